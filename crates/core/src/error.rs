use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Coarse classification every failure in the workspace maps onto.
///
/// The orchestrator logs this next to the error message so operators can tell
/// a redelivery-worthy failure from a configuration mistake at a glance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A resource that is allowed to be missing (manifest, archive, message).
    Absent,
    /// Network hiccup or server-side error; worth retrying.
    Transient,
    /// Damaged archive contents.
    Corruption,
    /// Another worker holds the entity lease.
    Contended,
    /// Anything else. The cycle is abandoned and the queue redelivers.
    Unexpected,
    /// Invalid configuration. Only fatal at startup.
    Config,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Absent => "absent",
            FailureKind::Transient => "transient",
            FailureKind::Corruption => "corruption",
            FailureKind::Contended => "contended",
            FailureKind::Unexpected => "unexpected",
            FailureKind::Config => "config",
        };
        f.write_str(s)
    }
}

/// Errors that can report their [`FailureKind`].
pub trait Classify {
    fn kind(&self) -> FailureKind;
}

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid filing path: {0}")]
    InvalidPath(String),
}

impl Classify for VaultError {
    fn kind(&self) -> FailureKind {
        match self {
            VaultError::Config(_) => FailureKind::Config,
            _ => FailureKind::Unexpected,
        }
    }
}
