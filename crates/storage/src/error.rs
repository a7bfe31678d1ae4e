use chrono::{DateTime, Utc};
use thiserror::Error;

use vault_core::{Classify, FailureKind};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("core error: {0}")]
    Core(#[from] vault_core::VaultError),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("corrupt archive {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("lease on {logical_path} held by {owner} until {expires_at}")]
    LeaseHeld {
        logical_path: String,
        owner: String,
        expires_at: DateTime<Utc>,
    },

    #[error("lease on {logical_path} lost: {reason}")]
    LeaseLost { logical_path: String, reason: String },

    #[error("not configured: {0}")]
    NotConfigured(String),

    #[error("{0}")]
    Other(String),
}

impl Classify for StorageError {
    fn kind(&self) -> FailureKind {
        match self {
            StorageError::ObjectStore(object_store::Error::NotFound { .. }) => FailureKind::Absent,
            StorageError::Core(e) => e.kind(),
            StorageError::Corrupt { .. } => FailureKind::Corruption,
            StorageError::LeaseHeld { .. } | StorageError::LeaseLost { .. } => FailureKind::Contended,
            StorageError::NotConfigured(_) => FailureKind::Config,
            _ => FailureKind::Unexpected,
        }
    }
}
