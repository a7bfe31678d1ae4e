use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use vault_core::{Classify, FailureKind};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("server error {status} for {path}")]
    Server { status: u16, path: String },

    #[error("client error {status} for {path}")]
    Client { status: u16, path: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    /// Server-side and network failures are worth another attempt; anything
    /// the client got wrong will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Server { .. } | SourceError::Transport(_))
    }
}

impl Classify for SourceError {
    fn kind(&self) -> FailureKind {
        if self.is_retryable() {
            FailureKind::Transient
        } else {
            FailureKind::Unexpected
        }
    }
}

/// Where filing documents come from (EDGAR over HTTPS in production).
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Download `remote_path` into the file at `dest`, returning the number of
    /// bytes written. `dest` is overwritten if it exists.
    async fn download(&self, remote_path: &str, dest: &Path) -> Result<u64, SourceError>;
}
