//! Queue error types.

use thiserror::Error;

use vault_core::{Classify, FailureKind};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("message parse error: {0}")]
    Parse(String),

    #[error("acknowledge error: {0}")]
    Ack(String),

    #[error("queue not found: {0}")]
    NotFound(String),

    #[error("provider error: {0}")]
    Provider(String),
}

impl Classify for QueueError {
    fn kind(&self) -> FailureKind {
        match self {
            QueueError::Connection(_) | QueueError::Ack(_) => FailureKind::Transient,
            QueueError::NotFound(_) => FailureKind::Config,
            QueueError::Parse(_) | QueueError::Provider(_) => FailureKind::Unexpected,
        }
    }
}
