//! Work queue consumer trait and message types.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// A raw delivery from the work queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: String,
    /// Message body, `{"cik": ...}` for entity work.
    pub body: String,
    /// Handle for ack/nack (SQS receipt handle). Changes on every delivery.
    pub receipt_handle: String,
    pub timestamp: DateTime<Utc>,
    /// Deliveries so far, including this one.
    pub attempt_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    pub connected: bool,
    pub approximate_message_count: Option<u64>,
    pub approximate_in_flight: Option<u64>,
    pub provider: String,
}

impl fmt::Display for QueueHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} connected={} waiting={} in_flight={}",
            self.provider,
            self.connected,
            fmt_count(self.approximate_message_count),
            fmt_count(self.approximate_in_flight),
        )
    }
}

fn fmt_count(count: Option<u64>) -> String {
    count.map_or_else(|| "?".to_string(), |c| c.to_string())
}

/// Where entity work comes from.
///
/// Delivery is at-least-once: a message that is not acked before its
/// visibility timeout runs out is delivered again, and after enough
/// deliveries the provider moves it to the dead-letter queue.
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Receive up to `max_messages`. May long-poll; an empty vec means the
    /// queue had nothing to hand out.
    async fn poll_batch(&self, max_messages: u32) -> Result<Vec<QueueMessage>, QueueError>;

    /// Remove a processed message from the queue.
    async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError>;

    /// Make a message visible again immediately.
    async fn nack(&self, receipt_handle: &str) -> Result<(), QueueError>;

    async fn health_check(&self) -> Result<QueueHealth, QueueError>;

    /// Approximate dead-letter queue depth, if a DLQ is known.
    async fn dlq_depth(&self) -> Result<Option<u64>, QueueError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_display_marks_unknown_counts() {
        let health = QueueHealth {
            connected: true,
            approximate_message_count: Some(42),
            approximate_in_flight: None,
            provider: "sqs".to_string(),
        };
        assert_eq!(health.to_string(), "sqs connected=true waiting=42 in_flight=?");
    }

    #[test]
    fn message_survives_json() {
        let msg = QueueMessage {
            id: "msg-1".to_string(),
            body: r#"{"cik":"1001"}"#.to_string(),
            receipt_handle: "handle-1".to_string(),
            timestamp: Utc::now(),
            attempt_count: 2,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: QueueMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.body, msg.body);
        assert_eq!(back.attempt_count, 2);
    }
}
