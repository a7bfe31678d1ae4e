//! Turn queue deliveries into [`WorkItem`]s.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use vault_core::{EntityId, WorkItem};

use crate::consumer::QueueMessage;
use crate::error::QueueError;

/// Body of an entity work message. Producers send the CIK as a string, older
/// ones as a bare number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkMessage {
    pub cik: Value,
}

impl WorkMessage {
    pub fn new(entity: &EntityId) -> Self {
        Self {
            cik: Value::String(entity.as_str().to_string()),
        }
    }

    pub fn to_body(&self) -> Result<String, QueueError> {
        serde_json::to_string(self).map_err(|e| QueueError::Parse(e.to_string()))
    }
}

pub fn parse_work_item(msg: &QueueMessage) -> Result<WorkItem, QueueError> {
    let body: WorkMessage = serde_json::from_str(&msg.body)
        .map_err(|e| QueueError::Parse(format!("message {}: {e}", msg.id)))?;

    let raw = match &body.cik {
        Value::String(s) => s.clone(),
        Value::Number(n) if n.is_u64() => n.to_string(),
        other => {
            return Err(QueueError::Parse(format!(
                "message {}: cik must be a string or non-negative integer, got {other}",
                msg.id
            )))
        }
    };

    let entity_id = EntityId::new(raw);
    if entity_id.is_empty() {
        return Err(QueueError::Parse(format!("message {}: empty cik", msg.id)));
    }

    Ok(WorkItem {
        entity_id,
        delivery_token: msg.receipt_handle.clone(),
        message_id: msg.id.clone(),
        attempt_count: msg.attempt_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_msg(body: &str) -> QueueMessage {
        QueueMessage {
            id: "msg-1".to_string(),
            body: body.to_string(),
            receipt_handle: "handle-1".to_string(),
            timestamp: Utc::now(),
            attempt_count: 1,
        }
    }

    #[test]
    fn string_cik() {
        let item = parse_work_item(&make_msg(r#"{"cik": "0001001"}"#)).unwrap();
        assert_eq!(item.entity_id.as_str(), "1001");
        assert_eq!(item.delivery_token, "handle-1");
        assert_eq!(item.message_id, "msg-1");
    }

    #[test]
    fn numeric_cik() {
        let item = parse_work_item(&make_msg(r#"{"cik": 320193}"#)).unwrap();
        assert_eq!(item.entity_id.as_str(), "320193");
    }

    #[test]
    fn rejects_bad_bodies() {
        for body in ["not json", r#"{"ticker": "AAPL"}"#, r#"{"cik": ""}"#, r#"{"cik": -4}"#, r#"{"cik": [1]}"#] {
            let err = parse_work_item(&make_msg(body)).unwrap_err();
            assert!(matches!(err, QueueError::Parse(_)), "{body}");
        }
    }

    #[test]
    fn work_message_body_parses_back() {
        let body = WorkMessage::new(&EntityId::new("1001")).to_body().unwrap();
        let item = parse_work_item(&make_msg(&body)).unwrap();
        assert_eq!(item.entity_id.as_str(), "1001");
    }
}
