//! Queue provisioning: the main work queue and its dead-letter queue.

use std::collections::HashMap;

use aws_sdk_sqs::types::QueueAttributeName;
use aws_sdk_sqs::Client;
use serde::Serialize;
use tracing::info;

use vault_core::config::{AwsConfig, QueueConfig};
use vault_core::EntityId;

use crate::error::QueueError;
use crate::parser::WorkMessage;
use crate::sqs::{lookup_queue_url, queue_depths, sqs_client};

/// 14 days, the SQS maximum.
pub const MESSAGE_RETENTION_SECS: u32 = 1_209_600;

/// Deliveries before a message is moved to the dead-letter queue.
pub const MAX_RECEIVE_COUNT: u32 = 3;

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub queue_name: String,
    pub queue_url: Option<String>,
    pub waiting: Option<u64>,
    pub in_flight: Option<u64>,
    pub dead_letter_queue_name: String,
    pub dead_letter_depth: Option<u64>,
}

pub struct SqsAdmin {
    client: Client,
    queue_name: String,
    dlq_name: String,
    visibility_timeout_secs: u32,
}

fn base_attributes(visibility_timeout_secs: u32) -> HashMap<QueueAttributeName, String> {
    HashMap::from([
        (QueueAttributeName::MessageRetentionPeriod, MESSAGE_RETENTION_SECS.to_string()),
        (QueueAttributeName::VisibilityTimeout, visibility_timeout_secs.to_string()),
    ])
}

/// `RedrivePolicy` attribute value pointing at the dead-letter queue.
pub fn redrive_policy(dead_letter_arn: &str) -> String {
    serde_json::json!({
        "deadLetterTargetArn": dead_letter_arn,
        "maxReceiveCount": MAX_RECEIVE_COUNT.to_string(),
    })
    .to_string()
}

impl SqsAdmin {
    pub async fn new(aws: &AwsConfig, queue: &QueueConfig) -> Self {
        Self {
            client: sqs_client(aws, queue).await,
            queue_name: queue.full_queue_name(),
            dlq_name: queue.dead_letter_queue_name(),
            visibility_timeout_secs: queue.visibility_timeout_secs,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Create the dead-letter queue, then the main queue redriving into it.
    /// Returns the main queue URL. Safe to re-run with unchanged settings.
    pub async fn setup(&self) -> Result<String, QueueError> {
        info!(queue = %self.dlq_name, "Creating dead-letter queue");
        let dlq_url = self
            .create_queue(&self.dlq_name, base_attributes(self.visibility_timeout_secs))
            .await?;

        let resp = self
            .client
            .get_queue_attributes()
            .queue_url(&dlq_url)
            .attribute_names(QueueAttributeName::QueueArn)
            .send()
            .await
            .map_err(|e| QueueError::Provider(format!("SQS get_queue_attributes failed: {e:?}")))?;
        let dlq_arn = resp
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::QueueArn))
            .cloned()
            .ok_or_else(|| QueueError::Provider(format!("no QueueArn for {}", self.dlq_name)))?;

        info!(queue = %self.queue_name, dead_letter_arn = %dlq_arn, "Creating main queue");
        let mut attributes = base_attributes(self.visibility_timeout_secs);
        attributes.insert(QueueAttributeName::RedrivePolicy, redrive_policy(&dlq_arn));
        self.create_queue(&self.queue_name, attributes).await
    }

    async fn create_queue(
        &self,
        name: &str,
        attributes: HashMap<QueueAttributeName, String>,
    ) -> Result<String, QueueError> {
        let resp = self
            .client
            .create_queue()
            .queue_name(name)
            .set_attributes(Some(attributes))
            .send()
            .await
            .map_err(|e| QueueError::Provider(format!("SQS create_queue({name}) failed: {e:?}")))?;
        resp.queue_url()
            .map(str::to_string)
            .ok_or_else(|| QueueError::Provider(format!("SQS returned no URL for {name}")))
    }

    /// Delete the main queue and its dead-letter queue. Missing queues are
    /// skipped. Returns the names actually deleted.
    pub async fn teardown(&self) -> Result<Vec<String>, QueueError> {
        let mut deleted = Vec::new();
        for name in [&self.queue_name, &self.dlq_name] {
            let Some(url) = lookup_queue_url(&self.client, name).await? else {
                info!(queue = %name, "Queue does not exist, skipping");
                continue;
            };
            self.client
                .delete_queue()
                .queue_url(&url)
                .send()
                .await
                .map_err(|e| QueueError::Provider(format!("SQS delete_queue({name}) failed: {e:?}")))?;
            info!(queue = %name, "Queue deleted");
            deleted.push(name.clone());
        }
        Ok(deleted)
    }

    /// Enqueue one entity for collection. Returns the message id.
    pub async fn send_entity(&self, entity: &EntityId) -> Result<String, QueueError> {
        let url = lookup_queue_url(&self.client, &self.queue_name)
            .await?
            .ok_or_else(|| QueueError::NotFound(self.queue_name.clone()))?;
        let body = WorkMessage::new(entity).to_body()?;

        let resp = self
            .client
            .send_message()
            .queue_url(&url)
            .message_body(body)
            .send()
            .await
            .map_err(|e| QueueError::Provider(format!("SQS send_message failed: {e:?}")))?;
        let message_id = resp.message_id().unwrap_or("unknown").to_string();
        info!(entity = %entity, message_id = %message_id, "Entity enqueued");
        Ok(message_id)
    }

    pub async fn status(&self) -> Result<QueueStatus, QueueError> {
        let queue_url = lookup_queue_url(&self.client, &self.queue_name).await?;
        let (waiting, in_flight) = match &queue_url {
            Some(url) => queue_depths(&self.client, url).await?,
            None => (None, None),
        };
        let dead_letter_depth = match lookup_queue_url(&self.client, &self.dlq_name).await? {
            Some(url) => queue_depths(&self.client, &url).await?.0,
            None => None,
        };

        Ok(QueueStatus {
            queue_name: self.queue_name.clone(),
            queue_url,
            waiting,
            in_flight,
            dead_letter_queue_name: self.dlq_name.clone(),
            dead_letter_depth,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redrive_policy_targets_dead_letter_queue() {
        let policy: serde_json::Value =
            serde_json::from_str(&redrive_policy("arn:aws:sqs:us-east-1:1:q_DeadLetter")).unwrap();
        assert_eq!(policy["deadLetterTargetArn"], "arn:aws:sqs:us-east-1:1:q_DeadLetter");
        assert_eq!(policy["maxReceiveCount"], "3");
    }

    #[test]
    fn queues_keep_messages_for_two_weeks() {
        let attrs = base_attributes(600);
        assert_eq!(attrs[&QueueAttributeName::MessageRetentionPeriod], "1209600");
        assert_eq!(attrs[&QueueAttributeName::VisibilityTimeout], "600");
    }
}
