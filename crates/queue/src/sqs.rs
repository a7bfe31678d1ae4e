//! AWS SQS consumer implementation.

use async_trait::async_trait;
use aws_config::default_provider::credentials::DefaultCredentialsChain;
use aws_credential_types::Credentials;
use aws_sdk_sqs::config::BehaviorVersion;
use aws_sdk_sqs::types::{MessageSystemAttributeName, QueueAttributeName};
use aws_sdk_sqs::Client;
use chrono::{TimeZone, Utc};
use tracing::{debug, info, warn};

use vault_core::config::{AwsConfig, QueueConfig};

use crate::consumer::{QueueConsumer, QueueHealth, QueueMessage};
use crate::error::QueueError;

/// SQS long-poll wait; the maximum SQS allows.
const WAIT_TIME_SECS: i32 = 20;

/// Build an SQS client from project config.
///
/// The client config is assembled by hand rather than through
/// `aws_config::defaults()`: that would honour `AWS_ENDPOINT_URL`, which may
/// point at an S3-compatible store and route every SQS call there. SQS gets
/// its own override in `QUEUE_AWS_ENDPOINT_URL`.
pub async fn sqs_client(aws: &AwsConfig, queue: &QueueConfig) -> Client {
    let region = aws_sdk_sqs::config::Region::new(aws.region.clone());

    let mut sqs_config = aws_sdk_sqs::Config::builder()
        .region(region.clone())
        .behavior_version(BehaviorVersion::latest());

    if let (Some(key_id), Some(secret)) = (&aws.access_key_id, &aws.secret_access_key) {
        let creds = Credentials::new(key_id, secret, aws.session_token.clone(), None, "vault-queue-static");
        sqs_config = sqs_config.credentials_provider(creds);
    } else {
        let chain = DefaultCredentialsChain::builder().region(region).build().await;
        sqs_config = sqs_config.credentials_provider(chain);
    }

    if let Some(ref endpoint) = queue.endpoint_url {
        let url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.clone()
        } else {
            format!("https://{endpoint}")
        };
        sqs_config = sqs_config.endpoint_url(&url);
    }

    Client::from_conf(sqs_config.build())
}

/// Look up a queue URL by name. `Ok(None)` when the queue does not exist.
pub async fn lookup_queue_url(client: &Client, name: &str) -> Result<Option<String>, QueueError> {
    match client.get_queue_url().queue_name(name).send().await {
        Ok(resp) => Ok(resp.queue_url().map(str::to_string)),
        Err(e) => {
            let missing = e
                .as_service_error()
                .map(|s| s.is_queue_does_not_exist())
                .unwrap_or(false);
            if missing {
                Ok(None)
            } else {
                Err(QueueError::Connection(format!("SQS get_queue_url({name}) failed: {e:?}")))
            }
        }
    }
}

/// Approximate message counts: (waiting, in flight).
pub(crate) async fn queue_depths(client: &Client, url: &str) -> Result<(Option<u64>, Option<u64>), QueueError> {
    let resp = client
        .get_queue_attributes()
        .queue_url(url)
        .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
        .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
        .send()
        .await
        .map_err(|e| QueueError::Connection(format!("SQS get_queue_attributes failed: {e:?}")))?;

    let count = |name: &QueueAttributeName| {
        resp.attributes()
            .and_then(|attrs| attrs.get(name))
            .and_then(|v| v.parse::<u64>().ok())
    };
    Ok((
        count(&QueueAttributeName::ApproximateNumberOfMessages),
        count(&QueueAttributeName::ApproximateNumberOfMessagesNotVisible),
    ))
}

/// SQS-backed queue consumer.
pub struct SqsConsumer {
    client: Client,
    queue_url: String,
    dlq_url: Option<String>,
    visibility_timeout_secs: i32,
}

impl SqsConsumer {
    /// Connect to the configured queue, resolving its URL by name when
    /// `QUEUE_URL` is not set.
    pub async fn new(aws: &AwsConfig, queue: &QueueConfig) -> Result<Self, QueueError> {
        let client = sqs_client(aws, queue).await;

        let queue_url = match &queue.queue_url {
            Some(url) => url.clone(),
            None => Self::resolve_queue_url(&client, &queue.full_queue_name()).await?,
        };
        let dlq_url = match &queue.dlq_url {
            Some(url) => Some(url.clone()),
            None => lookup_queue_url(&client, &queue.dead_letter_queue_name()).await.unwrap_or_else(|e| {
                warn!(error = %e, "Could not resolve dead-letter queue");
                None
            }),
        };

        info!(
            queue_url = %queue_url,
            dlq_url = dlq_url.as_deref().unwrap_or("(none)"),
            region = %aws.region,
            "SQS consumer initialized"
        );

        Ok(Self {
            client,
            queue_url,
            dlq_url,
            visibility_timeout_secs: queue.visibility_timeout_secs as i32,
        })
    }

    pub async fn resolve_queue_url(client: &Client, name: &str) -> Result<String, QueueError> {
        lookup_queue_url(client, name)
            .await?
            .ok_or_else(|| QueueError::NotFound(name.to_string()))
    }
}

#[async_trait]
impl QueueConsumer for SqsConsumer {
    async fn poll_batch(&self, max_messages: u32) -> Result<Vec<QueueMessage>, QueueError> {
        // SQS caps at 10 messages per request.
        let capped = max_messages.clamp(1, 10) as i32;

        debug!(max_messages = capped, "Polling SQS");

        let resp = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(capped)
            .wait_time_seconds(WAIT_TIME_SECS)
            .visibility_timeout(self.visibility_timeout_secs)
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .send()
            .await
            .map_err(|e| QueueError::Connection(format!("SQS receive failed: {e:?}")))?;

        let sqs_messages = resp.messages.unwrap_or_default();
        debug!(count = sqs_messages.len(), "Received SQS messages");

        let mut messages = Vec::with_capacity(sqs_messages.len());
        for msg in sqs_messages {
            let Some(receipt_handle) = msg.receipt_handle() else {
                warn!(message_id = ?msg.message_id(), "SQS message without receipt handle, skipping");
                continue;
            };

            let attribute = |name: MessageSystemAttributeName| {
                msg.attributes().and_then(|attrs| attrs.get(&name)).cloned()
            };

            let timestamp = attribute(MessageSystemAttributeName::SentTimestamp)
                .and_then(|ts| ts.parse::<i64>().ok())
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .unwrap_or_else(Utc::now);

            let attempt_count = attribute(MessageSystemAttributeName::ApproximateReceiveCount)
                .and_then(|c| c.parse::<u32>().ok())
                .unwrap_or(1);

            messages.push(QueueMessage {
                id: msg.message_id().unwrap_or("unknown").to_string(),
                body: msg.body().unwrap_or("").to_string(),
                receipt_handle: receipt_handle.to_string(),
                timestamp,
                attempt_count,
            });
        }

        Ok(messages)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        debug!("Deleting SQS message");

        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError::Ack(format!("SQS delete failed: {e:?}")))?;

        Ok(())
    }

    async fn nack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        debug!("Returning SQS message (visibility=0)");

        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(0)
            .send()
            .await
            .map_err(|e| QueueError::Provider(format!("SQS visibility change failed: {e:?}")))?;

        Ok(())
    }

    async fn health_check(&self) -> Result<QueueHealth, QueueError> {
        let (waiting, in_flight) = queue_depths(&self.client, &self.queue_url).await?;
        Ok(QueueHealth {
            connected: true,
            approximate_message_count: waiting,
            approximate_in_flight: in_flight,
            provider: "sqs".to_string(),
        })
    }

    async fn dlq_depth(&self) -> Result<Option<u64>, QueueError> {
        match &self.dlq_url {
            Some(url) => Ok(queue_depths(&self.client, url).await?.0),
            None => Ok(None),
        }
    }
}
