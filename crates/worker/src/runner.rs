//! Queue poll loop: receive, process one entity at a time, back off when idle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use vault_core::config::QueueConfig;
use vault_queue::{parse_work_item, QueueConsumer};

use crate::sync::{CycleReport, EntitySync};

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub batch_size: u32,
    pub idle_backoff: Duration,
    pub poll_error_backoff: Duration,
}

impl PollSettings {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            batch_size: config.max_batch_size,
            idle_backoff: config.idle_backoff(),
            poll_error_backoff: config.poll_error_backoff(),
        }
    }
}

#[derive(Debug)]
pub enum PollOutcome {
    /// The queue handed out nothing.
    Idle,
    PollFailed,
    Processed {
        reports: Vec<CycleReport>,
        /// Messages that did not parse; left for the dead-letter queue.
        rejected: usize,
    },
}

pub struct Worker {
    sync: EntitySync,
    queue: Arc<dyn QueueConsumer>,
    settings: PollSettings,
}

impl Worker {
    pub fn new(sync: EntitySync, queue: Arc<dyn QueueConsumer>, settings: PollSettings) -> Self {
        Self { sync, queue, settings }
    }

    /// Receive one batch and run every message in it to completion.
    pub async fn poll_once(&self) -> PollOutcome {
        let messages = match self.queue.poll_batch(self.settings.batch_size).await {
            Ok(messages) if messages.is_empty() => return PollOutcome::Idle,
            Ok(messages) => messages,
            Err(e) => {
                warn!(error = %e, "Queue poll failed");
                return PollOutcome::PollFailed;
            }
        };

        let mut reports = Vec::with_capacity(messages.len());
        let mut rejected = 0;
        for msg in &messages {
            match parse_work_item(msg) {
                Ok(item) => reports.push(self.sync.process(&item).await),
                Err(e) => {
                    warn!(
                        message_id = %msg.id,
                        attempt = msg.attempt_count,
                        error = %e,
                        "Unparseable message, leaving it for redelivery"
                    );
                    rejected += 1;
                }
            }
        }
        PollOutcome::Processed { reports, rejected }
    }

    /// Poll until `shutdown` flips to true. Shutdown is noticed between cycles
    /// and during backoff sleeps, never in the middle of an entity.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            batch_size = self.settings.batch_size,
            idle_backoff_secs = self.settings.idle_backoff.as_secs(),
            "Worker started"
        );
        let mut cycles = 0u64;

        while !*shutdown.borrow() {
            let pause = match self.poll_once().await {
                PollOutcome::Idle => {
                    info!(wait_secs = self.settings.idle_backoff.as_secs(), "Queue empty");
                    self.settings.idle_backoff
                }
                PollOutcome::PollFailed => self.settings.poll_error_backoff,
                PollOutcome::Processed { reports, .. } => {
                    cycles += reports.len() as u64;
                    Duration::ZERO
                }
            };

            if !pause.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    changed = shutdown.changed() => {
                        // a dropped sender counts as shutdown
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        info!(cycles, "Worker stopped");
    }
}
