//! Single-filing fetch with bounded retry.
//!
//! A fetch never returns an error: every failure is logged and turned into a
//! [`FetchOutcome::Skipped`] so one bad filing cannot abort an entity cycle.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use vault_core::config::FetchConfig;
use vault_core::{Classify, FilingReference};
use vault_storage::Archive;

use crate::source::{DocumentSource, SourceError};

/// Retry depth and backoff window for retryable download failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_depth: u32,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &FetchConfig) -> Self {
        Self {
            max_depth: config.max_retry_depth,
            backoff_min: Duration::from_millis(config.retry_backoff_min_ms),
            backoff_max: Duration::from_millis(config.retry_backoff_max_ms),
        }
    }

    /// Uniform draw from the inclusive backoff window.
    pub fn backoff(&self) -> Duration {
        let min = self.backoff_min.as_millis() as u64;
        let max = self.backoff_max.as_millis() as u64;
        if max <= min {
            return self.backoff_min;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The archive already holds an entry with this name.
    AlreadyPresent,
    RetriesExhausted { attempts: u32 },
    /// Non-retryable download failure.
    Rejected(String),
    AppendFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Written { bytes: u64, elapsed: Duration },
    Skipped(SkipReason),
}

impl FetchOutcome {
    pub fn bytes_written(&self) -> Option<u64> {
        match self {
            FetchOutcome::Written { bytes, .. } => Some(*bytes),
            FetchOutcome::Skipped(_) => None,
        }
    }

    /// True when the fetch reached the network and wrote nothing.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            FetchOutcome::Skipped(
                SkipReason::RetriesExhausted { .. } | SkipReason::Rejected(_) | SkipReason::AppendFailed(_)
            )
        )
    }
}

pub struct FilingFetcher {
    source: Arc<dyn DocumentSource>,
    policy: RetryPolicy,
    staging_dir: PathBuf,
}

impl FilingFetcher {
    pub fn new(source: Arc<dyn DocumentSource>, policy: RetryPolicy, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            source,
            policy,
            staging_dir: staging_dir.into(),
        }
    }

    /// Download `reference` into `archive` unless it is already there.
    pub async fn fetch(&self, reference: &FilingReference, archive: &mut Archive, force: bool) -> FetchOutcome {
        let name = reference.file_name();
        if !force && archive.contains(name) {
            debug!(filing = %reference.remote_path, "Already archived, skipping");
            return FetchOutcome::Skipped(SkipReason::AlreadyPresent);
        }

        if let Err(e) = tokio::fs::create_dir_all(&self.staging_dir).await {
            warn!(error = %e, dir = %self.staging_dir.display(), "Cannot create staging directory");
            return FetchOutcome::Skipped(SkipReason::Rejected(e.to_string()));
        }
        let staged = self.staging_dir.join(name);

        let started = Instant::now();
        let downloaded = self.download_with_retry(reference, &staged).await;
        let elapsed = started.elapsed();

        let outcome = match downloaded {
            Ok(_) => match archive.append_file(name, &staged) {
                Ok(bytes) => {
                    info!(
                        filing = %reference.remote_path,
                        bytes,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Filing archived"
                    );
                    FetchOutcome::Written { bytes, elapsed }
                }
                Err(e) => {
                    warn!(
                        filing = %reference.remote_path,
                        kind = %e.kind(),
                        error = %e,
                        "Failed to append filing to archive"
                    );
                    FetchOutcome::Skipped(SkipReason::AppendFailed(e.to_string()))
                }
            },
            Err(outcome) => outcome,
        };

        match tokio::fs::remove_file(&staged).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %staged.display(), error = %e, "Failed to remove staged download"),
        }
        outcome
    }

    async fn download_with_retry(
        &self,
        reference: &FilingReference,
        staged: &std::path::Path,
    ) -> Result<u64, FetchOutcome> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.source.download(&reference.remote_path, staged).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.is_retryable() && attempt <= self.policy.max_depth => {
                    let wait = self.policy.backoff();
                    warn!(
                        filing = %reference.remote_path,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "Download failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        filing = %reference.remote_path,
                        attempts = attempt,
                        error = %e,
                        "Giving up on filing"
                    );
                    return Err(FetchOutcome::Skipped(SkipReason::RetriesExhausted { attempts: attempt }));
                }
                Err(e) => {
                    log_rejected(reference, &e);
                    return Err(FetchOutcome::Skipped(SkipReason::Rejected(e.to_string())));
                }
            }
        }
    }
}

fn log_rejected(reference: &FilingReference, e: &SourceError) {
    warn!(
        filing = %reference.remote_path,
        kind = %e.kind(),
        error = %e,
        "Download rejected"
    );
}
