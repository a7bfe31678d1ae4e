//! Per-entity sync cycle.
//!
//! ```text
//! Received -> PathResolved -> Mirrored -> FilingsProcessed -> Indexed -> Synced -> Acknowledged
//!     \___________\______________\______________\______________\__________-> Abandoned
//! ```
//!
//! Once the entity lease is held, the local mirror is discarded and the lease
//! released on every exit path. The lease is renewed after every filing and
//! once more right before upload; a failed renewal means another worker took
//! the entity over and the cycle is abandoned without touching the store.
//! Only a cycle that reaches `Synced` is acknowledged; anything else is left
//! for the queue to redeliver.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use vault_core::config::FetchConfig;
use vault_core::{Classify, EntityId, FailureKind, LogicalPath, WorkItem};
use vault_ingest::{EntityFilings, FetchOutcome, FilingFetcher, FilingsCatalog, Resolution, SkipReason};
use vault_queue::QueueConsumer;
use vault_storage::{repair, Archive, ArchiveStore, Lease, LeaseManager, Manifest, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStage {
    Received,
    PathResolved,
    Mirrored,
    FilingsProcessed,
    Indexed,
    Synced,
    Acknowledged,
    Abandoned,
}

impl fmt::Display for CycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CycleStage::Received => "received",
            CycleStage::PathResolved => "path_resolved",
            CycleStage::Mirrored => "mirrored",
            CycleStage::FilingsProcessed => "filings_processed",
            CycleStage::Indexed => "indexed",
            CycleStage::Synced => "synced",
            CycleStage::Acknowledged => "acknowledged",
            CycleStage::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

/// Failure after the entity lease is held.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl Classify for SyncError {
    fn kind(&self) -> FailureKind {
        match self {
            SyncError::Storage(e) => e.kind(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleFailure {
    pub kind: FailureKind,
    /// Last stage reached before the failure.
    pub stage: CycleStage,
    pub message: String,
}

/// What one cycle did, for logs and tests.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub entity_id: EntityId,
    pub message_id: String,
    pub logical_path: Option<LogicalPath>,
    pub stage: CycleStage,
    pub filings: usize,
    pub fetched: usize,
    /// Already archived, not requested again.
    pub skipped: usize,
    /// Gave up after retries, rejected, or failed to append.
    pub failed: usize,
    pub bytes_written: u64,
    pub repaired: bool,
    pub manifest_records: usize,
    pub archive_uploaded: bool,
    pub ack_failed: bool,
    pub failure: Option<CycleFailure>,
}

impl CycleReport {
    fn new(item: &WorkItem) -> Self {
        Self {
            entity_id: item.entity_id.clone(),
            message_id: item.message_id.clone(),
            logical_path: None,
            stage: CycleStage::Received,
            filings: 0,
            fetched: 0,
            skipped: 0,
            failed: 0,
            bytes_written: 0,
            repaired: false,
            manifest_records: 0,
            archive_uploaded: false,
            ack_failed: false,
            failure: None,
        }
    }

    /// True when new content was fetched this cycle.
    pub fn changed(&self) -> bool {
        self.fetched > 0
    }

    /// Remote state is up to date, whether or not the ack went through.
    pub fn is_complete(&self) -> bool {
        matches!(self.stage, CycleStage::Synced | CycleStage::Acknowledged)
    }

    fn abandon(&mut self, error: &impl Classify, message: String) {
        self.failure = Some(CycleFailure {
            kind: error.kind(),
            stage: self.stage,
            message,
        });
        self.stage = CycleStage::Abandoned;
    }

    fn log(&self) {
        let logical_path = self.logical_path.as_ref().map(|p| p.as_str()).unwrap_or("-");
        match &self.failure {
            None => info!(
                entity = %self.entity_id,
                logical_path,
                stage = %self.stage,
                filings = self.filings,
                fetched = self.fetched,
                skipped = self.skipped,
                failed = self.failed,
                bytes_written = self.bytes_written,
                repaired = self.repaired,
                archive_uploaded = self.archive_uploaded,
                "Cycle finished"
            ),
            Some(failure) => warn!(
                entity = %self.entity_id,
                logical_path,
                failed_after = %failure.stage,
                kind = %failure.kind,
                error = %failure.message,
                "Cycle abandoned"
            ),
        }
    }
}

/// Courtesy pause between downloads, scaled by how long the last one took.
#[derive(Debug, Clone)]
pub struct Pacing {
    pub factor_min: f64,
    pub factor_max: f64,
    pub floor: Duration,
}

impl Pacing {
    pub fn from_config(config: &FetchConfig) -> Self {
        Self {
            factor_min: config.pause_factor_min,
            factor_max: config.pause_factor_max,
            floor: Duration::from_millis(config.pause_floor_ms),
        }
    }

    /// No pause at all.
    pub fn none() -> Self {
        Self {
            factor_min: 0.0,
            factor_max: 0.0,
            floor: Duration::ZERO,
        }
    }

    pub fn pause_after(&self, download: Duration) -> Duration {
        let factor = if self.factor_max > self.factor_min {
            rand::thread_rng().gen_range(self.factor_min..=self.factor_max)
        } else {
            self.factor_min
        };
        // an out-of-range product (huge factor, NaN) falls back to the floor
        Duration::try_from_secs_f64(download.as_secs_f64() * factor.max(0.0))
            .unwrap_or(self.floor)
            .max(self.floor)
    }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub pacing: Pacing,
    pub force_refetch: bool,
}

impl SyncOptions {
    pub fn from_config(config: &FetchConfig) -> Self {
        Self {
            pacing: Pacing::from_config(config),
            force_refetch: config.force_refetch,
        }
    }
}

pub struct EntitySync {
    catalog: Arc<FilingsCatalog>,
    store: ArchiveStore,
    fetcher: FilingFetcher,
    leases: LeaseManager,
    queue: Arc<dyn QueueConsumer>,
    options: SyncOptions,
}

impl EntitySync {
    pub fn new(
        catalog: Arc<FilingsCatalog>,
        store: ArchiveStore,
        fetcher: FilingFetcher,
        leases: LeaseManager,
        queue: Arc<dyn QueueConsumer>,
        options: SyncOptions,
    ) -> Self {
        Self {
            catalog,
            store,
            fetcher,
            leases,
            queue,
            options,
        }
    }

    /// Run one full cycle for `item`. Never fails; the outcome is in the report.
    pub async fn process(&self, item: &WorkItem) -> CycleReport {
        let mut report = CycleReport::new(item);
        info!(
            entity = %item.entity_id,
            message_id = %item.message_id,
            attempt = item.attempt_count,
            "Processing entity"
        );

        let filings = match self.catalog.resolve(&item.entity_id) {
            Ok(Resolution::Filings(filings)) => filings,
            Ok(Resolution::NoFilings) => {
                info!(entity = %item.entity_id, "No filings listed for entity");
                report.stage = CycleStage::Synced;
                self.acknowledge(item, &mut report).await;
                report.log();
                return report;
            }
            Err(e) => {
                report.abandon(&e, e.to_string());
                report.log();
                return report;
            }
        };
        report.logical_path = Some(filings.logical_path.clone());
        report.filings = filings.filings.len();
        report.stage = CycleStage::PathResolved;

        let mut lease = match self.leases.acquire(&filings.logical_path).await {
            Ok(lease) => lease,
            Err(e) => {
                report.abandon(&e, e.to_string());
                report.log();
                return report;
            }
        };

        let result = self.sync_locked(&filings, &mut lease, &mut report).await;

        if let Err(e) = self.store.discard(&filings.logical_path).await {
            warn!(logical_path = %filings.logical_path, error = %e, "Failed to discard local mirror");
        }
        if let Err(e) = self.leases.release(lease).await {
            warn!(logical_path = %filings.logical_path, error = %e, "Failed to release lease");
        }

        match result {
            Ok(()) => self.acknowledge(item, &mut report).await,
            Err(e) => report.abandon(&e, e.to_string()),
        }
        report.log();
        report
    }

    async fn sync_locked(
        &self,
        filings: &EntityFilings,
        lease: &mut Lease,
        report: &mut CycleReport,
    ) -> Result<(), SyncError> {
        let logical = &filings.logical_path;

        let (_, mut archive) = self.store.mirror(logical).await?;
        self.repair_archive(&mut archive, report)?;
        report.stage = CycleStage::Mirrored;

        for filing in &filings.filings {
            match self.fetcher.fetch(filing, &mut archive, self.options.force_refetch).await {
                FetchOutcome::Written { bytes, elapsed } => {
                    report.fetched += 1;
                    report.bytes_written += bytes;
                    let pause = self.options.pacing.pause_after(elapsed);
                    if !pause.is_zero() {
                        tokio::time::sleep(pause).await;
                    }
                }
                FetchOutcome::Skipped(SkipReason::AlreadyPresent) => {
                    report.skipped += 1;
                    continue;
                }
                FetchOutcome::Skipped(_) => report.failed += 1,
            }
            self.leases.renew(lease).await?;
        }
        // a forced refetch appends a second copy of names already present
        if archive.has_duplicates() {
            self.repair_archive(&mut archive, report)?;
        }
        report.stage = CycleStage::FilingsProcessed;

        let manifest = Manifest::build(logical, &archive);
        self.store.write_manifest(logical, &manifest).await?;
        report.manifest_records = manifest.len();
        report.stage = CycleStage::Indexed;

        self.leases.renew(lease).await?;
        let write_archive = report.changed() || report.repaired;
        let flushed = self.store.flush(logical, true, write_archive).await?;
        report.archive_uploaded = flushed.archive_bytes.is_some();
        report.stage = CycleStage::Synced;
        Ok(())
    }

    fn repair_archive(&self, archive: &mut Archive, report: &mut CycleReport) -> Result<(), SyncError> {
        let outcome = repair(archive)?;
        if outcome.rewrote() {
            info!(path = %archive.path().display(), ?outcome, "Archive repaired");
            report.repaired = true;
        }
        Ok(())
    }

    async fn acknowledge(&self, item: &WorkItem, report: &mut CycleReport) {
        match self.queue.ack(&item.delivery_token).await {
            Ok(()) => report.stage = CycleStage::Acknowledged,
            Err(e) => {
                warn!(
                    entity = %item.entity_id,
                    message_id = %item.message_id,
                    kind = %e.kind(),
                    error = %e,
                    "Failed to acknowledge message, it will be redelivered"
                );
                report.ack_failed = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_respects_floor() {
        let pacing = Pacing {
            factor_min: 2.0,
            factor_max: 5.0,
            floor: Duration::from_millis(750),
        };
        assert_eq!(pacing.pause_after(Duration::from_millis(10)), Duration::from_millis(750));

        let long = pacing.pause_after(Duration::from_secs(1));
        assert!(long >= Duration::from_secs(2) && long <= Duration::from_secs(5));
    }

    #[test]
    fn overflowing_pause_falls_back_to_floor() {
        let pacing = Pacing {
            factor_min: 1e300,
            factor_max: 1e300,
            floor: Duration::from_millis(750),
        };
        assert_eq!(pacing.pause_after(Duration::from_secs(10)), Duration::from_millis(750));
    }

    #[test]
    fn no_pacing_never_sleeps() {
        assert!(Pacing::none().pause_after(Duration::from_secs(3)).is_zero());
    }

    #[test]
    fn stages_render_snake_case() {
        assert_eq!(CycleStage::FilingsProcessed.to_string(), "filings_processed");
        assert_eq!(
            serde_json::to_string(&CycleStage::PathResolved).unwrap(),
            "\"path_resolved\""
        );
    }
}
