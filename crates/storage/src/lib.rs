pub mod archive;
pub mod backend;
pub mod error;
pub mod lease;
pub mod manifest;
pub mod repair;
pub mod store;

pub use archive::{Archive, ArchiveEntry, EntryInfo, ARCHIVE_FILE};
pub use backend::{LocalBackend, S3Backend, StorageBackend};
pub use error::StorageError;
pub use lease::{Lease, LeaseManager, LeaseRecord};
pub use manifest::{Manifest, ManifestRecord, MANIFEST_FILE};
pub use repair::{repair, RepairOutcome};
pub use store::{ArchiveStore, FlushReport, LocalMirror};
