//! Archive store: moves one entity's archive and manifest between the object
//! store and local scratch space.
//!
//! ```text
//! object store                          scratch_dir
//!   {prefix}/{logical}/index.json  <->    {logical}/index.json
//!   {prefix}/{logical}/filings.dat <->    {logical}/filings.dat
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::TryStreamExt;
use object_store::ObjectStore;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use vault_core::LogicalPath;

use crate::archive::{Archive, ARCHIVE_FILE};
use crate::backend::{object_key, StorageBackend};
use crate::error::StorageError;
use crate::manifest::{Manifest, MANIFEST_FILE};

const DOWNLOADS_DIR: &str = "downloads";

/// Local file locations for one logical path.
#[derive(Debug, Clone)]
pub struct LocalMirror {
    pub dir: PathBuf,
    pub manifest_path: PathBuf,
    pub archive_path: PathBuf,
}

/// Which artifacts a [`ArchiveStore::flush`] uploaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub manifest_bytes: Option<u64>,
    pub archive_bytes: Option<u64>,
}

pub struct ArchiveStore {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    scratch_dir: PathBuf,
}

impl ArchiveStore {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        prefix: impl Into<String>,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into().trim_matches('/').to_string(),
            scratch_dir: scratch_dir.into(),
        }
    }

    pub fn from_backend(backend: &StorageBackend, scratch_dir: impl Into<PathBuf>) -> Self {
        Self::new(backend.store_arc(), backend.prefix(), scratch_dir)
    }

    /// Staging directory for documents on their way into an archive.
    pub fn downloads_dir(&self) -> PathBuf {
        self.scratch_dir.join(DOWNLOADS_DIR)
    }

    pub fn local_mirror(&self, logical: &LogicalPath) -> LocalMirror {
        let dir = self.scratch_dir.join(logical.as_str());
        LocalMirror {
            manifest_path: dir.join(MANIFEST_FILE),
            archive_path: dir.join(ARCHIVE_FILE),
            dir,
        }
    }

    fn manifest_key(&self, logical: &LogicalPath) -> object_store::path::Path {
        object_key(&self.prefix, &logical.join(MANIFEST_FILE))
    }

    fn archive_key(&self, logical: &LogicalPath) -> object_store::path::Path {
        object_key(&self.prefix, &logical.join(ARCHIVE_FILE))
    }

    /// Copy the remote manifest and archive into scratch space.
    ///
    /// Missing objects materialize as an empty manifest / empty archive. Any
    /// other object store failure is returned as-is.
    pub async fn mirror(&self, logical: &LogicalPath) -> Result<(Manifest, Archive), StorageError> {
        info!(logical_path = %logical, "Mirroring archive from object store");
        let local = self.local_mirror(logical);
        tokio::fs::create_dir_all(&local.dir).await?;

        let manifest_key = self.manifest_key(logical);
        let manifest = match self.store.get(&manifest_key).await {
            Ok(result) => {
                let bytes = result.bytes().await?;
                match Manifest::from_json(&bytes) {
                    Ok(m) => m,
                    Err(e) => {
                        // Regenerated before the next flush, so an unreadable
                        // copy only costs us the old listing.
                        warn!(key = %manifest_key, error = %e, "Remote manifest unreadable, starting empty");
                        Manifest::empty()
                    }
                }
            }
            Err(object_store::Error::NotFound { .. }) => {
                info!(key = %manifest_key, "Index file does not exist");
                Manifest::empty()
            }
            Err(e) => return Err(e.into()),
        };
        tokio::fs::write(&local.manifest_path, manifest.to_json()?).await?;

        let archive_key = self.archive_key(logical);
        let archive = match self.store.get(&archive_key).await {
            Ok(result) => {
                info!(key = %archive_key, size = result.meta.size, "Retrieving filings archive");
                let mut stream = result.into_stream();
                let mut file = tokio::fs::File::create(&local.archive_path).await?;
                while let Some(chunk) = stream.try_next().await? {
                    file.write_all(&chunk).await?;
                }
                file.flush().await?;
                file.sync_all().await?;
                drop(file);
                Archive::open(&local.archive_path)?
            }
            Err(object_store::Error::NotFound { .. }) => {
                info!(key = %archive_key, "Filings archive does not exist");
                Archive::create(&local.archive_path)?
            }
            Err(e) => return Err(e.into()),
        };

        debug!(
            logical_path = %logical,
            manifest_records = manifest.len(),
            archive_entries = archive.len(),
            "Mirror complete"
        );
        Ok((manifest, archive))
    }

    /// Persist a manifest into the local mirror.
    pub async fn write_manifest(
        &self,
        logical: &LogicalPath,
        manifest: &Manifest,
    ) -> Result<(), StorageError> {
        let local = self.local_mirror(logical);
        tokio::fs::create_dir_all(&local.dir).await?;
        tokio::fs::write(&local.manifest_path, manifest.to_json()?).await?;
        Ok(())
    }

    /// Upload the local manifest and/or archive.
    pub async fn flush(
        &self,
        logical: &LogicalPath,
        write_manifest: bool,
        write_archive: bool,
    ) -> Result<FlushReport, StorageError> {
        let local = self.local_mirror(logical);
        let mut report = FlushReport::default();

        if write_manifest {
            info!(logical_path = %logical, "Pushing index to object store");
            let n = self.upload(&local.manifest_path, &self.manifest_key(logical)).await?;
            report.manifest_bytes = Some(n);
            info!(logical_path = %logical, bytes = n, "Uploaded index successfully");
        }

        if write_archive {
            info!(logical_path = %logical, "Pushing filings to object store");
            let n = self.upload(&local.archive_path, &self.archive_key(logical)).await?;
            report.archive_bytes = Some(n);
            info!(logical_path = %logical, bytes = n, "Uploaded filings successfully");
        }

        Ok(report)
    }

    async fn upload(&self, local: &Path, key: &object_store::path::Path) -> Result<u64, StorageError> {
        let data = tokio::fs::read(local).await?;
        let len = data.len() as u64;
        self.store.put(key, bytes::Bytes::from(data).into()).await?;
        Ok(len)
    }

    /// Delete the local mirror. Files that are already gone are fine.
    pub async fn discard(&self, logical: &LogicalPath) -> Result<(), StorageError> {
        info!(logical_path = %logical, "Removing local copy of index and filings");
        let local = self.local_mirror(logical);

        for path in [&local.manifest_path, &local.archive_path] {
            match tokio::fs::remove_file(path).await {
                Ok(()) => debug!(path = %path.display(), "Removed"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        // Only succeeds once nothing else lives there.
        tokio::fs::remove_dir(&local.dir).await.ok();
        Ok(())
    }
}
