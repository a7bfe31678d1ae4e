//! Manifest: the listing of an archive persisted next to it.

use serde::{Deserialize, Serialize};

use vault_core::LogicalPath;

use crate::archive::Archive;
use crate::error::StorageError;

/// File name of the manifest inside a mirror directory and in the object store.
pub const MANIFEST_FILE: &str = "index.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRecord {
    /// `logical_path/entry_name`.
    pub path: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub records: Vec<ManifestRecord>,
}

impl Manifest {
    pub fn empty() -> Self {
        Self::default()
    }

    /// One record per archive entry, in archive order.
    pub fn build(logical_path: &LogicalPath, archive: &Archive) -> Self {
        let records = archive
            .entries()
            .iter()
            .map(|entry| ManifestRecord {
                path: logical_path.join(&entry.name),
                size_bytes: entry.size_bytes,
            })
            .collect();
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.records.iter().map(|r| r.size_bytes).sum()
    }

    pub fn to_json(&self) -> Result<Vec<u8>, StorageError> {
        serde_json::to_vec_pretty(self).map_err(|e| StorageError::Serialize(e.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, StorageError> {
        serde_json::from_slice(bytes).map_err(|e| StorageError::Serialize(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ARCHIVE_FILE;

    #[test]
    fn manifest_mirrors_archive_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let mut archive = Archive::create(tmp.path().join(ARCHIVE_FILE)).unwrap();
        archive.append("q1.txt", &[1u8; 42]).unwrap();
        archive.append("q2.txt", &[2u8; 7]).unwrap();
        archive.append("q3.txt", b"").unwrap();

        let logical = LogicalPath::new("edgar/data/1001");
        let manifest = Manifest::build(&logical, &archive);

        assert_eq!(manifest.len(), archive.len());
        for (record, entry) in manifest.records.iter().zip(archive.entries()) {
            assert_eq!(record.size_bytes, entry.size_bytes);
            assert_eq!(record.path, format!("edgar/data/1001/{}", entry.name));
        }
        assert_eq!(manifest.total_bytes(), 49);
    }

    #[test]
    fn empty_archive_gives_empty_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = Archive::create(tmp.path().join(ARCHIVE_FILE)).unwrap();
        let manifest = Manifest::build(&LogicalPath::new("edgar/data/7"), &archive);
        assert!(manifest.is_empty());
        assert_eq!(manifest, Manifest::empty());
    }

    #[test]
    fn json_shape_is_stable() {
        let manifest = Manifest {
            records: vec![ManifestRecord {
                path: "edgar/data/1/a.txt".into(),
                size_bytes: 3,
            }],
        };
        let json: serde_json::Value = serde_json::from_slice(&manifest.to_json().unwrap()).unwrap();
        assert_eq!(json["records"][0]["path"], "edgar/data/1/a.txt");
        assert_eq!(json["records"][0]["size_bytes"], 3);
        assert_eq!(Manifest::from_json(&manifest.to_json().unwrap()).unwrap(), manifest);
    }
}
