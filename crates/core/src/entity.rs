use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::VaultError;

/// A filer identifier (SEC CIK).
///
/// All-digit ids are normalized by stripping leading zeros, so `"0001001"`
/// and `1001` name the same entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(raw: impl AsRef<str>) -> Self {
        let trimmed = raw.as_ref().trim();
        if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
            let stripped = trimmed.trim_start_matches('0');
            let normalized = if stripped.is_empty() { "0" } else { stripped };
            Self(normalized.to_string())
        } else {
            Self(trimmed.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<u64> for EntityId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

/// Directory-like grouping shared by every filing of one entity,
/// e.g. `edgar/data/1001`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalPath(String);

impl LogicalPath {
    pub fn new(path: impl AsRef<str>) -> Self {
        Self(path.as_ref().trim_matches('/').to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `logical_path/name`.
    pub fn join(&self, name: &str) -> String {
        if self.0.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.0, name)
        }
    }
}

impl fmt::Display for LogicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One document listed for an entity in the filings catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilingReference {
    pub entity_id: EntityId,
    /// Path relative to the document source root,
    /// e.g. `edgar/data/1001/0001001-20-000010.txt`.
    pub remote_path: String,
    pub logical_path: LogicalPath,
}

impl FilingReference {
    /// Split a remote path into its logical path and file name.
    ///
    /// The path needs at least one directory segment and a non-empty final
    /// segment. Empty, `.` and `..` segments are rejected so the logical path
    /// is safe to use as a local directory.
    pub fn from_remote_path(entity_id: EntityId, remote_path: &str) -> Result<Self, VaultError> {
        let trimmed = remote_path.trim().trim_start_matches('/');
        let (dir, name) = trimmed
            .rsplit_once('/')
            .ok_or_else(|| VaultError::InvalidPath(remote_path.to_string()))?;

        let bad_segment = |seg: &str| seg.is_empty() || seg == "." || seg == "..";
        if dir.is_empty() || bad_segment(name) || dir.split('/').any(bad_segment) {
            return Err(VaultError::InvalidPath(remote_path.to_string()));
        }

        Ok(Self {
            entity_id,
            remote_path: trimmed.to_string(),
            logical_path: LogicalPath::new(dir),
        })
    }

    /// Final path segment; the archive entry name for this filing.
    pub fn file_name(&self) -> &str {
        self.remote_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.remote_path)
    }
}

/// A unit of queue work: one entity to synchronize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub entity_id: EntityId,
    /// Provider handle used to acknowledge the delivery (SQS receipt handle).
    pub delivery_token: String,
    pub message_id: String,
    /// How many times the queue has delivered this message.
    pub attempt_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_id_strips_leading_zeros() {
        assert_eq!(EntityId::new("0001001"), EntityId::new("1001"));
        assert_eq!(EntityId::new("0000").as_str(), "0");
        assert_eq!(EntityId::from(1001u64).as_str(), "1001");
    }

    #[test]
    fn entity_id_keeps_non_numeric_ids() {
        assert_eq!(EntityId::new(" ACME-01 ").as_str(), "ACME-01");
    }

    #[test]
    fn filing_reference_splits_path() {
        let f = FilingReference::from_remote_path(
            EntityId::new("1001"),
            "edgar/data/1001/0001001-20-000010.txt",
        )
        .unwrap();
        assert_eq!(f.logical_path.as_str(), "edgar/data/1001");
        assert_eq!(f.file_name(), "0001001-20-000010.txt");
        assert_eq!(
            f.logical_path.join(f.file_name()),
            "edgar/data/1001/0001001-20-000010.txt"
        );
    }

    #[test]
    fn filing_reference_rejects_bare_names() {
        assert!(FilingReference::from_remote_path(EntityId::new("1"), "filing.txt").is_err());
        assert!(FilingReference::from_remote_path(EntityId::new("1"), "edgar/data/").is_err());
        assert!(FilingReference::from_remote_path(EntityId::new("1"), "edgar//x.txt").is_err());
        assert!(FilingReference::from_remote_path(EntityId::new("1"), "edgar/../x.txt").is_err());
    }
}
