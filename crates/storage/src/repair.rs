//! Self-healing pass for archives left behind by failed writes.
//!
//! Duplicate names are the corruption signature. When one is found the
//! archive is rebuilt into a sibling temp file that keeps only positive-size
//! records, one per name (the last one appended wins), and the temp file is
//! renamed over the original. Until the rename the original is untouched.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use crate::archive::{Archive, ArchiveWriter, EntryInfo};
use crate::error::StorageError;

const REPAIR_SUFFIX: &str = ".repair";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairOutcome {
    /// No duplicate names; the file was not touched.
    Clean,
    Rewritten {
        kept: usize,
        dropped_empty: usize,
        dropped_duplicates: usize,
    },
}

impl RepairOutcome {
    pub fn rewrote(&self) -> bool {
        matches!(self, RepairOutcome::Rewritten { .. })
    }
}

/// Rebuild `archive` if it contains duplicate entry names.
///
/// On error the original file is left as it was and the error is returned.
pub fn repair(archive: &mut Archive) -> Result<RepairOutcome, StorageError> {
    if !archive.has_duplicates() {
        info!(path = %archive.path().display(), "Archive has no duplicate files");
        return Ok(RepairOutcome::Clean);
    }

    error!(
        path = %archive.path().display(),
        entries = archive.len(),
        "Archive has duplicate files, removing files with null size"
    );

    let keep = select_survivors(archive.entries());
    let dropped_empty = archive.entries().iter().filter(|e| e.size_bytes == 0).count();
    let dropped_duplicates = archive.len() - keep.len() - dropped_empty;

    let target = archive.path().to_path_buf();
    let temp = repair_path(&target);

    let index = match rewrite(archive, &keep, &temp) {
        Ok(index) => index,
        Err(e) => {
            warn!(path = %target.display(), error = %e, "Failed to clean archive, keeping original");
            fs::remove_file(&temp).ok();
            return Err(e);
        }
    };

    if let Err(e) = fs::rename(&temp, &target) {
        warn!(path = %target.display(), error = %e, "Failed to swap in cleaned archive, keeping original");
        fs::remove_file(&temp).ok();
        return Err(StorageError::Io(e));
    }
    archive.replace_index(index);

    info!(
        path = %target.display(),
        kept = keep.len(),
        dropped_empty,
        dropped_duplicates,
        "Replaced archive with cleaned copy"
    );

    Ok(RepairOutcome::Rewritten {
        kept: keep.len(),
        dropped_empty,
        dropped_duplicates,
    })
}

/// Positions of the last positive-size record for each name.
fn select_survivors(entries: &[EntryInfo]) -> HashSet<usize> {
    let mut last_positive: HashMap<&str, usize> = HashMap::new();
    for (pos, entry) in entries.iter().enumerate() {
        if entry.size_bytes > 0 {
            last_positive.insert(entry.name.as_str(), pos);
        }
    }
    last_positive.into_values().collect()
}

fn rewrite(
    archive: &Archive,
    keep: &HashSet<usize>,
    temp: &Path,
) -> Result<Vec<EntryInfo>, StorageError> {
    let mut writer = ArchiveWriter::create(temp)?;
    for (pos, entry) in archive.read_entries()?.enumerate() {
        let entry = entry?;
        if keep.contains(&pos) {
            info!(entry = %entry.name, size = entry.size_bytes, "Valid file");
            writer.write_entry(&entry)?;
        } else if entry.size_bytes == 0 {
            error!(entry = %entry.name, "Zero size");
        } else {
            warn!(entry = %entry.name, size = entry.size_bytes, "Superseded duplicate");
        }
    }
    let (_, index) = writer.finish()?;
    Ok(index)
}

fn repair_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(REPAIR_SUFFIX);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ARCHIVE_FILE;

    fn archive_with(dir: &Path, entries: &[(&str, usize)]) -> Archive {
        let mut archive = Archive::create(dir.join(ARCHIVE_FILE)).unwrap();
        for (name, size) in entries {
            archive.append(name, &vec![b'x'; *size]).unwrap();
        }
        archive
    }

    fn names(archive: &Archive) -> Vec<&str> {
        archive.entries().iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn zero_size_duplicate_is_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let mut archive = archive_with(tmp.path(), &[("10-K.txt", 0), ("10-K.txt", 120)]);

        let outcome = repair(&mut archive).unwrap();
        assert_eq!(
            outcome,
            RepairOutcome::Rewritten { kept: 1, dropped_empty: 1, dropped_duplicates: 0 }
        );

        let reopened = Archive::open(archive.path()).unwrap();
        assert_eq!(
            reopened.entries(),
            &[EntryInfo { name: "10-K.txt".into(), size_bytes: 120 }]
        );
        assert_eq!(reopened.entries(), archive.entries());
    }

    #[test]
    fn repair_converges_and_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let mut archive = archive_with(
            tmp.path(),
            &[("a", 10), ("b", 0), ("a", 0), ("c", 5), ("b", 7), ("d", 0), ("c", 9)],
        );

        assert!(repair(&mut archive).unwrap().rewrote());

        let reopened = Archive::open(archive.path()).unwrap();
        assert!(!reopened.has_duplicates());
        assert!(reopened.entries().iter().all(|e| e.size_bytes > 0));
        assert_eq!(names(&reopened), vec!["a", "b", "c"]);
        // last positive-size "c" wins
        assert_eq!(reopened.entries()[2].size_bytes, 9);

        let before = std::fs::read(archive.path()).unwrap();
        assert_eq!(repair(&mut archive).unwrap(), RepairOutcome::Clean);
        assert_eq!(std::fs::read(archive.path()).unwrap(), before);
    }

    #[test]
    fn clean_archive_is_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        // zero-size entries without duplicates are not a corruption signature
        let mut archive = archive_with(tmp.path(), &[("a", 3), ("b", 0)]);
        let before = std::fs::read(archive.path()).unwrap();

        assert_eq!(repair(&mut archive).unwrap(), RepairOutcome::Clean);
        assert_eq!(std::fs::read(archive.path()).unwrap(), before);
        assert_eq!(archive.len(), 2);
    }

    #[test]
    fn failed_rewrite_preserves_original() {
        let tmp = tempfile::tempdir().unwrap();
        let mut archive = archive_with(tmp.path(), &[("a", 0), ("a", 4)]);
        let before = std::fs::read(archive.path()).unwrap();

        // A directory squatting on the temp path makes the rewrite fail.
        std::fs::create_dir(repair_path(archive.path())).unwrap();

        assert!(repair(&mut archive).is_err());
        assert_eq!(std::fs::read(archive.path()).unwrap(), before);
        assert_eq!(archive.len(), 2);
        assert!(Archive::open(archive.path()).unwrap().has_duplicates());
    }

    #[test]
    fn repair_path_appends_suffix() {
        assert_eq!(
            repair_path(Path::new("/tmp/sec/x/filings.dat")),
            PathBuf::from("/tmp/sec/x/filings.dat.repair")
        );
    }
}
