//! Append-only filing archive container.
//!
//! The container is a sequence of zstd frames. Each frame holds one record:
//!
//! ```text
//! [u32 LE header length][msgpack EntryHeader { name, size_bytes }][size_bytes raw bytes]
//! ```
//!
//! Frames are independent, so appending a filing is a single write at the end
//! of the file and readers decode the concatenated frames as one stream.
//! Nothing stops two records from sharing a name; that is the corruption
//! signature [`crate::repair`] looks for.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StorageError;

/// File name of the archive inside a mirror directory and in the object store.
pub const ARCHIVE_FILE: &str = "filings.dat";

const COMPRESSION_LEVEL: i32 = 3;

/// Headers are a name plus an integer; anything bigger is garbage.
const MAX_HEADER_LEN: usize = 64 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct EntryHeader {
    name: String,
    size_bytes: u64,
}

/// Name and size of one archive record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryInfo {
    pub name: String,
    pub size_bytes: u64,
}

/// One archive record with its contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub size_bytes: u64,
    pub data: Vec<u8>,
}

/// An archive file on local disk plus an in-memory index of its records.
///
/// The index is rebuilt from the file on [`Archive::open`] and kept in step
/// with every [`Archive::append`], so membership checks never rescan the file.
#[derive(Debug)]
pub struct Archive {
    path: PathBuf,
    index: Vec<EntryInfo>,
}

impl Archive {
    /// Create an empty archive, truncating any existing file.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        File::create(&path)?;
        Ok(Self {
            path,
            index: Vec::new(),
        })
    }

    /// Open an existing archive and index its records.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let mut reader = RecordReader::open(&path)?;
        let mut index = Vec::new();
        while let Some(header) = reader.next_header()? {
            reader.skip_body(header.size_bytes)?;
            index.push(EntryInfo {
                name: header.name,
                size_bytes: header.size_bytes,
            });
        }
        debug!(path = %path.display(), entries = index.len(), "Indexed archive");
        Ok(Self { path, index })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records in file order, duplicates included.
    pub fn entries(&self) -> &[EntryInfo] {
        &self.index
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.iter().any(|e| e.name == name)
    }

    /// True when fewer distinct names exist than records.
    pub fn has_duplicates(&self) -> bool {
        let distinct: HashSet<&str> = self.index.iter().map(|e| e.name.as_str()).collect();
        distinct.len() < self.index.len()
    }

    /// Append a record, returning the number of content bytes written.
    ///
    /// A failed write is truncated away so the file never ends in a torn frame.
    pub fn append(&mut self, name: &str, data: &[u8]) -> Result<u64, StorageError> {
        if name.is_empty() || name.contains('/') {
            return Err(StorageError::Other(format!("invalid archive entry name: {name:?}")));
        }

        let frame = encode_record(name, data)?;
        let mut file = OpenOptions::new().append(true).create(true).open(&self.path)?;
        let previous_len = file.metadata()?.len();

        if let Err(e) = write_frame(&mut file, &frame, previous_len) {
            warn!(path = %self.path.display(), entry = name, error = %e, "Append failed, torn frame truncated");
            return Err(StorageError::Io(e));
        }

        self.index.push(EntryInfo {
            name: name.to_string(),
            size_bytes: data.len() as u64,
        });
        Ok(data.len() as u64)
    }

    /// Append the contents of a file on disk as a record.
    pub fn append_file(&mut self, name: &str, source: &Path) -> Result<u64, StorageError> {
        let data = fs::read(source)?;
        self.append(name, &data)
    }

    /// Swap in the index of a file that was renamed over this archive.
    pub(crate) fn replace_index(&mut self, index: Vec<EntryInfo>) {
        self.index = index;
    }

    /// Stream every record, contents included, in file order.
    pub fn read_entries(&self) -> Result<Entries, StorageError> {
        Ok(Entries {
            reader: RecordReader::open(&self.path)?,
        })
    }

    /// Contents of the last record with `name`, if any.
    pub fn read_entry(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let mut found = None;
        for entry in self.read_entries()? {
            let entry = entry?;
            if entry.name == name {
                found = Some(entry.data);
            }
        }
        Ok(found)
    }
}

/// Iterator over full archive records.
pub struct Entries {
    reader: RecordReader,
}

impl Iterator for Entries {
    type Item = Result<ArchiveEntry, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        let header = match self.reader.next_header() {
            Ok(Some(h)) => h,
            Ok(None) => return None,
            Err(e) => return Some(Err(e)),
        };
        Some(self.reader.read_body(header.size_bytes).map(|data| ArchiveEntry {
            name: header.name,
            size_bytes: header.size_bytes,
            data,
        }))
    }
}

/// Writes a fresh archive file record by record (used by repair).
pub struct ArchiveWriter {
    path: PathBuf,
    file: File,
    index: Vec<EntryInfo>,
}

impl ArchiveWriter {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let file = File::create(&path)?;
        Ok(Self {
            path,
            file,
            index: Vec::new(),
        })
    }

    pub fn write_entry(&mut self, entry: &ArchiveEntry) -> Result<(), StorageError> {
        let frame = encode_record(&entry.name, &entry.data)?;
        self.file.write_all(&frame)?;
        self.index.push(EntryInfo {
            name: entry.name.clone(),
            size_bytes: entry.data.len() as u64,
        });
        Ok(())
    }

    /// Flush to disk and return the path and index of the written file.
    pub fn finish(self) -> Result<(PathBuf, Vec<EntryInfo>), StorageError> {
        self.file.sync_all()?;
        Ok((self.path, self.index))
    }
}

/// Append target that can be cut back to an earlier length.
trait FrameSink: Write {
    fn sync(&mut self) -> io::Result<()>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl FrameSink for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Write one whole frame or none of it.
fn write_frame(sink: &mut impl FrameSink, frame: &[u8], previous_len: u64) -> io::Result<()> {
    let written = sink.write_all(frame).and_then(|_| sink.sync());
    if let Err(e) = written {
        if let Err(trunc) = sink.truncate(previous_len) {
            warn!(error = %trunc, "Failed to truncate torn frame");
        }
        return Err(e);
    }
    Ok(())
}

fn encode_record(name: &str, data: &[u8]) -> Result<Vec<u8>, StorageError> {
    let header = rmp_serde::to_vec(&EntryHeader {
        name: name.to_string(),
        size_bytes: data.len() as u64,
    })
    .map_err(|e| StorageError::Serialize(e.to_string()))?;

    let mut record = Vec::with_capacity(4 + header.len() + data.len());
    record.extend_from_slice(&(header.len() as u32).to_le_bytes());
    record.extend_from_slice(&header);
    record.extend_from_slice(data);

    Ok(zstd::encode_all(record.as_slice(), COMPRESSION_LEVEL)?)
}

/// Sequential reader over the decompressed record stream.
struct RecordReader {
    path: PathBuf,
    /// `None` for an empty file, which holds no frames at all.
    decoder: Option<zstd::stream::read::Decoder<'static, BufReader<File>>>,
}

impl RecordReader {
    fn open(path: &Path) -> Result<Self, StorageError> {
        let file = File::open(path)?;
        let decoder = if file.metadata()?.len() == 0 {
            None
        } else {
            Some(zstd::stream::read::Decoder::new(file)?)
        };
        Ok(Self {
            path: path.to_path_buf(),
            decoder,
        })
    }

    fn next_header(&mut self) -> Result<Option<EntryHeader>, StorageError> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Ok(None);
        };

        let mut len_buf = [0u8; 4];
        let more = fill_or_eof(decoder, &mut len_buf);
        match more {
            Ok(false) => return Ok(None),
            Ok(true) => {}
            Err(e) => return Err(corrupt(&self.path, format!("record length: {e}"))),
        }

        let len = u32::from_le_bytes(len_buf) as usize;
        if len == 0 || len > MAX_HEADER_LEN {
            return Err(corrupt(&self.path, format!("implausible header length {len}")));
        }

        let mut buf = vec![0u8; len];
        if let Err(e) = decoder.read_exact(&mut buf) {
            return Err(corrupt(&self.path, format!("record header: {e}")));
        }
        rmp_serde::from_slice(&buf)
            .map(Some)
            .map_err(|e| corrupt(&self.path, format!("record header: {e}")))
    }

    fn read_body(&mut self, size: u64) -> Result<Vec<u8>, StorageError> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Err(corrupt(&self.path, "body without header"));
        };
        let mut data = Vec::new();
        let read = decoder.by_ref().take(size).read_to_end(&mut data);
        match read {
            Ok(n) if n as u64 == size => Ok(data),
            Ok(n) => Err(corrupt(&self.path, format!("record body truncated at {n} of {size} bytes"))),
            Err(e) => Err(corrupt(&self.path, format!("record body: {e}"))),
        }
    }

    fn skip_body(&mut self, size: u64) -> Result<(), StorageError> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Err(corrupt(&self.path, "body without header"));
        };
        let skipped = io::copy(&mut decoder.by_ref().take(size), &mut io::sink());
        match skipped {
            Ok(n) if n == size => Ok(()),
            Ok(n) => Err(corrupt(&self.path, format!("record body truncated at {n} of {size} bytes"))),
            Err(e) => Err(corrupt(&self.path, format!("record body: {e}"))),
        }
    }
}

fn corrupt(path: &Path, reason: impl Into<String>) -> StorageError {
    StorageError::Corrupt {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

/// Fill `buf` completely, or report a clean end of stream if nothing was read.
fn fill_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    if filled == 0 {
        Ok(false)
    } else if filled == buf.len() {
        Ok(true)
    } else {
        Err(io::Error::new(ErrorKind::UnexpectedEof, "truncated record"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Real archive file that runs out of space after `budget` more bytes.
    struct FullDisk {
        file: File,
        budget: usize,
    }

    impl Write for FullDisk {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::new(ErrorKind::Other, "no space left on device"));
            }
            let n = buf.len().min(self.budget);
            self.budget -= n;
            self.file.write(&buf[..n])
        }

        fn flush(&mut self) -> io::Result<()> {
            self.file.flush()
        }
    }

    impl FrameSink for FullDisk {
        fn sync(&mut self) -> io::Result<()> {
            self.file.sync_data()
        }

        fn truncate(&mut self, len: u64) -> io::Result<()> {
            self.file.set_len(len)
        }
    }

    #[test]
    fn torn_write_leaves_previous_length() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(ARCHIVE_FILE);
        let mut archive = Archive::create(&path).unwrap();
        archive.append("a.txt", b"first filing").unwrap();
        let before = fs::metadata(&path).unwrap().len();

        let frame = encode_record("b.txt", &[9u8; 4096]).unwrap();
        let file = OpenOptions::new().append(true).open(&path).unwrap();
        let mut sink = FullDisk { file, budget: frame.len() / 2 };
        assert!(write_frame(&mut sink, &frame, before).is_err());

        assert_eq!(fs::metadata(&path).unwrap().len(), before);
        let reopened = Archive::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.read_entry("a.txt").unwrap().unwrap(), b"first filing");
    }

    #[test]
    fn rejected_append_changes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(ARCHIVE_FILE);
        let mut archive = Archive::create(&path).unwrap();
        archive.append("a.txt", b"first filing").unwrap();
        let before = fs::metadata(&path).unwrap().len();

        assert!(archive.append("nested/b.txt", b"x").is_err());
        assert_eq!(fs::metadata(&path).unwrap().len(), before);
        assert_eq!(archive.len(), 1);
    }

    #[test]
    fn empty_archive_has_no_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(ARCHIVE_FILE);
        Archive::create(&path).unwrap();

        let archive = Archive::open(&path).unwrap();
        assert!(archive.is_empty());
        assert!(!archive.has_duplicates());
        assert_eq!(archive.read_entries().unwrap().count(), 0);
    }

    #[test]
    fn appended_entries_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(ARCHIVE_FILE);
        let mut archive = Archive::create(&path).unwrap();

        assert_eq!(archive.append("a.txt", b"hello").unwrap(), 5);
        assert_eq!(archive.append("b.txt", &[7u8; 300]).unwrap(), 300);

        let reopened = Archive::open(&path).unwrap();
        assert_eq!(
            reopened.entries(),
            &[
                EntryInfo { name: "a.txt".into(), size_bytes: 5 },
                EntryInfo { name: "b.txt".into(), size_bytes: 300 },
            ]
        );
        assert_eq!(reopened.read_entry("a.txt").unwrap().unwrap(), b"hello");
        assert!(reopened.contains("b.txt"));
        assert!(!reopened.contains("c.txt"));
    }

    #[test]
    fn duplicate_names_are_kept_and_detected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(ARCHIVE_FILE);
        let mut archive = Archive::create(&path).unwrap();
        archive.append("x.txt", b"").unwrap();
        archive.append("x.txt", b"second").unwrap();

        let reopened = Archive::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert!(reopened.has_duplicates());
        assert_eq!(reopened.read_entry("x.txt").unwrap().unwrap(), b"second");
    }

    #[test]
    fn append_file_reads_source() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("download.txt");
        std::fs::write(&src, b"filing body").unwrap();

        let mut archive = Archive::create(tmp.path().join(ARCHIVE_FILE)).unwrap();
        assert_eq!(archive.append_file("filing.txt", &src).unwrap(), 11);
        assert!(archive.contains("filing.txt"));
    }

    #[test]
    fn rejects_names_with_slashes() {
        let tmp = tempfile::tempdir().unwrap();
        let mut archive = Archive::create(tmp.path().join(ARCHIVE_FILE)).unwrap();
        assert!(archive.append("dir/file.txt", b"x").is_err());
        assert!(archive.append("", b"x").is_err());
        assert!(archive.is_empty());
    }

    #[test]
    fn garbage_file_is_reported_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(ARCHIVE_FILE);
        std::fs::write(&path, b"definitely not zstd").unwrap();

        let err = Archive::open(&path).unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. } | StorageError::Io(_)));
    }

    #[test]
    fn truncated_frame_is_reported_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(ARCHIVE_FILE);
        let mut archive = Archive::create(&path).unwrap();
        archive.append("a.txt", &[1u8; 4096]).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        assert!(Archive::open(&path).is_err());
    }
}
