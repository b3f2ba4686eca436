//! Append-only trajectory data files.
//!
//! Each file starts with an 8-byte header `[magic "STRJ"][version: u8][flags: u8][reserved: 2]`
//! followed by records in the header's format version.

use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::record::{self, FormatVersion, Record};
use crate::error::{StorageError, StorageResult};

pub const MAGIC: &[u8; 4] = b"STRJ";
pub const HEADER_LEN: u64 = 8;
const FLAG_COMPRESSION: u8 = 0b0000_0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub version: FormatVersion,
    /// Whether compression was enabled when the file was created. Each v2 record
    /// still carries its own codec byte.
    pub compressed: bool,
}

impl FileHeader {
    pub fn to_bytes(self) -> [u8; HEADER_LEN as usize] {
        let flags = if self.compressed { FLAG_COMPRESSION } else { 0 };
        let mut out = [0u8; HEADER_LEN as usize];
        out[..4].copy_from_slice(MAGIC);
        out[4] = self.version.as_u8();
        out[5] = flags;
        out
    }

    pub fn parse(bytes: &[u8]) -> StorageResult<Self> {
        if bytes.len() < HEADER_LEN as usize || &bytes[..4] != MAGIC {
            return Err(StorageError::RecordCorrupted {
                file: 0,
                offset: 0,
                reason: "missing data file header".into(),
            });
        }
        Ok(Self {
            version: FormatVersion::try_from(bytes[4])?,
            compressed: bytes[5] & FLAG_COMPRESSION != 0,
        })
    }
}

/// Parse a header read from `file_id`, attributing corruption to that file.
pub fn parse_header(file_id: u32, bytes: &[u8]) -> StorageResult<FileHeader> {
    FileHeader::parse(bytes).map_err(|e| with_file(e, file_id))
}

pub fn file_name(file_id: u32) -> String {
    format!("traj-{file_id:06}.dat")
}

pub fn file_path(dir: &Path, file_id: u32) -> PathBuf {
    dir.join(file_name(file_id))
}

pub fn parse_file_id(name: &str) -> Option<u32> {
    name.strip_prefix("traj-")?.strip_suffix(".dat")?.parse().ok()
}

/// Data file IDs present in `dir`, ascending.
pub async fn list_files(dir: &Path) -> StorageResult<Vec<u32>> {
    let mut ids = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        if let Some(id) = entry.file_name().to_str().and_then(parse_file_id) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

pub async fn read_header(dir: &Path, file_id: u32) -> StorageResult<FileHeader> {
    let mut file = fs::File::open(file_path(dir, file_id)).await?;
    let mut buf = [0u8; HEADER_LEN as usize];
    file.read_exact(&mut buf).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => corrupted(file_id, 0, "file shorter than header"),
        _ => e.into(),
    })?;
    parse_header(file_id, &buf)
}

/// Create (or truncate) a data file containing only its header. Returns the header length.
pub async fn create(dir: &Path, file_id: u32, header: FileHeader) -> StorageResult<u64> {
    let mut file = fs::File::create(file_path(dir, file_id)).await?;
    file.write_all(&header.to_bytes()).await?;
    file.sync_data().await?;
    Ok(HEADER_LEN)
}

pub async fn len(dir: &Path, file_id: u32) -> StorageResult<u64> {
    Ok(fs::metadata(file_path(dir, file_id)).await?.len())
}

/// Append `bytes` at the end of the file and sync.
pub async fn append(dir: &Path, file_id: u32, bytes: &[u8]) -> StorageResult<()> {
    let mut file = fs::OpenOptions::new()
        .append(true)
        .open(file_path(dir, file_id))
        .await?;
    file.write_all(bytes).await?;
    file.sync_data().await?;
    Ok(())
}

/// Cut the file back to `len` bytes and sync.
pub async fn truncate(dir: &Path, file_id: u32, len: u64) -> StorageResult<()> {
    let file = fs::OpenOptions::new()
        .write(true)
        .open(file_path(dir, file_id))
        .await?;
    file.set_len(len).await?;
    file.sync_data().await?;
    Ok(())
}

/// Read exactly one record slice. Never reads the rest of the file.
pub async fn read_at(dir: &Path, file_id: u32, offset: u64, length: u32) -> StorageResult<Vec<u8>> {
    let mut file = fs::File::open(file_path(dir, file_id)).await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; length as usize];
    file.read_exact(&mut buf).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => corrupted(file_id, offset, "record extends past end of file"),
        _ => e.into(),
    })?;
    Ok(buf)
}

/// A record found while scanning a whole file.
#[derive(Debug)]
pub struct ScannedRecord {
    pub offset: u64,
    pub length: u32,
    pub record: Record,
}

#[derive(Debug)]
pub struct FileScan {
    pub header: FileHeader,
    pub records: Vec<ScannedRecord>,
    /// Set when the scan stopped early at an undecodable record; everything before it is valid.
    pub truncated_at: Option<(u64, String)>,
    pub len: u64,
}

/// Decode every record of a file held in memory. Used for index rebuilds, compaction
/// and migration, never for point lookups.
pub fn scan(file_id: u32, bytes: &[u8]) -> StorageResult<FileScan> {
    let header = parse_header(file_id, bytes)?;
    let mut records = Vec::new();
    let mut truncated_at = None;
    let mut pos = HEADER_LEN as usize;

    while pos < bytes.len() {
        let rest = &bytes[pos..];
        let Some(total) = record::record_len(rest, header.version).filter(|&t| t <= rest.len()) else {
            truncated_at = Some((pos as u64, "incomplete record".to_string()));
            break;
        };
        match record::decode_record(&rest[..total], header.version) {
            Ok(record) => records.push(ScannedRecord {
                offset: pos as u64,
                length: total as u32,
                record,
            }),
            Err(reason) => {
                truncated_at = Some((pos as u64, reason));
                break;
            }
        }
        pos += total;
    }

    Ok(FileScan {
        header,
        records,
        truncated_at,
        len: bytes.len() as u64,
    })
}

pub(crate) fn corrupted(file: u32, offset: u64, reason: impl Into<String>) -> StorageError {
    StorageError::RecordCorrupted {
        file,
        offset,
        reason: reason.into(),
    }
}

fn with_file(error: StorageError, file_id: u32) -> StorageError {
    match error {
        StorageError::RecordCorrupted { offset, reason, .. } => StorageError::RecordCorrupted {
            file: file_id,
            offset,
            reason,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::types::Trajectory;
    use tempfile::TempDir;

    fn put(route: &str) -> Record {
        Record::Put {
            trajectory: Trajectory::new(route, vec!["p1".into()], vec![]),
        }
    }

    #[test]
    fn file_names_round_trip() {
        assert_eq!(file_name(7), "traj-000007.dat");
        assert_eq!(parse_file_id("traj-000007.dat"), Some(7));
        assert_eq!(parse_file_id("index.json"), None);
        assert_eq!(parse_file_id("traj-abc.dat"), None);
    }

    #[test]
    fn header_round_trip() {
        let header = FileHeader {
            version: FormatVersion::V1,
            compressed: true,
        };
        assert_eq!(FileHeader::parse(&header.to_bytes()).unwrap(), header);
        assert!(FileHeader::parse(b"NOPE\x01\x00\x00\x00").is_err());
    }

    #[tokio::test]
    async fn append_then_read_slice_and_scan() {
        let tmp = TempDir::new().unwrap();
        let header = FileHeader {
            version: FormatVersion::V2,
            compressed: false,
        };
        let mut offset = create(tmp.path(), 0, header).await.unwrap();

        let mut slots = Vec::new();
        for route in ["a", "b", "c"] {
            let record = put(route);
            let bytes = record::encode_record(&record, header.version, false).unwrap();
            append(tmp.path(), 0, &bytes).await.unwrap();
            slots.push((offset, bytes.len() as u32, record));
            offset += bytes.len() as u64;
        }
        assert_eq!(len(tmp.path(), 0).await.unwrap(), offset);

        let (at, length, expected) = &slots[1];
        let slice = read_at(tmp.path(), 0, *at, *length).await.unwrap();
        assert_eq!(&record::decode_record(&slice, header.version).unwrap(), expected);

        let bytes = tokio::fs::read(file_path(tmp.path(), 0)).await.unwrap();
        let scan = scan(0, &bytes).unwrap();
        assert_eq!(scan.records.len(), 3);
        assert!(scan.truncated_at.is_none());
        assert_eq!(scan.records[2].offset, slots[2].0);
    }

    #[test]
    fn scan_stops_at_torn_tail() {
        let header = FileHeader {
            version: FormatVersion::V1,
            compressed: false,
        };
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend(record::encode_record(&put("a"), header.version, false).unwrap());
        let second = record::encode_record(&put("b"), header.version, false).unwrap();
        bytes.extend(&second[..second.len() / 2]);

        let scan = scan(3, &bytes).unwrap();
        assert_eq!(scan.records.len(), 1);
        assert!(scan.truncated_at.is_some());
    }
}
