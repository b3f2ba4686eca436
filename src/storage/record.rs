//! Versioned trajectory record encoding.
//!
//! ```text
//! v1: [len: u32][JSON record, len bytes]
//! v2: [len: u32][crc32: u32][codec: u8][payload, len bytes]
//! ```
//!
//! The v2 checksum covers the codec byte and the payload. The v2 payload is a compact
//! binary encoding of the record, LZ4 block-compressed when that makes it smaller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checksum::Crc32;
use crate::error::{StorageError, StorageResult};
use crate::learning::types::Trajectory;

/// Payloads smaller than this are never compressed.
const MIN_COMPRESS_LEN: usize = 128;
const V1_HEADER_LEN: usize = 4;
const V2_HEADER_LEN: usize = 9;
/// Upper bound on a single record, to reject garbage lengths early.
pub const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum FormatVersion {
    /// Length-prefixed JSON records.
    V1 = 1,
    /// Checksummed binary records with optional LZ4 compression.
    V2 = 2,
}

impl FormatVersion {
    pub const LATEST: Self = Self::V2;

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for FormatVersion {
    type Error = StorageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            other => Err(StorageError::UnsupportedVersion(other)),
        }
    }
}

impl From<FormatVersion> for u8 {
    fn from(version: FormatVersion) -> Self {
        version.as_u8()
    }
}

impl std::fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.as_u8())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Codec {
    None = 0,
    Lz4 = 1,
}

/// One entry of a data file: a trajectory version or a tombstone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Record {
    Put { trajectory: Trajectory },
    Delete { id: String },
}

impl Record {
    pub fn id(&self) -> &str {
        match self {
            Self::Put { trajectory } => &trajectory.id,
            Self::Delete { id } => id,
        }
    }
}

pub fn encode_record(
    record: &Record,
    version: FormatVersion,
    compress: bool,
) -> StorageResult<Vec<u8>> {
    match version {
        FormatVersion::V1 => {
            let json = serde_json::to_vec(record)?;
            let mut out = Vec::with_capacity(V1_HEADER_LEN + json.len());
            out.extend_from_slice(&(json.len() as u32).to_le_bytes());
            out.extend_from_slice(&json);
            Ok(out)
        }
        FormatVersion::V2 => {
            let raw = encode_binary(record);
            let (codec, payload) = if compress && raw.len() >= MIN_COMPRESS_LEN {
                let packed = lz4_flex::compress_prepend_size(&raw);
                if packed.len() < raw.len() {
                    (Codec::Lz4, packed)
                } else {
                    (Codec::None, raw)
                }
            } else {
                (Codec::None, raw)
            };

            let mut crc = Crc32::new();
            crc.update(&[codec as u8]);
            crc.update(&payload);

            let mut out = Vec::with_capacity(V2_HEADER_LEN + payload.len());
            out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            out.extend_from_slice(&crc.finish().to_le_bytes());
            out.push(codec as u8);
            out.extend_from_slice(&payload);
            Ok(out)
        }
    }
}

/// Total encoded length of the record starting at `buf[0]`, if the header is complete.
pub fn record_len(buf: &[u8], version: FormatVersion) -> Option<usize> {
    if buf.len() < 4 {
        return None;
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_RECORD_LEN {
        return None;
    }
    Some(match version {
        FormatVersion::V1 => V1_HEADER_LEN + len,
        FormatVersion::V2 => V2_HEADER_LEN + len,
    })
}

/// Decode exactly one record occupying all of `buf`.
pub fn decode_record(buf: &[u8], version: FormatVersion) -> Result<Record, String> {
    let total = record_len(buf, version).ok_or("truncated or oversized record header")?;
    if total != buf.len() {
        return Err(format!("record length {total} does not match slice of {} bytes", buf.len()));
    }
    match version {
        FormatVersion::V1 => serde_json::from_slice(&buf[V1_HEADER_LEN..])
            .map_err(|e| format!("invalid JSON record: {e}")),
        FormatVersion::V2 => {
            let stored_crc = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
            let codec = buf[8];
            let payload = &buf[V2_HEADER_LEN..];

            let mut crc = Crc32::new();
            crc.update(&[codec]);
            crc.update(payload);
            if crc.finish() != stored_crc {
                return Err("checksum mismatch".into());
            }

            match codec {
                c if c == Codec::None as u8 => decode_binary(payload),
                c if c == Codec::Lz4 as u8 => {
                    let raw = lz4_flex::decompress_size_prepended(payload)
                        .map_err(|e| format!("lz4 decompression failed: {e}"))?;
                    decode_binary(&raw)
                }
                other => Err(format!("unknown codec {other}")),
            }
        }
    }
}

const KIND_PUT: u8 = 1;
const KIND_DELETE: u8 = 2;

fn encode_binary(record: &Record) -> Vec<u8> {
    let mut w = ByteWriter::default();
    match record {
        Record::Put { trajectory: t } => {
            w.u8(KIND_PUT);
            w.str(&t.id);
            w.str(&t.route);
            w.i64(t.created_at.timestamp());
            w.u32(t.created_at.timestamp_subsec_nanos());
            match t.quality {
                Some(q) => {
                    w.u8(1);
                    w.f64(q);
                }
                None => w.u8(0),
            }
            w.u8(t.processed as u8);
            w.strs(&t.pattern_ids);
            w.strs(&t.context_ids);
        }
        Record::Delete { id } => {
            w.u8(KIND_DELETE);
            w.str(id);
        }
    }
    w.0
}

fn decode_binary(buf: &[u8]) -> Result<Record, String> {
    let mut r = ByteReader { buf, pos: 0 };
    let record = match r.u8()? {
        KIND_PUT => {
            let id = r.str()?;
            let route = r.str()?;
            let secs = r.i64()?;
            let nanos = r.u32()?;
            let created_at: DateTime<Utc> = DateTime::from_timestamp(secs, nanos)
                .ok_or_else(|| format!("invalid timestamp {secs}.{nanos}"))?;
            let quality = match r.u8()? {
                0 => None,
                _ => Some(r.f64()?),
            };
            let processed = r.u8()? != 0;
            let pattern_ids = r.strs()?;
            let context_ids = r.strs()?;
            Record::Put {
                trajectory: Trajectory {
                    id,
                    route,
                    pattern_ids,
                    context_ids,
                    created_at,
                    quality,
                    processed,
                },
            }
        }
        KIND_DELETE => Record::Delete { id: r.str()? },
        other => return Err(format!("unknown record kind {other}")),
    };
    if r.pos != buf.len() {
        return Err(format!("{} trailing bytes after record", buf.len() - r.pos));
    }
    Ok(record)
}

#[derive(Default)]
struct ByteWriter(Vec<u8>);

impl ByteWriter {
    fn u8(&mut self, v: u8) {
        self.0.push(v);
    }

    fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn f64(&mut self, v: f64) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn str(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.0.extend_from_slice(s.as_bytes());
    }

    fn strs(&mut self, items: &[String]) {
        self.u32(items.len() as u32);
        for s in items {
            self.str(s);
        }
    }
}

struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| format!("unexpected end of record at byte {}", self.pos))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], String> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, String> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, String> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, String> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn f64(&mut self) -> Result<f64, String> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    fn str(&mut self) -> Result<String, String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| format!("invalid UTF-8: {e}"))
    }

    fn strs(&mut self) -> Result<Vec<String>, String> {
        let count = self.u32()? as usize;
        // each string needs at least its 4-byte length prefix
        if count > (self.buf.len() - self.pos) / 4 {
            return Err(format!("implausible list length {count}"));
        }
        (0..count).map(|_| self.str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(patterns: usize) -> Trajectory {
        let mut t = Trajectory::new(
            "coding.review",
            (0..patterns).map(|i| format!("pattern-{i}")).collect(),
            vec!["ctx-a".into(), "ctx-b".into()],
        );
        t.quality = Some(0.875);
        t.processed = true;
        t
    }

    #[test]
    fn both_versions_preserve_trajectories() {
        for version in [FormatVersion::V1, FormatVersion::V2] {
            let record = Record::Put { trajectory: scored(3) };
            let bytes = encode_record(&record, version, true).unwrap();
            assert_eq!(record_len(&bytes, version), Some(bytes.len()));
            assert_eq!(decode_record(&bytes, version).unwrap(), record);
        }
    }

    #[test]
    fn large_v2_records_are_compressed() {
        let record = Record::Put { trajectory: scored(200) };
        let plain = encode_record(&record, FormatVersion::V2, false).unwrap();
        let packed = encode_record(&record, FormatVersion::V2, true).unwrap();
        assert_eq!(plain[8], Codec::None as u8);
        assert_eq!(packed[8], Codec::Lz4 as u8);
        assert!(packed.len() < plain.len());
        assert_eq!(decode_record(&packed, FormatVersion::V2).unwrap(), record);
    }

    #[test]
    fn v2_detects_bit_flips() {
        let record = Record::Put { trajectory: scored(2) };
        let mut bytes = encode_record(&record, FormatVersion::V2, false).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x40;
        assert_eq!(
            decode_record(&bytes, FormatVersion::V2).unwrap_err(),
            "checksum mismatch"
        );
    }

    #[test]
    fn tombstones_encode_in_both_versions() {
        let record = Record::Delete { id: "traj-1".into() };
        for version in [FormatVersion::V1, FormatVersion::V2] {
            let bytes = encode_record(&record, version, true).unwrap();
            let decoded = decode_record(&bytes, version).unwrap();
            assert_eq!(decoded.id(), "traj-1");
        }
    }

    #[test]
    fn truncated_slices_are_rejected() {
        let bytes = encode_record(&Record::Put { trajectory: scored(1) }, FormatVersion::V2, false)
            .unwrap();
        assert!(decode_record(&bytes[..bytes.len() - 3], FormatVersion::V2).is_err());
        assert!(decode_record(&bytes[..2], FormatVersion::V2).is_err());
    }

    #[test]
    fn version_parsing() {
        assert_eq!(FormatVersion::try_from(1).unwrap(), FormatVersion::V1);
        assert!(matches!(
            FormatVersion::try_from(7),
            Err(StorageError::UnsupportedVersion(7))
        ));
        assert_eq!(FormatVersion::V2.to_string(), "v2");
    }
}
