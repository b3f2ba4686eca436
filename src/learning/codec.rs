//! Binary weight-file codec.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! [version: u32][metadata_len: u32][metadata: UTF-8 JSON, metadata_len bytes]
//! [weights: f32 × slots][fisher: f32 × slots][crc32: u32 over every preceding byte]
//! ```
//!
//! Slot order is the canonical `(route, pattern)` enumeration of [`WeightStore`]; the
//! metadata records that enumeration so the float blocks can be mapped back. Encoding and
//! decoding are pure functions. Checkpoint files use the same codec with a
//! [`CheckpointHeader`] in the metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use super::checkpoint::CheckpointHeader;
use super::update::RouteStats;
use super::weights::{WeightEntry, WeightStore};
use crate::checksum::crc32;
use crate::error::{LearningError, LearningResult};

/// The weight-file format the current binary reads and writes.
pub const WEIGHT_FORMAT_VERSION: u32 = 1;

const HEADER_LEN: usize = 8;
const CHECKSUM_LEN: usize = 4;
/// Guard against absurd metadata lengths in corrupted headers.
const MAX_METADATA_LEN: usize = 256 * 1024 * 1024;

/// Typed metadata block of format version 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightFileMetadata {
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub route_stats: BTreeMap<String, RouteStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<CheckpointHeader>,
}

impl WeightFileMetadata {
    pub fn now(route_stats: BTreeMap<String, RouteStats>) -> Self {
        Self {
            saved_at: Utc::now(),
            route_stats,
            checkpoint: None,
        }
    }
}

/// On-disk metadata: the typed block plus the slot enumeration.
#[derive(Serialize, Deserialize)]
struct StoredMetadata {
    #[serde(flatten)]
    metadata: WeightFileMetadata,
    slots: Vec<(String, String)>,
}

/// Decoded content of a weight or checkpoint file.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightFile {
    pub metadata: WeightFileMetadata,
    pub store: WeightStore,
}

fn corrupt(reason: impl Into<String>) -> LearningError {
    LearningError::WeightPersistence(reason.into())
}

pub fn encode(file: &WeightFile) -> LearningResult<Vec<u8>> {
    let slots: Vec<(String, String)> = file
        .store
        .iter()
        .map(|(route, pattern, _)| (route.to_string(), pattern.to_string()))
        .collect();
    let stored = StoredMetadata {
        metadata: file.metadata.clone(),
        slots,
    };
    let metadata = serde_json::to_vec(&stored)
        .map_err(|e| corrupt(format!("failed to encode metadata: {e}")))?;
    let metadata_len = u32::try_from(metadata.len())
        .map_err(|_| corrupt(format!("metadata too large: {} bytes", metadata.len())))?;

    let slot_count = file.store.len();
    let mut buf =
        Vec::with_capacity(HEADER_LEN + metadata.len() + slot_count * 8 + CHECKSUM_LEN);
    buf.extend_from_slice(&WEIGHT_FORMAT_VERSION.to_le_bytes());
    buf.extend_from_slice(&metadata_len.to_le_bytes());
    buf.extend_from_slice(&metadata);
    for (_, _, entry) in file.store.iter() {
        buf.extend_from_slice(&entry.weight.to_le_bytes());
    }
    for (_, _, entry) in file.store.iter() {
        buf.extend_from_slice(&entry.fisher.to_le_bytes());
    }
    let checksum = crc32(&buf);
    buf.extend_from_slice(&checksum.to_le_bytes());
    Ok(buf)
}

pub fn decode(bytes: &[u8]) -> LearningResult<WeightFile> {
    if bytes.len() < HEADER_LEN + CHECKSUM_LEN {
        return Err(corrupt(format!("file too short: {} bytes", bytes.len())));
    }

    let (body, tail) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
    let stored_checksum = read_u32(tail, 0);
    let actual = crc32(body);
    if stored_checksum != actual {
        return Err(corrupt(format!(
            "checksum mismatch: stored {stored_checksum:#010x}, computed {actual:#010x}"
        )));
    }

    let version = read_u32(body, 0);
    if version != WEIGHT_FORMAT_VERSION {
        return Err(corrupt(format!("unsupported weight format version {version}")));
    }

    let metadata_len = read_u32(body, 4) as usize;
    if metadata_len > MAX_METADATA_LEN || HEADER_LEN + metadata_len > body.len() {
        return Err(corrupt(format!(
            "metadata length {metadata_len} exceeds file body of {} bytes",
            body.len()
        )));
    }
    let metadata_bytes = &body[HEADER_LEN..HEADER_LEN + metadata_len];
    let stored: StoredMetadata = serde_json::from_slice(metadata_bytes)
        .map_err(|e| corrupt(format!("invalid metadata: {e}")))?;

    let slot_count = stored.slots.len();
    let floats = &body[HEADER_LEN + metadata_len..];
    if floats.len() != slot_count * 8 {
        return Err(corrupt(format!(
            "expected {} bytes of weights for {slot_count} slots, found {}",
            slot_count * 8,
            floats.len()
        )));
    }

    let mut store = WeightStore::new();
    for (i, (route, pattern)) in stored.slots.iter().enumerate() {
        let weight = read_f32(floats, i * 4);
        let fisher = read_f32(floats, (slot_count + i) * 4);
        store.insert(route, pattern, WeightEntry { weight, fisher });
    }
    if store.len() != slot_count {
        return Err(corrupt("duplicate slots in metadata"));
    }

    Ok(WeightFile {
        metadata: stored.metadata,
        store,
    })
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(word)
}

fn read_f32(bytes: &[u8], at: usize) -> f32 {
    f32::from_bits(read_u32(bytes, at))
}

/// Encode and write atomically (temp file + rename).
pub async fn save(path: &Path, file: &WeightFile) -> LearningResult<()> {
    let bytes = encode(file)?;
    crate::storage::write_atomic(path, &bytes)
        .await
        .map_err(|e| corrupt(format!("failed to write {}: {e}", path.display())))
}

/// Read and decode a weight file. Returns `Ok(None)` if it does not exist.
pub async fn load(path: &Path) -> LearningResult<Option<WeightFile>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => decode(&bytes).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(corrupt(format!("failed to read {}: {e}", path.display()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WeightFile {
        let mut store = WeightStore::new();
        store.set_weight("p1", "coding.review", 0.25).unwrap();
        store.set_weight("p2", "coding.review", -0.75).unwrap();
        store.set_weight("p1", "docs.write", 0.0).unwrap();
        store.set_fisher("p2", "coding.review", 1.5).unwrap();
        let mut stats = BTreeMap::new();
        stats.insert(
            "coding.review".to_string(),
            RouteStats {
                count: 3,
                mean_quality: 0.7,
            },
        );
        WeightFile {
            metadata: WeightFileMetadata::now(stats),
            store,
        }
    }

    #[test]
    fn round_trip() {
        let file = sample();
        let decoded = decode(&encode(&file).unwrap()).unwrap();
        assert_eq!(decoded, file);
    }

    #[test]
    fn empty_store_round_trips() {
        let file = WeightFile {
            metadata: WeightFileMetadata::now(BTreeMap::new()),
            store: WeightStore::new(),
        };
        let decoded = decode(&encode(&file).unwrap()).unwrap();
        assert_eq!(decoded, file);
    }

    #[test]
    fn flipped_checksum_byte_is_corruption() {
        let mut bytes = encode(&sample()).unwrap();
        let n = bytes.len();
        for i in n - 4..n {
            let mut copy = bytes.clone();
            copy[i] ^= 0x01;
            assert!(matches!(decode(&copy), Err(LearningError::WeightPersistence(_))));
        }
        bytes[HEADER_LEN + 2] ^= 0xFF;
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn truncated_file_is_rejected() {
        let bytes = encode(&sample()).unwrap();
        assert!(decode(&bytes[..bytes.len() - 9]).is_err());
        assert!(decode(&bytes[..6]).is_err());
    }

    #[test]
    fn header_layout_is_stable() {
        let bytes = encode(&sample()).unwrap();
        assert_eq!(read_u32(&bytes, 0), WEIGHT_FORMAT_VERSION);
        let metadata_len = read_u32(&bytes, 4) as usize;
        let slots = 3;
        assert_eq!(bytes.len(), HEADER_LEN + metadata_len + slots * 8 + CHECKSUM_LEN);
    }

    #[tokio::test]
    async fn save_and_load_from_disk() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("weights.bin");
        assert!(load(&path).await.unwrap().is_none());

        let file = sample();
        save(&path, &file).await.unwrap();
        assert_eq!(load(&path).await.unwrap(), Some(file));
    }
}
