//! Chunked large values
//!
//! A value too large for one record is written as a set of chunk records
//! plus a manifest stored under the value's own key. The manifest carries
//! the real writer schema id and the chunk keys in order; reading a value
//! through [`read_value`] reassembles it transparently.

use crate::engine::StorageEngine;
use crate::record::ValueRecord;
use serde::{Deserialize, Serialize};
use tidepool_common::{Error, PartitionId, Result};

/// Schema id marking a chunk record
pub const CHUNK_SCHEMA_ID: i32 = -10;

/// Schema id marking a chunk manifest record
pub const CHUNK_MANIFEST_SCHEMA_ID: i32 = -20;

/// Largest payload a chunked value may have
pub const MAX_CHUNKED_VALUE_SIZE: u64 = 256 * 1024 * 1024;

/// Separator between a value key and its chunk index
const CHUNK_KEY_MARKER: &[u8] = b"\0chunk\0";

/// Manifest of a chunked value
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkManifest {
    /// Writer schema id of the reassembled value
    pub schema_id: i32,
    /// Keys of the chunk records, in payload order
    pub chunk_keys: Vec<Vec<u8>>,
    /// Total payload size
    pub size: u64,
}

/// Key under which chunk `index` of `key` is stored
pub fn chunk_key(key: &[u8], index: u32) -> Vec<u8> {
    let mut chunk = Vec::with_capacity(key.len() + CHUNK_KEY_MARKER.len() + 4);
    chunk.extend_from_slice(key);
    chunk.extend_from_slice(CHUNK_KEY_MARKER);
    chunk.extend_from_slice(&index.to_be_bytes());
    chunk
}

/// Read a value, reassembling it if it was chunked
///
/// Returns `Ok(None)` if the key is absent. A manifest on a version without
/// chunking, a missing or mistyped chunk, or a size mismatch is corrupt data.
pub fn read_value(
    engine: &dyn StorageEngine,
    partition: PartitionId,
    key: &[u8],
    chunking_enabled: bool,
) -> Result<Option<ValueRecord>> {
    let Some(raw) = engine.get(partition, key)? else {
        return Ok(None);
    };
    let record = ValueRecord::decode(&raw)?;
    match record.schema_id {
        CHUNK_MANIFEST_SCHEMA_ID if !chunking_enabled => Err(Error::corrupt(format!(
            "chunk manifest in {} which has chunking disabled",
            engine.location()
        ))),
        CHUNK_MANIFEST_SCHEMA_ID => reassemble(engine, partition, &record.payload).map(Some),
        CHUNK_SCHEMA_ID => Err(Error::corrupt(format!(
            "key in {} resolves to a bare chunk",
            engine.location()
        ))),
        _ => Ok(Some(record)),
    }
}

fn reassemble(
    engine: &dyn StorageEngine,
    partition: PartitionId,
    manifest: &[u8],
) -> Result<ValueRecord> {
    let manifest: ChunkManifest = bincode::deserialize(manifest)
        .map_err(|e| Error::corrupt(format!("undecodable chunk manifest: {e}")))?;

    if manifest.size > MAX_CHUNKED_VALUE_SIZE {
        return Err(Error::corrupt(format!(
            "chunk manifest claims {} bytes, at most {} are allowed",
            manifest.size, MAX_CHUNKED_VALUE_SIZE
        )));
    }

    let mut payload = Vec::with_capacity(usize::try_from(manifest.size).unwrap_or(0));
    for (index, chunk_key) in manifest.chunk_keys.iter().enumerate() {
        let raw = engine.get(partition, chunk_key)?.ok_or_else(|| {
            Error::corrupt(format!(
                "chunk {index} of {} missing from {}",
                manifest.chunk_keys.len(),
                engine.location()
            ))
        })?;
        let chunk = ValueRecord::decode(&raw)?;
        if chunk.schema_id != CHUNK_SCHEMA_ID {
            return Err(Error::corrupt(format!(
                "chunk {index} has schema id {}",
                chunk.schema_id
            )));
        }
        payload.extend_from_slice(&chunk.payload);
        if payload.len() as u64 > manifest.size {
            return Err(Error::corrupt(format!(
                "chunked value exceeds the {} bytes its manifest says",
                manifest.size
            )));
        }
    }

    if payload.len() as u64 != manifest.size {
        return Err(Error::corrupt(format!(
            "chunked value has {} bytes, manifest says {}",
            payload.len(),
            manifest.size
        )));
    }
    Ok(ValueRecord::new(manifest.schema_id, payload))
}

/// Write a value, chunking it when it exceeds `max_chunk_size`
///
/// Returns the number of chunks written, zero for a value stored whole.
pub fn write_value(
    engine: &dyn StorageEngine,
    partition: PartitionId,
    key: &[u8],
    record: &ValueRecord,
    max_chunk_size: usize,
) -> Result<usize> {
    if max_chunk_size == 0 {
        return Err(Error::invalid_argument("max chunk size must be positive"));
    }
    if record.payload.len() <= max_chunk_size {
        engine.put(partition, key, &record.encode())?;
        return Ok(0);
    }

    if record.payload.len() as u64 > MAX_CHUNKED_VALUE_SIZE {
        return Err(Error::invalid_argument(format!(
            "value of {} bytes is too large to chunk",
            record.payload.len()
        )));
    }

    let mut chunk_keys = Vec::new();
    for (index, piece) in record.payload.chunks(max_chunk_size).enumerate() {
        let index = u32::try_from(index)
            .map_err(|_| Error::invalid_argument("value has too many chunks"))?;
        let key = chunk_key(key, index);
        let chunk = ValueRecord::new(CHUNK_SCHEMA_ID, piece.to_vec());
        engine.put(partition, &key, &chunk.encode())?;
        chunk_keys.push(key);
    }

    let manifest = ChunkManifest {
        schema_id: record.schema_id,
        chunk_keys,
        size: record.payload.len() as u64,
    };
    let chunks = manifest.chunk_keys.len();
    let encoded =
        bincode::serialize(&manifest).map_err(|e| Error::Serialization(e.to_string()))?;
    engine.put(
        partition,
        key,
        &ValueRecord::new(CHUNK_MANIFEST_SCHEMA_ID, encoded).encode(),
    )?;
    Ok(chunks)
}
