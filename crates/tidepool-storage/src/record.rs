//! Stored value framing

use tidepool_common::{Error, Result};

/// A stored value: writer schema id plus payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValueRecord {
    /// Schema the payload was written with, or a chunking marker
    pub schema_id: i32,
    /// Value bytes as produced by the writer's compressor
    pub payload: Vec<u8>,
}

impl ValueRecord {
    /// Size of the schema id header
    pub const HEADER_LEN: usize = 4;

    pub fn new(schema_id: i32, payload: Vec<u8>) -> Self {
        Self { schema_id, payload }
    }

    /// Encode as `[schema id, big endian][payload]`
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.schema_id.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a stored value
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (header, payload) = bytes
            .split_first_chunk::<4>()
            .ok_or_else(|| {
                Error::corrupt(format!("stored value too short: {} bytes", bytes.len()))
            })?;
        Ok(Self {
            schema_id: i32::from_be_bytes(*header),
            payload: payload.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framing() {
        let record = ValueRecord::new(-20, b"abc".to_vec());
        let bytes = record.encode();
        assert_eq!(&bytes[..4], &[0xFF, 0xFF, 0xFF, 0xEC]);
        assert_eq!(ValueRecord::decode(&bytes).unwrap(), record);

        let empty = ValueRecord::decode(&7i32.to_be_bytes()).unwrap();
        assert_eq!(empty.schema_id, 7);
        assert!(empty.payload.is_empty());
    }

    #[test]
    fn test_short_value_is_corrupt() {
        assert!(matches!(
            ValueRecord::decode(&[0, 1]),
            Err(Error::CorruptData(_))
        ));
    }
}
