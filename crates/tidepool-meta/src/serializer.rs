//! Store record encoding on coordination nodes

use tidepool_common::{Error, Result, StoreRecord};

/// Encode a store record as stored on its node
pub fn encode_store(record: &StoreRecord) -> Result<Vec<u8>> {
    serde_json::to_vec(record).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode and validate a store record read from `path`
///
/// Payloads that do not parse or violate the record invariants are
/// reported as consistency errors.
pub fn decode_store(path: &str, bytes: &[u8]) -> Result<StoreRecord> {
    let record: StoreRecord = serde_json::from_slice(bytes)
        .map_err(|e| Error::consistency(format!("undecodable store record at {path}: {e}")))?;
    record
        .validate()
        .map_err(|e| Error::consistency(format!("invalid store record at {path}: {e}")))?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidepool_common::VersionRecord;

    #[test]
    fn test_encode_decode() {
        let record = StoreRecord::new("users")
            .with_version(VersionRecord::new("users", 3, 16))
            .unwrap()
            .with_current_version(3)
            .unwrap();
        let bytes = encode_store(&record).unwrap();
        assert_eq!(decode_store("/c/Stores/users", &bytes).unwrap(), record);
    }

    #[test]
    fn test_decode_rejects_garbage_and_invalid() {
        assert!(matches!(
            decode_store("/c/Stores/x", b"{not json"),
            Err(Error::Consistency(_))
        ));

        let mut record = StoreRecord::new("users");
        record.current_version = Some(4);
        let bytes = serde_json::to_vec(&record).unwrap();
        assert!(matches!(
            decode_store("/c/Stores/users", &bytes),
            Err(Error::Consistency(_))
        ));
    }
}
