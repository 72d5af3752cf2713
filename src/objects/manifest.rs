//! Object manifests.

use crate::error::Result;
use crate::types::{Digest, FileId, Timestamp};
use serde::{Deserialize, Serialize};

/// Describes a complete object. Written once, after every chunk has been
/// stored, and never modified.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectManifest {
    pub file_id: FileId,
    pub name: String,
    pub chunk_size: u32,
    pub chunk_count: u32,
    /// Total size in bytes.
    pub size: u64,
    /// SHA-256 of the whole content.
    pub digest: Digest,
    pub created: Timestamp,
}

impl ObjectManifest {
    /// Encode as MessagePack.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Decode from MessagePack.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Number of bytes chunk `index` should hold.
    pub fn expected_chunk_len(&self, index: u32) -> u64 {
        let start = index as u64 * self.chunk_size as u64;
        self.size.saturating_sub(start).min(self.chunk_size as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(size: u64, chunk_size: u32) -> ObjectManifest {
        ObjectManifest {
            file_id: FileId::from("f1"),
            name: "report.pdf".into(),
            chunk_size,
            chunk_count: size.div_ceil(chunk_size as u64) as u32,
            size,
            digest: Digest::from_bytes(b"x"),
            created: Timestamp::now(),
        }
    }

    #[test]
    fn test_encode_decode() {
        let m = manifest(2_500_000, 1 << 20);
        assert_eq!(ObjectManifest::decode(&m.encode().unwrap()).unwrap(), m);
        assert!(ObjectManifest::decode(b"garbage").is_err());
    }

    #[test]
    fn test_expected_chunk_len() {
        let m = manifest(2_500_000, 1 << 20);
        assert_eq!(m.chunk_count, 3);
        assert_eq!(m.expected_chunk_len(0), 1 << 20);
        assert_eq!(m.expected_chunk_len(2), 2_500_000 - 2 * (1 << 20));
        assert_eq!(m.expected_chunk_len(3), 0);
    }
}
