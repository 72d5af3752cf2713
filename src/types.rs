//! Core types shared by the messaging, KV and object layers.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Message headers, kept ordered so frames compare and log deterministically.
pub type Headers = BTreeMap<String, String>;

/// A single message travelling over the connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Concrete subject (never a wildcard pattern).
    pub subject: String,

    /// Subject the receiver should answer on, if any.
    pub reply_to: Option<String>,

    /// Metadata headers.
    pub headers: Headers,

    /// Opaque payload.
    pub payload: Vec<u8>,
}

impl Message {
    /// Create a message with a raw payload.
    pub fn new(subject: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            subject: subject.into(),
            reply_to: None,
            headers: Headers::new(),
            payload: payload.into(),
        }
    }

    /// Create a message with a JSON-encoded payload.
    pub fn json(subject: impl Into<String>, value: &impl Serialize) -> Result<Self> {
        Ok(Self::new(subject, serde_json::to_vec(value)?))
    }

    /// Set the reply subject.
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Look up a header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Decode the payload as JSON.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload).map_err(Error::from)
    }
}

/// Per-key version counter. The first put of a key yields `Revision(1)`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Revision(pub u64);

impl Revision {
    pub fn next(self) -> Self {
        Revision(self.0 + 1)
    }
}

impl fmt::Debug for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rev({})", self.0)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 128-bit token linking a request to its reply.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CorrelationId(pub u128);

impl CorrelationId {
    /// Draw a fresh id from the OS entropy source.
    pub fn random() -> Result<Self> {
        Ok(CorrelationId(random_u128()?))
    }

    /// Fixed-width lowercase hex, as used in reply subjects.
    pub fn to_hex(&self) -> String {
        format!("{:032x}", self.0)
    }

    /// Parse the hex form back into an id.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 32 {
            return None;
        }
        u128::from_str_radix(s, 16).ok().map(CorrelationId)
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CorrelationId({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Identifier of an uploaded object.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(pub String);

impl FileId {
    /// Generate a fresh random id.
    pub fn generate() -> Result<Self> {
        Ok(FileId(format!("{:032x}", random_u128()?)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for FileId {
    fn from(s: &str) -> Self {
        FileId(s.to_string())
    }
}

/// SHA-256 content digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    /// Compute digest from bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Digest(hasher.finalize().into())
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> std::result::Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Digest(arr))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A single key-value entry at a given revision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvEntry {
    pub bucket: String,
    pub key: String,
    pub value: Vec<u8>,
    pub revision: Revision,
    pub created: Timestamp,
}

impl KvEntry {
    /// Decode the value as JSON.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.value).map_err(Error::from)
    }
}

pub(crate) fn random_u128() -> Result<u128> {
    let mut buf = [0u8; 16];
    getrandom::fill(&mut buf)?;
    Ok(u128::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_digest_roundtrip() {
        let digest = Digest::from_bytes(b"hello world");
        let parsed = Digest::from_hex(&digest.to_hex()).unwrap();
        assert_eq!(digest, parsed);
    }

    #[test]
    fn test_correlation_id_hex_is_fixed_width() {
        let id = CorrelationId(7);
        assert_eq!(id.to_hex().len(), 32);
        assert_eq!(CorrelationId::from_hex(&id.to_hex()), Some(id));
        assert_eq!(CorrelationId::from_hex("7"), None);
    }

    #[test]
    fn test_random_ids_differ() {
        let a = CorrelationId::random().unwrap();
        let b = CorrelationId::random().unwrap();
        assert_ne!(a, b);

        let f = FileId::generate().unwrap();
        assert_eq!(f.as_str().len(), 32);
    }

    #[test]
    fn test_revision_next() {
        assert_eq!(Revision(1).next(), Revision(2));
        assert!(Revision(2) > Revision(1));
    }

    #[test]
    fn test_message_json_helpers() {
        let msg = Message::json("orders.created", &json!({"id": 7}))
            .unwrap()
            .with_header("LL-Key", "k")
            .with_reply_to("_INBOX.x.y");

        let value: serde_json::Value = msg.decode_json().unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(msg.header("LL-Key"), Some("k"));
        assert_eq!(msg.reply_to.as_deref(), Some("_INBOX.x.y"));
    }

    #[test]
    fn test_decode_garbage_is_malformed() {
        let msg = Message::new("a", b"not json".to_vec());
        let result: Result<serde_json::Value> = msg.decode_json();
        assert!(matches!(result, Err(Error::Malformed(_))));
    }
}
