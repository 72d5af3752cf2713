//! In-memory KV buckets.

use super::Rejection;
use crate::types::{KvEntry, Revision, Timestamp};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

struct KvBucket {
    history: usize,
    keys: BTreeMap<String, VecDeque<KvEntry>>,
}

/// KV buckets held in memory. Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryKv {
    buckets: Arc<Mutex<HashMap<String, KvBucket>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the bucket or attach to it. Returns true if this call created
    /// it; `history` is ignored otherwise.
    pub fn bind(&self, bucket: &str, history: u64) -> bool {
        let mut buckets = self.buckets.lock();
        if buckets.contains_key(bucket) {
            return false;
        }
        buckets.insert(
            bucket.to_string(),
            KvBucket {
                history: history.max(1) as usize,
                keys: BTreeMap::new(),
            },
        );
        true
    }

    /// Store a value as the key's next revision.
    pub fn put(&self, bucket: &str, key: &str, value: Vec<u8>) -> Result<KvEntry, Rejection> {
        let mut buckets = self.buckets.lock();
        let b = buckets
            .get_mut(bucket)
            .ok_or_else(|| Rejection::Unbound(bucket.to_string()))?;

        let versions = b.keys.entry(key.to_string()).or_default();
        let revision = versions
            .back()
            .map(|e| e.revision.next())
            .unwrap_or(Revision(1));
        let entry = KvEntry {
            bucket: bucket.to_string(),
            key: key.to_string(),
            value,
            revision,
            created: Timestamp::now(),
        };
        versions.push_back(entry.clone());
        while versions.len() > b.history {
            versions.pop_front();
        }
        Ok(entry)
    }

    /// Latest entry, or a specific revision if still retained.
    pub fn get(
        &self,
        bucket: &str,
        key: &str,
        revision: Option<Revision>,
    ) -> Result<KvEntry, Rejection> {
        let buckets = self.buckets.lock();
        let b = buckets
            .get(bucket)
            .ok_or_else(|| Rejection::Unbound(bucket.to_string()))?;
        let versions = b
            .keys
            .get(key)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Rejection::NotFound(format!("{bucket}/{key}")))?;

        match revision {
            None => versions
                .back()
                .cloned()
                .ok_or_else(|| Rejection::NotFound(format!("{bucket}/{key}"))),
            Some(rev) => versions
                .iter()
                .find(|e| e.revision == rev)
                .cloned()
                .ok_or_else(|| {
                    Rejection::Conflict(format!("revision {rev} of {key} is not retained"))
                }),
        }
    }

    /// Keys in sorted order, optionally filtered by prefix.
    pub fn keys(&self, bucket: &str, prefix: Option<&str>) -> Result<Vec<String>, Rejection> {
        let buckets = self.buckets.lock();
        let b = buckets
            .get(bucket)
            .ok_or_else(|| Rejection::Unbound(bucket.to_string()))?;
        Ok(b.keys
            .keys()
            .filter(|k| prefix.map_or(true, |p| k.starts_with(p)))
            .cloned()
            .collect())
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }

    /// History depth the bucket was created with.
    pub fn history(&self, bucket: &str) -> Option<usize> {
        self.buckets.lock().get(bucket).map(|b| b.history)
    }
}
