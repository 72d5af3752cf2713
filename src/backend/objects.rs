//! In-memory object buckets.

use super::Rejection;
use crate::objects::ObjectManifest;
use crate::types::FileId;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

struct StoredChunk {
    data: Vec<u8>,
    checksum: u32,
}

#[derive(Default)]
struct ObjBucket {
    chunks: HashMap<FileId, BTreeMap<u32, StoredChunk>>,
    manifests: HashMap<FileId, ObjectManifest>,
}

/// Object buckets held in memory. Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryObjects {
    buckets: Arc<Mutex<HashMap<String, ObjBucket>>>,
}

impl MemoryObjects {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the bucket or attach to it. Returns true if it was created.
    pub fn bind(&self, bucket: &str) -> bool {
        let mut buckets = self.buckets.lock();
        if buckets.contains_key(bucket) {
            return false;
        }
        buckets.insert(bucket.to_string(), ObjBucket::default());
        true
    }

    fn with_bucket<T>(
        &self,
        bucket: &str,
        f: impl FnOnce(&mut ObjBucket) -> Result<T, Rejection>,
    ) -> Result<T, Rejection> {
        let mut buckets = self.buckets.lock();
        let b = buckets
            .get_mut(bucket)
            .ok_or_else(|| Rejection::Unbound(bucket.to_string()))?;
        f(b)
    }

    /// Store a chunk. The data must match its crc32 and the object must not
    /// be complete yet.
    pub fn put_chunk(
        &self,
        bucket: &str,
        file_id: &FileId,
        index: u32,
        data: Vec<u8>,
        checksum: u32,
    ) -> Result<(), Rejection> {
        let actual = crc32fast::hash(&data);
        if actual != checksum {
            return Err(Rejection::Conflict(format!(
                "chunk {index} of {file_id}: checksum {actual:08x} does not match {checksum:08x}"
            )));
        }
        self.with_bucket(bucket, |b| {
            if b.manifests.contains_key(file_id) {
                return Err(Rejection::Conflict(format!("{file_id} is already complete")));
            }
            b.chunks
                .entry(file_id.clone())
                .or_default()
                .insert(index, StoredChunk { data, checksum });
            Ok(())
        })
    }

    /// A chunk and the checksum it was stored with.
    pub fn get_chunk(
        &self,
        bucket: &str,
        file_id: &FileId,
        index: u32,
    ) -> Result<(Vec<u8>, u32), Rejection> {
        self.with_bucket(bucket, |b| {
            b.chunks
                .get(file_id)
                .and_then(|chunks| chunks.get(&index))
                .map(|c| (c.data.clone(), c.checksum))
                .ok_or_else(|| Rejection::NotFound(format!("chunk {index} of {file_id}")))
        })
    }

    /// Commit a manifest. Refused if one exists already or if any chunk it
    /// lists is missing.
    pub fn put_manifest(&self, bucket: &str, manifest: ObjectManifest) -> Result<(), Rejection> {
        self.with_bucket(bucket, |b| {
            let file_id = &manifest.file_id;
            if b.manifests.contains_key(file_id) {
                return Err(Rejection::Conflict(format!(
                    "manifest for {file_id} already exists"
                )));
            }

            let empty = BTreeMap::new();
            let chunks = b.chunks.get(file_id).unwrap_or(&empty);
            let mut size = 0u64;
            for index in 0..manifest.chunk_count {
                match chunks.get(&index) {
                    Some(chunk) => size += chunk.data.len() as u64,
                    None => {
                        return Err(Rejection::Conflict(format!(
                            "{file_id}: chunk {index} of {} missing",
                            manifest.chunk_count
                        )))
                    }
                }
            }
            if size != manifest.size {
                return Err(Rejection::Conflict(format!(
                    "{file_id}: chunks hold {size} bytes, manifest says {}",
                    manifest.size
                )));
            }

            b.manifests.insert(file_id.clone(), manifest);
            Ok(())
        })
    }

    pub fn get_manifest(&self, bucket: &str, file_id: &FileId) -> Result<ObjectManifest, Rejection> {
        self.with_bucket(bucket, |b| {
            b.manifests
                .get(file_id)
                .cloned()
                .ok_or_else(|| Rejection::NotFound(file_id.to_string()))
        })
    }

    /// Remove an object's manifest and chunks.
    pub fn purge(&self, bucket: &str, file_id: &FileId) -> Result<(), Rejection> {
        self.with_bucket(bucket, |b| {
            let manifest = b.manifests.remove(file_id);
            let chunks = b.chunks.remove(file_id);
            if manifest.is_none() && chunks.is_none() {
                return Err(Rejection::NotFound(file_id.to_string()));
            }
            debug!(%file_id, chunks = chunks.map_or(0, |c| c.len()), "object purged");
            Ok(())
        })
    }

    /// Number of chunks stored for an object, complete or not.
    pub fn chunk_count(&self, bucket: &str, file_id: &FileId) -> usize {
        self.buckets
            .lock()
            .get(bucket)
            .and_then(|b| b.chunks.get(file_id))
            .map_or(0, BTreeMap::len)
    }

    /// Objects in a bucket with at least one chunk or a manifest.
    pub fn object_count(&self, bucket: &str) -> usize {
        self.buckets.lock().get(bucket).map_or(0, |b| {
            b.chunks
                .keys()
                .chain(b.manifests.keys().filter(|id| !b.chunks.contains_key(*id)))
                .count()
        })
    }

    /// Flip a byte of a stored chunk without touching its checksum.
    /// Returns false if there is no such chunk.
    pub fn corrupt_chunk(&self, bucket: &str, file_id: &FileId, index: u32) -> bool {
        let mut buckets = self.buckets.lock();
        let chunk = buckets
            .get_mut(bucket)
            .and_then(|b| b.chunks.get_mut(file_id))
            .and_then(|chunks| chunks.get_mut(&index));
        match chunk {
            Some(chunk) => {
                match chunk.data.first_mut() {
                    Some(byte) => *byte ^= 0xff,
                    None => chunk.data.push(0),
                }
                true
            }
            None => false,
        }
    }

    /// Replace a stored chunk's bytes and recompute its checksum, so only
    /// the manifest can tell the difference.
    pub fn rewrite_chunk(&self, bucket: &str, file_id: &FileId, index: u32, data: Vec<u8>) -> bool {
        let mut buckets = self.buckets.lock();
        let chunk = buckets
            .get_mut(bucket)
            .and_then(|b| b.chunks.get_mut(file_id))
            .and_then(|chunks| chunks.get_mut(&index));
        match chunk {
            Some(chunk) => {
                chunk.checksum = crc32fast::hash(&data);
                chunk.data = data;
                true
            }
            None => false,
        }
    }
}
