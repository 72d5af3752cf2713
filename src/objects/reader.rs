//! Lazy, verifying object reader.

use super::client::ObjectStore;
use super::manifest::ObjectManifest;
use crate::error::{Error, Result};
use crate::types::Digest;
use sha2::{Digest as _, Sha256};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReadState {
    Reading,
    Complete,
    Failed,
}

/// Yields an object's chunks in order, fetching each on demand.
///
/// Every chunk is checked against its stored crc32. After the last chunk
/// the total size and SHA-256 digest are checked against the manifest.
/// The first failure is yielded as an error and ends the iteration.
pub struct ObjectReader<'a> {
    store: &'a ObjectStore,
    manifest: ObjectManifest,
    next_index: u32,
    received: u64,
    hasher: Sha256,
    state: ReadState,
}

impl<'a> ObjectReader<'a> {
    pub(crate) fn new(store: &'a ObjectStore, manifest: ObjectManifest) -> Self {
        Self {
            store,
            manifest,
            next_index: 0,
            received: 0,
            hasher: Sha256::new(),
            state: ReadState::Reading,
        }
    }

    pub fn manifest(&self) -> &ObjectManifest {
        &self.manifest
    }

    /// True once every chunk has been read and the whole object verified.
    pub fn is_complete(&self) -> bool {
        self.state == ReadState::Complete
    }

    /// Read and verify the remaining content into memory.
    pub fn read_to_end(self) -> Result<Vec<u8>> {
        let mut content = Vec::with_capacity(self.manifest.size as usize);
        for chunk in self {
            content.extend_from_slice(&chunk?);
        }
        Ok(content)
    }

    fn read_chunk(&mut self) -> Result<Vec<u8>> {
        let index = self.next_index;
        let (data, expected) = self.store.fetch_chunk(&self.manifest.file_id, index)?;

        let want = self.manifest.expected_chunk_len(index);
        if data.len() as u64 != want {
            return Err(Error::Corruption(format!(
                "{}: chunk {index} holds {} bytes, expected {want}",
                self.manifest.file_id,
                data.len()
            )));
        }

        let got = crc32fast::hash(&data);
        if got != expected {
            return Err(Error::CorruptChunk {
                file_id: self.manifest.file_id.clone(),
                index,
                expected,
                got,
            });
        }

        self.hasher.update(&data);
        self.received += data.len() as u64;
        self.next_index += 1;
        Ok(data)
    }

    fn verify_whole(&mut self) -> Result<()> {
        if self.received != self.manifest.size {
            return Err(Error::Corruption(format!(
                "{}: expected {} bytes, got {}",
                self.manifest.file_id, self.manifest.size, self.received
            )));
        }
        let digest = Digest(std::mem::take(&mut self.hasher).finalize().into());
        if digest != self.manifest.digest {
            return Err(Error::Corruption(format!(
                "{}: digest mismatch, expected {}, got {}",
                self.manifest.file_id, self.manifest.digest, digest
            )));
        }
        Ok(())
    }

    fn settle(&mut self) -> Option<Error> {
        match self.verify_whole() {
            Ok(()) => {
                self.state = ReadState::Complete;
                None
            }
            Err(e) => {
                self.state = ReadState::Failed;
                Some(e)
            }
        }
    }
}

impl Iterator for ObjectReader<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.state != ReadState::Reading {
            return None;
        }

        if self.next_index >= self.manifest.chunk_count {
            return self.settle().map(Err);
        }

        match self.read_chunk() {
            Ok(data) => {
                if self.next_index == self.manifest.chunk_count {
                    if let Some(e) = self.settle() {
                        return Some(Err(e));
                    }
                }
                Some(Ok(data))
            }
            Err(e) => {
                self.state = ReadState::Failed;
                Some(Err(e))
            }
        }
    }
}

impl std::fmt::Debug for ObjectReader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectReader")
            .field("file_id", &self.manifest.file_id)
            .field("next_index", &self.next_index)
            .field("state", &self.state)
            .finish()
    }
}
