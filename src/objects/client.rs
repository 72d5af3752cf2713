//! Chunked object store client.

use super::manifest::ObjectManifest;
use super::reader::ObjectReader;
use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::protocol::{
    expect_ok, header_u64, obj_subject, status_of, ObjOp, Status, HDR_CHECKSUM, HDR_FILE_ID,
    HDR_INDEX,
};
use crate::rpc::Coordinator;
use crate::types::{Digest, FileId, Message, Timestamp};
use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest as _, Sha256};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Client for one object bucket.
///
/// Objects are split into fixed-size chunks, each stored with its crc32.
/// The manifest is written last; an object without a manifest does not
/// exist as far as readers are concerned.
pub struct ObjectStore {
    bucket: String,
    chunk_size: usize,
    conn: Arc<ConnectionManager>,
    coordinator: Arc<Coordinator>,
    bound: Mutex<bool>,

    /// Manifests never change once written, so cached ones never go stale.
    manifests: Mutex<LruCache<FileId, ObjectManifest>>,
}

impl ObjectStore {
    pub(crate) fn new(
        bucket: impl Into<String>,
        conn: Arc<ConnectionManager>,
        coordinator: Arc<Coordinator>,
    ) -> Self {
        let config = conn.config();
        let chunk_size = config.chunk_size.max(1);
        let cache_size = NonZeroUsize::new(config.manifest_cache_size).unwrap_or(NonZeroUsize::MIN);

        Self {
            bucket: bucket.into(),
            chunk_size,
            conn,
            coordinator,
            bound: Mutex::new(false),
            manifests: Mutex::new(LruCache::new(cache_size)),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn request(&self, op: ObjOp, message: Message) -> Result<Message> {
        let message = Message {
            subject: obj_subject(&self.bucket, op)?,
            ..message
        };
        self.coordinator
            .request(&self.conn, message, self.conn.request_timeout())
    }

    fn file_request(file_id: &FileId, payload: Vec<u8>) -> Message {
        Message::new(String::new(), payload).with_header(HDR_FILE_ID, file_id.as_str())
    }

    /// Create or attach to the bucket.
    pub fn bind(&self) -> Result<()> {
        let mut bound = self.bound.lock();
        if *bound {
            return Ok(());
        }
        expect_ok(&self.request(ObjOp::Bind, Message::new(String::new(), Vec::new()))?)?;
        debug!(bucket = %self.bucket, "object bucket bound");
        *bound = true;
        Ok(())
    }

    /// Upload everything `source` yields as a new object.
    ///
    /// On failure, chunks already stored are purged on a best-effort basis
    /// and no manifest is ever written.
    pub fn upload(&self, mut source: impl Read, name: &str) -> Result<FileId> {
        self.bind()?;
        let file_id = FileId::generate()?;

        match self.upload_chunks(&file_id, &mut source, name) {
            Ok(manifest) => {
                info!(
                    file_id = %file_id,
                    name,
                    size = manifest.size,
                    chunks = manifest.chunk_count,
                    "object uploaded"
                );
                self.manifests.lock().put(file_id.clone(), manifest);
                Ok(file_id)
            }
            Err(e) => {
                if e.is_connection_error() {
                    warn!(file_id = %file_id, name, error = %e, "upload failed, chunks left for reclamation");
                    return Err(e);
                }
                warn!(file_id = %file_id, name, error = %e, "upload failed, purging chunks");
                if let Err(purge_err) = self.purge(&file_id) {
                    debug!(file_id = %file_id, error = %purge_err, "purge after failed upload");
                }
                Err(e)
            }
        }
    }

    fn upload_chunks(
        &self,
        file_id: &FileId,
        source: &mut dyn Read,
        name: &str,
    ) -> Result<ObjectManifest> {
        let mut buf = vec![0u8; self.chunk_size];
        let mut hasher = Sha256::new();
        let mut index: u32 = 0;
        let mut size: u64 = 0;

        loop {
            let n = fill_buffer(source, &mut buf)?;
            if n == 0 {
                break;
            }
            let chunk = &buf[..n];
            hasher.update(chunk);
            self.put_chunk(file_id, index, chunk)?;
            size += n as u64;
            index += 1;
            if n < buf.len() {
                break;
            }
        }

        let manifest = ObjectManifest {
            file_id: file_id.clone(),
            name: name.to_string(),
            chunk_size: u32::try_from(self.chunk_size)
                .map_err(|_| Error::Config(format!("chunk_size {} too large", self.chunk_size)))?,
            chunk_count: index,
            size,
            digest: Digest(hasher.finalize().into()),
            created: Timestamp::now(),
        };
        let reply = self.request(
            ObjOp::Manifest,
            Self::file_request(file_id, manifest.encode()?),
        )?;
        expect_ok(&reply)?;
        Ok(manifest)
    }

    fn put_chunk(&self, file_id: &FileId, index: u32, data: &[u8]) -> Result<()> {
        let request = Self::file_request(file_id, data.to_vec())
            .with_header(HDR_INDEX, index.to_string())
            .with_header(HDR_CHECKSUM, crc32fast::hash(data).to_string());
        expect_ok(&self.request(ObjOp::Chunk, request)?)
    }

    /// Fetch a chunk and the checksum it was stored with.
    pub(crate) fn fetch_chunk(&self, file_id: &FileId, index: u32) -> Result<(Vec<u8>, u32)> {
        let request =
            Self::file_request(file_id, Vec::new()).with_header(HDR_INDEX, index.to_string());
        let reply = self.request(ObjOp::ChunkGet, request)?;
        if status_of(&reply)?.0 == Status::NotFound {
            return Err(Error::Corruption(format!(
                "{file_id}: chunk {index} listed in manifest is missing"
            )));
        }
        expect_ok(&reply)?;
        let checksum = u32::try_from(header_u64(&reply, HDR_CHECKSUM)?)
            .map_err(|_| Error::Malformed(format!("{HDR_CHECKSUM} out of range")))?;
        Ok((reply.payload, checksum))
    }

    /// Read an object's manifest. Fails with `NotFound` unless the upload
    /// completed.
    pub fn stat(&self, file_id: &FileId) -> Result<ObjectManifest> {
        if let Some(cached) = self.manifests.lock().get(file_id).cloned() {
            return Ok(cached);
        }
        self.bind()?;

        let reply = self.request(ObjOp::ManifestGet, Self::file_request(file_id, Vec::new()))?;
        if status_of(&reply)?.0 == Status::NotFound {
            return Err(Error::NotFound(format!("{}/{}", self.bucket, file_id)));
        }
        expect_ok(&reply)?;

        let manifest = ObjectManifest::decode(&reply.payload)?;
        if &manifest.file_id != file_id {
            return Err(Error::Malformed(format!(
                "manifest for {} returned for {}",
                manifest.file_id, file_id
            )));
        }
        self.manifests.lock().put(file_id.clone(), manifest.clone());
        Ok(manifest)
    }

    /// Open an object for reading. Chunks are fetched lazily.
    pub fn download(&self, file_id: &FileId) -> Result<ObjectReader<'_>> {
        let manifest = self.stat(file_id)?;
        Ok(ObjectReader::new(self, manifest))
    }

    /// Delete an object and its chunks.
    pub fn delete(&self, file_id: &FileId) -> Result<()> {
        self.bind()?;
        self.manifests.lock().pop(file_id);
        self.purge(file_id)
    }

    fn purge(&self, file_id: &FileId) -> Result<()> {
        expect_ok(&self.request(ObjOp::Purge, Self::file_request(file_id, Vec::new()))?)
    }

    /// Upload a local file. `name` defaults to the file name.
    pub fn upload_file(&self, path: impl AsRef<Path>, name: Option<&str>) -> Result<FileId> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let name = match name {
            Some(name) => name.to_string(),
            None => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        self.upload(BufReader::new(file), &name)
    }

    /// Download an object to `dest`.
    ///
    /// Content is written to `<dest>.part` and renamed into place only after
    /// it has been fully verified.
    pub fn download_file(&self, file_id: &FileId, dest: impl AsRef<Path>) -> Result<ObjectManifest> {
        let dest = dest.as_ref();
        let reader = self.download(file_id)?;
        let manifest = reader.manifest().clone();
        let part = part_path(dest);

        let written = write_chunks(reader, &part).and_then(|()| Ok(fs::rename(&part, dest)?));
        if let Err(e) = written {
            if let Err(rm) = fs::remove_file(&part) {
                if rm.kind() != ErrorKind::NotFound {
                    warn!(path = %part.display(), error = %rm, "failed to remove partial download");
                }
            }
            return Err(e);
        }

        debug!(file_id = %file_id, dest = %dest.display(), size = manifest.size, "object downloaded");
        Ok(manifest)
    }
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("bucket", &self.bucket)
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

fn write_chunks(reader: ObjectReader<'_>, part: &Path) -> Result<()> {
    let mut out = BufWriter::new(File::create(part)?);
    for chunk in reader {
        out.write_all(&chunk?)?;
    }
    out.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    Ok(())
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name: OsString = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Read until `buf` is full or the source is exhausted.
fn fill_buffer(source: &mut dyn Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
