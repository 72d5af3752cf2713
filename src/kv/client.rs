//! KV bucket client.

use super::watch::{WatchCallback, WatchHandler, WatchId, WatchState, WatchTarget};
use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::protocol::{
    entry_from_message, expect_ok, header_u64, kv_event_pattern, kv_subject, status_of,
    validate_key, KvOp, Status, HDR_HISTORY, HDR_KEY, HDR_PREFIX, HDR_REVISION,
};
use crate::rpc::Coordinator;
use crate::subscriptions::{MessageHandler, OverflowPolicy, SubscriptionOptions};
use crate::types::{KvEntry, Message, Revision};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Client for one KV bucket.
///
/// The bucket is bound on first use. Binding is idempotent on the server,
/// so any number of clients may race to create the same bucket.
pub struct KvStore {
    bucket: String,
    history: u64,
    conn: Arc<ConnectionManager>,
    coordinator: Arc<Coordinator>,
    bound: Mutex<bool>,
}

impl KvStore {
    pub(crate) fn new(
        bucket: impl Into<String>,
        history: u64,
        conn: Arc<ConnectionManager>,
        coordinator: Arc<Coordinator>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            history,
            conn,
            coordinator,
            bound: Mutex::new(false),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn request(&self, op: KvOp, message: Message) -> Result<Message> {
        let message = Message {
            subject: kv_subject(&self.bucket, op)?,
            ..message
        };
        self.coordinator
            .request(&self.conn, message, self.conn.request_timeout())
    }

    /// Create or attach to the bucket. History depth only applies when this
    /// call creates it.
    pub fn bind(&self) -> Result<()> {
        let mut bound = self.bound.lock();
        if *bound {
            return Ok(());
        }
        let request =
            Message::new(String::new(), Vec::new()).with_header(HDR_HISTORY, self.history.to_string());
        expect_ok(&self.request(KvOp::Bind, request)?)?;
        debug!(bucket = %self.bucket, "bucket bound");
        *bound = true;
        Ok(())
    }

    /// Store a value, returning the key's new revision.
    pub fn put(&self, key: &str, value: impl Into<Vec<u8>>) -> Result<Revision> {
        validate_key(key)?;
        self.bind()?;
        let request = Message::new(String::new(), value).with_header(HDR_KEY, key);
        let reply = self.request(KvOp::Put, request)?;
        expect_ok(&reply)?;
        Ok(Revision(header_u64(&reply, HDR_REVISION)?))
    }

    /// Read the latest entry, or a specific retained revision.
    pub fn get(&self, key: &str, revision: Option<Revision>) -> Result<KvEntry> {
        validate_key(key)?;
        self.bind()?;
        let mut request = Message::new(String::new(), Vec::new()).with_header(HDR_KEY, key);
        if let Some(rev) = revision {
            request = request.with_header(HDR_REVISION, rev.0.to_string());
        }

        let reply = self.request(KvOp::Get, request)?;
        match (status_of(&reply)?, revision) {
            ((Status::Ok, _), _) => entry_from_message(&self.bucket, &reply),
            ((Status::NotFound, _), _) => Err(Error::NotFound(format!("{}/{}", self.bucket, key))),
            ((Status::Conflict, _), Some(revision)) => Err(Error::RevisionMismatch {
                key: key.to_string(),
                revision,
            }),
            _ => expect_ok(&reply).and_then(|_| {
                Err(Error::Malformed(format!("unexpected GET reply for {key}")))
            }),
        }
    }

    /// List keys, optionally restricted to a prefix, in sorted order.
    pub fn keys(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        self.bind()?;
        let mut request = Message::new(String::new(), Vec::new());
        if let Some(prefix) = prefix {
            request = request.with_header(HDR_PREFIX, prefix);
        }
        let reply = self.request(KvOp::Keys, request)?;
        expect_ok(&reply)?;
        Ok(rmp_serde::from_slice(&reply.payload)?)
    }

    /// Watch a key or prefix.
    ///
    /// The handler first receives the current value(s) on the calling
    /// thread, then every change in revision order on the watcher's own
    /// thread. If the watcher falls behind, misses a revision or loses its
    /// connection, the handler receives a final error and is not called
    /// again.
    pub fn watch<F>(&self, target: WatchTarget, handler: F) -> Result<WatchId>
    where
        F: FnMut(Result<KvEntry>) + Send + 'static,
    {
        match &target {
            WatchTarget::Key(key) => validate_key(key)?,
            WatchTarget::Prefix(_) => {}
        }
        self.bind()?;

        let callback: WatchCallback = Box::new(handler);
        let state = WatchState::new(callback);
        let options = SubscriptionOptions {
            capacity: self.conn.config().subscription_capacity,
            overflow: OverflowPolicy::Terminate,
            resume_on_reconnect: false,
        };

        let id = self.conn.subscribe_with(
            &kv_event_pattern(&self.bucket),
            options,
            |id| -> Box<dyn MessageHandler> {
                Box::new(WatchHandler {
                    bucket: self.bucket.clone(),
                    target: target.clone(),
                    state: Arc::clone(&state),
                    conn: Arc::downgrade(&self.conn),
                    id,
                })
            },
        )?;

        let snapshot = match self.snapshot(&target) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.conn.unsubscribe(id);
                return Err(e);
            }
        };

        debug!(bucket = %self.bucket, ?target, entries = snapshot.len(), "watch started");
        if !state.lock().prime(snapshot) {
            self.conn.unsubscribe(id);
        }
        Ok(WatchId(id))
    }

    fn snapshot(&self, target: &WatchTarget) -> Result<Vec<KvEntry>> {
        let keys = match target {
            WatchTarget::Key(key) => vec![key.clone()],
            WatchTarget::Prefix(prefix) => self.keys(Some(prefix))?,
        };

        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            match self.get(&key, None) {
                Ok(entry) => entries.push(entry),
                Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(entries)
    }

    /// Stop a watcher. No-op if it already ended.
    pub fn unwatch(&self, id: WatchId) {
        self.conn.unsubscribe(id.0);
    }
}

impl std::fmt::Debug for KvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStore")
            .field("bucket", &self.bucket)
            .field("history", &self.history)
            .finish()
    }
}
