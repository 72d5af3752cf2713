//! Client facade.

use crate::config::{ClientConfig, FILES_BUCKET, STATE_BUCKET};
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::Result;
use crate::kv::{KvStore, WatchId, WatchTarget};
use crate::objects::{ObjectManifest, ObjectStore};
use crate::rpc::{decode_reply, service_subject, CallHandle, Coordinator, RpcRequest};
use crate::subscriptions::{
    FnHandler, HandlerResult, MessageHandler, SubscriptionId, SubscriptionOptions,
};
use crate::transport::Connector;
use crate::types::{random_u128, FileId, Message, Revision};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Subject file transfer notices are published on.
pub const FILE_TRANSFER_SUBJECT: &str = "file.transfer";

struct ClientInner {
    conn: Arc<ConnectionManager>,
    coordinator: Arc<Coordinator>,
    state: KvStore,
    files: ObjectStore,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.conn.close();
    }
}

/// A connected client. Cheap to clone; all clones share one connection,
/// which closes when the last clone is dropped or [`Client::close`] is
/// called.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Connect to the broker. Fails with `Connect` if the first dial fails;
    /// later link losses are retried according to the reconnect policy.
    pub fn connect(config: ClientConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        let coordinator = Coordinator::new()?;
        let history = u64::from(config.kv_history);
        let conn = ConnectionManager::connect(config, connector, Arc::clone(&coordinator))?;

        let state = KvStore::new(
            STATE_BUCKET,
            history,
            Arc::clone(&conn),
            Arc::clone(&coordinator),
        );
        let files = ObjectStore::new(FILES_BUCKET, Arc::clone(&conn), Arc::clone(&coordinator));

        Ok(Self {
            inner: Arc::new(ClientInner {
                conn,
                coordinator,
                state,
                files,
            }),
        })
    }

    /// Connect using `LIGHT_LINK_URL` and the `LIGHT_LINK_TLS_*` variables.
    pub fn connect_env(connector: Arc<dyn Connector>) -> Result<Self> {
        Self::connect(ClientConfig::from_env(), connector)
    }

    pub(crate) fn connection(&self) -> &Arc<ConnectionManager> {
        &self.inner.conn
    }

    pub fn config(&self) -> &ClientConfig {
        self.inner.conn.config()
    }

    /// Close the connection for every clone. Idempotent.
    pub fn close(&self) {
        self.inner.conn.close();
    }

    pub fn is_connected(&self) -> bool {
        self.inner.conn.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.conn.state()
    }

    /// Reconnect attempts made since the link was last established.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.conn.retry_count()
    }

    /// Live subscriptions, including watches and service handlers.
    pub fn subscription_count(&self) -> usize {
        self.inner.conn.subscription_count()
    }

    /// Requests still awaiting a reply, deadline or cancellation.
    pub fn pending_requests(&self) -> usize {
        self.inner.coordinator.pending_count()
    }

    // --- Pub/sub ---

    pub fn publish(&self, subject: &str, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.inner.conn.send(Message::new(subject, payload))
    }

    pub fn publish_json(&self, subject: &str, value: &impl Serialize) -> Result<()> {
        self.inner.conn.send(Message::json(subject, value)?)
    }

    pub fn publish_message(&self, message: Message) -> Result<()> {
        self.inner.conn.send(message)
    }

    /// Subscribe a closure to a pattern with default options.
    pub fn subscribe<F>(&self, pattern: &str, handler: F) -> Result<SubscriptionId>
    where
        F: FnMut(Message) -> HandlerResult + Send + 'static,
    {
        self.subscribe_with(pattern, SubscriptionOptions::default(), FnHandler(handler))
    }

    /// Subscribe a handler with explicit options.
    pub fn subscribe_with(
        &self,
        pattern: &str,
        options: SubscriptionOptions,
        handler: impl MessageHandler,
    ) -> Result<SubscriptionId> {
        let handler: Box<dyn MessageHandler> = Box::new(handler);
        self.inner
            .conn
            .subscribe_with(pattern, options, move |_| handler)
    }

    /// Remove a subscription. No-op if it is already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.conn.unsubscribe(id);
    }

    /// Messages a subscription dropped because its queue was full.
    pub fn dropped_count(&self, id: SubscriptionId) -> Option<u64> {
        self.inner.conn.dropped_count(id)
    }

    // --- Request/reply ---

    /// Send a raw request and wait for the reply.
    pub fn request(
        &self,
        subject: &str,
        payload: impl Into<Vec<u8>>,
        timeout: Duration,
    ) -> Result<Message> {
        self.inner
            .coordinator
            .request(&self.inner.conn, Message::new(subject, payload), timeout)
    }

    fn rpc_request(service: &str, method: &str, args: Value) -> Result<(String, Message)> {
        let subject = service_subject(service, method)?;
        let id = format!("{:032x}", random_u128()?);
        let body = RpcRequest {
            id: id.clone(),
            method: method.to_string(),
            args,
        };
        Ok((id, Message::json(subject, &body)?))
    }

    /// Call `service.method` and wait for its result.
    pub fn call(&self, service: &str, method: &str, args: Value, timeout: Duration) -> Result<Value> {
        let (id, message) = Self::rpc_request(service, method, args)?;
        debug!(service, method, request = %id, "rpc call");
        let reply = self
            .inner
            .coordinator
            .request(&self.inner.conn, message, timeout)?;
        decode_reply(&id, &reply)
    }

    /// Call `service.method` without blocking.
    ///
    /// `on_complete` runs exactly once on the client's callback thread with
    /// the result, a timeout, a cancellation or a connection error. If the
    /// request cannot be sent at all, the error is returned here instead
    /// and `on_complete` is not called.
    pub fn call_async<F>(
        &self,
        service: &str,
        method: &str,
        args: Value,
        timeout: Duration,
        on_complete: F,
    ) -> Result<CallHandle>
    where
        F: FnOnce(Result<Value>) + Send + 'static,
    {
        let (id, message) = Self::rpc_request(service, method, args)?;
        debug!(service, method, request = %id, "async rpc call");
        let correlation = self.inner.coordinator.request_async(
            &self.inner.conn,
            message,
            timeout,
            move |reply| on_complete(reply.and_then(|m| decode_reply(&id, &m))),
        )?;
        Ok(CallHandle::new(
            correlation,
            Arc::downgrade(&self.inner.coordinator),
        ))
    }

    // --- State ---

    /// The `light_link_state` bucket.
    pub fn kv(&self) -> &KvStore {
        &self.inner.state
    }

    /// A client for another KV bucket on this connection.
    pub fn kv_bucket(&self, bucket: &str) -> KvStore {
        KvStore::new(
            bucket,
            u64::from(self.config().kv_history),
            Arc::clone(&self.inner.conn),
            Arc::clone(&self.inner.coordinator),
        )
    }

    /// Store `value` as JSON under `key`.
    pub fn set_state<T: Serialize>(&self, key: &str, value: &T) -> Result<Revision> {
        self.inner.state.put(key, serde_json::to_vec(value)?)
    }

    /// Read and decode the JSON value under `key`.
    pub fn get_state<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.inner.state.get(key, None)?.decode_json()
    }

    /// Watch `key`, decoding each value as JSON. A value that fails to
    /// decode is reported as `Malformed` without ending the watch.
    pub fn watch_state<T, F>(&self, key: &str, mut handler: F) -> Result<WatchId>
    where
        T: DeserializeOwned,
        F: FnMut(Result<T>) + Send + 'static,
    {
        self.inner
            .state
            .watch(WatchTarget::key(key), move |change| {
                handler(change.and_then(|entry| entry.decode_json()))
            })
    }

    pub fn unwatch_state(&self, id: WatchId) {
        self.inner.state.unwatch(id);
    }

    // --- Files ---

    /// The `light_link_files` bucket.
    pub fn objects(&self) -> &ObjectStore {
        &self.inner.files
    }

    /// A client for another object bucket on this connection.
    pub fn object_bucket(&self, bucket: &str) -> ObjectStore {
        ObjectStore::new(
            bucket,
            Arc::clone(&self.inner.conn),
            Arc::clone(&self.inner.coordinator),
        )
    }

    pub fn upload_file(&self, path: impl AsRef<Path>, name: Option<&str>) -> Result<FileId> {
        self.inner.files.upload_file(path, name)
    }

    pub fn download_file(&self, file_id: &FileId, dest: impl AsRef<Path>) -> Result<ObjectManifest> {
        self.inner.files.download_file(file_id, dest)
    }

    /// Upload a file, then announce it to `to` on `file.transfer`.
    pub fn send_file(&self, path: impl AsRef<Path>, name: &str, to: &str) -> Result<FileId> {
        let file_id = self.upload_file(path, Some(name))?;
        self.publish_json(
            FILE_TRANSFER_SUBJECT,
            &json!({
                "file_id": file_id.as_str(),
                "file_name": name,
                "to": to,
            }),
        )?;
        Ok(file_id)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("address", &self.config().address)
            .field("state", &self.state())
            .finish()
    }
}
