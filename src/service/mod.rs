//! Hosting RPC services.
//!
//! ```ignore
//! let mut math = Service::new(&client, "math")?;
//! math.register("add", |args| {
//!     let a: i64 = args["a"].as_str().and_then(|s| s.parse().ok()).ok_or("bad a")?;
//!     let b: i64 = args["b"].as_str().and_then(|s| s.parse().ok()).ok_or("bad b")?;
//!     Ok(json!({ "sum": (a + b).to_string() }))
//! });
//! math.start()?;
//! ```
//!
//! While running, a service publishes a heartbeat on
//! `$LL.heartbeat.<name>`. [`Service::register_metadata`] announces its
//! description on `$LL.register.<name>`.

mod metadata;

pub use metadata::{
    heartbeat_subject, register_subject, ExampleMetadata, HeartbeatMessage, MethodMetadata,
    ParameterMetadata, RegisterMessage, ReturnMetadata, ServiceMetadata,
    DEFAULT_HEARTBEAT_INTERVAL, HEARTBEAT_PREFIX, REGISTER_PREFIX,
};

use crate::client::Client;
use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::rpc::{service_pattern, RpcRequest, RpcResponse};
use crate::subject::validate_token;
use crate::subscriptions::{HandlerResult, MessageHandler, SubscriptionId, SubscriptionOptions};
use crate::types::{Message, Timestamp};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

type MethodFn = dyn Fn(&Value) -> std::result::Result<Value, String> + Send + Sync;
type MethodMap = Arc<RwLock<HashMap<String, Arc<MethodFn>>>>;
type SharedMetadata = Arc<RwLock<Option<ServiceMetadata>>>;

/// Serves the methods of one named service on `$SRV.<name>.>`.
///
/// Methods may be registered before or after `start`.
pub struct Service {
    name: String,
    client: Client,
    methods: MethodMap,
    method_metadata: RwLock<BTreeMap<String, MethodMetadata>>,
    metadata: SharedMetadata,
    heartbeat_interval: Duration,
    heartbeat: Option<Heartbeat>,
    subscription: Option<SubscriptionId>,
}

impl Service {
    pub fn new(client: &Client, name: &str) -> Result<Self> {
        validate_token(name)?;
        Ok(Self {
            name: name.to_string(),
            client: client.clone(),
            methods: Arc::new(RwLock::new(HashMap::new())),
            method_metadata: RwLock::new(BTreeMap::new()),
            metadata: Arc::new(RwLock::new(None)),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat: None,
            subscription: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register (or replace) a method.
    pub fn register<F>(&self, method: &str, handler: F)
    where
        F: Fn(&Value) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        self.methods
            .write()
            .insert(method.to_string(), Arc::new(handler));
    }

    /// Register a method together with its description.
    pub fn register_with_metadata<F>(&self, metadata: MethodMetadata, handler: F)
    where
        F: Fn(&Value) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        let method = metadata.name.clone();
        self.method_metadata.write().insert(method.clone(), metadata);
        self.register(&method, handler);
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.read().contains_key(method)
    }

    pub fn method_metadata(&self, method: &str) -> Option<MethodMetadata> {
        self.method_metadata.read().get(method).cloned()
    }

    /// The last metadata announced with [`Service::register_metadata`].
    pub fn metadata(&self) -> Option<ServiceMetadata> {
        self.metadata.read().clone()
    }

    /// Store and announce the service description.
    ///
    /// An empty method list is filled from the methods registered with
    /// [`Service::register_with_metadata`]. Calling it again re-announces.
    pub fn register_metadata(&self, mut metadata: ServiceMetadata) -> Result<()> {
        if metadata.methods.is_empty() {
            metadata.methods = self.method_metadata.read().values().cloned().collect();
        }
        let now = Timestamp::now();
        if metadata.registered_at == Timestamp::default() {
            metadata.registered_at = now;
        }
        metadata.last_seen = now;

        let announcement = RegisterMessage {
            service: self.name.clone(),
            version: metadata.version.clone(),
            metadata: metadata.clone(),
            timestamp: now,
        };
        *self.metadata.write() = Some(metadata);
        self.client
            .publish_json(&register_subject(&self.name), &announcement)?;
        info!(service = %self.name, version = %announcement.version, "metadata registered");
        Ok(())
    }

    /// Interval between heartbeats. Applies from the next `start`.
    pub fn set_heartbeat_interval(&mut self, interval: Duration) {
        self.heartbeat_interval = interval;
    }

    pub fn is_running(&self) -> bool {
        self.subscription.is_some()
    }

    /// Start answering requests and sending heartbeats. No-op if already
    /// running. Fails if the first heartbeat cannot be sent.
    pub fn start(&mut self) -> Result<()> {
        if self.subscription.is_some() {
            return Ok(());
        }
        let conn = self.client.connection();
        let handler = ServiceHandler {
            service: self.name.clone(),
            methods: Arc::clone(&self.methods),
            conn: Arc::downgrade(conn),
        };
        let id = conn.subscribe_with(
            &service_pattern(&self.name)?,
            SubscriptionOptions::default(),
            move |_| -> Box<dyn MessageHandler> { Box::new(handler) },
        )?;

        let beacon = Beacon {
            service: self.name.clone(),
            subject: heartbeat_subject(&self.name),
            metadata: Arc::clone(&self.metadata),
            conn: Arc::downgrade(conn),
        };
        match Heartbeat::spawn(beacon, self.heartbeat_interval) {
            Ok(heartbeat) => self.heartbeat = Some(heartbeat),
            Err(e) => {
                self.client.unsubscribe(id);
                return Err(e);
            }
        }

        info!(service = %self.name, "service started");
        self.subscription = Some(id);
        Ok(())
    }

    /// Stop answering requests and sending heartbeats. Idempotent.
    pub fn stop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop();
        }
        if let Some(id) = self.subscription.take() {
            self.client.unsubscribe(id);
            info!(service = %self.name, "service stopped");
        }
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Builds and sends one heartbeat.
struct Beacon {
    service: String,
    subject: String,
    metadata: SharedMetadata,
    conn: Weak<ConnectionManager>,
}

impl Beacon {
    fn send(&self) -> Result<()> {
        let conn = self.conn.upgrade().ok_or(Error::Closed)?;
        let version = self
            .metadata
            .read()
            .as_ref()
            .map_or_else(|| metadata::UNKNOWN_VERSION.to_string(), |m| m.version.clone());
        let beat = HeartbeatMessage {
            service: self.service.clone(),
            version,
            timestamp: Timestamp::now(),
        };
        conn.send(Message::json(self.subject.as_str(), &beat)?)
    }
}

/// The heartbeat thread. Dropping `stop` wakes and ends it.
struct Heartbeat {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    fn spawn(beacon: Beacon, interval: Duration) -> Result<Self> {
        beacon.send()?;

        let (stop, stopped) = bounded::<()>(0);
        let handle = thread::Builder::new()
            .name(format!("light-link-heartbeat-{}", beacon.service))
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => match beacon.send() {
                        Ok(()) => {}
                        Err(Error::Closed) => break,
                        Err(e) => debug!(service = %beacon.service, error = %e, "heartbeat skipped"),
                    },
                    _ => break,
                }
            })?;
        Ok(Self { stop, handle })
    }

    fn stop(self) {
        drop(self.stop);
        if self.handle.join().is_err() {
            warn!("heartbeat thread panicked");
        }
    }
}

struct ServiceHandler {
    service: String,
    methods: MethodMap,
    conn: Weak<ConnectionManager>,
}

impl ServiceHandler {
    fn answer(&self, payload: &[u8]) -> RpcResponse {
        let request: RpcRequest = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(e) => return RpcResponse::err("", format!("invalid request: {e}")),
        };

        let handler = self.methods.read().get(&request.method).cloned();
        let Some(handler) = handler else {
            return RpcResponse::err(request.id, format!("method not found: {}", request.method));
        };

        debug!(service = %self.service, method = %request.method, id = %request.id, "rpc");
        match catch_unwind(AssertUnwindSafe(|| handler(&request.args))) {
            Ok(Ok(result)) => RpcResponse::ok(request.id, result),
            Ok(Err(message)) => RpcResponse::err(request.id, message),
            Err(_) => {
                warn!(service = %self.service, method = %request.method, "method panicked");
                RpcResponse::err(request.id, format!("method {} panicked", request.method))
            }
        }
    }
}

impl MessageHandler for ServiceHandler {
    fn on_message(&mut self, message: Message) -> HandlerResult {
        let Some(reply_to) = message.reply_to.as_deref() else {
            warn!(service = %self.service, subject = %message.subject, "rpc request without reply subject");
            return Ok(());
        };
        let Some(conn) = self.conn.upgrade() else {
            return Ok(());
        };
        let response = self.answer(&message.payload);
        conn.send(Message::json(reply_to, &response)?)?;
        Ok(())
    }
}
