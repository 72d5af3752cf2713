//! # Light Link
//!
//! Client core for a subject-based message bus: publish/subscribe,
//! request/reply with timeouts, key-value buckets with watches, and
//! chunked object storage.
//!
//! ## Core Concepts
//!
//! - **Subjects**: `.`-delimited routing keys; patterns use `*` for one
//!   token and a trailing `>` for the rest
//! - **Subscriptions**: each has its own bounded queue and delivery thread
//! - **Requests**: correlated through a per-client reply inbox, settled
//!   exactly once
//! - **KV**: per-key revisions, watches that never skip a revision silently
//! - **Objects**: chunked uploads with crc32 per chunk and a SHA-256 digest
//!   in an immutable manifest
//!
//! ## Example
//!
//! ```ignore
//! use light_link::{Client, ClientConfig, MemoryBroker, MemoryKv, MemoryObjects, StorageResponder};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! let broker = MemoryBroker::new();
//! let host = Client::connect(ClientConfig::default(), broker.connector())?;
//! let _storage = StorageResponder::start(&host, MemoryKv::new(), MemoryObjects::new())?;
//!
//! let client = Client::connect(ClientConfig::default(), broker.connector())?;
//! client.subscribe("orders.>", |msg| {
//!     println!("{}: {} bytes", msg.subject, msg.payload.len());
//!     Ok(())
//! })?;
//! client.publish("orders.created", b"{}".to_vec())?;
//!
//! client.set_state("config.app", &json!({"v": 1}))?;
//! let sum = client.call("math", "add", json!({"a": "2", "b": "3"}), Duration::from_secs(5))?;
//! ```

pub mod backend;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod kv;
pub mod objects;
pub mod protocol;
pub mod rpc;
pub mod service;
pub mod subject;
pub mod subscriptions;
pub mod transport;
pub mod types;

// Re-exports
pub use backend::{MemoryKv, MemoryObjects, Rejection, StorageResponder};
pub use client::{Client, FILE_TRANSFER_SUBJECT};
pub use config::{ClientConfig, ReconnectPolicy, TlsOptions};
pub use connection::ConnectionState;
pub use error::{Error, Result};
pub use kv::{KvStore, WatchId, WatchTarget};
pub use objects::{ObjectManifest, ObjectReader, ObjectStore};
pub use rpc::{CallHandle, RpcRequest, RpcResponse};
pub use service::{
    ExampleMetadata, HeartbeatMessage, MethodMetadata, ParameterMetadata, RegisterMessage,
    ReturnMetadata, Service, ServiceMetadata,
};
pub use subject::Pattern;
pub use subscriptions::{
    CloseReason, HandlerResult, MessageHandler, OverflowPolicy, SubscriptionId,
    SubscriptionOptions,
};
pub use transport::{Connector, Link, LinkEvent, MemoryBroker};
pub use types::*;
