//! In-memory storage backends and the responder that serves them over the
//! message bus.
//!
//! Any client connected to the same broker can then use KV buckets and
//! object buckets through the regular request/reply path:
//!
//! ```ignore
//! let host = Client::connect(config.clone(), broker.connector())?;
//! let _responder = StorageResponder::start(&host, MemoryKv::new(), MemoryObjects::new())?;
//!
//! let client = Client::connect(config, broker.connector())?;
//! client.set_state("config.app", &json!({"v": 1}))?;
//! ```

mod kv;
mod objects;
mod responder;

pub use kv::MemoryKv;
pub use objects::MemoryObjects;
pub use responder::StorageResponder;

use crate::protocol::Status;
use thiserror::Error;

/// Why a backend refused a request. Travels back to the client as an
/// `LL-Status` code plus description.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("bucket {0} is not bound")]
    Unbound(String),

    #[error("{0}")]
    Internal(String),
}

impl Rejection {
    pub fn status(&self) -> Status {
        match self {
            Rejection::BadRequest(_) => Status::BadRequest,
            Rejection::NotFound(_) => Status::NotFound,
            Rejection::Conflict(_) => Status::Conflict,
            Rejection::Unbound(_) | Rejection::Internal(_) => Status::Unavailable,
        }
    }
}
