//! Request/reply over subjects.
//!
//! Each call gets a random 128-bit correlation id and a reply subject
//! scoped to it under this client's inbox. The coordinator settles a call
//! exactly once: reply, timeout, cancellation or connection failure.

mod coordinator;
mod protocol;

pub(crate) use coordinator::Coordinator;
pub use coordinator::INBOX_PREFIX;
pub use protocol::{
    decode_reply, service_pattern, service_subject, RpcRequest, RpcResponse, SERVICE_PREFIX,
};

use crate::types::CorrelationId;
use std::sync::Weak;

/// Handle to an in-flight asynchronous call.
#[derive(Clone)]
pub struct CallHandle {
    id: CorrelationId,
    coordinator: Weak<Coordinator>,
}

impl CallHandle {
    pub(crate) fn new(id: CorrelationId, coordinator: Weak<Coordinator>) -> Self {
        Self { id, coordinator }
    }

    pub fn id(&self) -> CorrelationId {
        self.id
    }

    /// Cancel the call. The completion callback receives `Cancelled` unless
    /// the call already settled, in which case this returns false.
    pub fn cancel(&self) -> bool {
        self.coordinator
            .upgrade()
            .map(|c| c.cancel(self.id))
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallHandle").field("id", &self.id).finish()
    }
}
