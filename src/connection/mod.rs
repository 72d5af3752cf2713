//! Connection lifecycle and inbound dispatch.
//!
//! One link per client. A reader thread drains the link, hands replies to
//! the request coordinator and everything else to the subscription
//! registry. On an unexpected drop it retries with bounded exponential
//! backoff, replays every interest on success, and closes the client once
//! the attempts run out.

mod manager;

pub(crate) use manager::ConnectionManager;

/// Lifecycle state of the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}
