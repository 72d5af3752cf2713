//! Transport capability interface.
//!
//! The messaging core never talks to a broker directly. It dials a
//! [`Connector`] and drives the returned [`Link`]:
//! - `publish` hands a message to the broker
//! - `subscribe`/`unsubscribe` register interest under a numeric sid
//! - `events` yields inbound messages and the link's own closure
//!
//! [`MemoryBroker`] is an in-process implementation used by tests, demos
//! and any embedding that wants pub/sub without a network.

mod memory;

pub use memory::MemoryBroker;

use crate::config::TlsOptions;
use crate::types::Message;
use crossbeam_channel::Receiver;
use std::io;

/// Something the link reports to its owner.
#[derive(Clone, Debug)]
pub enum LinkEvent {
    /// An inbound message matching one of the registered interests.
    Message(Message),
    /// The link went away. `None` when closed locally.
    Closed(Option<String>),
}

/// One established connection to a broker.
pub trait Link: Send + Sync {
    /// Send a message to the broker.
    fn publish(&self, message: Message) -> io::Result<()>;

    /// Register interest in a subject pattern.
    fn subscribe(&self, sid: u64, pattern: &str) -> io::Result<()>;

    /// Drop a previously registered interest.
    fn unsubscribe(&self, sid: u64) -> io::Result<()>;

    /// Inbound events. The channel disconnects once the link is gone.
    fn events(&self) -> Receiver<LinkEvent>;

    /// Close the link. Idempotent.
    fn close(&self);
}

/// Opens links to a broker address.
pub trait Connector: Send + Sync {
    fn dial(&self, address: &str, tls: Option<&TlsOptions>) -> io::Result<Box<dyn Link>>;
}
