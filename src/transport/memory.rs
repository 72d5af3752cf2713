//! In-process broker.

use super::{Connector, Link, LinkEvent};
use crate::config::TlsOptions;
use crate::subject::Pattern;
use crate::types::Message;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Per-link broker state.
struct LinkSlot {
    sender: Sender<LinkEvent>,
    interest: BTreeMap<u64, Pattern>,
}

struct BrokerInner {
    links: Mutex<BTreeMap<u64, LinkSlot>>,
    next_link: AtomicU64,
    accepting: AtomicBool,
    routed: AtomicU64,
}

impl BrokerInner {
    fn route(&self, from: u64, message: Message) -> io::Result<()> {
        let links = self.links.lock();
        if !links.contains_key(&from) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "link closed"));
        }

        for slot in links.values() {
            if slot.interest.values().any(|p| p.matches(&message.subject)) {
                // A receiver that hung up is reaped on its own close.
                let _ = slot.sender.send(LinkEvent::Message(message.clone()));
            }
        }
        self.routed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// An in-memory broker. Every dial yields a fresh link; published
/// messages are delivered once to each link with a matching interest.
///
/// The address passed to `dial` is not interpreted.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                links: Mutex::new(BTreeMap::new()),
                next_link: AtomicU64::new(1),
                accepting: AtomicBool::new(true),
                routed: AtomicU64::new(0),
            }),
        }
    }

    /// Refuse (or accept again) new dials.
    pub fn set_accepting(&self, accepting: bool) {
        self.inner.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Sever every open link as if the network dropped.
    pub fn drop_connections(&self) {
        let dropped = std::mem::take(&mut *self.inner.links.lock());
        debug!(count = dropped.len(), "memory broker dropping links");
        for (_, slot) in dropped {
            let _ = slot
                .sender
                .send(LinkEvent::Closed(Some("connection reset by broker".into())));
        }
    }

    /// Number of currently open links.
    pub fn connection_count(&self) -> usize {
        self.inner.links.lock().len()
    }

    /// Total messages routed since creation.
    pub fn routed_count(&self) -> u64 {
        self.inner.routed.load(Ordering::Relaxed)
    }

    /// This broker as a shareable connector.
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for MemoryBroker {
    fn dial(&self, address: &str, _tls: Option<&TlsOptions>) -> io::Result<Box<dyn Link>> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("broker at {address} is not accepting connections"),
            ));
        }

        let id = self.inner.next_link.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = unbounded();
        self.inner.links.lock().insert(
            id,
            LinkSlot {
                sender,
                interest: BTreeMap::new(),
            },
        );
        debug!(link = id, address, "memory broker accepted link");

        Ok(Box::new(MemoryLink {
            id,
            broker: Arc::clone(&self.inner),
            events: receiver,
        }))
    }
}

struct MemoryLink {
    id: u64,
    broker: Arc<BrokerInner>,
    events: Receiver<LinkEvent>,
}

impl MemoryLink {
    fn with_slot<T>(&self, f: impl FnOnce(&mut LinkSlot) -> T) -> io::Result<T> {
        let mut links = self.broker.links.lock();
        links
            .get_mut(&self.id)
            .map(f)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "link closed"))
    }
}

impl Link for MemoryLink {
    fn publish(&self, message: Message) -> io::Result<()> {
        self.broker.route(self.id, message)
    }

    fn subscribe(&self, sid: u64, pattern: &str) -> io::Result<()> {
        let pattern = Pattern::parse(pattern)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        self.with_slot(|slot| {
            slot.interest.insert(sid, pattern);
        })
    }

    fn unsubscribe(&self, sid: u64) -> io::Result<()> {
        self.with_slot(|slot| {
            slot.interest.remove(&sid);
        })
    }

    fn events(&self) -> Receiver<LinkEvent> {
        self.events.clone()
    }

    fn close(&self) {
        self.broker.links.lock().remove(&self.id);
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn recv_message(link: &dyn Link) -> Message {
        match link.events().recv_timeout(Duration::from_secs(1)).unwrap() {
            LinkEvent::Message(m) => m,
            other => panic!("Expected message, got {:?}", other),
        }
    }

    #[test]
    fn test_routes_by_interest() {
        let broker = MemoryBroker::new();
        let a = broker.dial("mem://", None).unwrap();
        let b = broker.dial("mem://", None).unwrap();

        b.subscribe(1, "orders.*").unwrap();
        a.publish(Message::new("orders.created", b"x".to_vec())).unwrap();
        a.publish(Message::new("users.created", b"y".to_vec())).unwrap();

        assert_eq!(recv_message(b.as_ref()).subject, "orders.created");
        assert!(b.events().recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_one_copy_per_link() {
        let broker = MemoryBroker::new();
        let link = broker.dial("mem://", None).unwrap();
        link.subscribe(1, "a.>").unwrap();
        link.subscribe(2, "a.b").unwrap();

        link.publish(Message::new("a.b", Vec::new())).unwrap();
        recv_message(link.as_ref());
        assert!(link.events().recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_refuses_when_not_accepting() {
        let broker = MemoryBroker::new();
        broker.set_accepting(false);
        let err = broker.dial("mem://", None).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[test]
    fn test_drop_connections_notifies_links() {
        let broker = MemoryBroker::new();
        let link = broker.dial("mem://", None).unwrap();
        assert_eq!(broker.connection_count(), 1);

        broker.drop_connections();
        assert_eq!(broker.connection_count(), 0);
        match link.events().recv_timeout(Duration::from_secs(1)).unwrap() {
            LinkEvent::Closed(Some(_)) => {}
            other => panic!("Expected Closed, got {:?}", other),
        }
        assert!(link.publish(Message::new("a", Vec::new())).is_err());
    }

    #[test]
    fn test_close_is_idempotent() {
        let broker = MemoryBroker::new();
        let link = broker.dial("mem://", None).unwrap();
        link.close();
        link.close();
        assert_eq!(broker.connection_count(), 0);
    }
}
