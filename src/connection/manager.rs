//! Connection manager: owns the link, the state machine and the registry.

use super::ConnectionState;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::rpc::Coordinator;
use crate::subject::{validate_subject, Pattern};
use crate::subscriptions::{
    CloseReason, MessageHandler, SubscriptionId, SubscriptionOptions, SubscriptionRegistry,
};
use crate::transport::{Connector, Link, LinkEvent};
use crate::types::Message;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::io;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Link-level sid of the reply inbox. Registry ids start at 1.
const INBOX_SID: u64 = 0;

/// Everything guarded by the single connection lock.
struct Shared {
    state: ConnectionState,
    link: Option<Arc<dyn Link>>,
    registry: SubscriptionRegistry,
    retries: u32,
}

/// Owns the single broker link.
///
/// State, link and subscription registry share one mutex, so subscribe,
/// unsubscribe, dispatch and reconnect replay are serialised.
pub(crate) struct ConnectionManager {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    coordinator: Arc<Coordinator>,
    shared: Mutex<Shared>,
    /// Dropped on close to wake a reader sleeping in backoff.
    shutdown: Mutex<Option<Sender<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Dial the broker and start the reader thread.
    pub fn connect(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        coordinator: Arc<Coordinator>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let manager = Arc::new(Self {
            config,
            connector,
            coordinator,
            shared: Mutex::new(Shared {
                state: ConnectionState::Disconnected,
                link: None,
                registry: SubscriptionRegistry::new(),
                retries: 0,
            }),
            shutdown: Mutex::new(Some(shutdown_tx)),
            reader: Mutex::new(None),
        });

        let events = manager.establish()?;

        let weak = Arc::downgrade(&manager);
        let spawned = thread::Builder::new()
            .name("light-link-reader".into())
            .spawn(move || read_loop(weak, events, shutdown_rx));
        match spawned {
            Ok(handle) => *manager.reader.lock() = Some(handle),
            Err(e) => {
                manager.close();
                return Err(e.into());
            }
        }

        Ok(manager)
    }

    fn establish(&self) -> Result<Receiver<LinkEvent>> {
        self.shared.lock().state = ConnectionState::Connecting;
        debug!(address = %self.config.address, name = %self.config.name, "connecting");

        let dialed = self
            .connector
            .dial(&self.config.address, self.config.tls.as_ref())
            .and_then(|link| {
                let shared = self.shared.lock();
                self.register_interests(link.as_ref(), &shared.registry)?;
                Ok(link)
            });

        let mut shared = self.shared.lock();
        match dialed {
            Ok(link) => {
                let events = link.events();
                shared.link = Some(Arc::from(link));
                shared.state = ConnectionState::Connected;
                info!(address = %self.config.address, "connected");
                Ok(events)
            }
            Err(e) => {
                shared.state = ConnectionState::Closed;
                Err(Error::Connect(format!("{}: {e}", self.config.address)))
            }
        }
    }

    fn register_interests(&self, link: &dyn Link, registry: &SubscriptionRegistry) -> io::Result<()> {
        link.subscribe(INBOX_SID, &self.coordinator.inbox_pattern())?;
        for (id, pattern) in registry.interests() {
            link.subscribe(id.0, pattern)?;
        }
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Reconnect attempts made since the last successful connect.
    pub fn retry_count(&self) -> u32 {
        self.shared.lock().retries
    }

    /// Publish a message. Fails fast while reconnecting; nothing is buffered.
    pub fn send(&self, message: Message) -> Result<()> {
        validate_subject(&message.subject)?;
        if let Some(reply_to) = &message.reply_to {
            validate_subject(reply_to)?;
        }

        // Publish outside the lock so a slow write never stalls routing.
        let link = {
            let shared = self.shared.lock();
            match (shared.state, &shared.link) {
                (ConnectionState::Connected, Some(link)) => Arc::clone(link),
                (ConnectionState::Reconnecting, _) => return Err(Error::Reconnecting),
                (ConnectionState::Closed, _) => return Err(Error::Closed),
                _ => return Err(Error::ConnectionLost),
            }
        };
        link.publish(message).map_err(|e| {
            if e.kind() == io::ErrorKind::NotConnected {
                Error::ConnectionLost
            } else {
                Error::Io(e)
            }
        })
    }

    /// Register a handler. `make_handler` receives the id the subscription
    /// will get, so handlers can refer to themselves.
    pub fn subscribe_with<F>(
        &self,
        pattern: &str,
        options: SubscriptionOptions,
        make_handler: F,
    ) -> Result<SubscriptionId>
    where
        F: FnOnce(SubscriptionId) -> Box<dyn MessageHandler>,
    {
        let pattern = Pattern::parse(pattern)?;

        let mut shared = self.shared.lock();
        if shared.state == ConnectionState::Closed {
            return Err(Error::Closed);
        }

        let handler = make_handler(shared.registry.peek_id());
        let id = shared.registry.insert(pattern.clone(), options, handler)?;

        if let Some(link) = shared.link.clone() {
            if let Err(e) = link.subscribe(id.0, pattern.as_str()) {
                shared.registry.remove(id, CloseReason::Unsubscribed);
                return Err(e.into());
            }
        }
        Ok(id)
    }

    /// Remove a subscription. No-op if already removed.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut shared = self.shared.lock();
        if shared.registry.remove(id, CloseReason::Unsubscribed) {
            if let Some(link) = &shared.link {
                let _ = link.unsubscribe(id.0);
            }
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.shared.lock().registry.len()
    }

    pub fn dropped_count(&self, id: SubscriptionId) -> Option<u64> {
        self.shared.lock().registry.dropped_count(id)
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        self.config.request_timeout
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Close the connection. Idempotent; subscriptions and pending calls
    /// are released exactly once.
    pub fn close(&self) {
        let link = {
            let mut shared = self.shared.lock();
            if shared.state != ConnectionState::Closed {
                shared.state = ConnectionState::Closed;
                shared.registry.close_all(CloseReason::Closed);
                info!(address = %self.config.address, "connection closed");
            }
            shared.link.take()
        };

        self.shutdown.lock().take();
        if let Some(link) = link {
            link.close();
        }
        self.coordinator.fail_all(|| Error::Closed);
        self.coordinator.shutdown();

        let handle = self.reader.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    // --- Reader side ---

    fn route(&self, message: Message) {
        if self.coordinator.owns(&message.subject) {
            self.coordinator.resolve(message);
            return;
        }

        let mut shared = self.shared.lock();
        let closed = shared.registry.dispatch(&message);
        if let Some(link) = &shared.link {
            for id in closed {
                let _ = link.unsubscribe(id.0);
            }
        }
    }

    /// Handle a dropped link. Returns the new link's events, or `None` once
    /// the connection is closed for good.
    fn recover(&self, reason: Option<String>, shutdown: &Receiver<()>) -> Option<Receiver<LinkEvent>> {
        {
            let mut shared = self.shared.lock();
            if shared.state == ConnectionState::Closed {
                return None;
            }
            warn!(
                address = %self.config.address,
                reason = reason.as_deref().unwrap_or("link closed"),
                "connection lost, reconnecting"
            );
            shared.state = ConnectionState::Reconnecting;
            if let Some(link) = shared.link.take() {
                link.close();
            }
            shared.registry.interrupt();
        }
        self.coordinator.fail_all(|| Error::ConnectionLost);

        let policy = &self.config.reconnect;
        for attempt in 1..=policy.max_reconnects {
            match shutdown.recv_timeout(policy.backoff(attempt)) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => return None,
            }

            {
                let mut shared = self.shared.lock();
                if shared.state == ConnectionState::Closed {
                    return None;
                }
                shared.retries = attempt;
            }

            let link = match self
                .connector
                .dial(&self.config.address, self.config.tls.as_ref())
            {
                Ok(link) => link,
                Err(e) => {
                    warn!(attempt, error = %e, "reconnect attempt failed");
                    continue;
                }
            };

            let mut shared = self.shared.lock();
            if shared.state == ConnectionState::Closed {
                link.close();
                return None;
            }
            if let Err(e) = self.register_interests(link.as_ref(), &shared.registry) {
                warn!(attempt, error = %e, "failed to restore subscriptions");
                link.close();
                continue;
            }
            let events = link.events();
            shared.link = Some(Arc::from(link));
            shared.state = ConnectionState::Connected;
            shared.retries = 0;
            info!(attempt, address = %self.config.address, "reconnected");
            return Some(events);
        }

        {
            let mut shared = self.shared.lock();
            if shared.state != ConnectionState::Closed {
                shared.state = ConnectionState::Closed;
                shared.registry.close_all(CloseReason::ConnectionLost);
            }
        }
        warn!(
            attempts = policy.max_reconnects,
            address = %self.config.address,
            "reconnect attempts exhausted, closing"
        );
        self.coordinator.fail_all(|| Error::ConnectionLost);
        None
    }
}

fn read_loop(weak: Weak<ConnectionManager>, mut events: Receiver<LinkEvent>, shutdown: Receiver<()>) {
    loop {
        let event = events
            .recv()
            .unwrap_or_else(|_| LinkEvent::Closed(Some("link disconnected".into())));

        let Some(manager) = weak.upgrade() else {
            return;
        };

        match event {
            LinkEvent::Message(message) => manager.route(message),
            LinkEvent::Closed(reason) => match manager.recover(reason, &shutdown) {
                Some(next) => events = next,
                None => return,
            },
        }
    }
}
