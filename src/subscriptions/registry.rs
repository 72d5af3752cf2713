//! Subscription registry: pattern → handler, one delivery thread each.

use crate::error::Result;
use crate::subject::Pattern;
use crate::types::Message;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

use super::types::{
    CloseReason, MessageHandler, OverflowPolicy, SubscriptionId, SubscriptionOptions,
};

/// State shared between the registry and a delivery thread.
struct Shared {
    active: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
    dropped: AtomicU64,
}

/// Internal subscription state.
struct Subscription {
    pattern: Pattern,
    options: SubscriptionOptions,
    sender: Sender<Message>,
    shared: Arc<Shared>,
}

impl Subscription {
    /// Stop delivery and release the queue. The delivery thread drains out
    /// and reports `reason` to the handler.
    fn close(self, reason: CloseReason) {
        *self.shared.close_reason.lock() = Some(reason);
        self.shared.active.store(false, Ordering::Release);
        drop(self.sender);
    }
}

/// Maps subject patterns to handlers.
///
/// Not synchronised on its own: the owner serialises every call, so
/// subscribe, unsubscribe, dispatch and reconnect replay never interleave.
/// Iteration follows id order, which is registration order.
pub(crate) struct SubscriptionRegistry {
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    next_id: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            subscriptions: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Reserve the id the next `insert` will use.
    pub fn peek_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id)
    }

    /// Register a handler and start its delivery thread.
    pub fn insert(
        &mut self,
        pattern: Pattern,
        options: SubscriptionOptions,
        handler: Box<dyn MessageHandler>,
    ) -> Result<SubscriptionId> {
        let id = SubscriptionId(self.next_id);
        let (sender, receiver) = bounded(options.capacity.max(1));
        let shared = Arc::new(Shared {
            active: AtomicBool::new(true),
            close_reason: Mutex::new(None),
            dropped: AtomicU64::new(0),
        });

        let worker_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name(format!("light-link-sub-{}", id.0))
            .spawn(move || deliver_loop(id, receiver, worker_shared, handler))?;

        self.next_id += 1;
        debug!(subscription = id.0, pattern = %pattern, "subscribed");
        self.subscriptions.insert(
            id,
            Subscription {
                pattern,
                options,
                sender,
                shared,
            },
        );
        Ok(id)
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn remove(&mut self, id: SubscriptionId, reason: CloseReason) -> bool {
        match self.subscriptions.remove(&id) {
            Some(sub) => {
                debug!(subscription = id.0, ?reason, "subscription closed");
                sub.close(reason);
                true
            }
            None => false,
        }
    }

    /// Queue a message on every matching subscription.
    ///
    /// Returns the subscriptions that were closed as a side effect
    /// (overflow under `Terminate`, or a vanished delivery thread).
    pub fn dispatch(&mut self, message: &Message) -> Vec<SubscriptionId> {
        let mut to_remove = Vec::new();

        for (id, sub) in &self.subscriptions {
            if !sub.pattern.matches(&message.subject) {
                continue;
            }
            match sub.sender.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => match sub.options.overflow {
                    OverflowPolicy::Drop => {
                        let dropped = sub.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(
                            subscription = id.0,
                            subject = %message.subject,
                            dropped,
                            "slow consumer, message dropped"
                        );
                    }
                    OverflowPolicy::Terminate => to_remove.push((*id, CloseReason::Overrun)),
                },
                Err(TrySendError::Disconnected(_)) => {
                    to_remove.push((*id, CloseReason::Unsubscribed))
                }
            }
        }

        to_remove
            .into_iter()
            .filter_map(|(id, reason)| self.remove(id, reason).then_some(id))
            .collect()
    }

    /// Close subscriptions that cannot survive a reconnect.
    pub fn interrupt(&mut self) -> Vec<SubscriptionId> {
        let ids: Vec<_> = self
            .subscriptions
            .iter()
            .filter(|(_, sub)| !sub.options.resume_on_reconnect)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            self.remove(*id, CloseReason::ConnectionLost);
        }
        ids
    }

    /// Close everything.
    pub fn close_all(&mut self, reason: CloseReason) {
        for (_, sub) in std::mem::take(&mut self.subscriptions) {
            sub.close(reason);
        }
    }

    /// Registered interests, in registration order.
    pub fn interests(&self) -> impl Iterator<Item = (SubscriptionId, &str)> + '_ {
        self.subscriptions
            .iter()
            .map(|(id, sub)| (*id, sub.pattern.as_str()))
    }

    /// Messages dropped for a subscription due to overflow.
    pub fn dropped_count(&self, id: SubscriptionId) -> Option<u64> {
        self.subscriptions
            .get(&id)
            .map(|sub| sub.shared.dropped.load(Ordering::Relaxed))
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    #[cfg(test)]
    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.subscriptions.contains_key(&id)
    }
}

fn deliver_loop(
    id: SubscriptionId,
    receiver: Receiver<Message>,
    shared: Arc<Shared>,
    mut handler: Box<dyn MessageHandler>,
) {
    for message in receiver.iter() {
        if !shared.active.load(Ordering::Acquire) {
            break;
        }
        let subject = message.subject.clone();
        match catch_unwind(AssertUnwindSafe(|| handler.on_message(message))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(subscription = id.0, %subject, error = %e, "handler failed");
            }
            Err(_) => {
                warn!(subscription = id.0, %subject, "handler panicked");
            }
        }
    }

    let reason = shared
        .close_reason
        .lock()
        .take()
        .unwrap_or(CloseReason::Closed);
    if catch_unwind(AssertUnwindSafe(|| handler.on_closed(reason))).is_err() {
        warn!(subscription = id.0, "handler panicked while closing");
    }
}
