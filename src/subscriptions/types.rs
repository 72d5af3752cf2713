//! Subscription types.

use crate::error::Error;
use crate::types::Message;
use std::fmt;

/// Unique identifier for a subscription.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What to do when a subscription's queue is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Drop the incoming message and keep the subscription.
    #[default]
    Drop,
    /// Close the subscription with [`CloseReason::Overrun`].
    Terminate,
}

/// Per-subscription settings.
#[derive(Clone, Debug)]
pub struct SubscriptionOptions {
    /// Max queued messages before the overflow policy applies.
    /// Default: 1024
    pub capacity: usize,

    /// Overflow behaviour.
    pub overflow: OverflowPolicy,

    /// Whether the subscription is re-registered after a reconnect.
    /// Subscriptions that cannot tolerate gaps set this to false and are
    /// closed with [`CloseReason::ConnectionLost`] instead.
    pub resume_on_reconnect: bool,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            capacity: 1024,
            overflow: OverflowPolicy::Drop,
            resume_on_reconnect: true,
        }
    }
}

/// Why a subscription ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Explicitly unsubscribed.
    Unsubscribed,
    /// The client was closed.
    Closed,
    /// The connection dropped and could not be resumed.
    ConnectionLost,
    /// The queue overflowed under [`OverflowPolicy::Terminate`].
    Overrun,
}

impl CloseReason {
    /// The error a dependent operation should report, if any.
    pub fn to_error(self) -> Option<Error> {
        match self {
            CloseReason::Unsubscribed => None,
            CloseReason::Closed => Some(Error::Closed),
            CloseReason::ConnectionLost => Some(Error::ConnectionLost),
            CloseReason::Overrun => Some(Error::Overrun),
        }
    }
}

/// Outcome of a handler invocation. Errors are logged, never propagated.
pub type HandlerResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Receives messages for one subscription, on that subscription's own
/// delivery thread.
pub trait MessageHandler: Send + 'static {
    /// Handle one message.
    fn on_message(&mut self, message: Message) -> HandlerResult;

    /// Called exactly once after the last delivery.
    fn on_closed(&mut self, _reason: CloseReason) {}
}

/// Adapts a closure into a [`MessageHandler`].
pub(crate) struct FnHandler<F>(pub F);

impl<F> MessageHandler for FnHandler<F>
where
    F: FnMut(Message) -> HandlerResult + Send + 'static,
{
    fn on_message(&mut self, message: Message) -> HandlerResult {
        (self.0)(message)
    }
}
