//! Subscription registry for inbound messages.
//!
//! Every subscription gets:
//! - a validated subject pattern
//! - a bounded queue with an overflow policy
//! - a dedicated delivery thread, so a slow handler only delays itself
//!
//! Handler errors and panics are logged and never reach sibling
//! subscriptions or the dispatcher.
//!
//! # Example
//!
//! ```ignore
//! let id = client.subscribe("orders.*", |msg| {
//!     println!("{}: {} bytes", msg.subject, msg.payload.len());
//!     Ok(())
//! })?;
//! client.unsubscribe(id);
//! ```

mod registry;
mod types;

pub(crate) use registry::SubscriptionRegistry;
pub(crate) use types::FnHandler;
pub use types::{
    CloseReason, HandlerResult, MessageHandler, OverflowPolicy, SubscriptionId,
    SubscriptionOptions,
};
