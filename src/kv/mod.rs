//! Key-value buckets with per-key revisions and watches.
//!
//! ## Revisions
//!
//! Every successful put to a key bumps its revision by one, starting at 1.
//! `get` returns the latest entry unless a revision is asked for; asking
//! for a revision the bucket no longer retains fails with
//! [`RevisionMismatch`](crate::Error::RevisionMismatch).
//!
//! ## Watches
//!
//! ```ignore
//! let id = kv.watch(WatchTarget::key("config.app"), |change| match change {
//!     Ok(entry) => println!("{} -> rev {}", entry.key, entry.revision),
//!     Err(e) => eprintln!("watch ended: {e}"),
//! })?;
//! kv.unwatch(id);
//! ```

mod client;
mod watch;

pub use client::KvStore;
pub use watch::{WatchId, WatchTarget};
