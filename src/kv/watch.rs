//! KV watchers.
//!
//! A watcher subscribes to change events before reading the snapshot, so
//! nothing committed after the snapshot can be missed. Events arriving
//! while the snapshot is being read are buffered and replayed once it has
//! been delivered, skipping anything the snapshot already covers.

use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::protocol::entry_from_message;
use crate::subscriptions::{CloseReason, HandlerResult, MessageHandler, SubscriptionId};
use crate::types::{KvEntry, Message, Revision};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// What a watcher follows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchTarget {
    /// A single key.
    Key(String),
    /// Every key starting with the prefix.
    Prefix(String),
}

impl WatchTarget {
    pub fn key(key: impl Into<String>) -> Self {
        WatchTarget::Key(key.into())
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        WatchTarget::Prefix(prefix.into())
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            WatchTarget::Key(k) => k == key,
            WatchTarget::Prefix(p) => key.starts_with(p.as_str()),
        }
    }
}

/// Identifies an active watcher.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub(crate) SubscriptionId);

impl fmt::Debug for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WatchId({})", self.0 .0)
    }
}

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0 .0)
    }
}

pub(crate) type WatchCallback = Box<dyn FnMut(Result<KvEntry>) + Send>;

/// Delivery state shared by the caller thread (snapshot) and the
/// subscription thread (changes).
pub(crate) struct WatchState {
    primed: bool,
    finished: bool,
    buffered: Vec<KvEntry>,
    last: HashMap<String, Revision>,
    callback: WatchCallback,
}

impl WatchState {
    pub fn new(callback: WatchCallback) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            primed: false,
            finished: false,
            buffered: Vec::new(),
            last: HashMap::new(),
            callback,
        }))
    }

    /// Deliver the snapshot, then replay buffered changes. Returns false if
    /// the watcher terminated along the way.
    pub fn prime(&mut self, snapshot: Vec<KvEntry>) -> bool {
        if self.finished {
            return false;
        }
        for entry in snapshot {
            self.last.insert(entry.key.clone(), entry.revision);
            (self.callback)(Ok(entry));
        }
        self.primed = true;
        for entry in std::mem::take(&mut self.buffered) {
            if !self.offer(entry) {
                return false;
            }
        }
        true
    }

    /// Deliver one change. Per key the next revision must be exactly
    /// last + 1; older revisions are duplicates and skipped, a jump ends
    /// the watcher with `Overrun`.
    fn offer(&mut self, entry: KvEntry) -> bool {
        let last = self.last.get(&entry.key).copied().unwrap_or_default();
        if entry.revision <= last {
            return true;
        }
        if entry.revision != last.next() {
            warn!(
                key = %entry.key,
                expected = %last.next(),
                got = %entry.revision,
                "watch missed a revision, terminating"
            );
            self.finish(Error::Overrun);
            return false;
        }
        self.last.insert(entry.key.clone(), entry.revision);
        (self.callback)(Ok(entry));
        true
    }

    fn finish(&mut self, error: Error) {
        if !self.finished {
            self.finished = true;
            self.buffered.clear();
            (self.callback)(Err(error));
        }
    }
}

/// Subscription handler feeding change events into a [`WatchState`].
pub(crate) struct WatchHandler {
    pub bucket: String,
    pub target: WatchTarget,
    pub state: Arc<Mutex<WatchState>>,
    pub conn: Weak<ConnectionManager>,
    pub id: SubscriptionId,
}

impl WatchHandler {
    fn stop(&self) {
        if let Some(conn) = self.conn.upgrade() {
            conn.unsubscribe(self.id);
        }
    }
}

impl MessageHandler for WatchHandler {
    fn on_message(&mut self, message: Message) -> HandlerResult {
        let entry = entry_from_message(&self.bucket, &message)?;
        if !self.target.matches(&entry.key) {
            return Ok(());
        }

        let mut state = self.state.lock();
        if state.finished {
            return Ok(());
        }
        if !state.primed {
            state.buffered.push(entry);
            return Ok(());
        }
        if !state.offer(entry) {
            drop(state);
            self.stop();
        }
        Ok(())
    }

    fn on_closed(&mut self, reason: CloseReason) {
        debug!(watch = self.id.0, ?reason, "watch closed");
        if let Some(error) = reason.to_error() {
            self.state.lock().finish(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timestamp;
    use crossbeam_channel::{unbounded, Receiver};

    fn entry(key: &str, rev: u64) -> KvEntry {
        KvEntry {
            bucket: "b".into(),
            key: key.into(),
            value: format!("v{rev}").into_bytes(),
            revision: Revision(rev),
            created: Timestamp(0),
        }
    }

    fn recording() -> (Arc<Mutex<WatchState>>, Receiver<Result<KvEntry>>) {
        let (tx, rx) = unbounded();
        let state = WatchState::new(Box::new(move |r| {
            let _ = tx.send(r);
        }));
        (state, rx)
    }

    fn revisions(rx: &Receiver<Result<KvEntry>>) -> Vec<u64> {
        rx.try_iter()
            .map(|r| r.map(|e| e.revision.0).unwrap_or(0))
            .collect()
    }

    #[test]
    fn test_snapshot_then_buffered_without_duplicates() {
        let (state, rx) = recording();
        {
            let mut s = state.lock();
            s.buffered.push(entry("k", 2));
            s.buffered.push(entry("k", 3));
            s.buffered.push(entry("k", 4));
            assert!(s.prime(vec![entry("k", 3)]));
        }
        assert_eq!(revisions(&rx), vec![3, 4]);
    }

    #[test]
    fn test_gap_terminates_with_overrun() {
        let (state, rx) = recording();
        let mut s = state.lock();
        assert!(s.prime(vec![entry("k", 1)]));
        assert!(!s.offer(entry("k", 3)));
        assert!(s.finished);

        let results: Vec<_> = rx.try_iter().collect();
        assert_eq!(results.len(), 2);
        assert!(matches!(results[1], Err(Error::Overrun)));
    }

    #[test]
    fn test_revisions_tracked_per_key() {
        let (state, rx) = recording();
        let mut s = state.lock();
        assert!(s.prime(vec![entry("a", 5)]));
        assert!(s.offer(entry("b", 1)));
        assert!(s.offer(entry("a", 6)));
        assert!(s.offer(entry("b", 2)));
        assert_eq!(revisions(&rx), vec![5, 1, 6, 2]);
    }

    #[test]
    fn test_finish_reports_once() {
        let (state, rx) = recording();
        let mut s = state.lock();
        s.finish(Error::ConnectionLost);
        s.finish(Error::Closed);
        assert!(!s.prime(Vec::new()));
        let results: Vec<_> = rx.try_iter().collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(Error::ConnectionLost)));
    }

    #[test]
    fn test_target_matching() {
        assert!(WatchTarget::key("config.app").matches("config.app"));
        assert!(!WatchTarget::key("config.app").matches("config.app2"));
        assert!(WatchTarget::prefix("config.").matches("config.app"));
        assert!(!WatchTarget::prefix("config.").matches("other"));
    }
}
