//! Request/reply correlation.

use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::types::{random_u128, CorrelationId, Message};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, SendError, Sender};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Prefix of every reply subject.
pub const INBOX_PREFIX: &str = "_INBOX";

type Callback = Box<dyn FnOnce(Result<Message>) + Send>;
type Job = Box<dyn FnOnce() + Send>;

/// Where a call's outcome goes.
enum Completion {
    Blocking(Sender<Result<Message>>),
    Callback(Callback),
}

/// A call awaiting its reply.
struct PendingCall {
    timeout: Duration,
    completion: Completion,
}

enum TimerCommand {
    Arm(Instant, CorrelationId),
    Shutdown,
}

/// Tracks in-flight requests.
///
/// A pending call leaves the map exactly once: on its reply, its deadline,
/// cancellation or a connection failure, whichever comes first. Anything
/// arriving afterwards for the same id is discarded.
pub(crate) struct Coordinator {
    inbox: String,
    pending: Mutex<HashMap<CorrelationId, PendingCall>>,
    timers: Sender<TimerCommand>,
    callbacks: Sender<Job>,
    open: AtomicBool,
}

impl Coordinator {
    /// Create a coordinator with its deadline and callback threads.
    pub fn new() -> Result<Arc<Self>> {
        let (timers, timer_rx) = unbounded();
        let (callbacks, job_rx) = unbounded::<Job>();
        let nonce = random_u128()? as u64;

        let coordinator = Arc::new(Self {
            inbox: format!("{INBOX_PREFIX}.{nonce:016x}"),
            pending: Mutex::new(HashMap::new()),
            timers,
            callbacks,
            open: AtomicBool::new(true),
        });

        let weak = Arc::downgrade(&coordinator);
        thread::Builder::new()
            .name("light-link-deadlines".into())
            .spawn(move || deadline_loop(weak, timer_rx))?;
        thread::Builder::new()
            .name("light-link-callbacks".into())
            .spawn(move || {
                for job in job_rx.iter() {
                    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
                        warn!("call completion callback panicked");
                    }
                }
            })?;

        Ok(coordinator)
    }

    /// Pattern covering every reply subject of this coordinator.
    pub fn inbox_pattern(&self) -> String {
        format!("{}.*", self.inbox)
    }

    /// True if the subject is one of our reply subjects.
    pub fn owns(&self, subject: &str) -> bool {
        self.correlation_of(subject).is_some()
    }

    fn correlation_of(&self, subject: &str) -> Option<CorrelationId> {
        subject
            .strip_prefix(self.inbox.as_str())?
            .strip_prefix('.')
            .and_then(CorrelationId::from_hex)
    }

    fn reply_subject(&self, id: CorrelationId) -> String {
        format!("{}.{}", self.inbox, id.to_hex())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn register(&self, timeout: Duration, completion: Completion) -> Result<CorrelationId> {
        loop {
            let id = CorrelationId::random()?;
            let mut pending = self.pending.lock();
            if !self.open.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }
            if pending.contains_key(&id) {
                warn!(%id, "correlation id collision, regenerating");
                continue;
            }
            pending.insert(id, PendingCall { timeout, completion });
            return Ok(id);
        }
    }

    fn take(&self, id: CorrelationId) -> Option<PendingCall> {
        self.pending.lock().remove(&id)
    }

    fn fire(&self, call: PendingCall, result: Result<Message>) {
        match call.completion {
            Completion::Blocking(tx) => {
                let _ = tx.send(result);
            }
            Completion::Callback(callback) => {
                let job: Job = Box::new(move || callback(result));
                if let Err(SendError(job)) = self.callbacks.send(job) {
                    job();
                }
            }
        }
    }

    /// Send a request and block until its reply, deadline or failure.
    pub fn request(
        &self,
        conn: &ConnectionManager,
        message: Message,
        timeout: Duration,
    ) -> Result<Message> {
        let (tx, rx) = bounded(1);
        let id = self.register(timeout, Completion::Blocking(tx))?;

        let message = message.with_reply_to(self.reply_subject(id));
        debug!(%id, subject = %message.subject, "request");
        if let Err(e) = conn.send(message) {
            self.take(id);
            return Err(e);
        }

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(_) => {
                self.expire(id);
                // Either the timeout just recorded or a reply that won the race.
                rx.recv().unwrap_or(Err(Error::Timeout(timeout)))
            }
        }
    }

    /// Send a request without blocking. `on_complete` runs on the callback
    /// thread. If the request cannot be sent, the error is returned here and
    /// `on_complete` is never called.
    pub fn request_async<F>(
        &self,
        conn: &ConnectionManager,
        message: Message,
        timeout: Duration,
        on_complete: F,
    ) -> Result<CorrelationId>
    where
        F: FnOnce(Result<Message>) + Send + 'static,
    {
        // A deadline past the end of representable time never fires.
        let deadline = Instant::now().checked_add(timeout);
        let id = self.register(timeout, Completion::Callback(Box::new(on_complete)))?;

        let message = message.with_reply_to(self.reply_subject(id));
        debug!(%id, subject = %message.subject, "async request");
        if let Err(e) = conn.send(message) {
            self.take(id);
            return Err(e);
        }

        if let Some(at) = deadline {
            let _ = self.timers.send(TimerCommand::Arm(at, id));
        }
        Ok(id)
    }

    /// Complete a call from an inbound reply. Late replies are dropped.
    pub fn resolve(&self, message: Message) {
        let Some(id) = self.correlation_of(&message.subject) else {
            return;
        };
        match self.take(id) {
            Some(call) => self.fire(call, Ok(message)),
            None => debug!(%id, "discarding reply for settled call"),
        }
    }

    fn expire(&self, id: CorrelationId) {
        if let Some(call) = self.take(id) {
            let timeout = call.timeout;
            debug!(%id, ?timeout, "request timed out");
            self.fire(call, Err(Error::Timeout(timeout)));
        }
    }

    /// Cancel a pending call. Returns false if it had already settled.
    pub fn cancel(&self, id: CorrelationId) -> bool {
        match self.take(id) {
            Some(call) => {
                self.fire(call, Err(Error::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Fail every pending call.
    pub fn fail_all(&self, error: impl Fn() -> Error) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "failing pending calls");
        }
        for (_, call) in drained {
            self.fire(call, Err(error()));
        }
    }

    /// Refuse new calls and stop the deadline thread.
    pub fn shutdown(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.timers.send(TimerCommand::Shutdown);
        }
    }
}

fn deadline_loop(coordinator: Weak<Coordinator>, commands: Receiver<TimerCommand>) {
    let mut deadlines: BinaryHeap<Reverse<(Instant, CorrelationId)>> = BinaryHeap::new();

    loop {
        let now = Instant::now();
        while let Some(Reverse((at, id))) = deadlines.peek().copied() {
            if at > now {
                break;
            }
            deadlines.pop();
            match coordinator.upgrade() {
                Some(c) => c.expire(id),
                None => return,
            }
        }

        let command = match deadlines.peek() {
            Some(Reverse((at, _))) => commands.recv_timeout(at.saturating_duration_since(now)),
            None => commands.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match command {
            Ok(TimerCommand::Arm(at, id)) => deadlines.push(Reverse((at, id))),
            Ok(TimerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}
