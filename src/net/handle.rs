use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use super::{Envelope, ProtocolMessage};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Cloneable handle to one connection and its ordered inbound queue.
///
/// Reading is only possible through a [`ConsumerLease`], and at most one
/// lease exists per handle at any time.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<Inner>,
}

struct Inner {
    id: ConnectionId,
    username: Option<String>,
    state: Mutex<QueueState>,
    /// Signalled when a message arrives or the queue closes.
    ready: Condvar,
    /// Signalled when the consumer lease is released.
    lease_free: Condvar,
    keepalives: AtomicU64,
}

#[derive(Default)]
struct QueueState {
    messages: VecDeque<Envelope>,
    closed: bool,
    consumer: bool,
}

impl SessionHandle {
    pub fn new(username: Option<String>) -> Self {
        let id = ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed));
        Self {
            inner: Arc::new(Inner {
                id,
                username,
                state: Mutex::new(QueueState::default()),
                ready: Condvar::new(),
                lease_free: Condvar::new(),
                keepalives: AtomicU64::new(0),
            }),
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Account name the connection was authenticated as.
    pub fn username(&self) -> Option<&str> {
        self.inner.username.as_deref()
    }

    /// Whether both handles refer to the same connection.
    pub fn same_connection(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Queue a message received from the server. Returns `false` once closed.
    pub fn deliver(&self, msg: ProtocolMessage) -> bool {
        self.push(Envelope::Protocol(msg))
    }

    /// Append an envelope behind everything already queued.
    ///
    /// Safe from any thread; never blocks on the consumer. Returns `false`
    /// (and drops the envelope) once the queue is closed.
    pub fn inject(&self, envelope: Envelope) -> bool {
        self.push(envelope)
    }

    fn push(&self, envelope: Envelope) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.messages.push_back(envelope);
        drop(state);
        self.inner.ready.notify_all();
        true
    }

    /// Close locally: pending messages are discarded and any blocked
    /// consumer wakes up with end-of-stream.
    pub fn close(&self) {
        let mut state = self.lock();
        if state.closed && state.messages.is_empty() {
            return;
        }
        state.closed = true;
        let dropped = state.messages.len();
        state.messages.clear();
        drop(state);
        debug!(connection = %self.inner.id, dropped, "Connection closed");
        self.inner.ready.notify_all();
    }

    /// Remote end-of-stream: messages already queued are still delivered.
    pub fn finish(&self) {
        self.lock().closed = true;
        self.inner.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of queued, not yet consumed envelopes.
    pub fn pending(&self) -> usize {
        self.lock().messages.len()
    }

    /// Network keepalive, driven by the headless tick loop.
    pub fn keepalive(&self) {
        self.inner.keepalives.fetch_add(1, Ordering::Relaxed);
    }

    pub fn keepalive_count(&self) -> u64 {
        self.inner.keepalives.load(Ordering::Relaxed)
    }

    pub fn has_consumer(&self) -> bool {
        self.lock().consumer
    }

    /// Become the queue's consumer, waiting until the current one releases.
    pub fn acquire_consumer(&self) -> ConsumerLease {
        let mut state = self.lock();
        while state.consumer {
            state = self
                .inner
                .lease_free
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.consumer = true;
        ConsumerLease {
            handle: self.clone(),
        }
    }

    /// Like [`acquire_consumer`](Self::acquire_consumer) but gives up after `timeout`.
    pub fn acquire_consumer_timeout(&self, timeout: Duration) -> Option<ConsumerLease> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while state.consumer {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            state = self
                .inner
                .lease_free
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        state.consumer = true;
        Some(ConsumerLease {
            handle: self.clone(),
        })
    }

    pub fn try_acquire_consumer(&self) -> Option<ConsumerLease> {
        let mut state = self.lock();
        if state.consumer {
            return None;
        }
        state.consumer = true;
        Some(ConsumerLease {
            handle: self.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.inner.id)
            .field("username", &self.inner.username)
            .finish_non_exhaustive()
    }
}

/// Exclusive right to drain a session's queue. Released on drop.
pub struct ConsumerLease {
    handle: SessionHandle,
}

impl ConsumerLease {
    /// Block until the next envelope arrives. `None` means end-of-stream.
    pub fn next_message(&self) -> Option<Envelope> {
        let inner = &self.handle.inner;
        let mut state = self.handle.lock();
        loop {
            if let Some(envelope) = state.messages.pop_front() {
                return Some(envelope);
            }
            if state.closed {
                return None;
            }
            state = inner
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }
}

impl Drop for ConsumerLease {
    fn drop(&mut self) {
        self.handle.lock().consumer = false;
        self.handle.inner.lease_free.notify_all();
    }
}
