//! Per-connection event queue.
//!
//! The socket reader task and the command path communicate only through
//! this queue. Most kinds are FIFO; `BytesRead` is a coalescing
//! single-slot kind; a new occurrence replaces the queued one instead
//! of growing the queue, because the actual payload accumulates in the
//! connection's input buffer and one wakeup is as good as ten.
//!
//! `wait` is the single blocking primitive of the engine: next event,
//! cancel, or timeout.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};

/// Discrete events a connection object can receive.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnEvent {
    /// An outbound buffer was fully written.
    WriteDone,
    /// New bytes were appended to the input buffer (coalescing kind).
    BytesRead,
    /// The socket closed. `graceful` = orderly shutdown, not an error
    /// or reset.
    Closed { graceful: bool },
    IpResolved(IpAddr),
    Connected,
    /// Disk worker or listing fetch finished on our behalf.
    ExternalWorkDone,
    /// Active-mode listener is bound and ready; address to send in PORT.
    ListenReady(SocketAddr),
}

impl ConnEvent {
    fn is_coalescing(&self) -> bool {
        matches!(self, ConnEvent::BytesRead)
    }
}

/// Outcome of a `wait` call.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    Event(ConnEvent),
    Cancelled,
    Timeout,
}

// ─── Cancel flag ─────────────────────────────────────────────────────

/// Cooperative cancellation signal. Cloned freely; `cancel` wakes every
/// pending `wait`.
#[derive(Clone, Default)]
pub struct CancelFlag {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolves once the flag is set. Usable inside `select!`.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

// ─── Event queue ─────────────────────────────────────────────────────

struct QueueInner {
    fifo: VecDeque<ConnEvent>,
    /// Single-slot mailbox for the coalescing kind.
    bytes_read_pending: bool,
    capacity: usize,
    dropped: u64,
}

/// Bounded event queue shared between a reader task and the command path.
#[derive(Clone)]
pub struct EventQueue {
    inner: Arc<Mutex<QueueInner>>,
    notify: Arc<Notify>,
}

pub const EVENT_QUEUE_CAPACITY: usize = 64;

impl EventQueue {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner {
                fifo: VecDeque::new(),
                bytes_read_pending: false,
                capacity,
                dropped: 0,
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Enqueue an event. Coalescing kinds overwrite their slot; a full
    /// FIFO drops the new event (counted, logged).
    pub fn push(&self, event: ConnEvent) {
        {
            let mut q = self.inner.lock().unwrap();
            if event.is_coalescing() {
                q.bytes_read_pending = true;
            } else if q.fifo.len() < q.capacity {
                q.fifo.push_back(event);
            } else {
                q.dropped += 1;
                log::warn!("event queue full, dropping {:?}", event);
            }
        }
        self.notify.notify_waiters();
    }

    /// Non-blocking pop: FIFO events first (arrival order), then the
    /// coalesced mailbox.
    pub fn try_pop(&self) -> Option<ConnEvent> {
        let mut q = self.inner.lock().unwrap();
        if let Some(e) = q.fifo.pop_front() {
            return Some(e);
        }
        if q.bytes_read_pending {
            q.bytes_read_pending = false;
            return Some(ConnEvent::BytesRead);
        }
        None
    }

    /// Discard everything queued.
    pub fn clear(&self) {
        let mut q = self.inner.lock().unwrap();
        q.fifo.clear();
        q.bytes_read_pending = false;
    }

    pub fn dropped_count(&self) -> u64 {
        self.inner.lock().unwrap().dropped
    }

    /// Wait for the next event, cancellation, or timeout, whichever
    /// comes first. `None` timeout waits indefinitely.
    pub async fn wait(&self, cancel: &CancelFlag, timeout: Option<Duration>) -> WaitOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let notified = self.notify.notified();
            if let Some(e) = self.try_pop() {
                return WaitOutcome::Event(e);
            }
            if cancel.is_cancelled() {
                return WaitOutcome::Cancelled;
            }
            match deadline {
                Some(d) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = cancel.cancelled() => return WaitOutcome::Cancelled,
                        _ = tokio::time::sleep_until(d) => return WaitOutcome::Timeout,
                    }
                }
                None => {
                    tokio::select! {
                        _ = notified => {}
                        _ = cancel.cancelled() => return WaitOutcome::Cancelled,
                    }
                }
            }
        }
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_preserved() {
        let q = EventQueue::new();
        q.push(ConnEvent::Connected);
        q.push(ConnEvent::WriteDone);
        assert_eq!(q.try_pop(), Some(ConnEvent::Connected));
        assert_eq!(q.try_pop(), Some(ConnEvent::WriteDone));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn bytes_read_coalesces() {
        let q = EventQueue::new();
        q.push(ConnEvent::BytesRead);
        q.push(ConnEvent::BytesRead);
        q.push(ConnEvent::BytesRead);
        assert_eq!(q.try_pop(), Some(ConnEvent::BytesRead));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn full_queue_drops_new_event() {
        let q = EventQueue::with_capacity(2);
        q.push(ConnEvent::Connected);
        q.push(ConnEvent::WriteDone);
        q.push(ConnEvent::ExternalWorkDone);
        assert_eq!(q.dropped_count(), 1);
        assert_eq!(q.try_pop(), Some(ConnEvent::Connected));
    }

    #[tokio::test]
    async fn wait_returns_event() {
        let q = EventQueue::new();
        let cancel = CancelFlag::new();
        let q2 = q.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            q2.push(ConnEvent::Connected);
        });
        let out = q.wait(&cancel, Some(Duration::from_secs(5))).await;
        assert_eq!(out, WaitOutcome::Event(ConnEvent::Connected));
    }

    #[tokio::test]
    async fn wait_times_out() {
        let q = EventQueue::new();
        let cancel = CancelFlag::new();
        let out = q.wait(&cancel, Some(Duration::from_millis(20))).await;
        assert_eq!(out, WaitOutcome::Timeout);
    }

    #[tokio::test]
    async fn wait_sees_cancel() {
        let q = EventQueue::new();
        let cancel = CancelFlag::new();
        let c2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            c2.cancel();
        });
        let out = q.wait(&cancel, Some(Duration::from_secs(5))).await;
        assert_eq!(out, WaitOutcome::Cancelled);
    }

    #[tokio::test]
    async fn cancel_before_wait() {
        let q = EventQueue::new();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let out = q.wait(&cancel, None).await;
        assert_eq!(out, WaitOutcome::Cancelled);
    }

    #[tokio::test]
    async fn wait_is_pending_until_push() {
        let q = EventQueue::new();
        let cancel = CancelFlag::new();
        let mut waiting = tokio_test::task::spawn(q.wait(&cancel, None));
        tokio_test::assert_pending!(waiting.poll());
        q.push(ConnEvent::WriteDone);
        assert_eq!(
            tokio_test::assert_ready!(waiting.poll()),
            WaitOutcome::Event(ConnEvent::WriteDone)
        );
    }
}
