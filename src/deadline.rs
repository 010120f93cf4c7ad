//! Cancellable, rearmable deadline primitive.
//!
//! A [`Deadline`] owns a latch that trips when the armed instant passes.
//! Readers use the latch as one arm of a select alongside their data source;
//! a tripped latch means the deadline was exceeded. Re-arming after a trip
//! reopens the latch.

use std::future::poll_fn;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use tokio::time::Instant;

/// One-shot open → closed signal with waker registration.
///
/// Usable both from poll contexts and as an async wait.
#[derive(Default)]
pub struct Latch {
    inner: Mutex<LatchState>,
}

#[derive(Default)]
struct LatchState {
    closed: bool,
    wakers: Vec<Waker>,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trips the latch. Returns false if it was already closed.
    pub fn close(&self) -> bool {
        let mut st = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if st.closed {
            return false;
        }
        st.closed = true;
        for w in st.wakers.drain(..) {
            w.wake();
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).closed
    }

    /// Poll-style wait; registers the caller's waker while open.
    pub fn poll_closed(&self, cx: &mut Context<'_>) -> Poll<()> {
        let mut st = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if st.closed {
            return Poll::Ready(());
        }
        if !st.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            st.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }

    /// Resolves when the latch trips.
    pub async fn closed(&self) {
        poll_fn(|cx| self.poll_closed(cx)).await
    }
}

/// A deadline that can be armed, disarmed, and re-armed.
///
/// - `set(None)` disarms; an already tripped latch is reopened.
/// - `set(Some(past))` trips immediately.
/// - `set(Some(future))` arms a timer that trips the latch on expiry.
///
/// Each arm allocates a fresh generation so a timer left over from a
/// previous arm can never trip a re-armed latch.
pub struct Deadline {
    inner: Arc<Mutex<DeadlineState>>,
}

struct DeadlineState {
    gen: u64,
    latch: Arc<Latch>,
}

impl Default for Deadline {
    fn default() -> Self {
        Self::new()
    }
}

impl Deadline {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(DeadlineState {
                gen: 0,
                latch: Arc::new(Latch::new()),
            })),
        }
    }

    /// Arms, re-arms, or disarms the deadline.
    pub fn set(&self, at: Option<Instant>) {
        let mut st = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        st.gen += 1;

        let Some(at) = at else {
            // Disarm. Reopen if a previous arm already tripped.
            if st.latch.is_closed() {
                st.latch = Arc::new(Latch::new());
            }
            return;
        };

        if at <= Instant::now() {
            st.latch.close();
            return;
        }

        if st.latch.is_closed() {
            st.latch = Arc::new(Latch::new());
        }
        let gen = st.gen;
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            let st = inner.lock().unwrap_or_else(|e| e.into_inner());
            if st.gen == gen {
                st.latch.close();
            }
        });
    }

    /// Convenience: arm `timeout` from now, or disarm when `None`.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.set(timeout.map(|d| Instant::now() + d));
    }

    /// The current latch. Trips once when the deadline passes; a later
    /// `set` may replace it, so callers grab it fresh per wait.
    pub fn latch(&self) -> Arc<Latch> {
        let st = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&st.latch)
    }

    /// Whether the current deadline has already passed.
    pub fn is_expired(&self) -> bool {
        self.latch().is_closed()
    }

    /// Poll-style expiry check that registers the caller's waker.
    pub fn poll_expired(&self, cx: &mut Context<'_>) -> Poll<()> {
        self.latch().poll_closed(cx)
    }
}
