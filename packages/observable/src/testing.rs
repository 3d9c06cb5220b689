//! Test helpers for code built on the bus.
//!
//! Enabled for this crate's own tests and, for downstream crates, with the
//! `testing` feature.
//!
//! - [`CallLog`] hands out labelled listeners and records what they saw.
//! - [`EventLatch`] waits for an exact number of invocations, which makes
//!   deferred listeners testable without guessing sleep durations.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::Notify;

use crate::core::{Args, Callback};

// =============================================================================
// Call Log
// =============================================================================

/// Shared record of listener invocations, in call order.
///
/// # Example
///
/// ```ignore
/// let log = CallLog::new();
/// bus.on("e", log.listener("a"), ListenerOptions::new());
/// bus.on("e", log.returning("b", 42), ListenerOptions::new());
///
/// let _ = bus.all("e", vec![json!(1)])?;
/// assert_eq!(log.labels(), vec!["a", "b"]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<(String, Args)>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A listener recording its calls under `label` and returning `null`.
    pub fn listener(&self, label: &str) -> Callback {
        self.returning(label, Value::Null)
    }

    /// A listener recording its calls under `label` and returning `value`.
    pub fn returning(&self, label: &str, value: impl Into<Value>) -> Callback {
        let log = self.clone();
        let label = label.to_string();
        let value = value.into();
        Callback::sync(move |args| {
            log.record(&label, args);
            value.clone()
        })
    }

    /// Record a call manually.
    pub fn record(&self, label: &str, args: Args) {
        self.lock().push((label.to_string(), args));
    }

    /// Labels in call order.
    pub fn labels(&self) -> Vec<String> {
        self.lock().iter().map(|(label, _)| label.clone()).collect()
    }

    /// Every call with its arguments.
    pub fn calls(&self) -> Vec<(String, Args)> {
        self.lock().clone()
    }

    /// How often `label` was called.
    pub fn count(&self, label: &str) -> usize {
        self.lock().iter().filter(|(l, _)| l == label).count()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(String, Args)>> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// =============================================================================
// Event Latch
// =============================================================================

/// Countdown that async tests can wait on.
///
/// Tests should wait for meaning, not time.
///
/// ```ignore
/// let latch = shared_latch(3);
/// bus.on("e", EventLatch::listener(&latch), ListenerOptions::new().deferred());
/// for _ in 0..3 {
///     bus.trigger("e", vec![])?.detach();
/// }
/// timeout(Duration::from_secs(5), latch.await_zero()).await?;
/// ```
#[derive(Debug)]
pub struct EventLatch {
    remaining: AtomicUsize,
    notify: Notify,
}

impl EventLatch {
    /// Create a latch expecting `expected` invocations.
    pub fn new(expected: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(expected),
            notify: Notify::new(),
        }
    }

    /// Count one invocation; waiters wake when the count hits zero.
    ///
    /// # Panics
    ///
    /// Panics if called more often than expected.
    pub fn dec(&self) {
        let prev = self.remaining.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            panic!("EventLatch decremented below zero - more invocations than expected");
        }
        if prev == 1 {
            self.notify.notify_waiters();
        }
    }

    /// Wait for the count to reach zero.
    pub async fn await_zero(&self) {
        loop {
            // Register before checking so a concurrent dec is not missed.
            let notified = self.notify.notified();
            if self.remaining.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    /// A listener counting down `latch` on every call.
    pub fn listener(latch: &SharedEventLatch) -> Callback {
        let latch = Arc::clone(latch);
        Callback::sink(move |_| latch.dec())
    }
}

/// Arc-wrapped latch for sharing across listeners.
pub type SharedEventLatch = Arc<EventLatch>;

/// Shorthand for `Arc::new(EventLatch::new(expected))`.
pub fn shared_latch(expected: usize) -> SharedEventLatch {
    Arc::new(EventLatch::new(expected))
}
