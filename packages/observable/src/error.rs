//! Structured error types for the observable bus.
//!
//! `BusError` provides pattern-matchable errors for everything that can make a
//! trigger fail. User code (listeners, argument transforms, pending replies)
//! reports failures as `anyhow::Error`; the bus wraps them with the event name
//! and hands them back verbatim.
//!
//! # The Error Boundary Rule
//!
//! > **A trigger either returns a value or the first error it met.**
//!
//! - No retries, no partial results: a synchronous listener error aborts the
//!   remaining listeners of that trigger.
//! - Deferred and pending listeners fail later, through the future returned by
//!   the trigger (or not at all if that future is never awaited).
//! - Vetoes and suspended channels are not errors; they produce the Return
//!   Mode's empty value.
//!
//! # Example
//!
//! ```ignore
//! use observable::{BusError, Observable};
//!
//! match bus.all("save", vec![json!(1)]) {
//!     Ok(outcome) => println!("{:?}", outcome.ready()),
//!     Err(BusError::Listener { event, source }) => {
//!         eprintln!("listener for {} failed: {:#}", event, source);
//!     }
//!     Err(other) => eprintln!("{}", other),
//! }
//! ```

use thiserror::Error;

/// Pattern-matchable errors produced by the bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// A listener returned an error (synchronously or from its pending reply).
    #[error("listener for event '{event}' failed: {source}")]
    Listener {
        /// Event whose listener failed.
        event: String,
        /// The listener's own error.
        #[source]
        source: anyhow::Error,
    },

    /// A computed prepend/append/replace transform returned an error.
    #[error("argument transform for event '{event}' failed: {source}")]
    Transform {
        /// Event whose transform failed.
        event: String,
        /// The transform's own error.
        #[source]
        source: anyhow::Error,
    },

    /// A deferred listener panicked inside its spawned task.
    #[error("deferred listener for event '{event}' panicked")]
    ListenerPanicked {
        /// Event whose deferred listener panicked.
        event: String,
    },

    /// A deferred invocation was requested outside of a tokio runtime.
    #[error("deferred listeners require a tokio runtime")]
    NoRuntime,

    /// A pending subscription was dropped before its event fired.
    #[error("subscription to event '{event}' was cancelled before it fired")]
    Cancelled {
        /// Event the subscription was waiting for.
        event: String,
    },
}

impl BusError {
    /// Wrap a listener failure for `event`.
    pub(crate) fn listener(event: &str, source: anyhow::Error) -> Self {
        BusError::Listener {
            event: event.to_string(),
            source,
        }
    }

    /// Wrap a transform failure for `event`.
    pub(crate) fn transform(event: &str, source: anyhow::Error) -> Self {
        BusError::Transform {
            event: event.to_string(),
            source,
        }
    }

    /// Name of the event this error belongs to, if any.
    pub fn event(&self) -> Option<&str> {
        match self {
            BusError::Listener { event, .. }
            | BusError::Transform { event, .. }
            | BusError::ListenerPanicked { event }
            | BusError::Cancelled { event } => Some(event),
            BusError::NoRuntime => None,
        }
    }

    /// Returns true if the failure came from user code (listener or transform).
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            BusError::Listener { .. } | BusError::Transform { .. } | BusError::ListenerPanicked { .. }
        )
    }
}
