//! # Observable
//!
//! An in-process event bus whose triggers do more than broadcast: they can
//! collect, merge, concatenate or pipe listener results, or stop at the first
//! listener that answers with a sentinel. Listeners may answer right away or
//! with a future, in any mix; the trigger's outcome becomes a future exactly
//! when it has to.
//!
//! ## Core Concepts
//!
//! - [`Observable`] = the bus: a map from event name to channel
//! - [`Callback`] = a listener, `Fn(Args) -> anyhow::Result<Reply>`
//! - [`ReturnMode`] = how the replies of one trigger are combined
//! - [`Outcome`] = the combined result, immediate or pending
//!
//! ## Architecture
//!
//! ```text
//! caller
//!     │
//!     ▼ trigger_with(name, args, mode)
//! Observable ── interceptor veto? ──► mode.empty()
//!     │
//!     ▼
//! EventChannel (suspended? queued? limit?)
//!     │
//!     ▼ snapshot
//! dispatch ─► admit: transforms ─► filters ─► tags ─► start
//!     │
//!     ├─► independent modes: invoke all, fold replies
//!     │
//!     └─► chained modes: invoke in order, stop or thread values
//!     │
//!     ▼
//! Outcome ──────────────► then "*" channel, fire-and-forget
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Ordered** - listeners run in registration order, adjusted by
//!    `first`, `always_first` and `always_last`
//! 2. **Deduplicated** - a `(callback, context)` pair is registered once
//! 3. **Snapshotted** - changes made during a dispatch apply to the next one
//! 4. **Lock-free callbacks** - no bus lock is held while user code runs, so
//!    listeners may subscribe, unsubscribe and trigger freely
//! 5. **Lazy futures** - pending outcomes progress when awaited or detached;
//!    deferred listeners are spawned and always run
//!
//! ## Example
//!
//! ```ignore
//! use observable::{Callback, ListenerOptions, Observable, ReturnMode};
//! use serde_json::json;
//!
//! let bus = Observable::new();
//!
//! bus.on("validate", Callback::sync(|args| args[0].is_string()), ListenerOptions::new());
//! bus.on("validate", Callback::sync(|args| args[0] != json!("")), ListenerOptions::new());
//!
//! // Stop at the first failing validator.
//! let verdict = bus.until_false("validate", vec![json!("")])?.ready();
//! assert_eq!(verdict, Some(json!(false)));
//!
//! // Await a mix of sync and async listeners.
//! bus.on("load", Callback::future(|_| async { Ok(json!({"a": 1})) }), ListenerOptions::new());
//! bus.on("load", Callback::sync(|_| json!({"b": 2})), ListenerOptions::new());
//! let merged = bus.resolve("load", vec![], ReturnMode::Merge).await?;
//! assert_eq!(merged, json!({"a": 1, "b": 2}));
//! ```

// Core modules
mod bus;
mod channel;
mod core;
mod dispatch;
mod error;
mod listener;
mod registry;
mod transform;

// Wiring between buses and external emitters
mod relay;

// Subscription-only handle
mod api;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export core types
pub use crate::core::{
    Args, BusId, Callback, ListenerId, Outcome, PendingValue, Reply, ReturnMode, ALL_EVENTS,
};

// Re-export error types
pub use crate::error::BusError;

// Re-export option and listener types
pub use channel::EventOptions;
pub use listener::{
    EventFilter, ListenerFilter, ListenerInfo, ListenerOptions, ListenerRecord, Priority, Tags,
    DEFAULT_DEFER_DELAY,
};
pub use transform::{ArgTransform, ArgTransforms};

// Re-export bus types (primary entry point)
pub use bus::{Interceptor, Observable, ObservableBuilder, TagScope};

// Re-export relay types
pub use relay::{EventSource, RelayOptions};

// Re-export public api
pub use api::PublicApi;
