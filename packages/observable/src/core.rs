//! Core value types for the observable bus.
//!
//! # Overview
//!
//! Everything that flows through the bus is a [`serde_json::Value`]:
//! - [`Args`] = the argument list handed to a trigger and to each listener
//! - [`Reply`] = what one listener produced (immediate or pending)
//! - [`Outcome`] = what a trigger produced after folding replies per [`ReturnMode`]
//!
//! `Value::Null` stands for "nothing": a listener that returns nothing, a mode
//! with no result, an empty chain.
//!
//! # Immediate vs pending
//!
//! A listener may answer right away or hand back a future. The distinction is
//! explicit in [`Reply`], so the dispatcher folds a known sum type instead of
//! probing values at runtime. As soon as one reply is pending, every mode that
//! needs settled values turns its [`Outcome`] into a future as well.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::error::BusError;

/// Reserved event name whose channel receives every trigger on the bus.
///
/// Listeners on this channel get the concrete event name as their first
/// argument, followed by the trigger's own arguments.
pub const ALL_EVENTS: &str = "*";

/// Argument list passed to triggers and listeners.
pub type Args = Vec<Value>;

/// Future resolving to a settled listener value.
pub type PendingValue = BoxFuture<'static, Result<Value, BusError>>;

// =============================================================================
// Identifiers
// =============================================================================

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque handle for a registered listener.
///
/// Returned by `on`/`once`. Use it with `un_id` instead of re-supplying the
/// original callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw numeric value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

/// Identity of one bus instance.
///
/// Relays register their listeners on the source bus with this id as the
/// invocation context, so two target buses relaying the same event never
/// collide in the source's dedup check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BusId(Uuid);

impl BusId {
    /// Create a new random bus id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID value.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// The id as a context value.
    pub(crate) fn to_value(self) -> Value {
        Value::String(self.0.to_string())
    }
}

impl Default for BusId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Return Mode
// =============================================================================

/// How the results of the listeners of one trigger are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReturnMode {
    /// Every listener's reply, untouched (pending replies stay pending).
    Raw,
    /// Every listener's value, in order.
    All,
    /// Every listener's array value, flattened one level.
    Concat,
    /// Every listener's object value, merged key by key (later wins).
    Merge,
    /// The last listener's value.
    Last,
    /// Each listener receives the previous listener's value as its first argument.
    Pipe,
    /// The first invoked listener's value; no other listener runs.
    First,
    /// Stop at the first listener returning `true`.
    UntilTrue,
    /// Stop at the first listener returning `false`.
    UntilFalse,
    /// Stop at the first listener returning something other than `null`.
    FirstNonEmpty,
    /// Run every listener, return nothing.
    #[serde(rename = "trigger")]
    FireAndForget,
}

impl ReturnMode {
    /// Returns true for modes where each listener depends on the previous result.
    pub fn is_chained(&self) -> bool {
        matches!(
            self,
            ReturnMode::Pipe
                | ReturnMode::UntilTrue
                | ReturnMode::UntilFalse
                | ReturnMode::FirstNonEmpty
        )
    }

    /// The neutral result for this mode (suspended channel, vetoed trigger).
    pub fn empty(&self) -> Outcome {
        match self {
            ReturnMode::Raw => Outcome::Raw(Vec::new()),
            ReturnMode::All | ReturnMode::Concat => Outcome::Ready(Value::Array(Vec::new())),
            ReturnMode::Merge => Outcome::Ready(Value::Object(Default::default())),
            _ => Outcome::Ready(Value::Null),
        }
    }

    /// The sentinel a short-circuiting mode stops at.
    pub(crate) fn sentinel(&self) -> Option<bool> {
        match self {
            ReturnMode::UntilTrue => Some(true),
            ReturnMode::UntilFalse => Some(false),
            _ => None,
        }
    }

    /// Returns true if `value` ends a chain in this mode.
    pub(crate) fn stops_at(&self, value: &Value) -> bool {
        match self {
            ReturnMode::UntilTrue | ReturnMode::UntilFalse => {
                self.sentinel().map(Value::Bool).as_ref() == Some(value)
            }
            ReturnMode::FirstNonEmpty => !value.is_null(),
            _ => false,
        }
    }
}

impl fmt::Display for ReturnMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReturnMode::Raw => "raw",
            ReturnMode::All => "all",
            ReturnMode::Concat => "concat",
            ReturnMode::Merge => "merge",
            ReturnMode::Last => "last",
            ReturnMode::Pipe => "pipe",
            ReturnMode::First => "first",
            ReturnMode::UntilTrue => "untilTrue",
            ReturnMode::UntilFalse => "untilFalse",
            ReturnMode::FirstNonEmpty => "firstNonEmpty",
            ReturnMode::FireAndForget => "trigger",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Reply
// =============================================================================

/// What a single listener invocation produced.
pub enum Reply {
    /// A value available right away.
    Ready(Value),
    /// A value that settles later.
    Pending(PendingValue),
}

impl Reply {
    /// Wrap an immediate value.
    pub fn ready(value: impl Into<Value>) -> Self {
        Reply::Ready(value.into())
    }

    /// Wrap a future produced by user code.
    pub fn pending<F>(fut: F) -> Self
    where
        F: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Reply::Pending(
            fut.map(|res| res.map_err(|e| BusError::listener("<pending>", e)))
                .boxed(),
        )
    }

    /// Returns true if the value has not settled yet.
    pub fn is_pending(&self) -> bool {
        matches!(self, Reply::Pending(_))
    }

    /// Settle the reply.
    pub async fn settle(self) -> Result<Value, BusError> {
        match self {
            Reply::Ready(value) => Ok(value),
            Reply::Pending(fut) => fut.await,
        }
    }

    /// Turn the reply into a boxed future.
    pub(crate) fn into_future(self) -> PendingValue {
        match self {
            Reply::Ready(value) => future::ready(Ok(value)).boxed(),
            Reply::Pending(fut) => fut,
        }
    }

    /// Tag listener failures with the event they belong to.
    pub(crate) fn for_event(self, event: &str) -> Self {
        match self {
            Reply::Ready(value) => Reply::Ready(value),
            Reply::Pending(fut) => {
                let event = event.to_string();
                Reply::Pending(fut.map(move |res| res.map_err(|e| retag(e, &event))).boxed())
            }
        }
    }
}

fn retag(err: BusError, event: &str) -> BusError {
    match err {
        BusError::Listener { source, .. } => BusError::listener(event, source),
        other => other,
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Reply::Ready(value)
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
            Reply::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}

// =============================================================================
// Outcome
// =============================================================================

/// Result of a trigger call, folded according to its [`ReturnMode`].
///
/// Pending outcomes are futures: the work behind them (other than deferred
/// listeners, which are spawned) only runs when the outcome is awaited via
/// [`Outcome::resolve`] or handed off with [`Outcome::detach`].
#[must_use = "pending listener work only runs when the outcome is resolved or detached"]
pub enum Outcome {
    /// Every listener settled synchronously.
    Ready(Value),
    /// At least one listener is pending; the folded value settles later.
    Pending(PendingValue),
    /// RAW mode: each listener's reply, untouched.
    Raw(Vec<Reply>),
}

impl Outcome {
    /// Returns true if the outcome is not available yet.
    pub fn is_pending(&self) -> bool {
        match self {
            Outcome::Ready(_) => false,
            Outcome::Pending(_) => true,
            Outcome::Raw(replies) => replies.iter().any(Reply::is_pending),
        }
    }

    /// The value if it is available right away.
    ///
    /// RAW outcomes are available only when none of their replies is pending.
    pub fn ready(self) -> Option<Value> {
        match self {
            Outcome::Ready(value) => Some(value),
            Outcome::Pending(_) => None,
            Outcome::Raw(replies) => replies
                .into_iter()
                .map(|reply| match reply {
                    Reply::Ready(value) => Some(value),
                    Reply::Pending(_) => None,
                })
                .collect::<Option<Vec<_>>>()
                .map(Value::Array),
        }
    }

    /// Lift the outcome into a future, whatever its shape.
    ///
    /// RAW outcomes resolve to the array of their settled replies.
    pub fn resolve(self) -> PendingValue {
        match self {
            Outcome::Ready(value) => future::ready(Ok(value)).boxed(),
            Outcome::Pending(fut) => fut,
            Outcome::Raw(replies) => {
                future::try_join_all(replies.into_iter().map(Reply::into_future))
                    .map(|res| res.map(Value::Array))
                    .boxed()
            }
        }
    }

    /// Convert into a single listener reply (used when one bus feeds another).
    pub(crate) fn into_reply(self) -> Reply {
        match self {
            Outcome::Ready(value) => Reply::Ready(value),
            pending => Reply::Pending(pending.resolve()),
        }
    }

    /// Let pending work run without anyone awaiting it.
    ///
    /// Pending outcomes are spawned on the current tokio runtime and their
    /// errors are logged. Outside a runtime the work is dropped.
    pub fn detach(self) {
        if !self.is_pending() {
            return;
        }
        let fut = self.resolve();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = fut.await {
                        warn!(error = %e, "detached listener work failed");
                    }
                });
            }
            Err(_) => {
                warn!("pending listener work dropped: no tokio runtime");
            }
        }
    }
}

impl From<Value> for Outcome {
    fn from(value: Value) -> Self {
        Outcome::Ready(value)
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
            Outcome::Pending(_) => f.write_str("Pending(..)"),
            Outcome::Raw(replies) => f.debug_tuple("Raw").field(replies).finish(),
        }
    }
}

// =============================================================================
// Callback
// =============================================================================

type CallbackFn = dyn Fn(Args) -> anyhow::Result<Reply> + Send + Sync;

/// A listener function.
///
/// Callbacks are reference-counted; clones share identity, and identity is what
/// the registry uses to detect duplicate registrations and to find a listener
/// again in `un`.
///
/// # Example
///
/// ```ignore
/// use observable::{Callback, Reply};
/// use serde_json::json;
///
/// let double = Callback::sync(|args| args[0].as_i64().unwrap_or(0) * 2);
/// let save = Callback::future(|args| async move {
///     store.save(&args).await?;
///     Ok(json!(true))
/// });
/// let checked = Callback::new(|args| {
///     if args.is_empty() {
///         anyhow::bail!("missing payload");
///     }
///     Ok(Reply::ready(args.len()))
/// });
/// ```
#[derive(Clone)]
pub struct Callback {
    inner: Arc<CallbackFn>,
}

impl Callback {
    /// Create a callback with full control over its reply.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Args) -> anyhow::Result<Reply> + Send + Sync + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    /// Create an infallible callback returning an immediate value.
    pub fn sync<F, R>(f: F) -> Self
    where
        F: Fn(Args) -> R + Send + Sync + 'static,
        R: Into<Value>,
    {
        Self::new(move |args| Ok(Reply::Ready(f(args).into())))
    }

    /// Create a callback that only performs side effects.
    pub fn sink<F>(f: F) -> Self
    where
        F: Fn(Args) + Send + Sync + 'static,
    {
        Self::new(move |args| {
            f(args);
            Ok(Reply::Ready(Value::Null))
        })
    }

    /// Create a callback answering with a future.
    pub fn future<F, Fut>(f: F) -> Self
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::new(move |args| Ok(Reply::pending(f(args))))
    }

    /// Returns true if both callbacks are the same function.
    pub fn ptr_eq(&self, other: &Callback) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Invoke the callback.
    pub fn call(&self, args: Args) -> anyhow::Result<Reply> {
        (self.inner)(args)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("ptr", &Arc::as_ptr(&self.inner).cast::<()>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_listener_ids_are_unique() {
        let a = ListenerId::next();
        let b = ListenerId::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_chained_modes() {
        assert!(ReturnMode::Pipe.is_chained());
        assert!(ReturnMode::UntilTrue.is_chained());
        assert!(ReturnMode::UntilFalse.is_chained());
        assert!(ReturnMode::FirstNonEmpty.is_chained());
        assert!(!ReturnMode::All.is_chained());
        assert!(!ReturnMode::First.is_chained());
        assert!(!ReturnMode::FireAndForget.is_chained());
    }

    #[test]
    fn test_empty_values_per_mode() {
        assert_eq!(ReturnMode::All.empty().ready(), Some(json!([])));
        assert_eq!(ReturnMode::Concat.empty().ready(), Some(json!([])));
        assert_eq!(ReturnMode::Merge.empty().ready(), Some(json!({})));
        assert_eq!(ReturnMode::Raw.empty().ready(), Some(json!([])));
        assert_eq!(ReturnMode::Pipe.empty().ready(), Some(Value::Null));
        assert_eq!(ReturnMode::Last.empty().ready(), Some(Value::Null));
    }

    #[test]
    fn test_stops_at() {
        assert!(ReturnMode::UntilTrue.stops_at(&json!(true)));
        assert!(!ReturnMode::UntilTrue.stops_at(&json!(1)));
        assert!(ReturnMode::UntilFalse.stops_at(&json!(false)));
        assert!(!ReturnMode::UntilFalse.stops_at(&Value::Null));
        assert!(ReturnMode::FirstNonEmpty.stops_at(&json!(0)));
        assert!(!ReturnMode::FirstNonEmpty.stops_at(&Value::Null));
        assert!(!ReturnMode::Pipe.stops_at(&json!(true)));
    }

    #[test]
    fn test_mode_serde_names() {
        assert_eq!(
            serde_json::to_value(ReturnMode::FirstNonEmpty).unwrap(),
            json!("firstNonEmpty")
        );
        assert_eq!(
            serde_json::to_value(ReturnMode::FireAndForget).unwrap(),
            json!("trigger")
        );
        let mode: ReturnMode = serde_json::from_value(json!("untilFalse")).unwrap();
        assert_eq!(mode, ReturnMode::UntilFalse);
        assert_eq!(ReturnMode::UntilTrue.to_string(), "untilTrue");
    }

    #[test]
    fn test_callback_identity() {
        let a = Callback::sync(|_| 1);
        let b = a.clone();
        let c = Callback::sync(|_| 1);
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
    }

    #[test]
    fn test_sink_returns_null() {
        let cb = Callback::sink(|_| {});
        match cb.call(vec![]).unwrap() {
            Reply::Ready(v) => assert!(v.is_null()),
            Reply::Pending(_) => panic!("sink should be immediate"),
        }
    }

    #[tokio::test]
    async fn test_future_callback_settles() {
        let cb = Callback::future(|args| async move { Ok(json!(args.len())) });
        let reply = cb.call(vec![json!(1), json!(2)]).unwrap();
        assert!(reply.is_pending());
        assert_eq!(reply.settle().await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_raw_outcome_resolves_to_array() {
        let outcome = Outcome::Raw(vec![
            Reply::ready(1),
            Reply::pending(async { Ok(json!(2)) }),
        ]);
        assert!(outcome.is_pending());
        assert_eq!(outcome.resolve().await.unwrap(), json!([1, 2]));
    }

    #[test]
    fn test_raw_outcome_ready_when_all_immediate() {
        let outcome = Outcome::Raw(vec![Reply::ready(1), Reply::ready("a")]);
        assert!(!outcome.is_pending());
        assert_eq!(outcome.ready(), Some(json!([1, "a"])));
    }

    #[tokio::test]
    async fn test_pending_reply_error_is_tagged_with_event() {
        let reply = Reply::pending(async { Err(anyhow::anyhow!("boom")) }).for_event("save");
        let err = reply.settle().await.unwrap_err();
        assert_eq!(err.event(), Some("save"));
    }
}
