//! Listener options and registered listener records.
//!
//! [`ListenerOptions`] is the typed configuration accepted by `on`/`once`.
//! Every field has a default; builders set them one at a time. The registry
//! turns options into a [`ListenerRecord`], which additionally carries the
//! live counters the dispatcher updates on every trigger.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use smallvec::SmallVec;

use crate::core::{Callback, ListenerId};
use crate::transform::{ArgTransform, ArgTransforms};

/// Delay used when a listener is deferred without an explicit duration.
pub const DEFAULT_DEFER_DELAY: Duration = Duration::from_millis(1);

/// Per-listener filter: `(filter_context, args) -> keep`.
pub type ListenerFilter = Arc<dyn Fn(Option<&Value>, &[Value]) -> bool + Send + Sync>;

/// Channel-wide filter: `(filter_context, args, listener) -> keep`.
pub type EventFilter = Arc<dyn Fn(Option<&Value>, &[Value], &ListenerRecord) -> bool + Send + Sync>;

/// Tag set of a listener. Most listeners carry zero to two tags.
pub type Tags = SmallVec<[String; 2]>;

/// Position tier of a listener within its channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Runs before every non-`AlwaysFirst` listener.
    AlwaysFirst,
    /// Insertion order.
    #[default]
    Normal,
    /// Runs after every non-`AlwaysLast` listener.
    AlwaysLast,
}

// =============================================================================
// Listener Options
// =============================================================================

/// Configuration for one listener registration.
///
/// # Example
///
/// ```ignore
/// use observable::ListenerOptions;
/// use serde_json::json;
///
/// let opts = ListenerOptions::new()
///     .with_limit(2)
///     .with_start(3)
///     .with_tag("audit")
///     .with_prepend(vec![json!("prefix")])
///     .first();
/// ```
#[derive(Clone, Default)]
pub struct ListenerOptions {
    /// Identity the callback is bound to; part of the dedup key.
    pub context: Option<Value>,
    /// Defer the invocation by this long. `None` uses the channel default.
    pub delay: Option<Duration>,
    /// Maximum successful invocations, 0 = unlimited.
    pub limit: u32,
    /// 1-based attempt index from which the listener is invoked.
    pub start: u32,
    /// Insert at the front instead of the back.
    pub first: bool,
    /// Ordering tier.
    pub priority: Priority,
    /// Listener-level argument transforms.
    pub transforms: ArgTransforms,
    /// Listener-level filter.
    pub filter: Option<ListenerFilter>,
    /// Context handed to the filter.
    pub filter_context: Option<Value>,
    /// Labels for scoped triggering and bulk removal.
    pub tags: Tags,
    /// Free-form data visible to channel filters and transforms.
    pub extra_data: Option<Value>,
}

impl ListenerOptions {
    /// Options with every default.
    pub fn new() -> Self {
        Self {
            start: 1,
            ..Default::default()
        }
    }

    /// Bind the listener to a context value.
    pub fn with_context(mut self, context: impl Into<Value>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Defer invocation by the default delay.
    pub fn deferred(self) -> Self {
        self.with_delay(DEFAULT_DEFER_DELAY)
    }

    /// Defer invocation by `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Stop after `limit` successful invocations.
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    /// Run at most once.
    pub fn once(self) -> Self {
        self.with_limit(1)
    }

    /// Skip attempts before the `start`-th one.
    pub fn with_start(mut self, start: u32) -> Self {
        self.start = start;
        self
    }

    /// Insert at the front of the channel.
    pub fn first(mut self) -> Self {
        self.first = true;
        self
    }

    /// Always run before other listeners.
    pub fn always_first(mut self) -> Self {
        self.priority = Priority::AlwaysFirst;
        self
    }

    /// Always run after other listeners.
    pub fn always_last(mut self) -> Self {
        self.priority = Priority::AlwaysLast;
        self
    }

    /// Values to place before the trigger arguments.
    pub fn with_prepend(mut self, transform: impl Into<ArgTransform>) -> Self {
        self.transforms.prepend = Some(transform.into());
        self
    }

    /// Values to place after the trigger arguments.
    pub fn with_append(mut self, transform: impl Into<ArgTransform>) -> Self {
        self.transforms.append = Some(transform.into());
        self
    }

    /// Values replacing the trigger arguments.
    pub fn with_replace(mut self, transform: impl Into<ArgTransform>) -> Self {
        self.transforms.replace = Some(transform.into());
        self
    }

    /// Only invoke when `filter` returns true.
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(Option<&Value>, &[Value]) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Context passed to the filter.
    pub fn with_filter_context(mut self, context: impl Into<Value>) -> Self {
        self.filter_context = Some(context.into());
        self
    }

    /// Add one tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
        self
    }

    /// Add several tags.
    pub fn with_tags<I, S>(self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        tags.into_iter().fold(self, |opts, tag| opts.with_tag(tag))
    }

    /// Attach free-form data.
    pub fn with_extra_data(mut self, data: impl Into<Value>) -> Self {
        self.extra_data = Some(data.into());
        self
    }
}

impl fmt::Debug for ListenerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerOptions")
            .field("context", &self.context)
            .field("delay", &self.delay)
            .field("limit", &self.limit)
            .field("start", &self.start)
            .field("first", &self.first)
            .field("priority", &self.priority)
            .field("transforms", &self.transforms)
            .field("has_filter", &self.filter.is_some())
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Listener Record
// =============================================================================

/// A registered listener together with its counters.
///
/// Records are shared (`Arc`) between the registry and in-flight dispatches,
/// so counters are atomics.
pub struct ListenerRecord {
    id: ListenerId,
    callback: Callback,
    context: Option<Value>,
    delay: Option<Duration>,
    limit: u32,
    start: u32,
    count: AtomicU32,
    called: AtomicU32,
    transforms: ArgTransforms,
    filter: Option<ListenerFilter>,
    filter_context: Option<Value>,
    tags: Tags,
    priority: Priority,
    index: u64,
    extra_data: Option<Value>,
}

impl ListenerRecord {
    pub(crate) fn new(callback: Callback, options: ListenerOptions, index: u64) -> Self {
        Self {
            id: ListenerId::next(),
            callback,
            context: options.context,
            delay: options.delay,
            limit: options.limit,
            start: options.start,
            count: AtomicU32::new(0),
            called: AtomicU32::new(0),
            transforms: options.transforms,
            filter: options.filter,
            filter_context: options.filter_context,
            tags: options.tags,
            priority: options.priority,
            index,
            extra_data: options.extra_data,
        }
    }

    /// Registration handle.
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// The listener function.
    pub fn callback(&self) -> &Callback {
        &self.callback
    }

    /// Context the callback is bound to.
    pub fn context(&self) -> Option<&Value> {
        self.context.as_ref()
    }

    /// Own deferral delay, if any.
    pub fn delay(&self) -> Option<Duration> {
        self.delay
    }

    /// Maximum successful invocations, 0 = unlimited.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// 1-based attempt index from which the listener is invoked.
    pub fn start(&self) -> u32 {
        self.start
    }

    /// Attempts made so far (including attempts skipped by `start`).
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Successful invocations so far.
    pub fn called(&self) -> u32 {
        self.called.load(Ordering::Acquire)
    }

    /// Tags attached to the listener.
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Ordering tier.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Insertion sequence number within the channel.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Free-form data attached at registration.
    pub fn extra_data(&self) -> Option<&Value> {
        self.extra_data.as_ref()
    }

    pub(crate) fn transforms(&self) -> &ArgTransforms {
        &self.transforms
    }

    pub(crate) fn filter(&self) -> Option<&ListenerFilter> {
        self.filter.as_ref()
    }

    /// Filter context: own, else channel's, else the invocation context.
    pub(crate) fn filter_context<'a>(&'a self, channel: Option<&'a Value>) -> Option<&'a Value> {
        self.filter_context
            .as_ref()
            .or(channel)
            .or(self.context.as_ref())
    }

    /// Same callback bound to the same context.
    pub(crate) fn matches(&self, callback: &Callback, context: Option<&Value>) -> bool {
        self.callback.ptr_eq(callback) && self.context.as_ref() == context
    }

    pub(crate) fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Eligibility under a trigger's tag scope.
    ///
    /// Untagged listeners never match a tagged trigger.
    pub(crate) fn matches_scope(&self, scope: &[String]) -> bool {
        self.tags.iter().any(|t| scope.contains(t))
    }

    /// Record an attempt; returns the new attempt count.
    pub(crate) fn record_attempt(&self) -> u32 {
        let prev = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_add(1))
            })
            .unwrap_or_else(|count| count);
        prev.saturating_add(1)
    }

    /// Reserve one invocation against the limit before running the callback.
    ///
    /// Returns `None` when the limit is used up, otherwise whether this
    /// reservation takes the last allowed call.
    pub(crate) fn reserve_call(&self) -> Option<bool> {
        let prev = self
            .called
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |called| {
                if self.limit > 0 && called >= self.limit {
                    None
                } else {
                    Some(called.saturating_add(1))
                }
            })
            .ok()?;
        Some(self.limit > 0 && prev + 1 == self.limit)
    }

    /// Give back a reservation whose invocation failed.
    pub(crate) fn release_call(&self) {
        let _ = self
            .called
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |called| {
                Some(called.saturating_sub(1))
            });
    }

    /// Serializable snapshot for introspection.
    pub fn info(&self) -> ListenerInfo {
        ListenerInfo {
            id: self.id,
            context: self.context.clone(),
            tags: self.tags.to_vec(),
            priority: self.priority,
            delay_ms: self.delay.map(|d| d.as_millis() as u64),
            limit: self.limit,
            start: self.start,
            count: self.count(),
            called: self.called(),
            extra_data: self.extra_data.clone(),
        }
    }
}

impl fmt::Debug for ListenerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRecord")
            .field("id", &self.id)
            .field("context", &self.context)
            .field("priority", &self.priority)
            .field("index", &self.index)
            .field("count", &self.count())
            .field("called", &self.called())
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of a listener, for debugging and introspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListenerInfo {
    /// Registration handle.
    pub id: ListenerId,
    /// Invocation context.
    pub context: Option<Value>,
    /// Tags.
    pub tags: Vec<String>,
    /// Ordering tier.
    pub priority: Priority,
    /// Own deferral in milliseconds.
    pub delay_ms: Option<u64>,
    /// Invocation limit, 0 = unlimited.
    pub limit: u32,
    /// First attempt index that invokes.
    pub start: u32,
    /// Attempts so far.
    pub count: u32,
    /// Successful invocations so far.
    pub called: u32,
    /// Free-form data.
    pub extra_data: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let opts = ListenerOptions::new();
        assert_eq!(opts.start, 1);
        assert_eq!(opts.limit, 0);
        assert!(opts.delay.is_none());
        assert_eq!(opts.priority, Priority::Normal);
        assert!(!opts.first);
    }

    #[test]
    fn test_deferred_normalizes_to_one_millisecond() {
        let opts = ListenerOptions::new().deferred();
        assert_eq!(opts.delay, Some(Duration::from_millis(1)));
    }

    #[test]
    fn test_once_sets_limit() {
        assert_eq!(ListenerOptions::new().once().limit, 1);
    }

    #[test]
    fn test_tags_are_deduplicated() {
        let opts = ListenerOptions::new().with_tags(["a", "b", "a"]);
        assert_eq!(opts.tags.as_slice(), &["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_reserve_call_stops_at_limit() {
        let record = ListenerRecord::new(
            Callback::sink(|_| {}),
            ListenerOptions::new().with_limit(2),
            0,
        );
        assert_eq!(record.reserve_call(), Some(false));
        assert_eq!(record.reserve_call(), Some(true));
        assert_eq!(record.reserve_call(), None);
        assert_eq!(record.called(), 2);
    }

    #[test]
    fn test_released_reservation_can_be_taken_again() {
        let record = ListenerRecord::new(Callback::sink(|_| {}), ListenerOptions::new().once(), 0);
        assert_eq!(record.reserve_call(), Some(true));
        record.release_call();
        assert_eq!(record.called(), 0);
        assert_eq!(record.reserve_call(), Some(true));
        assert_eq!(record.reserve_call(), None);
    }

    #[test]
    fn test_unlimited_never_reaches_limit() {
        let record = ListenerRecord::new(Callback::sink(|_| {}), ListenerOptions::new(), 0);
        for _ in 0..5 {
            assert_eq!(record.reserve_call(), Some(false));
        }
        assert_eq!(record.called(), 5);
    }

    #[test]
    fn test_counters_saturate() {
        let record = ListenerRecord::new(Callback::sink(|_| {}), ListenerOptions::new(), 0);
        record.count.store(u32::MAX, Ordering::Release);
        record.called.store(u32::MAX, Ordering::Release);
        assert_eq!(record.record_attempt(), u32::MAX);
        assert_eq!(record.reserve_call(), Some(false));
        assert_eq!(record.called(), u32::MAX);
    }

    #[test]
    fn test_matches_requires_same_callback_and_context() {
        let cb = Callback::sink(|_| {});
        let record = ListenerRecord::new(
            cb.clone(),
            ListenerOptions::new().with_context(json!({"id": 1})),
            0,
        );
        assert!(record.matches(&cb, Some(&json!({"id": 1}))));
        assert!(!record.matches(&cb, None));
        assert!(!record.matches(&cb, Some(&json!({"id": 2}))));
        assert!(!record.matches(&Callback::sink(|_| {}), Some(&json!({"id": 1}))));
    }

    #[test]
    fn test_scope_matching() {
        let tagged = ListenerRecord::new(
            Callback::sink(|_| {}),
            ListenerOptions::new().with_tags(["a", "b"]),
            0,
        );
        let untagged = ListenerRecord::new(Callback::sink(|_| {}), ListenerOptions::new(), 1);
        assert!(tagged.matches_scope(&["a".into()]));
        assert!(!tagged.matches_scope(&["c".into()]));
        assert!(!untagged.matches_scope(&["a".into()]));
    }

    #[test]
    fn test_filter_context_fallback_order() {
        let own = ListenerRecord::new(
            Callback::sink(|_| {}),
            ListenerOptions::new()
                .with_context("ctx")
                .with_filter_context("fctx"),
            0,
        );
        assert_eq!(own.filter_context(Some(&json!("chan"))), Some(&json!("fctx")));

        let fallback = ListenerRecord::new(
            Callback::sink(|_| {}),
            ListenerOptions::new().with_context("ctx"),
            0,
        );
        assert_eq!(fallback.filter_context(Some(&json!("chan"))), Some(&json!("chan")));
        assert_eq!(fallback.filter_context(None), Some(&json!("ctx")));
    }

    #[test]
    fn test_info_is_serializable() {
        let record = ListenerRecord::new(
            Callback::sink(|_| {}),
            ListenerOptions::new().with_tag("x").with_delay(Duration::from_millis(5)),
            0,
        );
        record.record_attempt();
        let info = serde_json::to_value(record.info()).unwrap();
        assert_eq!(info["tags"], json!(["x"]));
        assert_eq!(info["delay_ms"], json!(5));
        assert_eq!(info["count"], json!(1));
        assert_eq!(info["priority"], json!("normal"));
    }
}
