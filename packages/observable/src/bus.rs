//! The bus facade.
//!
//! [`Observable`] owns the name → channel map and routes every operation to
//! the right channel. It adds three bus-wide concerns on top of the channels:
//!
//! - **Interceptor**: one global predicate consulted before every trigger.
//!   Returning `false` vetoes the trigger; nothing is dispatched, not even
//!   the catch-all channel, and the call yields the mode's empty value.
//! - **Catch-all channel** ([`ALL_EVENTS`]): after a named trigger, listeners
//!   on `"*"` run in fire-and-forget mode with the event name prepended to
//!   the arguments.
//! - **Tag scope**: [`Observable::with_tags`] hands a [`TagScope`] to a
//!   closure; triggers issued through it only reach listeners sharing a tag.
//!   The tags travel with each call, there is no ambient state.
//!
//! The bus is `Clone + Send + Sync`. Clones share state. No lock is held
//! while listeners, filters, transforms or the interceptor run, so every
//! method may be called from inside a listener.
//!
//! # Example
//!
//! ```ignore
//! use observable::{Callback, ListenerOptions, Observable};
//! use serde_json::json;
//!
//! let bus = Observable::new();
//! bus.on("price", Callback::sync(|args| args[0].as_f64().unwrap_or(0.0) * 1.2), ListenerOptions::new());
//! bus.on("price", Callback::sync(|args| args[0].as_f64().unwrap_or(0.0).round()), ListenerOptions::new());
//!
//! let total = bus.pipe("price", vec![json!(10.0)])?.ready();
//! assert_eq!(total, Some(json!(12.0)));
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock, Weak};

use dashmap::{DashMap, DashSet};
use futures::future::{self, FutureExt};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::channel::{EventChannel, EventOptions, QueuedTrigger};
use crate::core::{Args, BusId, Callback, ListenerId, Outcome, PendingValue, ReturnMode, ALL_EVENTS};
use crate::dispatch::dispatch;
use crate::error::BusError;
use crate::listener::{ListenerInfo, ListenerOptions};
use crate::registry::Registration;
use crate::relay::{EventSource, RelayLink};

/// Global veto hook: `(event, args, mode, tags) -> allow`.
pub type Interceptor = Arc<dyn Fn(&str, &[Value], ReturnMode, &[String]) -> bool + Send + Sync>;

pub(crate) struct BusInner {
    pub(crate) id: BusId,
    case_insensitive: bool,
    channels: DashMap<String, Arc<EventChannel>>,
    interceptor: RwLock<Option<Interceptor>>,
    pub(crate) sources: RwLock<Vec<Arc<dyn EventSource>>>,
    /// `(source name, event)` pairs whose proxy is subscribed on the source.
    pub(crate) bridged: DashSet<(String, String)>,
    pub(crate) proxies: DashMap<(String, ReturnMode), Callback>,
    /// Relays this bus receives, keyed by `(source bus, source event)`.
    pub(crate) relays: DashMap<(BusId, String), RelayLink>,
}

/// An in-process event bus.
///
/// See the [module documentation](self) for the bus-wide behavior and
/// [`ReturnMode`] for the ways listener results are combined.
#[derive(Clone)]
pub struct Observable {
    pub(crate) inner: Arc<BusInner>,
}

impl Observable {
    /// Create a bus with default settings.
    pub fn new() -> Self {
        ObservableBuilder::new().build()
    }

    /// Start configuring a bus.
    pub fn builder() -> ObservableBuilder {
        ObservableBuilder::new()
    }

    /// Identity of this bus.
    pub fn id(&self) -> BusId {
        self.inner.id
    }

    pub(crate) fn downgrade(&self) -> Weak<BusInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<BusInner>) -> Option<Observable> {
        weak.upgrade().map(|inner| Observable { inner })
    }

    /// Normalize an event name.
    pub(crate) fn key(&self, name: &str) -> String {
        if self.inner.case_insensitive {
            name.to_lowercase()
        } else {
            name.to_string()
        }
    }

    fn channel(&self, key: &str) -> Arc<EventChannel> {
        if let Some(channel) = self.inner.channels.get(key) {
            return Arc::clone(channel.value());
        }
        self.inner
            .channels
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(EventChannel::new(key)))
            .value()
            .clone()
    }

    fn existing(&self, key: &str) -> Option<Arc<EventChannel>> {
        self.inner
            .channels
            .get(key)
            .map(|channel| Arc::clone(channel.value()))
    }

    pub(crate) fn all_channels(&self) -> Vec<Arc<EventChannel>> {
        self.inner
            .channels
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Create or update channel-level options for `name`.
    pub fn set_event_options(&self, name: &str, options: EventOptions) {
        let key = self.key(name);
        debug!(event = %key, ?options, "event options set");
        self.channel(&key).configure(options);
    }

    /// Install the interceptor, replacing any previous one.
    pub fn intercept<F>(&self, interceptor: F)
    where
        F: Fn(&str, &[Value], ReturnMode, &[String]) -> bool + Send + Sync + 'static,
    {
        *self
            .inner
            .interceptor
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(interceptor));
        debug!(bus = %self.inner.id, "interceptor installed");
    }

    /// Remove the interceptor.
    pub fn stop_intercepting(&self) {
        *self
            .inner
            .interceptor
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }

    fn interceptor(&self) -> Option<Interceptor> {
        self.inner
            .interceptor
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    // =========================================================================
    // Subscription
    // =========================================================================

    /// Register a listener and return its handle.
    ///
    /// Registering the same callback with the same context again changes
    /// nothing and returns the existing handle.
    ///
    /// If the channel has auto-trigger enabled and was triggered before, the
    /// new listener immediately receives the last trigger's arguments.
    pub fn on(&self, name: &str, callback: Callback, options: ListenerOptions) -> ListenerId {
        let key = self.key(name);
        let channel = self.channel(&key);
        let source_options = options.clone();

        let (registration, replay) = channel.register(callback, options);
        let Registration::Added(id) = registration else {
            return registration.id();
        };

        self.bridge_sources(&key, &source_options);

        if let Some(args) = replay {
            match self.dispatch(&channel, args, ReturnMode::FireAndForget, &[], Some(id)) {
                Ok(outcome) => outcome.detach(),
                Err(e) => warn!(event = %key, listener = %id, error = %e, "auto-trigger replay failed"),
            }
        }

        id
    }

    /// Register a listener that runs at most once.
    pub fn once(&self, name: &str, callback: Callback, options: ListenerOptions) -> ListenerId {
        self.on(name, callback, options.once())
    }

    /// Wait for the next trigger of `name` and yield its arguments.
    ///
    /// The subscription is made right away. The future fails with
    /// [`BusError::Cancelled`] if the listener is removed before the event
    /// fires (for example by `destroy_event`).
    pub fn promise(
        &self,
        name: &str,
        options: ListenerOptions,
    ) -> impl Future<Output = Result<Args, BusError>> + Send + 'static {
        let (tx, rx) = oneshot::channel::<Args>();
        let tx = Mutex::new(Some(tx));
        let callback = Callback::sink(move |args| {
            let sender = tx
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            if let Some(sender) = sender {
                let _ = sender.send(args);
            }
        });
        self.once(name, callback, options);

        let event = self.key(name);
        async move { rx.await.map_err(|_| BusError::Cancelled { event }) }
    }

    /// Unregister by callback, context and (optionally) tag.
    ///
    /// Returns true if a listener was removed.
    pub fn un(
        &self,
        name: &str,
        callback: &Callback,
        context: Option<&Value>,
        tag: Option<&str>,
    ) -> bool {
        let key = self.key(name);
        let Some(channel) = self.existing(&key) else {
            return false;
        };
        let removed = channel.unregister(callback, context, tag);
        if removed && channel.listener_count() == 0 {
            self.unbridge_sources(&key);
        }
        removed
    }

    /// Unregister by handle.
    pub fn un_id(&self, name: &str, id: ListenerId) -> bool {
        let key = self.key(name);
        let Some(channel) = self.existing(&key) else {
            return false;
        };
        let removed = channel.unregister_id(id);
        if removed && channel.listener_count() == 0 {
            self.unbridge_sources(&key);
        }
        removed
    }

    /// Check for listeners.
    ///
    /// - no name: any channel
    /// - no callback: any listener (carrying `tag`, if given)
    /// - callback: that exact `(callback, context, tag)` registration
    pub fn has(
        &self,
        name: Option<&str>,
        callback: Option<&Callback>,
        context: Option<&Value>,
        tag: Option<&str>,
    ) -> bool {
        match name {
            Some(name) => self
                .existing(&self.key(name))
                .is_some_and(|channel| channel.has_listener(callback, context, tag)),
            None => self
                .all_channels()
                .iter()
                .any(|channel| channel.has_listener(callback, context, tag)),
        }
    }

    /// Check whether the handle is still registered on `name`.
    pub fn has_id(&self, name: &str, id: ListenerId) -> bool {
        self.existing(&self.key(name))
            .is_some_and(|channel| channel.contains_id(id))
    }

    /// Remove listeners of one channel or of all channels, optionally only
    /// those carrying `tag`.
    pub fn remove_all_listeners(&self, name: Option<&str>, tag: Option<&str>) {
        let channels = match name {
            Some(name) => self.existing(&self.key(name)).into_iter().collect(),
            None => self.all_channels(),
        };
        for channel in channels {
            channel.remove_all(tag);
            if channel.listener_count() == 0 {
                self.unbridge_sources(channel.name());
            }
        }
    }

    // =========================================================================
    // Triggering
    // =========================================================================

    /// Trigger `name` in `mode`, restricted to listeners sharing one of `tags`.
    ///
    /// An empty tag list means no restriction.
    pub fn trigger_tagged(
        &self,
        name: &str,
        args: Args,
        mode: ReturnMode,
        tags: &[String],
    ) -> Result<Outcome, BusError> {
        let key = self.key(name);

        if let Some(interceptor) = self.interceptor() {
            if !interceptor(&key, &args, mode, tags) {
                debug!(event = %key, %mode, "trigger vetoed by interceptor");
                return Ok(mode.empty());
            }
        }

        let channel = self.existing(&key);
        let catch_all = if key == ALL_EVENTS {
            None
        } else {
            self.existing(ALL_EVENTS).map(|all| {
                let mut all_args = Vec::with_capacity(args.len() + 1);
                all_args.push(Value::String(key.clone()));
                all_args.extend(args.iter().cloned());
                (all, all_args)
            })
        };

        // Unknown names get no channel; they answer like a channel without listeners.
        let outcome = match channel {
            Some(channel) => self.dispatch(&channel, args, mode, tags, None)?,
            None => match mode {
                ReturnMode::Pipe => Outcome::Ready(args.into_iter().next().unwrap_or(Value::Null)),
                other => other.empty(),
            },
        };

        if let Some((all, all_args)) = catch_all {
            self.dispatch(&all, all_args, ReturnMode::FireAndForget, tags, None)?
                .detach();
        }

        Ok(outcome)
    }

    /// Dispatch on `channel`; unbridges event sources when limits empty it.
    fn dispatch(
        &self,
        channel: &Arc<EventChannel>,
        args: Args,
        mode: ReturnMode,
        tags: &[String],
        only: Option<ListenerId>,
    ) -> Result<Outcome, BusError> {
        dispatch(channel, args, mode, tags, only, &|name: &str| self.unbridge_sources(name))
    }

    /// Trigger `name` in `mode`.
    pub fn trigger_with(&self, name: &str, args: Args, mode: ReturnMode) -> Result<Outcome, BusError> {
        self.trigger_tagged(name, args, mode, &[])
    }

    /// Run every listener; the outcome carries no value.
    pub fn trigger(&self, name: &str, args: Args) -> Result<Outcome, BusError> {
        self.trigger_with(name, args, ReturnMode::FireAndForget)
    }

    /// Collect every listener's value.
    pub fn all(&self, name: &str, args: Args) -> Result<Outcome, BusError> {
        self.trigger_with(name, args, ReturnMode::All)
    }

    /// Return the first invoked listener's value; later listeners do not run.
    pub fn first(&self, name: &str, args: Args) -> Result<Outcome, BusError> {
        self.trigger_with(name, args, ReturnMode::First)
    }

    /// Return the last listener's value.
    pub fn last(&self, name: &str, args: Args) -> Result<Outcome, BusError> {
        self.trigger_with(name, args, ReturnMode::Last)
    }

    /// Merge object values key by key.
    pub fn merge(&self, name: &str, args: Args) -> Result<Outcome, BusError> {
        self.trigger_with(name, args, ReturnMode::Merge)
    }

    /// Concatenate array values.
    pub fn concat(&self, name: &str, args: Args) -> Result<Outcome, BusError> {
        self.trigger_with(name, args, ReturnMode::Concat)
    }

    /// Stop at the first value that is not `null`.
    pub fn first_non_empty(&self, name: &str, args: Args) -> Result<Outcome, BusError> {
        self.trigger_with(name, args, ReturnMode::FirstNonEmpty)
    }

    /// Stop at the first `true`.
    pub fn until_true(&self, name: &str, args: Args) -> Result<Outcome, BusError> {
        self.trigger_with(name, args, ReturnMode::UntilTrue)
    }

    /// Stop at the first `false`.
    pub fn until_false(&self, name: &str, args: Args) -> Result<Outcome, BusError> {
        self.trigger_with(name, args, ReturnMode::UntilFalse)
    }

    /// Thread the first argument through every listener.
    pub fn pipe(&self, name: &str, args: Args) -> Result<Outcome, BusError> {
        self.trigger_with(name, args, ReturnMode::Pipe)
    }

    /// Every listener's reply, untouched.
    pub fn raw(&self, name: &str, args: Args) -> Result<Outcome, BusError> {
        self.trigger_with(name, args, ReturnMode::Raw)
    }

    /// Trigger now and always get a future back.
    pub fn resolve(&self, name: &str, args: Args, mode: ReturnMode) -> PendingValue {
        match self.trigger_with(name, args, mode) {
            Ok(outcome) => outcome.resolve(),
            Err(e) => future::ready(Err(e)).boxed(),
        }
    }

    pub fn resolve_trigger(&self, name: &str, args: Args) -> PendingValue {
        self.resolve(name, args, ReturnMode::FireAndForget)
    }

    pub fn resolve_all(&self, name: &str, args: Args) -> PendingValue {
        self.resolve(name, args, ReturnMode::All)
    }

    pub fn resolve_first(&self, name: &str, args: Args) -> PendingValue {
        self.resolve(name, args, ReturnMode::First)
    }

    pub fn resolve_last(&self, name: &str, args: Args) -> PendingValue {
        self.resolve(name, args, ReturnMode::Last)
    }

    pub fn resolve_merge(&self, name: &str, args: Args) -> PendingValue {
        self.resolve(name, args, ReturnMode::Merge)
    }

    pub fn resolve_concat(&self, name: &str, args: Args) -> PendingValue {
        self.resolve(name, args, ReturnMode::Concat)
    }

    pub fn resolve_first_non_empty(&self, name: &str, args: Args) -> PendingValue {
        self.resolve(name, args, ReturnMode::FirstNonEmpty)
    }

    pub fn resolve_until_true(&self, name: &str, args: Args) -> PendingValue {
        self.resolve(name, args, ReturnMode::UntilTrue)
    }

    pub fn resolve_until_false(&self, name: &str, args: Args) -> PendingValue {
        self.resolve(name, args, ReturnMode::UntilFalse)
    }

    pub fn resolve_pipe(&self, name: &str, args: Args) -> PendingValue {
        self.resolve(name, args, ReturnMode::Pipe)
    }

    /// RAW outcome resolved to the array of settled replies.
    pub fn resolve_raw(&self, name: &str, args: Args) -> PendingValue {
        self.resolve(name, args, ReturnMode::Raw)
    }

    /// Run `f` with a scope whose triggers only reach listeners tagged with
    /// one of `tags`.
    ///
    /// ```ignore
    /// bus.with_tags(["audit"], |scope| scope.trigger("save", vec![json!(1)]))?;
    /// ```
    pub fn with_tags<I, S, R>(&self, tags: I, f: impl FnOnce(&TagScope<'_>) -> R) -> R
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let scope = TagScope {
            bus: self,
            tags: tags.into_iter().map(Into::into).collect(),
        };
        f(&scope)
    }

    // =========================================================================
    // Suspension
    // =========================================================================

    /// Stop dispatching `name`. With `with_queue`, triggers are buffered and
    /// replayed on resume; otherwise they are dropped.
    pub fn suspend_event(&self, name: &str, with_queue: bool) {
        self.channel(&self.key(name)).suspend(with_queue);
    }

    /// Resume `name` and replay its buffered triggers in arrival order.
    ///
    /// The first failing replay stops the replay and is returned.
    pub fn resume_event(&self, name: &str) -> Result<(), BusError> {
        match self.existing(&self.key(name)) {
            Some(channel) => {
                let queue = channel.resume();
                self.replay(&channel, queue)
            }
            None => Ok(()),
        }
    }

    pub fn is_suspended(&self, name: &str) -> bool {
        self.existing(&self.key(name))
            .is_some_and(|channel| channel.is_suspended())
    }

    pub fn is_queued(&self, name: &str) -> bool {
        self.existing(&self.key(name))
            .is_some_and(|channel| channel.is_queued())
    }

    /// Check for buffered triggers on one channel, or on any.
    pub fn has_queue(&self, name: Option<&str>) -> bool {
        match name {
            Some(name) => self
                .existing(&self.key(name))
                .is_some_and(|channel| channel.has_queue()),
            None => self.all_channels().iter().any(|channel| channel.has_queue()),
        }
    }

    /// Suspend every existing channel.
    pub fn suspend_all_events(&self, with_queue: bool) {
        for channel in self.all_channels() {
            channel.suspend(with_queue);
        }
    }

    /// Resume every channel; all channels are resumed even if a replay fails.
    /// The first failure is returned.
    pub fn resume_all_events(&self) -> Result<(), BusError> {
        let mut first_error = None;
        for channel in self.all_channels() {
            let queue = channel.resume();
            if let Err(e) = self.replay(&channel, queue) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Snapshots of the listeners of `name`, in invocation order.
    pub fn listeners(&self, name: &str) -> Vec<ListenerInfo> {
        self.existing(&self.key(name))
            .map(|channel| channel.infos())
            .unwrap_or_default()
    }

    /// How many triggers of `name` were dispatched.
    pub fn trigger_count(&self, name: &str) -> u64 {
        self.existing(&self.key(name))
            .map_or(0, |channel| channel.trigger_count())
    }

    /// Check whether a channel exists for `name`.
    pub fn has_event(&self, name: &str) -> bool {
        self.inner.channels.contains_key(&self.key(name))
    }

    /// Names of every channel, sorted.
    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .channels
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Drop the channel of `name` with its listeners and options.
    pub fn destroy_event(&self, name: &str) {
        let key = self.key(name);
        if let Some((_, channel)) = self.inner.channels.remove(&key) {
            channel.clear();
            self.unbridge_sources(&key);
            debug!(event = %key, "event destroyed");
        }
    }

    /// Drop every channel, the interceptor, event sources, relays and proxies.
    pub fn destroy(&self) {
        for name in self.event_names() {
            self.destroy_event(&name);
        }
        self.stop_intercepting();
        self.clear_event_sources();
        self.clear_relays();
        self.inner.proxies.clear();
        debug!(bus = %self.inner.id, "bus destroyed");
    }

    /// Replay buffered triggers on `channel`, oldest first.
    fn replay(
        &self,
        channel: &Arc<EventChannel>,
        queue: VecDeque<QueuedTrigger>,
    ) -> Result<(), BusError> {
        let total = queue.len();
        for (done, queued) in queue.into_iter().enumerate() {
            match self.dispatch(channel, queued.args, queued.mode, &queued.tags, None) {
                Ok(outcome) => outcome.detach(),
                Err(e) => {
                    let dropped = total - done - 1;
                    if dropped > 0 {
                        warn!(event = %channel.name(), dropped, error = %e, "queued triggers dropped after failed replay");
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

impl Default for Observable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Observable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable")
            .field("id", &self.inner.id)
            .field("events", &self.inner.channels.len())
            .field("case_insensitive", &self.inner.case_insensitive)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tag Scope
// =============================================================================

/// Trigger handle restricted to a set of tags.
///
/// Obtained from [`Observable::with_tags`].
pub struct TagScope<'a> {
    bus: &'a Observable,
    tags: Vec<String>,
}

impl TagScope<'_> {
    /// The active tags.
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn trigger_with(&self, name: &str, args: Args, mode: ReturnMode) -> Result<Outcome, BusError> {
        self.bus.trigger_tagged(name, args, mode, &self.tags)
    }

    pub fn trigger(&self, name: &str, args: Args) -> Result<Outcome, BusError> {
        self.trigger_with(name, args, ReturnMode::FireAndForget)
    }

    pub fn all(&self, name: &str, args: Args) -> Result<Outcome, BusError> {
        self.trigger_with(name, args, ReturnMode::All)
    }

    pub fn first(&self, name: &str, args: Args) -> Result<Outcome, BusError> {
        self.trigger_with(name, args, ReturnMode::First)
    }

    pub fn pipe(&self, name: &str, args: Args) -> Result<Outcome, BusError> {
        self.trigger_with(name, args, ReturnMode::Pipe)
    }

    /// Trigger now and always get a future back.
    pub fn resolve(&self, name: &str, args: Args, mode: ReturnMode) -> PendingValue {
        match self.trigger_with(name, args, mode) {
            Ok(outcome) => outcome.resolve(),
            Err(e) => future::ready(Err(e)).boxed(),
        }
    }
}

impl fmt::Debug for TagScope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagScope").field("tags", &self.tags).finish()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for a preconfigured [`Observable`].
///
/// # Example
///
/// ```ignore
/// let bus = Observable::builder()
///     .case_insensitive()
///     .with_event("ready", EventOptions::new().auto_trigger())
///     .with_interceptor(|name, _args, _mode, _tags| name != "blocked")
///     .with_event_source(Arc::new(emitter_source))
///     .build();
/// ```
#[derive(Default)]
pub struct ObservableBuilder {
    case_insensitive: bool,
    events: Vec<(String, EventOptions)>,
    interceptor: Option<Interceptor>,
    sources: Vec<Arc<dyn EventSource>>,
}

impl ObservableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat event names case-insensitively (names are lowercased).
    pub fn case_insensitive(mut self) -> Self {
        self.case_insensitive = true;
        self
    }

    /// Preconfigure the channel `name`.
    pub fn with_event(mut self, name: impl Into<String>, options: EventOptions) -> Self {
        self.events.push((name.into(), options));
        self
    }

    /// Install an interceptor.
    pub fn with_interceptor<F>(mut self, interceptor: F) -> Self
    where
        F: Fn(&str, &[Value], ReturnMode, &[String]) -> bool + Send + Sync + 'static,
    {
        self.interceptor = Some(Arc::new(interceptor));
        self
    }

    /// Bridge an external event source.
    pub fn with_event_source(mut self, source: Arc<dyn EventSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn build(self) -> Observable {
        let bus = Observable {
            inner: Arc::new(BusInner {
                id: BusId::new(),
                case_insensitive: self.case_insensitive,
                channels: DashMap::new(),
                interceptor: RwLock::new(self.interceptor),
                sources: RwLock::new(Vec::new()),
                bridged: DashSet::new(),
                proxies: DashMap::new(),
                relays: DashMap::new(),
            }),
        };
        for (name, options) in self.events {
            bus.set_event_options(&name, options);
        }
        for source in self.sources {
            bus.add_event_source(source);
        }
        bus
    }
}

impl fmt::Debug for ObservableBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservableBuilder")
            .field("case_insensitive", &self.case_insensitive)
            .field("events", &self.events)
            .field("has_interceptor", &self.interceptor.is_some())
            .field("sources", &self.sources.len())
            .finish()
    }
}
