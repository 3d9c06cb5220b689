//! Per-event channel state: listeners, channel options, suspension and queue.
//!
//! A channel is shared as `Arc<EventChannel>` between the bus map and every
//! in-flight dispatch. All mutable state lives behind one `std::sync::Mutex`
//! which is only held for bookkeeping, never while user code runs.
//!
//! # Trigger gate
//!
//! Every trigger passes [`EventChannel::open`] first:
//!
//! ```text
//! queued?     ──► buffer (args, mode, tags), no dispatch
//! suspended?  ──► no dispatch, mode's empty value
//! limit hit?  ──► no dispatch
//! otherwise   ──► trigger_count += 1, snapshot listeners + options
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::core::{Args, Callback, ListenerId, ReturnMode};
use crate::listener::{EventFilter, ListenerInfo, ListenerOptions, ListenerRecord, DEFAULT_DEFER_DELAY};
use crate::registry::{ListenerRegistry, Registration};
use crate::transform::{ArgTransform, ArgTransforms};

// =============================================================================
// Event Options
// =============================================================================

/// Channel-level configuration.
///
/// Unset fields leave the channel's current value alone when applied with
/// `set_event_options`.
///
/// # Example
///
/// ```ignore
/// use observable::EventOptions;
/// use serde_json::json;
///
/// bus.set_event_options(
///     "ready",
///     EventOptions::new()
///         .auto_trigger()
///         .with_limit(1)
///         .with_append(vec![json!("ctx")]),
/// );
/// ```
#[derive(Clone, Default)]
pub struct EventOptions {
    /// Stop dispatching after this many triggers, 0 = unlimited.
    pub limit: Option<u32>,
    /// Remember the last trigger's arguments and replay them to late subscribers.
    pub auto_trigger: Option<bool>,
    /// Filter consulted for every listener.
    pub filter: Option<EventFilter>,
    /// Context handed to the filter.
    pub filter_context: Option<Value>,
    /// Default argument transforms for every listener.
    pub transforms: ArgTransforms,
    /// Default deferral for listeners without their own.
    pub delay: Option<Duration>,
}

impl EventOptions {
    /// Options that change nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatch at most `limit` triggers.
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Replay the last trigger to listeners registered later.
    pub fn auto_trigger(mut self) -> Self {
        self.auto_trigger = Some(true);
        self
    }

    /// Consult `filter` before invoking any listener.
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(Option<&Value>, &[Value], &ListenerRecord) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn with_filter_context(mut self, context: impl Into<Value>) -> Self {
        self.filter_context = Some(context.into());
        self
    }

    pub fn with_prepend(mut self, transform: impl Into<ArgTransform>) -> Self {
        self.transforms.prepend = Some(transform.into());
        self
    }

    pub fn with_append(mut self, transform: impl Into<ArgTransform>) -> Self {
        self.transforms.append = Some(transform.into());
        self
    }

    pub fn with_replace(mut self, transform: impl Into<ArgTransform>) -> Self {
        self.transforms.replace = Some(transform.into());
        self
    }

    /// Defer every listener by the default delay.
    pub fn deferred(self) -> Self {
        self.with_delay(DEFAULT_DEFER_DELAY)
    }

    /// Defer every listener by `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl fmt::Debug for EventOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventOptions")
            .field("limit", &self.limit)
            .field("auto_trigger", &self.auto_trigger)
            .field("has_filter", &self.filter.is_some())
            .field("filter_context", &self.filter_context)
            .field("transforms", &self.transforms)
            .field("delay", &self.delay)
            .finish()
    }
}

// =============================================================================
// Channel
// =============================================================================

/// A trigger buffered while its channel was suspended with a queue.
#[derive(Debug, Clone)]
pub(crate) struct QueuedTrigger {
    pub(crate) args: Args,
    pub(crate) mode: ReturnMode,
    pub(crate) tags: Vec<String>,
}

/// Everything a dispatch needs, copied out of the channel under its lock.
pub(crate) struct DispatchPlan {
    pub(crate) listeners: Vec<Arc<ListenerRecord>>,
    pub(crate) transforms: ArgTransforms,
    pub(crate) filter: Option<EventFilter>,
    pub(crate) filter_context: Option<Value>,
    pub(crate) delay: Option<Duration>,
}

/// Result of passing the trigger gate.
pub(crate) enum Gate {
    /// Buffered for replay on resume.
    Queued,
    /// Suspended without a queue; dropped.
    Suspended,
    /// The channel's trigger limit was reached.
    Exhausted,
    /// Dispatch with this plan.
    Open(DispatchPlan),
}

#[derive(Default)]
struct ChannelState {
    registry: ListenerRegistry,
    suspended: bool,
    queued: bool,
    queue: VecDeque<QueuedTrigger>,
    triggered: u64,
    limit: u32,
    auto_trigger: bool,
    last_args: Option<Args>,
    filter: Option<EventFilter>,
    filter_context: Option<Value>,
    transforms: ArgTransforms,
    delay: Option<Duration>,
}

/// One named event.
pub(crate) struct EventChannel {
    name: String,
    state: Mutex<ChannelState>,
}

impl EventChannel {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(ChannelState::default()),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Acquire the state lock, recovering from poison if necessary.
    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply the options that are set.
    pub(crate) fn configure(&self, options: EventOptions) {
        let mut state = self.lock();
        if let Some(limit) = options.limit {
            state.limit = limit;
        }
        if let Some(auto_trigger) = options.auto_trigger {
            state.auto_trigger = auto_trigger;
            if !auto_trigger {
                state.last_args = None;
            }
        }
        if options.filter.is_some() {
            state.filter = options.filter;
        }
        if options.filter_context.is_some() {
            state.filter_context = options.filter_context;
        }
        if options.delay.is_some() {
            state.delay = options.delay;
        }
        state.transforms.merge_from(options.transforms);
    }

    // -------------------------------------------------------------------------
    // Listeners
    // -------------------------------------------------------------------------

    /// Register a listener.
    ///
    /// Returns the arguments to replay to it when auto-trigger applies.
    pub(crate) fn register(
        &self,
        callback: Callback,
        options: ListenerOptions,
    ) -> (Registration, Option<Args>) {
        let mut state = self.lock();
        let registration = state.registry.register(callback, options);
        let replay = match registration {
            Registration::Added(_) if state.auto_trigger && !state.suspended => {
                state.last_args.clone()
            }
            _ => None,
        };
        debug!(
            event = %self.name,
            listener = %registration.id(),
            added = matches!(registration, Registration::Added(_)),
            "listener registered"
        );
        (registration, replay)
    }

    pub(crate) fn unregister(
        &self,
        callback: &Callback,
        context: Option<&Value>,
        tag: Option<&str>,
    ) -> bool {
        let removed = self.lock().registry.unregister(callback, context, tag);
        if let Some(record) = &removed {
            debug!(event = %self.name, listener = %record.id(), "listener removed");
        }
        removed.is_some()
    }

    pub(crate) fn unregister_id(&self, id: ListenerId) -> bool {
        let removed = self.lock().registry.unregister_id(id).is_some();
        if removed {
            debug!(event = %self.name, listener = %id, "listener removed");
        }
        removed
    }

    pub(crate) fn has_listener(
        &self,
        callback: Option<&Callback>,
        context: Option<&Value>,
        tag: Option<&str>,
    ) -> bool {
        self.lock().registry.has_listener(callback, context, tag)
    }

    pub(crate) fn contains_id(&self, id: ListenerId) -> bool {
        self.lock().registry.contains_id(id)
    }

    pub(crate) fn remove_all(&self, tag: Option<&str>) -> usize {
        let removed = self.lock().registry.remove_all(tag);
        debug!(event = %self.name, removed, tag = ?tag, "listeners removed");
        removed
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.lock().registry.len()
    }

    pub(crate) fn infos(&self) -> Vec<ListenerInfo> {
        self.lock().registry.iter().map(|l| l.info()).collect()
    }

    // -------------------------------------------------------------------------
    // Suspension
    // -------------------------------------------------------------------------

    pub(crate) fn suspend(&self, with_queue: bool) {
        let mut state = self.lock();
        state.suspended = true;
        state.queued = with_queue;
        debug!(event = %self.name, with_queue, "event suspended");
    }

    /// Lift suspension and hand back the buffered triggers, oldest first.
    pub(crate) fn resume(&self) -> VecDeque<QueuedTrigger> {
        let mut state = self.lock();
        state.suspended = false;
        state.queued = false;
        let queue = std::mem::take(&mut state.queue);
        debug!(event = %self.name, replay = queue.len(), "event resumed");
        queue
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.lock().suspended
    }

    pub(crate) fn is_queued(&self) -> bool {
        self.lock().queued
    }

    pub(crate) fn has_queue(&self) -> bool {
        !self.lock().queue.is_empty()
    }

    pub(crate) fn trigger_count(&self) -> u64 {
        self.lock().triggered
    }

    // -------------------------------------------------------------------------
    // Trigger gate
    // -------------------------------------------------------------------------

    /// Decide whether a trigger dispatches, and snapshot what it needs.
    pub(crate) fn open(&self, args: &[Value], mode: ReturnMode, tags: &[String]) -> Gate {
        let mut state = self.lock();

        if state.queued {
            state.queue.push_back(QueuedTrigger {
                args: args.to_vec(),
                mode,
                tags: tags.to_vec(),
            });
            return Gate::Queued;
        }
        if state.suspended {
            return Gate::Suspended;
        }
        if state.limit > 0 && state.triggered >= u64::from(state.limit) {
            return Gate::Exhausted;
        }

        state.triggered += 1;
        if state.auto_trigger {
            state.last_args = Some(args.to_vec());
        }

        Gate::Open(DispatchPlan {
            listeners: state.registry.snapshot(),
            transforms: state.transforms.clone(),
            filter: state.filter.clone(),
            filter_context: state.filter_context.clone(),
            delay: state.delay,
        })
    }

    /// Drop listeners, filter state, queue and replay state.
    pub(crate) fn clear(&self) {
        let mut state = self.lock();
        state.registry.remove_all(None);
        state.queue.clear();
        state.last_args = None;
        state.filter = None;
        state.filter_context = None;
        state.transforms = ArgTransforms::default();
    }
}

impl fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("EventChannel")
            .field("name", &self.name)
            .field("listeners", &state.registry.len())
            .field("suspended", &state.suspended)
            .field("queued", &state.queued)
            .field("triggered", &state.triggered)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_plan(channel: &EventChannel, args: &[Value]) -> Option<DispatchPlan> {
        match channel.open(args, ReturnMode::All, &[]) {
            Gate::Open(plan) => Some(plan),
            _ => None,
        }
    }

    #[test]
    fn test_open_counts_triggers() {
        let channel = EventChannel::new("e");
        assert!(open_plan(&channel, &[]).is_some());
        assert!(open_plan(&channel, &[]).is_some());
        assert_eq!(channel.trigger_count(), 2);
    }

    #[test]
    fn test_suspended_without_queue_drops_triggers() {
        let channel = EventChannel::new("e");
        channel.suspend(false);
        assert!(matches!(channel.open(&[], ReturnMode::All, &[]), Gate::Suspended));
        assert_eq!(channel.trigger_count(), 0);
        assert!(!channel.has_queue());
        assert!(channel.resume().is_empty());
    }

    #[test]
    fn test_queue_preserves_arrival_order() {
        let channel = EventChannel::new("e");
        channel.suspend(true);
        assert!(channel.is_suspended());
        assert!(channel.is_queued());
        for i in 0..3 {
            assert!(matches!(
                channel.open(&[json!(i)], ReturnMode::Pipe, &["t".to_string()]),
                Gate::Queued
            ));
        }
        assert!(channel.has_queue());

        let replay: Vec<_> = channel.resume().into_iter().collect();
        assert_eq!(
            replay.iter().map(|q| q.args[0].clone()).collect::<Vec<_>>(),
            vec![json!(0), json!(1), json!(2)]
        );
        assert!(replay.iter().all(|q| q.mode == ReturnMode::Pipe));
        assert_eq!(replay[0].tags, vec!["t".to_string()]);
        assert!(!channel.is_suspended());
        assert!(!channel.has_queue());
    }

    #[test]
    fn test_limit_exhausts_channel() {
        let channel = EventChannel::new("e");
        channel.configure(EventOptions::new().with_limit(2));
        assert!(open_plan(&channel, &[]).is_some());
        assert!(open_plan(&channel, &[]).is_some());
        assert!(matches!(channel.open(&[], ReturnMode::All, &[]), Gate::Exhausted));
        assert_eq!(channel.trigger_count(), 2);
    }

    #[test]
    fn test_auto_trigger_replays_to_new_listeners_only() {
        let channel = EventChannel::new("e");
        channel.configure(EventOptions::new().auto_trigger());
        let cb = Callback::sink(|_| {});

        let (_, replay) = channel.register(cb.clone(), ListenerOptions::new());
        assert!(replay.is_none(), "nothing triggered yet");

        assert!(open_plan(&channel, &[json!(1)]).is_some());
        let (registration, replay) = channel.register(cb, ListenerOptions::new());
        assert!(matches!(registration, Registration::Existing(_)));
        assert!(replay.is_none());

        let (_, replay) = channel.register(Callback::sink(|_| {}), ListenerOptions::new());
        assert_eq!(replay, Some(vec![json!(1)]));
    }

    #[test]
    fn test_auto_trigger_skipped_while_suspended() {
        let channel = EventChannel::new("e");
        channel.configure(EventOptions::new().auto_trigger());
        assert!(open_plan(&channel, &[json!(1)]).is_some());
        channel.suspend(false);
        let (_, replay) = channel.register(Callback::sink(|_| {}), ListenerOptions::new());
        assert!(replay.is_none());
    }

    #[test]
    fn test_configure_merges_set_fields_only() {
        let channel = EventChannel::new("e");
        channel.configure(
            EventOptions::new()
                .with_limit(3)
                .with_prepend(vec![json!("p")])
                .with_filter_context("fc"),
        );
        channel.configure(EventOptions::new().with_append(vec![json!("a")]));

        let plan = open_plan(&channel, &[]).unwrap();
        assert!(plan.transforms.prepend.is_some());
        assert!(plan.transforms.append.is_some());
        assert_eq!(plan.filter_context, Some(json!("fc")));
        assert!(plan.delay.is_none());
    }

    #[test]
    fn test_snapshot_excludes_later_registrations() {
        let channel = EventChannel::new("e");
        channel.register(Callback::sink(|_| {}), ListenerOptions::new());
        let plan = open_plan(&channel, &[]).unwrap();
        channel.register(Callback::sink(|_| {}), ListenerOptions::new());
        assert_eq!(plan.listeners.len(), 1);
        assert_eq!(channel.listener_count(), 2);
    }

    #[test]
    fn test_clear_drops_listeners_and_queue() {
        let channel = EventChannel::new("e");
        channel.register(Callback::sink(|_| {}), ListenerOptions::new());
        channel.suspend(true);
        let _ = channel.open(&[], ReturnMode::All, &[]);
        channel.clear();
        assert_eq!(channel.listener_count(), 0);
        assert!(!channel.has_queue());
    }
}
