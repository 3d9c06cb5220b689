//! Dispatch engine: runs one trigger against one channel.
//!
//! # Flow
//!
//! ```text
//! open gate ──► snapshot ──► for each listener:
//!                              prepare args ─► channel filter ─► listener filter
//!                              ─► tag scope ─► count attempt ─► start gate
//!                              ─► invoke (now, or spawned after a delay)
//!                              ─► count call ─► unregister at limit
//!                          ──► fold replies per ReturnMode
//! ```
//!
//! Independent modes (ALL, CONCAT, MERGE, LAST, RAW, FIRST, fire-and-forget)
//! invoke every admitted listener with its own arguments. Chained modes (PIPE,
//! UNTIL_TRUE, UNTIL_FALSE, FIRST_NON_EMPTY) carry the previous value into the
//! next link. A chain runs synchronously until the first pending reply; the
//! remaining links are admitted (filters, counters, limits) right away and
//! invoked later as continuations of that reply.
//!
//! No lock is held while user code runs: the channel hands out a snapshot and
//! the engine only touches it again to unregister a listener at its limit.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, FutureExt};
use serde_json::{Map, Value};
use tracing::trace;

use crate::channel::{EventChannel, Gate};
use crate::core::{Args, Callback, ListenerId, Outcome, PendingValue, Reply, ReturnMode};
use crate::error::BusError;
use crate::listener::{EventFilter, ListenerRecord};
use crate::transform::{prepare_args, ArgTransforms};

/// Run one trigger on `channel`.
///
/// `only` restricts the run to a single listener (auto-trigger replay).
/// `drained` is called with the channel name when a listener reaching its
/// limit was the last one on the channel.
pub(crate) fn dispatch(
    channel: &Arc<EventChannel>,
    args: Args,
    mode: ReturnMode,
    tags: &[String],
    only: Option<ListenerId>,
    drained: &dyn Fn(&str),
) -> Result<Outcome, BusError> {
    trace!(event = %channel.name(), %mode, args = args.len(), "trigger");

    let plan = match channel.open(&args, mode, tags) {
        Gate::Open(plan) => plan,
        Gate::Suspended => return Ok(mode.empty()),
        Gate::Queued | Gate::Exhausted => return Ok(idle(mode)),
    };

    if plan.listeners.is_empty() {
        return Ok(match mode {
            ReturnMode::Pipe => Outcome::Ready(args.into_iter().next().unwrap_or(Value::Null)),
            other => other.empty(),
        });
    }

    let run = Run {
        channel,
        invoker: Arc::new(Invoker {
            event: channel.name().to_string(),
            transforms: plan.transforms,
            delay: plan.delay,
        }),
        filter: plan.filter,
        filter_context: plan.filter_context,
        tags,
        only,
        mode,
        drained,
    };

    if mode.is_chained() {
        run.chained(&plan.listeners, &args)
    } else {
        run.independent(&plan.listeners, &args)
    }
}

/// Result of a trigger that was buffered or refused by the call limit.
fn idle(mode: ReturnMode) -> Outcome {
    match mode {
        ReturnMode::Raw => Outcome::Raw(Vec::new()),
        _ => Outcome::Ready(Value::Null),
    }
}

// =============================================================================
// Invocation
// =============================================================================

/// The owned part of a dispatch, shared with chain continuations.
struct Invoker {
    event: String,
    transforms: ArgTransforms,
    delay: Option<Duration>,
}

impl Invoker {
    fn prepare(&self, listener: &ListenerRecord, args: &[Value]) -> Result<Args, BusError> {
        prepare_args(&self.event, listener, &self.transforms, args)
    }

    /// Invoke a listener in place, or spawn it if it is deferred.
    fn call(&self, listener: &ListenerRecord, args: Args) -> Result<Reply, BusError> {
        match listener.delay().or(self.delay) {
            None => listener
                .callback()
                .call(args)
                .map(|reply| reply.for_event(&self.event))
                .map_err(|e| BusError::listener(&self.event, e)),
            Some(delay) => self.defer(listener.callback().clone(), args, delay),
        }
    }

    fn defer(&self, callback: Callback, args: Args, delay: Duration) -> Result<Reply, BusError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| BusError::NoRuntime)?;

        let event = self.event.clone();
        let task = handle.spawn({
            let event = event.clone();
            async move {
                tokio::time::sleep(delay).await;
                let reply = callback
                    .call(args)
                    .map_err(|e| BusError::listener(&event, e))?;
                reply.for_event(&event).settle().await
            }
        });

        Ok(Reply::Pending(
            async move {
                match task.await {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => Err(BusError::ListenerPanicked { event }),
                    Err(_) => Err(BusError::Cancelled { event }),
                }
            }
            .boxed(),
        ))
    }
}

// =============================================================================
// Run
// =============================================================================

struct Run<'a> {
    channel: &'a Arc<EventChannel>,
    invoker: Arc<Invoker>,
    filter: Option<EventFilter>,
    filter_context: Option<Value>,
    tags: &'a [String],
    only: Option<ListenerId>,
    mode: ReturnMode,
    drained: &'a dyn Fn(&str),
}

/// A chain link admitted synchronously and invoked once the chain reaches it.
struct Link {
    listener: Arc<ListenerRecord>,
    args: Args,
}

impl Run<'_> {
    /// Gate one listener. Returns its arguments if it is to be invoked.
    fn admit(&self, listener: &ListenerRecord, args: &[Value]) -> Result<Option<Args>, BusError> {
        if self.only.is_some_and(|id| id != listener.id()) {
            return Ok(None);
        }

        let args = self.invoker.prepare(listener, args)?;

        if let Some(filter) = &self.filter {
            if !filter(self.filter_context.as_ref(), &args, listener) {
                return Ok(None);
            }
        }
        if let Some(filter) = listener.filter() {
            if !filter(listener.filter_context(self.filter_context.as_ref()), &args) {
                return Ok(None);
            }
        }
        if !self.tags.is_empty() && !listener.matches_scope(self.tags) {
            return Ok(None);
        }

        // The attempt counts even when `start` holds the listener back.
        if listener.record_attempt() < listener.start() {
            return Ok(None);
        }

        Ok(Some(args))
    }

    /// Invoke a listener holding a call reservation; a failed call gives
    /// the reservation back.
    fn invoke(&self, listener: &ListenerRecord, args: Args) -> Result<Reply, BusError> {
        self.invoker.call(listener, args).map_err(|e| {
            listener.release_call();
            e
        })
    }

    /// Drop the listener once its last reserved call went through.
    fn complete(&self, listener: &ListenerRecord, last: bool) {
        if last
            && self.channel.unregister_id(listener.id())
            && self.channel.listener_count() == 0
        {
            (self.drained)(self.channel.name());
        }
    }

    fn independent(
        &self,
        listeners: &[Arc<ListenerRecord>],
        args: &[Value],
    ) -> Result<Outcome, BusError> {
        let mut replies = Vec::with_capacity(listeners.len());

        for listener in listeners {
            let Some(call_args) = self.admit(listener, args)? else {
                continue;
            };
            let Some(last) = listener.reserve_call() else {
                continue;
            };
            let reply = self.invoke(listener, call_args)?;
            self.complete(listener, last);

            if self.mode == ReturnMode::First {
                return Ok(settled(reply));
            }
            replies.push(reply);
        }

        Ok(fold(self.mode, replies))
    }

    fn chained(&self, listeners: &[Arc<ListenerRecord>], args: &[Value]) -> Result<Outcome, BusError> {
        let mode = self.mode;
        let mut prev: Option<Value> = None;
        let mut remaining = listeners.iter();

        while let Some(listener) = remaining.next() {
            let piped;
            let link_args: &[Value] = match (&prev, mode) {
                (Some(value), ReturnMode::Pipe) => {
                    piped = with_head(args, value.clone());
                    &piped
                }
                _ => args,
            };

            let Some(call_args) = self.admit(listener, link_args)? else {
                continue;
            };
            let Some(last) = listener.reserve_call() else {
                continue;
            };
            let reply = self.invoke(listener, call_args)?;
            self.complete(listener, last);

            match reply {
                Reply::Ready(value) => {
                    if mode.stops_at(&value) {
                        return Ok(Outcome::Ready(value));
                    }
                    prev = Some(value);
                }
                Reply::Pending(head) => {
                    // The carried value is not known yet, so the remaining
                    // links are admitted against the trigger's own arguments.
                    // PIPE links get their arguments rebuilt once the value
                    // arrives; filters and start gates have already run.
                    let mut links = Vec::new();
                    for listener in remaining {
                        if let Some(link_args) = self.admit(listener, args)? {
                            let Some(last) = listener.reserve_call() else {
                                continue;
                            };
                            self.complete(listener, last);
                            links.push(Link {
                                listener: Arc::clone(listener),
                                args: link_args,
                            });
                        }
                    }
                    return Ok(Outcome::Pending(chain(
                        Arc::clone(&self.invoker),
                        mode,
                        args.to_vec(),
                        head,
                        links,
                    )));
                }
            }
        }

        Ok(Outcome::Ready(match mode {
            ReturnMode::Pipe => prev.unwrap_or(Value::Null),
            _ => Value::Null,
        }))
    }
}

/// Continue a chain after its first pending link.
fn chain(
    invoker: Arc<Invoker>,
    mode: ReturnMode,
    args: Args,
    head: PendingValue,
    links: Vec<Link>,
) -> PendingValue {
    async move {
        let mut prev = head.await?;

        for link in links {
            if mode.stops_at(&prev) {
                return Ok(prev);
            }
            let call_args = if mode == ReturnMode::Pipe {
                invoker.prepare(&link.listener, &with_head(&args, prev))?
            } else {
                link.args
            };
            prev = invoker.call(&link.listener, call_args)?.settle().await?;
        }

        Ok(match mode {
            ReturnMode::Pipe => prev,
            _ if mode.stops_at(&prev) => prev,
            _ => Value::Null,
        })
    }
    .boxed()
}

/// Replace the first argument with the carried chain value.
fn with_head(args: &[Value], head: Value) -> Args {
    let mut out = args.to_vec();
    match out.first_mut() {
        Some(first) => *first = head,
        None => out.push(head),
    }
    out
}

// =============================================================================
// Folding
// =============================================================================

fn settled(reply: Reply) -> Outcome {
    match reply {
        Reply::Ready(value) => Outcome::Ready(value),
        Reply::Pending(fut) => Outcome::Pending(fut),
    }
}

/// Fold the replies of an independent run.
fn fold(mode: ReturnMode, mut replies: Vec<Reply>) -> Outcome {
    match mode {
        ReturnMode::Raw => return Outcome::Raw(replies),
        ReturnMode::Last => {
            return replies
                .pop()
                .map(settled)
                .unwrap_or(Outcome::Ready(Value::Null))
        }
        _ => {}
    }

    if replies.iter().any(Reply::is_pending) {
        let joined = future::try_join_all(replies.into_iter().map(Reply::into_future));
        return Outcome::Pending(
            joined
                .map(move |res| res.map(|values| combine(mode, values)))
                .boxed(),
        );
    }

    let values = replies
        .into_iter()
        .filter_map(|reply| match reply {
            Reply::Ready(value) => Some(value),
            Reply::Pending(_) => None,
        })
        .collect();
    Outcome::Ready(combine(mode, values))
}

fn combine(mode: ReturnMode, values: Vec<Value>) -> Value {
    match mode {
        ReturnMode::All => Value::Array(values),
        ReturnMode::Concat => Value::Array(
            values
                .into_iter()
                .flat_map(|value| match value {
                    Value::Array(items) => items,
                    Value::Null => Vec::new(),
                    other => vec![other],
                })
                .collect(),
        ),
        ReturnMode::Merge => {
            let mut merged = Map::new();
            for value in values {
                if let Value::Object(object) = value {
                    merged.extend(object);
                }
            }
            Value::Object(merged)
        }
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::EventOptions;
    use crate::listener::ListenerOptions;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn channel() -> Arc<EventChannel> {
        Arc::new(EventChannel::new("e"))
    }

    fn on(channel: &EventChannel, callback: Callback) -> ListenerId {
        channel.register(callback, ListenerOptions::new()).0.id()
    }

    fn counting(counter: &Arc<AtomicUsize>, value: Value) -> Callback {
        let counter = Arc::clone(counter);
        Callback::sync(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            value.clone()
        })
    }

    fn dispatch(
        channel: &Arc<EventChannel>,
        args: Args,
        mode: ReturnMode,
        tags: &[String],
        only: Option<ListenerId>,
    ) -> Result<Outcome, BusError> {
        super::dispatch(channel, args, mode, tags, only, &|_: &str| {})
    }

    fn run(channel: &Arc<EventChannel>, mode: ReturnMode, args: Args) -> Value {
        dispatch(channel, args, mode, &[], None)
            .unwrap()
            .ready()
            .expect("outcome should be immediate")
    }

    fn as_i64(args: &[Value]) -> i64 {
        args.first().and_then(Value::as_i64).unwrap_or(0)
    }

    #[test]
    fn test_all_collects_in_registration_order() {
        let c = channel();
        on(&c, Callback::sync(|_| 1));
        on(&c, Callback::sync(|_| 2));
        assert_eq!(run(&c, ReturnMode::All, vec![]), json!([1, 2]));
    }

    #[test]
    fn test_merge_later_keys_win() {
        let c = channel();
        on(&c, Callback::sync(|_| json!({"a": 1, "b": 0})));
        on(&c, Callback::sync(|_| json!({"b": 2})));
        on(&c, Callback::sync(|_| json!("not an object")));
        assert_eq!(run(&c, ReturnMode::Merge, vec![]), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_concat_flattens_one_level() {
        let c = channel();
        on(&c, Callback::sync(|_| json!([1])));
        on(&c, Callback::sync(|_| json!([2, [3]])));
        on(&c, Callback::sink(|_| {}));
        on(&c, Callback::sync(|_| 4));
        assert_eq!(run(&c, ReturnMode::Concat, vec![]), json!([1, 2, [3], 4]));
    }

    #[test]
    fn test_first_skips_remaining_listeners() {
        let c = channel();
        let second = Arc::new(AtomicUsize::new(0));
        on(&c, Callback::sync(|_| 1));
        on(&c, counting(&second, json!(2)));
        assert_eq!(run(&c, ReturnMode::First, vec![]), json!(1));
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_last_returns_final_value() {
        let c = channel();
        on(&c, Callback::sync(|_| 1));
        on(&c, Callback::sync(|_| 2));
        assert_eq!(run(&c, ReturnMode::Last, vec![]), json!(2));
    }

    #[test]
    fn test_pipe_threads_value() {
        let c = channel();
        on(&c, Callback::sync(|args| as_i64(&args) * 2));
        on(&c, Callback::sync(|args| {
            let n = as_i64(&args);
            n * n
        }));
        assert_eq!(run(&c, ReturnMode::Pipe, vec![json!(1)]), json!(4));
    }

    #[test]
    fn test_pipe_without_listeners_is_identity() {
        let c = channel();
        assert_eq!(run(&c, ReturnMode::Pipe, vec![json!(5), json!(6)]), json!(5));
        assert_eq!(run(&c, ReturnMode::Pipe, vec![]), Value::Null);
    }

    #[test]
    fn test_empty_channel_values_per_mode() {
        let c = channel();
        assert_eq!(run(&c, ReturnMode::All, vec![]), json!([]));
        assert_eq!(run(&c, ReturnMode::Concat, vec![]), json!([]));
        assert_eq!(run(&c, ReturnMode::Merge, vec![]), json!({}));
        assert_eq!(run(&c, ReturnMode::Raw, vec![]), json!([]));
        assert_eq!(run(&c, ReturnMode::First, vec![json!(1)]), Value::Null);
    }

    #[test]
    fn test_pipe_skipped_link_carries_last_executed_value() {
        let c = channel();
        on(&c, Callback::sync(|args| as_i64(&args) + 1));
        c.register(
            Callback::sync(|_| 100),
            ListenerOptions::new().with_start(2),
        );
        on(&c, Callback::sync(|args| as_i64(&args) * 10));
        assert_eq!(run(&c, ReturnMode::Pipe, vec![json!(1)]), json!(20));
    }

    #[test]
    fn test_pipe_every_link_skipped_is_null() {
        let c = channel();
        c.register(Callback::sync(|_| 1), ListenerOptions::new().with_start(3));
        assert_eq!(run(&c, ReturnMode::Pipe, vec![json!(9)]), Value::Null);
    }

    #[test]
    fn test_pipe_applies_transforms_after_substitution() {
        let c = channel();
        c.register(
            Callback::sync(|args: Args| args.iter().filter_map(Value::as_i64).sum::<i64>()),
            ListenerOptions::new().with_append(vec![json!(10)]),
        );
        c.register(
            Callback::sync(|args: Args| json!(args)),
            ListenerOptions::new().with_append(vec![json!("x")]),
        );
        assert_eq!(
            run(&c, ReturnMode::Pipe, vec![json!(1), json!(2)]),
            json!([13, 2, "x"])
        );
    }

    #[test]
    fn test_until_false_short_circuits() {
        let c = channel();
        let second = Arc::new(AtomicUsize::new(0));
        on(&c, Callback::sync(|_| false));
        on(&c, counting(&second, json!(2)));
        assert_eq!(run(&c, ReturnMode::UntilFalse, vec![]), json!(false));
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_until_true_exhausted_returns_null() {
        let c = channel();
        on(&c, Callback::sync(|_| false));
        on(&c, Callback::sync(|_| 1));
        assert_eq!(run(&c, ReturnMode::UntilTrue, vec![]), Value::Null);
    }

    #[test]
    fn test_first_non_empty() {
        let c = channel();
        let third = Arc::new(AtomicUsize::new(0));
        on(&c, Callback::sink(|_| {}));
        on(&c, Callback::sync(|_| 0));
        on(&c, counting(&third, json!("late")));
        assert_eq!(run(&c, ReturnMode::FirstNonEmpty, vec![]), json!(0));
        assert_eq!(third.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_fire_and_forget_returns_null() {
        let c = channel();
        let calls = Arc::new(AtomicUsize::new(0));
        on(&c, counting(&calls, json!(1)));
        on(&c, counting(&calls, json!(2)));
        assert_eq!(run(&c, ReturnMode::FireAndForget, vec![]), Value::Null);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_raw_keeps_replies() {
        let c = channel();
        on(&c, Callback::sync(|_| 1));
        on(&c, Callback::future(|_| async { Ok(json!(2)) }));
        let outcome = dispatch(&c, vec![], ReturnMode::Raw, &[], None).unwrap();
        match outcome {
            Outcome::Raw(replies) => {
                assert_eq!(replies.len(), 2);
                assert!(!replies[0].is_pending());
                assert!(replies[1].is_pending());
            }
            other => panic!("expected raw outcome, got {:?}", other),
        }
    }

    #[test]
    fn test_limit_unregisters_listener() {
        let c = channel();
        let calls = Arc::new(AtomicUsize::new(0));
        c.register(counting(&calls, json!(1)), ListenerOptions::new().with_limit(2));
        for _ in 0..4 {
            let _ = run(&c, ReturnMode::FireAndForget, vec![]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(c.listener_count(), 0);
    }

    #[test]
    fn test_failed_call_does_not_use_up_limit() {
        let c = channel();
        let fail = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let flag = Arc::clone(&fail);
        c.register(
            Callback::new(move |_| {
                if flag.load(Ordering::SeqCst) {
                    anyhow::bail!("not yet");
                }
                Ok(Reply::ready(1))
            }),
            ListenerOptions::new().once(),
        );
        assert!(dispatch(&c, vec![], ReturnMode::All, &[], None).is_err());
        assert_eq!(c.listener_count(), 1);

        fail.store(false, Ordering::SeqCst);
        assert_eq!(run(&c, ReturnMode::All, vec![]), json!([1]));
        assert_eq!(c.listener_count(), 0);
    }

    #[test]
    fn test_drained_hook_runs_when_last_listener_expires() {
        let c = channel();
        c.register(Callback::sync(|_| 1), ListenerOptions::new().once());
        c.register(Callback::sync(|_| 2), ListenerOptions::new().with_limit(2));
        let drained = std::sync::Mutex::new(Vec::new());
        let hook = |name: &str| drained.lock().unwrap().push(name.to_string());

        super::dispatch(&c, vec![], ReturnMode::All, &[], None, &hook).unwrap().detach();
        assert!(drained.lock().unwrap().is_empty());
        super::dispatch(&c, vec![], ReturnMode::All, &[], None, &hook).unwrap().detach();
        assert_eq!(drained.lock().unwrap().as_slice(), &["e".to_string()]);
    }

    #[test]
    fn test_start_skips_early_attempts() {
        let c = channel();
        let calls = Arc::new(AtomicUsize::new(0));
        c.register(counting(&calls, json!(1)), ListenerOptions::new().with_start(3));
        let _ = run(&c, ReturnMode::FireAndForget, vec![]);
        let _ = run(&c, ReturnMode::FireAndForget, vec![]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let _ = run(&c, ReturnMode::FireAndForget, vec![]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_channel_filter_skips_without_counting() {
        let c = channel();
        c.configure(
            EventOptions::new()
                .with_filter_context("allow-b")
                .with_filter(|ctx, _args, listener| {
                    listener.extra_data() == Some(&json!("b")) && ctx == Some(&json!("allow-b"))
                }),
        );
        c.register(
            Callback::sync(|_| "a"),
            ListenerOptions::new().with_extra_data("a"),
        );
        c.register(
            Callback::sync(|_| "b"),
            ListenerOptions::new().with_extra_data("b"),
        );
        assert_eq!(run(&c, ReturnMode::All, vec![]), json!(["b"]));
        let counts: Vec<u32> = c.infos().iter().map(|info| info.count).collect();
        assert_eq!(counts, vec![0, 1]);
    }

    #[test]
    fn test_listener_filter_sees_context_and_args() {
        let c = channel();
        c.register(
            Callback::sync(|_| "hit"),
            ListenerOptions::new()
                .with_context(json!({"min": 2}))
                .with_filter(|ctx, args| {
                    let min = ctx.and_then(|c| c["min"].as_i64()).unwrap_or(0);
                    as_i64(args) >= min
                }),
        );
        assert_eq!(run(&c, ReturnMode::All, vec![json!(1)]), json!([]));
        assert_eq!(run(&c, ReturnMode::All, vec![json!(3)]), json!(["hit"]));
    }

    #[test]
    fn test_tag_scope_filters_listeners() {
        let c = channel();
        c.register(Callback::sync(|_| "a"), ListenerOptions::new().with_tag("a"));
        c.register(Callback::sync(|_| "ab"), ListenerOptions::new().with_tags(["a", "b"]));
        c.register(Callback::sync(|_| "b"), ListenerOptions::new().with_tag("b"));
        c.register(Callback::sync(|_| "none"), ListenerOptions::new());

        let scoped = dispatch(&c, vec![], ReturnMode::All, &["a".to_string()], None)
            .unwrap()
            .ready();
        assert_eq!(scoped, Some(json!(["a", "ab"])));
        assert_eq!(run(&c, ReturnMode::All, vec![]), json!(["a", "ab", "b", "none"]));
    }

    #[test]
    fn test_sync_error_aborts_remaining_listeners() {
        let c = channel();
        let second = Arc::new(AtomicUsize::new(0));
        on(&c, Callback::new(|_| anyhow::bail!("boom")));
        on(&c, counting(&second, json!(1)));
        let err = dispatch(&c, vec![], ReturnMode::All, &[], None).unwrap_err();
        assert!(matches!(err, BusError::Listener { ref event, .. } if event == "e"));
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_only_restricts_to_one_listener() {
        let c = channel();
        on(&c, Callback::sync(|_| 1));
        let id = on(&c, Callback::sync(|_| 2));
        let outcome = dispatch(&c, vec![], ReturnMode::All, &[], Some(id)).unwrap();
        assert_eq!(outcome.ready(), Some(json!([2])));
    }

    #[test]
    fn test_suspended_channel_returns_empty_value() {
        let c = channel();
        let calls = Arc::new(AtomicUsize::new(0));
        on(&c, counting(&calls, json!(1)));
        c.suspend(false);
        assert_eq!(run(&c, ReturnMode::All, vec![]), json!([]));
        assert_eq!(run(&c, ReturnMode::Merge, vec![]), json!({}));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(c.trigger_count(), 0);
    }

    #[test]
    fn test_deferred_listener_needs_runtime() {
        let c = channel();
        c.register(Callback::sync(|_| 1), ListenerOptions::new().deferred());
        let err = dispatch(&c, vec![], ReturnMode::All, &[], None).unwrap_err();
        assert!(matches!(err, BusError::NoRuntime));
    }

    #[tokio::test]
    async fn test_pipe_with_pending_links() {
        let c = channel();
        on(
            &c,
            Callback::future(|args| async move { Ok(json!(as_i64(&args) * 2)) }),
        );
        on(
            &c,
            Callback::future(|args| async move {
                let n = as_i64(&args);
                Ok(json!(n * n))
            }),
        );
        let outcome = dispatch(&c, vec![json!(1)], ReturnMode::Pipe, &[], None).unwrap();
        assert!(outcome.is_pending());
        assert_eq!(outcome.resolve().await.unwrap(), json!(4));
    }

    #[tokio::test]
    async fn test_all_with_mixed_replies() {
        let c = channel();
        on(&c, Callback::sync(|_| 1));
        on(&c, Callback::future(|_| async { Ok(json!(2)) }));
        on(&c, Callback::sync(|_| 3));
        let outcome = dispatch(&c, vec![], ReturnMode::All, &[], None).unwrap();
        assert_eq!(outcome.resolve().await.unwrap(), json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn test_merge_with_pending_replies() {
        let c = channel();
        on(&c, Callback::future(|_| async { Ok(json!({"a": 1})) }));
        on(&c, Callback::sync(|_| json!({"b": 2})));
        let outcome = dispatch(&c, vec![], ReturnMode::Merge, &[], None).unwrap();
        assert_eq!(outcome.resolve().await.unwrap(), json!({"a": 1, "b": 2}));
    }

    #[tokio::test]
    async fn test_deferred_listener_runs_later() {
        let c = channel();
        let calls = Arc::new(AtomicUsize::new(0));
        c.register(
            counting(&calls, json!("late")),
            ListenerOptions::new().with_delay(Duration::from_millis(5)),
        );
        let outcome = dispatch(&c, vec![], ReturnMode::All, &[], None).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.resolve().await.unwrap(), json!(["late"]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_channel_default_delay_applies() {
        let c = channel();
        c.configure(EventOptions::new().deferred());
        let calls = Arc::new(AtomicUsize::new(0));
        on(&c, counting(&calls, json!(1)));
        let outcome = dispatch(&c, vec![], ReturnMode::FireAndForget, &[], None).unwrap();
        assert!(outcome.is_pending());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.resolve().await.unwrap(), Value::Null);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deferred_error_surfaces_on_resolve() {
        let c = channel();
        c.register(
            Callback::new(|_| anyhow::bail!("late failure")),
            ListenerOptions::new().deferred(),
        );
        let outcome = dispatch(&c, vec![], ReturnMode::All, &[], None).unwrap();
        let err = outcome.resolve().await.unwrap_err();
        assert_eq!(err.event(), Some("e"));
        assert!(err.to_string().contains("late failure"));
    }

    #[tokio::test]
    async fn test_until_true_async_chain_stops_at_sentinel() {
        let c = channel();
        let third = Arc::new(AtomicUsize::new(0));
        on(&c, Callback::future(|_| async { Ok(json!(false)) }));
        on(&c, Callback::sync(|_| true));
        on(&c, counting(&third, json!(3)));
        let outcome = dispatch(&c, vec![], ReturnMode::UntilTrue, &[], None).unwrap();
        assert_eq!(outcome.resolve().await.unwrap(), json!(true));
        assert_eq!(third.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_until_false_async_chain_exhausted_is_null() {
        let c = channel();
        on(&c, Callback::future(|_| async { Ok(json!(true)) }));
        on(&c, Callback::sync(|_| 1));
        let outcome = dispatch(&c, vec![], ReturnMode::UntilFalse, &[], None).unwrap();
        assert_eq!(outcome.resolve().await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_first_non_empty_async_chain() {
        let c = channel();
        on(&c, Callback::future(|_| async { Ok(Value::Null) }));
        on(&c, Callback::sync(|_| "x"));
        on(&c, Callback::sync(|_| "y"));
        let outcome = dispatch(&c, vec![], ReturnMode::FirstNonEmpty, &[], None).unwrap();
        assert_eq!(outcome.resolve().await.unwrap(), json!("x"));
    }

    #[tokio::test]
    async fn test_first_returns_pending_reply() {
        let c = channel();
        on(&c, Callback::future(|_| async { Ok(json!("async")) }));
        on(&c, Callback::sync(|_| "sync"));
        let outcome = dispatch(&c, vec![], ReturnMode::First, &[], None).unwrap();
        assert_eq!(outcome.resolve().await.unwrap(), json!("async"));
    }
}
