//! Wiring between buses and external emitters.
//!
//! - [`Observable::relay`] re-triggers events of another bus on this one.
//! - [`Observable::proxy`] hands out a stable callback that triggers an event
//!   here; it can be registered anywhere a [`Callback`] is accepted.
//! - [`EventSource`] bridges a push-style emitter: while a name has
//!   listeners on this bus, a proxy for it is subscribed on every source that
//!   accepts the name.
//!
//! Everything here goes through the public subscribe and trigger operations.
//! Callbacks hold the target bus weakly, so wiring never keeps a bus alive.

use std::fmt;
use std::sync::{Arc, Weak};

use serde_json::Value;
use tracing::{debug, warn};

use crate::bus::{BusInner, Observable};
use crate::core::{Callback, Reply, ReturnMode, ALL_EVENTS};
use crate::listener::ListenerOptions;

/// A push-style emitter the bus can mirror.
///
/// Implementations subscribe the given proxy to their own event named
/// `event` and call it with the emitted arguments.
pub trait EventSource: Send + Sync {
    /// Unique name of the source on one bus.
    fn name(&self) -> &str;

    /// Whether this source emits `event`.
    fn accepts(&self, _event: &str) -> bool {
        true
    }

    /// Mode the proxies for this source trigger with.
    fn proxy_mode(&self) -> ReturnMode {
        ReturnMode::FireAndForget
    }

    /// Start forwarding `event` to `proxy`.
    ///
    /// `options` are the options of the bus listener that caused the
    /// subscription (defaults when bridging names that already had listeners).
    fn subscribe(&self, event: &str, proxy: Callback, options: &ListenerOptions) -> anyhow::Result<()>;

    /// Stop forwarding `event` to `proxy`.
    fn unsubscribe(&self, event: &str, proxy: &Callback) -> anyhow::Result<()>;
}

/// How relayed events are re-triggered.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Name to trigger instead of the source event's name.
    pub trigger_name: Option<String>,
    /// Prefix for relayed names when relaying `"*"`.
    pub prefix: Option<String>,
    pub mode: ReturnMode,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            trigger_name: None,
            prefix: None,
            mode: ReturnMode::FireAndForget,
        }
    }
}

impl RelayOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trigger_name(mut self, name: impl Into<String>) -> Self {
        self.trigger_name = Some(name.into());
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_mode(mut self, mode: ReturnMode) -> Self {
        self.mode = mode;
        self
    }
}

/// A relay this bus receives from another bus.
pub(crate) struct RelayLink {
    callback: Callback,
    source: Weak<BusInner>,
    event: String,
}

impl fmt::Debug for RelayLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayLink")
            .field("event", &self.event)
            .finish_non_exhaustive()
    }
}

impl Observable {
    // =========================================================================
    // Relays
    // =========================================================================

    /// Re-trigger `event` of `source` on this bus.
    ///
    /// The relay listener answers the source with this bus's outcome, so a
    /// collecting trigger on the source sees what this bus collected.
    /// Relaying `"*"` forwards every event under its own name (prefixed with
    /// `options.prefix`). Returns false if the relay already exists.
    pub fn relay(&self, source: &Observable, event: &str, options: RelayOptions) -> bool {
        let source_event = source.key(event);
        let link_key = (source.id(), source_event.clone());
        if self.inner.relays.contains_key(&link_key) {
            return false;
        }

        let target = self.downgrade();
        let relayed = source_event.clone();
        let RelayOptions {
            trigger_name,
            prefix,
            mode,
        } = options;

        let callback = Callback::new(move |args| {
            let Some(target) = Observable::upgrade(&target) else {
                return Ok(Reply::ready(Value::Null));
            };
            let (name, args) = if relayed == ALL_EVENTS {
                let mut args = args.into_iter();
                let Some(Value::String(name)) = args.next() else {
                    return Ok(Reply::ready(Value::Null));
                };
                let name = match &prefix {
                    Some(prefix) => format!("{prefix}{name}"),
                    None => name,
                };
                (name, args.collect())
            } else {
                (trigger_name.clone().unwrap_or_else(|| relayed.clone()), args)
            };
            Ok(target.trigger_with(&name, args, mode)?.into_reply())
        });

        source.on(
            &source_event,
            callback.clone(),
            ListenerOptions::new().with_context(self.id().to_value()),
        );
        self.inner.relays.insert(
            link_key,
            RelayLink {
                callback,
                source: source.downgrade(),
                event: source_event.clone(),
            },
        );
        debug!(source = %source.id(), target = %self.id(), event = %source_event, "relay added");
        true
    }

    /// Stop relaying `event` of `source`.
    pub fn unrelay(&self, source: &Observable, event: &str) -> bool {
        let source_event = source.key(event);
        let Some((_, link)) = self.inner.relays.remove(&(source.id(), source_event)) else {
            return false;
        };
        let context = self.id().to_value();
        source.un(&link.event, &link.callback, Some(&context), None);
        debug!(source = %source.id(), target = %self.id(), event = %link.event, "relay removed");
        true
    }

    /// Check whether `event` of `source` is relayed here.
    pub fn is_relayed(&self, source: &Observable, event: &str) -> bool {
        self.inner
            .relays
            .contains_key(&(source.id(), source.key(event)))
    }

    pub(crate) fn clear_relays(&self) {
        let keys: Vec<_> = self
            .inner
            .relays
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let context = self.id().to_value();
        for key in keys {
            let Some((_, link)) = self.inner.relays.remove(&key) else {
                continue;
            };
            if let Some(source) = Observable::upgrade(&link.source) {
                source.un(&link.event, &link.callback, Some(&context), None);
            }
        }
    }

    // =========================================================================
    // Proxies
    // =========================================================================

    /// A callback that triggers `name` on this bus in `mode`.
    ///
    /// The same callback is returned for the same `(name, mode)`, so it can
    /// be unregistered wherever it was registered.
    pub fn proxy(&self, name: &str, mode: ReturnMode) -> Callback {
        let key = self.key(name);
        if let Some(existing) = self.inner.proxies.get(&(key.clone(), mode)) {
            return existing.value().clone();
        }
        let target = self.downgrade();
        let event = key.clone();
        self.inner
            .proxies
            .entry((key, mode))
            .or_insert_with(|| {
                Callback::new(move |args| match Observable::upgrade(&target) {
                    Some(target) => Ok(target.trigger_with(&event, args, mode)?.into_reply()),
                    None => Ok(Reply::ready(Value::Null)),
                })
            })
            .value()
            .clone()
    }

    // =========================================================================
    // Event sources
    // =========================================================================

    /// Bridge `source`. Names that already have listeners are subscribed
    /// right away. Returns false if a source with that name is registered.
    pub fn add_event_source(&self, source: Arc<dyn EventSource>) -> bool {
        {
            let mut sources = self
                .inner
                .sources
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if sources.iter().any(|s| s.name() == source.name()) {
                return false;
            }
            sources.push(Arc::clone(&source));
        }
        debug!(bus = %self.id(), source = %source.name(), "event source added");

        let defaults = ListenerOptions::new();
        for channel in self.all_channels() {
            if channel.name() != ALL_EVENTS && channel.listener_count() > 0 {
                self.bridge(&source, channel.name(), &defaults);
            }
        }
        true
    }

    /// Unsubscribe every proxy from the source named `name` and forget it.
    pub fn remove_event_source(&self, name: &str) -> bool {
        let removed = {
            let mut sources = self
                .inner
                .sources
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let pos = sources.iter().position(|s| s.name() == name);
            pos.map(|pos| sources.remove(pos))
        };
        let Some(source) = removed else {
            return false;
        };
        self.unbridge_all(&source);
        debug!(bus = %self.id(), source = %name, "event source removed");
        true
    }

    pub fn has_event_source(&self, name: &str) -> bool {
        self.sources().iter().any(|s| s.name() == name)
    }

    pub(crate) fn clear_event_sources(&self) {
        let sources = std::mem::take(
            &mut *self
                .inner
                .sources
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for source in sources {
            self.unbridge_all(&source);
        }
    }

    fn sources(&self) -> Vec<Arc<dyn EventSource>> {
        self.inner
            .sources
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Subscribe proxies for `event` on every accepting source.
    pub(crate) fn bridge_sources(&self, event: &str, options: &ListenerOptions) {
        if event == ALL_EVENTS {
            return;
        }
        for source in self.sources() {
            self.bridge(&source, event, options);
        }
    }

    /// Unsubscribe the proxies for `event` from every source.
    pub(crate) fn unbridge_sources(&self, event: &str) {
        for source in self.sources() {
            self.unbridge(&source, event);
        }
    }

    fn bridge(&self, source: &Arc<dyn EventSource>, event: &str, options: &ListenerOptions) {
        if !source.accepts(event) {
            return;
        }
        let key = (source.name().to_string(), event.to_string());
        if !self.inner.bridged.insert(key.clone()) {
            return;
        }
        let proxy = self.proxy(event, source.proxy_mode());
        match source.subscribe(event, proxy, options) {
            Ok(()) => debug!(source = %source.name(), event, "proxy subscribed"),
            Err(e) => {
                self.inner.bridged.remove(&key);
                warn!(source = %source.name(), event, error = %e, "event source subscribe failed");
            }
        }
    }

    fn unbridge(&self, source: &Arc<dyn EventSource>, event: &str) {
        let key = (source.name().to_string(), event.to_string());
        if self.inner.bridged.remove(&key).is_none() {
            return;
        }
        let proxy = self.proxy(event, source.proxy_mode());
        match source.unsubscribe(event, &proxy) {
            Ok(()) => debug!(source = %source.name(), event, "proxy unsubscribed"),
            Err(e) => warn!(source = %source.name(), event, error = %e, "event source unsubscribe failed"),
        }
    }

    fn unbridge_all(&self, source: &Arc<dyn EventSource>) {
        let events: Vec<String> = self
            .inner
            .bridged
            .iter()
            .filter(|entry| entry.key().0 == source.name())
            .map(|entry| entry.key().1.clone())
            .collect();
        for event in events {
            self.unbridge(source, &event);
        }
    }
}
