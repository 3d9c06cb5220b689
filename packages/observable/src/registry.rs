//! Ordered listener registry for one channel.
//!
//! # Ordering
//!
//! - Listeners run in insertion order; `first` inserts at the front.
//! - Once any listener was registered as `AlwaysFirst` or `AlwaysLast` the
//!   registry switches to sorted mode for good: after every insertion the list
//!   is stably sorted by tier, so `AlwaysFirst` listeners precede everything,
//!   `AlwaysLast` listeners follow everything, and each tier keeps its
//!   current relative order.
//!
//! # Identity
//!
//! A `(callback, context)` pair is registered at most once. Registering it
//! again returns the existing handle.

use std::sync::Arc;

use serde_json::Value;

use crate::core::{Callback, ListenerId};
use crate::listener::{ListenerOptions, ListenerRecord, Priority};

/// Result of a registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Registration {
    /// A new record was inserted.
    Added(ListenerId),
    /// The pair was already registered.
    Existing(ListenerId),
}

impl Registration {
    pub(crate) fn id(&self) -> ListenerId {
        match self {
            Registration::Added(id) | Registration::Existing(id) => *id,
        }
    }
}

/// Ordered collection of listener records.
#[derive(Debug, Default)]
pub(crate) struct ListenerRegistry {
    listeners: Vec<Arc<ListenerRecord>>,
    next_index: u64,
    sorted: bool,
}

impl ListenerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a listener.
    pub(crate) fn register(&mut self, callback: Callback, options: ListenerOptions) -> Registration {
        if let Some(existing) = self
            .listeners
            .iter()
            .find(|l| l.matches(&callback, options.context.as_ref()))
        {
            return Registration::Existing(existing.id());
        }

        let front = options.first || options.priority == Priority::AlwaysFirst;
        if options.priority != Priority::Normal {
            self.sorted = true;
        }

        let record = Arc::new(ListenerRecord::new(callback, options, self.next_index));
        self.next_index += 1;
        let id = record.id();

        if front {
            self.listeners.insert(0, record);
        } else {
            self.listeners.push(record);
        }

        if self.sorted {
            // Vec::sort_by_key is stable: current order breaks ties.
            self.listeners.sort_by_key(|l| l.priority());
        }

        Registration::Added(id)
    }

    /// Remove the first record matching callback, context and (optionally) tag.
    pub(crate) fn unregister(
        &mut self,
        callback: &Callback,
        context: Option<&Value>,
        tag: Option<&str>,
    ) -> Option<Arc<ListenerRecord>> {
        let pos = self.listeners.iter().position(|l| {
            l.matches(callback, context) && tag.map_or(true, |t| l.has_tag(t))
        })?;
        Some(self.listeners.remove(pos))
    }

    /// Remove a record by handle.
    pub(crate) fn unregister_id(&mut self, id: ListenerId) -> Option<Arc<ListenerRecord>> {
        let pos = self.listeners.iter().position(|l| l.id() == id)?;
        Some(self.listeners.remove(pos))
    }

    /// Check for listeners.
    ///
    /// Without a callback: any listener (carrying `tag`, if given).
    /// With a callback: that exact `(callback, context, tag)` registration.
    pub(crate) fn has_listener(
        &self,
        callback: Option<&Callback>,
        context: Option<&Value>,
        tag: Option<&str>,
    ) -> bool {
        let tagged = |l: &Arc<ListenerRecord>| tag.map_or(true, |t| l.has_tag(t));
        match callback {
            Some(cb) => self
                .listeners
                .iter()
                .any(|l| l.matches(cb, context) && tagged(l)),
            None => self.listeners.iter().any(tagged),
        }
    }

    pub(crate) fn contains_id(&self, id: ListenerId) -> bool {
        self.listeners.iter().any(|l| l.id() == id)
    }

    /// Drop every listener, or only those carrying `tag`. Returns the number removed.
    pub(crate) fn remove_all(&mut self, tag: Option<&str>) -> usize {
        let before = self.listeners.len();
        match tag {
            Some(t) => self.listeners.retain(|l| !l.has_tag(t)),
            None => self.listeners.clear(),
        }
        before - self.listeners.len()
    }

    /// Immutable copy of the current order for one dispatch.
    pub(crate) fn snapshot(&self) -> Vec<Arc<ListenerRecord>> {
        self.listeners.clone()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<ListenerRecord>> {
        self.listeners.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}
