//! Subscription-only view of a bus.

use serde_json::Value;

use crate::bus::Observable;
use crate::core::{Callback, ListenerId};
use crate::listener::ListenerOptions;

/// Handle that can subscribe to a bus but not trigger, suspend or destroy it.
///
/// Hand this to collaborators that should observe events only.
#[derive(Debug, Clone)]
pub struct PublicApi {
    bus: Observable,
}

impl PublicApi {
    pub fn on(&self, name: &str, callback: Callback, options: ListenerOptions) -> ListenerId {
        self.bus.on(name, callback, options)
    }

    pub fn once(&self, name: &str, callback: Callback, options: ListenerOptions) -> ListenerId {
        self.bus.once(name, callback, options)
    }

    pub fn un(&self, name: &str, callback: &Callback, context: Option<&Value>, tag: Option<&str>) -> bool {
        self.bus.un(name, callback, context, tag)
    }

    pub fn un_id(&self, name: &str, id: ListenerId) -> bool {
        self.bus.un_id(name, id)
    }

    pub fn has(
        &self,
        name: Option<&str>,
        callback: Option<&Callback>,
        context: Option<&Value>,
        tag: Option<&str>,
    ) -> bool {
        self.bus.has(name, callback, context, tag)
    }
}

impl Observable {
    /// A subscription-only handle to this bus.
    pub fn public_api(&self) -> PublicApi {
        PublicApi { bus: self.clone() }
    }
}
