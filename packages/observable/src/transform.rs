//! Argument transforms applied between a trigger and each listener.
//!
//! A transform either splices a fixed list of values into the arguments or
//! computes that list from the listener and the trigger arguments. Three slots
//! exist, on every listener and as channel-wide defaults:
//!
//! | Slot | Effect |
//! |------|--------|
//! | prepend | values go in front of the trigger arguments |
//! | append | values go after the trigger arguments |
//! | replace | values replace the trigger arguments entirely |
//!
//! Prepend and append win over replace: if either is set (on the listener or
//! the channel), replace is ignored.
//!
//! Arguments are recomputed on every trigger. A computed transform may look at
//! live listener state such as [`ListenerRecord::count`].

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::core::Args;
use crate::error::BusError;
use crate::listener::ListenerRecord;

type ComputeFn = dyn Fn(&ListenerRecord, &[Value]) -> anyhow::Result<Args> + Send + Sync;

/// One prepend/append/replace transform.
#[derive(Clone)]
pub enum ArgTransform {
    /// Splice these values.
    Fixed(Args),
    /// Compute the values from the listener and the trigger arguments.
    Computed(Arc<ComputeFn>),
}

impl ArgTransform {
    /// A transform splicing fixed values.
    pub fn fixed(values: impl IntoIterator<Item = Value>) -> Self {
        ArgTransform::Fixed(values.into_iter().collect())
    }

    /// A transform computing its values per invocation.
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(&ListenerRecord, &[Value]) -> anyhow::Result<Args> + Send + Sync + 'static,
    {
        ArgTransform::Computed(Arc::new(f))
    }

    fn values(&self, listener: &ListenerRecord, args: &[Value]) -> anyhow::Result<Args> {
        match self {
            ArgTransform::Fixed(values) => Ok(values.clone()),
            ArgTransform::Computed(f) => f(listener, args),
        }
    }
}

impl fmt::Debug for ArgTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgTransform::Fixed(values) => f.debug_tuple("Fixed").field(values).finish(),
            ArgTransform::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

impl From<Args> for ArgTransform {
    fn from(values: Args) -> Self {
        ArgTransform::Fixed(values)
    }
}

/// The three transform slots of a listener or a channel.
#[derive(Debug, Clone, Default)]
pub struct ArgTransforms {
    /// Values placed before the trigger arguments.
    pub prepend: Option<ArgTransform>,
    /// Values placed after the trigger arguments.
    pub append: Option<ArgTransform>,
    /// Values replacing the trigger arguments.
    pub replace: Option<ArgTransform>,
}

impl ArgTransforms {
    /// Returns true if no slot is set.
    pub fn is_empty(&self) -> bool {
        self.prepend.is_none() && self.append.is_none() && self.replace.is_none()
    }

    /// Fill unset slots from `other`.
    pub(crate) fn merge_from(&mut self, other: ArgTransforms) {
        if other.prepend.is_some() {
            self.prepend = other.prepend;
        }
        if other.append.is_some() {
            self.append = other.append;
        }
        if other.replace.is_some() {
            self.replace = other.replace;
        }
    }
}

/// Compute the arguments one listener is invoked with.
///
/// Each slot prefers the listener's own transform over the channel default.
pub(crate) fn prepare_args(
    event: &str,
    listener: &ListenerRecord,
    defaults: &ArgTransforms,
    args: &[Value],
) -> Result<Args, BusError> {
    let own = listener.transforms();
    let prepend = own.prepend.as_ref().or(defaults.prepend.as_ref());
    let append = own.append.as_ref().or(defaults.append.as_ref());
    let replace = own.replace.as_ref().or(defaults.replace.as_ref());

    let eval = |t: &ArgTransform| {
        t.values(listener, args)
            .map_err(|e| BusError::transform(event, e))
    };

    if prepend.is_some() || append.is_some() {
        let mut out = match prepend {
            Some(t) => eval(t)?,
            None => Vec::with_capacity(args.len()),
        };
        out.extend_from_slice(args);
        if let Some(t) = append {
            out.extend(eval(t)?);
        }
        return Ok(out);
    }

    if let Some(t) = replace {
        return eval(t);
    }

    Ok(args.to_vec())
}
