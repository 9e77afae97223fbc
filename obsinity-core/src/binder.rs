//! Parameter binders (C8, spec §4.8).
//!
//! The source design binds handler-method parameters by reflecting over
//! their declared types and annotations. Rust handlers are plain closures
//! with no reflective parameter list, so binding is pull-based instead: a
//! handler receives a [`HandlerContext`] and calls accessor methods to pull
//! exactly the attributes/context/throwable/batch it needs, each performing
//! the same coercion rules the source binders specify. This mirrors how
//! `tracing_subscriber::Layer::on_event` hands a `Layer` an `Event` plus a
//! `Context` to query, rather than auto-injecting fields positionally.

use crate::attrs::{AttrMap, AttrValue, FromAttrValue};
use crate::holder::Holder;
use crate::metadata::{Kind, Lifecycle, Outcome};
use crate::throwable::Throwable;

/// Which captured error a throwable-bind pulls (spec §4.4, §4.8).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Selector {
    /// The throwable itself.
    Itself,
    /// Its `source()` (spec's "cause").
    Cause,
    /// The end of its `source()` chain (spec's "root-cause").
    RootCause,
}

impl Selector {
    /// Resolve this selector against a holder's captured throwable.
    pub fn resolve(&self, throwable: &Throwable) -> Option<Throwable> {
        match self {
            Selector::Itself => Some(throwable.clone()),
            Selector::Cause => throwable.cause(),
            Selector::RootCause => throwable.root_cause(),
        }
    }

    /// A stable label, used in [`crate::error::BindingError::MissingThrowable`].
    pub fn label(&self) -> &'static str {
        match self {
            Selector::Itself => "self",
            Selector::Cause => "cause",
            Selector::RootCause => "root-cause",
        }
    }
}

/// The registration-time-declared preconditions a candidate handler must
/// satisfy before it is invoked (spec §4.7.4, §4.8 "throwable bind ...
/// required"). Checked by the dispatch bus's eligibility filter, never by
/// the handler body itself.
#[derive(Clone, Debug, Default)]
pub struct RequiredBindings {
    /// Attribute keys that must be present (and non-null) on the holder.
    pub attrs: Vec<String>,
    /// Context keys that must be present (and non-null) on the holder.
    pub context: Vec<String>,
    /// A throwable selector that must resolve to `Some`, if declared.
    pub throwable: Option<Selector>,
}

impl RequiredBindings {
    /// No required bindings.
    pub fn none() -> Self {
        RequiredBindings::default()
    }
}

/// The read-only view a handler closure is invoked with: the pull surface
/// for attributes, context, throwable selectors, and (at
/// `ROOT_FLOW_FINISHED` only) the accumulated batch.
#[derive(Debug)]
pub struct HandlerContext<'a> {
    holder: &'a Holder,
    lifecycle: Lifecycle,
    outcome: Option<Outcome>,
    batch: Option<&'a [Holder]>,
}

impl<'a> HandlerContext<'a> {
    pub(crate) fn new(
        holder: &'a Holder,
        lifecycle: Lifecycle,
        outcome: Option<Outcome>,
        batch: Option<&'a [Holder]>,
    ) -> Self {
        HandlerContext {
            holder,
            lifecycle,
            outcome,
            batch,
        }
    }

    /// The holder this signal was emitted for (default fallback: holder).
    pub fn holder(&self) -> &Holder {
        self.holder
    }

    /// The phase this signal was emitted for (default fallback: lifecycle).
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// The outcome, meaningful only at finish phases.
    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    /// The holder's span kind (default fallback: kind, defaulting null to
    /// `INTERNAL` — already guaranteed by [`Kind::default`]).
    pub fn kind(&self) -> Kind {
        self.holder.kind()
    }

    /// Pull and coerce a single attribute (spec §4.8 "attribute pull").
    pub fn attr<T: FromAttrValue>(&self, key: &str) -> Option<T> {
        match self.holder.attributes().get(key) {
            Some(AttrValue::Null) | None => None,
            Some(v) => T::coerce(v),
        }
    }

    /// Pull and coerce a single context value (spec §4.8 "context pull").
    pub fn context<T: FromAttrValue>(&self, key: &str) -> Option<T> {
        match self.holder.event_context().get(key) {
            Some(AttrValue::Null) | None => None,
            Some(v) => T::coerce(v),
        }
    }

    /// A defensive copy of every attribute (spec §4.8 "attribute pull-all").
    pub fn all_attrs(&self) -> AttrMap {
        self.holder.attributes_snapshot()
    }

    /// A defensive copy of every context value (spec §4.8 "context
    /// pull-all").
    pub fn all_context(&self) -> AttrMap {
        self.holder.event_context_snapshot()
    }

    /// The captured throwable itself (default fallback: throwable).
    pub fn throwable(&self) -> Option<&Throwable> {
        self.holder.throwable()
    }

    /// The throwable's cause, if any.
    pub fn cause(&self) -> Option<Throwable> {
        self.holder.throwable().and_then(Throwable::cause)
    }

    /// The throwable's root cause, if any.
    pub fn root_cause(&self) -> Option<Throwable> {
        self.holder.throwable().and_then(Throwable::root_cause)
    }

    /// The root batch, only `Some` at `ROOT_FLOW_FINISHED` (spec §4.8
    /// "batch bind").
    pub fn batch(&self) -> Option<&[Holder]> {
        self.batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{SpanId, TraceId};

    fn make_holder() -> Holder {
        let trace = TraceId::generate();
        let span = SpanId::generate();
        let mut h = Holder::new("x", Kind::Internal, trace, span, None, trace, false);
        h.put_attr("count", 3i64);
        h.put_context("request_id", "abc");
        h
    }

    #[test]
    fn attr_and_context_pulls_coerce() {
        let holder = make_holder();
        let ctx = HandlerContext::new(&holder, Lifecycle::FlowFinished, Some(Outcome::Success), None);
        assert_eq!(ctx.attr::<i64>("count"), Some(3));
        assert_eq!(ctx.attr::<f64>("count"), Some(3.0));
        assert_eq!(ctx.context::<String>("request_id"), Some("abc".to_string()));
        assert_eq!(ctx.attr::<bool>("count"), None);
    }

    #[test]
    fn batch_is_none_outside_root_flow_finished() {
        let holder = make_holder();
        let ctx = HandlerContext::new(&holder, Lifecycle::FlowFinished, Some(Outcome::Success), None);
        assert!(ctx.batch().is_none());
    }

    #[test]
    fn missing_attribute_pulls_to_none_not_default() {
        let holder = make_holder();
        let ctx = HandlerContext::new(&holder, Lifecycle::FlowStarted, None, None);
        assert_eq!(ctx.attr::<i64>("absent"), None);
    }
}
