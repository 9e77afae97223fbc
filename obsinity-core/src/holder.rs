//! The [`Holder`] model (C2): the in-memory record of one flow or step
//! while it is active, and the [`Event`] it folds into its parent when it is
//! a step (spec §3, §4.2).

use std::fmt;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use parking_lot::Mutex;

use crate::attrs::AttrMap;
use crate::ids::{SpanId, TraceId};
use crate::metadata::Kind;
use crate::throwable::Throwable;

/// A holder shared between the thread-local stack, the per-root batch, and
/// (briefly, synchronously) the dispatch bus. Interior mutability is used
/// rather than unique ownership because a logical task carrying a holder may
/// resume on a different worker thread of a multi-threaded async runtime,
/// even though only one thread ever touches it at a time (spec §5).
pub type HolderHandle = Arc<Mutex<Holder>>;

/// The completion status of a holder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Status {
    /// No explicit status has been set yet.
    Unset,
    /// The holder completed without error.
    Ok,
    /// The holder completed with an error, with an optional message.
    Error(Option<String>),
}

/// A folded step: the record appended to a parent holder's `events` when a
/// step-holder finishes (spec §3, §4.3 step 5).
#[derive(Clone, Debug)]
pub struct Event {
    name: String,
    epoch_start: SystemTime,
    epoch_end: SystemTime,
    attributes: AttrMap,
    event_context: AttrMap,
    throwable: Option<Throwable>,
}

impl Event {
    pub(crate) fn new(
        name: String,
        epoch_start: SystemTime,
        epoch_end: SystemTime,
        attributes: AttrMap,
        event_context: AttrMap,
        throwable: Option<Throwable>,
    ) -> Self {
        Event {
            name,
            epoch_start,
            epoch_end,
            attributes,
            event_context,
            throwable,
        }
    }

    /// The folded step's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// When the step started.
    pub fn epoch_start(&self) -> SystemTime {
        self.epoch_start
    }

    /// When the step ended.
    pub fn epoch_end(&self) -> SystemTime {
        self.epoch_end
    }

    /// The step's persisted attributes at the time it folded.
    pub fn attributes(&self) -> &AttrMap {
        &self.attributes
    }

    /// The step's ephemeral event context at the time it folded.
    pub fn event_context(&self) -> &AttrMap {
        &self.event_context
    }

    /// The throwable captured by the step, if any.
    pub fn throwable(&self) -> Option<&Throwable> {
        self.throwable.as_ref()
    }
}

/// The in-memory record of one flow or step during (and briefly after) its
/// active lifetime (spec §3).
#[derive(Clone)]
pub struct Holder {
    name: String,
    kind: Kind,
    trace_id: TraceId,
    span_id: SpanId,
    parent_span_id: Option<SpanId>,
    correlation_id: TraceId,
    start_time: SystemTime,
    end_time: Option<SystemTime>,
    start_mono: Instant,
    end_mono: Option<Instant>,
    attributes: AttrMap,
    event_context: AttrMap,
    events: Vec<Event>,
    status: Status,
    throwable: Option<Throwable>,
    is_step: bool,
}

impl Holder {
    /// Construct a newly-opened holder. `parent_span_id` is `None` iff this
    /// is a root flow holder (spec §3 invariant: "A root holder has no
    /// parent; its `correlationId == traceId`").
    pub fn new(
        name: impl Into<String>,
        kind: Kind,
        trace_id: TraceId,
        span_id: SpanId,
        parent_span_id: Option<SpanId>,
        correlation_id: TraceId,
        is_step: bool,
    ) -> Self {
        Holder {
            name: name.into(),
            kind,
            trace_id,
            span_id,
            parent_span_id,
            correlation_id,
            start_time: SystemTime::now(),
            end_time: None,
            start_mono: Instant::now(),
            end_mono: None,
            attributes: AttrMap::new(),
            event_context: AttrMap::new(),
            events: Vec::new(),
            status: Status::Unset,
            throwable: None,
            is_step,
        }
    }

    /// Wrap this holder in a shared, interior-mutable handle.
    pub fn into_handle(self) -> HolderHandle {
        Arc::new(Mutex::new(self))
    }

    /// The dot-separated flow/step name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The OpenTelemetry-compatible span kind.
    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// The 128-bit trace id shared by this holder and every holder in its
    /// tree.
    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// This holder's own 64-bit span id.
    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    /// The span id of this holder's parent, or `None` if it is a root.
    pub fn parent_span_id(&self) -> Option<SpanId> {
        self.parent_span_id
    }

    /// The correlation id: equal to the root's trace id across the whole
    /// tree.
    pub fn correlation_id(&self) -> TraceId {
        self.correlation_id
    }

    /// Wall-clock start time.
    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }

    /// Wall-clock end time, if finished.
    pub fn end_time(&self) -> Option<SystemTime> {
        self.end_time
    }

    /// Monotonic start instant.
    pub fn start_mono(&self) -> Instant {
        self.start_mono
    }

    /// Monotonic end instant, if finished.
    pub fn end_mono(&self) -> Option<Instant> {
        self.end_mono
    }

    /// Duration derived from the monotonic counters, not wall time (spec
    /// §3). `None` until the holder finishes.
    pub fn duration(&self) -> Option<std::time::Duration> {
        self.end_mono.map(|end| end.saturating_duration_since(self.start_mono))
    }

    /// The persisted, exportable attributes.
    pub fn attributes(&self) -> &AttrMap {
        &self.attributes
    }

    /// A defensive copy of the persisted attributes, safe to hand to a
    /// handler (spec §5, "Defensive copies are made when handing
    /// attribute/context maps to handlers").
    pub fn attributes_snapshot(&self) -> AttrMap {
        self.attributes.clone()
    }

    /// The ephemeral, non-exported event context.
    pub fn event_context(&self) -> &AttrMap {
        &self.event_context
    }

    /// A defensive copy of the event context.
    pub fn event_context_snapshot(&self) -> AttrMap {
        self.event_context.clone()
    }

    /// The folded step events, in completion order.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// The current completion status.
    pub fn status(&self) -> &Status {
        &self.status
    }

    /// The captured throwable, if this holder failed.
    pub fn throwable(&self) -> Option<&Throwable> {
        self.throwable.as_ref()
    }

    /// Whether this holder was opened as a step (as opposed to a flow).
    pub fn is_step(&self) -> bool {
        self.is_step
    }

    /// Write (or overwrite) a persisted attribute.
    pub fn put_attr(&mut self, key: impl Into<String>, value: impl Into<crate::attrs::AttrValue>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Write (or overwrite) an ephemeral context value.
    pub fn put_context(
        &mut self,
        key: impl Into<String>,
        value: impl Into<crate::attrs::AttrValue>,
    ) {
        self.event_context.insert(key.into(), value.into());
    }

    /// Mark the holder as ended at the current wall/monotonic time.
    pub fn set_end_time(&mut self) {
        self.end_time = Some(SystemTime::now());
        self.end_mono = Some(Instant::now());
    }

    /// Attach a captured throwable and mark the status as errored.
    pub fn attach_throwable(&mut self, throwable: Throwable) {
        let message = throwable.to_string();
        self.throwable = Some(throwable);
        self.status = Status::Error(Some(message));
    }

    /// Set the completion status explicitly (used when there is no
    /// throwable to attach).
    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    /// Append a folded step event (only meaningful on a flow holder).
    pub fn append_event(&mut self, event: Event) {
        self.events.push(event);
    }

    /// Build the [`Event`] this (step) holder folds into its parent.
    pub fn fold_into_event(&self) -> Event {
        Event::new(
            self.name.clone(),
            self.start_time,
            self.end_time.unwrap_or(self.start_time),
            self.attributes.clone(),
            self.event_context.clone(),
            self.throwable.clone(),
        )
    }
}

impl fmt::Debug for Holder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Holder")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("trace_id", &self.trace_id)
            .field("span_id", &self.span_id)
            .field("parent_span_id", &self.parent_span_id)
            .field("is_step", &self.is_step)
            .field("status", &self.status)
            .finish()
    }
}

/// The reserved event-context key under which the dispatch bus stashes the
/// root batch before a `ROOT_FLOW_FINISHED` dispatch (spec §9, "Root batch
/// attachment"). User code must never write to this key; the handler
/// compiler rejects any "pull context" binding that targets it.
pub const RESERVED_BATCH_KEY: &str = "__obsinity_root_batch__";

/// The ordered batch of every flow/step opened transitively during a root's
/// lifetime, delivered at `ROOT_FLOW_FINISHED` (spec §3, §4.7).
#[derive(Clone, Default)]
pub struct Batch {
    holders: Vec<HolderHandle>,
}

impl Batch {
    /// An empty batch.
    pub fn new() -> Self {
        Batch { holders: Vec::new() }
    }

    /// Append a holder handle to the batch, in start order.
    pub fn push(&mut self, holder: HolderHandle) {
        self.holders.push(holder);
    }

    /// The number of holders in the batch.
    pub fn len(&self) -> usize {
        self.holders.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }

    /// A defensive, independent snapshot of every holder in the batch, in
    /// start order, with the root (if any) at index 0.
    pub fn snapshot(&self) -> Vec<Holder> {
        self.holders.iter().map(|h| h.lock().clone()).collect()
    }

    /// The raw handles, for internal use by the state machine and dispatch
    /// bus.
    pub(crate) fn handles(&self) -> &[HolderHandle] {
        &self.holders
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_holder_has_no_parent_and_matching_correlation() {
        let trace = TraceId::generate();
        let span = SpanId::generate();
        let holder = Holder::new("checkout.start", Kind::Internal, trace, span, None, trace, false);
        assert!(holder.parent_span_id().is_none());
        assert_eq!(holder.correlation_id(), holder.trace_id());
    }

    #[test]
    fn end_mono_is_never_before_start_mono() {
        let trace = TraceId::generate();
        let span = SpanId::generate();
        let mut holder = Holder::new("x", Kind::Internal, trace, span, None, trace, false);
        holder.set_end_time();
        assert!(holder.end_mono().unwrap() >= holder.start_mono());
        assert!(holder.end_time().unwrap() >= holder.start_time());
    }

    #[test]
    fn attribute_snapshot_is_independent() {
        let trace = TraceId::generate();
        let span = SpanId::generate();
        let mut holder = Holder::new("x", Kind::Internal, trace, span, None, trace, false);
        holder.put_attr("k", "v");
        let mut snap = holder.attributes_snapshot();
        snap.insert("k2".into(), "v2".into());
        assert_eq!(holder.attributes().len(), 1);
        assert_eq!(snap.len(), 2);
    }
}
