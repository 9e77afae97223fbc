//! The `begin`/`end` driver: ergonomic entry points over
//! [`obsinity_core::state`], plus the attribute/context write facade (spec
//! §4.2, §6). Mirrors `tracing`'s `Span::enter` returning an RAII `Entered`
//! guard, except here the guard is the session itself and is consumed by
//! calling [`FlowGuard::success`]/[`FlowGuard::failure`] rather than being
//! dropped (dropping it unfinished still completes it, as an error, via
//! [`obsinity_core::state::Session`]'s own `Drop` impl).

use std::sync::{Arc, Once};

use obsinity_core::{
    AttrValue, BeginOptions, Classify, Emitter, HolderHandle, ParamPush, PushDestination, Session,
    SessionOutcome, Throwable,
};

use crate::init;

struct NoopEmitter;

impl Emitter for NoopEmitter {
    fn flow_started(&self, _holder: &obsinity_core::Holder) {}
    fn flow_finished(&self, _holder: &obsinity_core::Holder) {}
    fn root_flow_finished(&self, _batch: &obsinity_core::Batch) {}
}

static WARN_NO_DISPATCHER: Once = Once::new();

fn active_emitter() -> Arc<dyn Emitter> {
    match init::global() {
        Some(bus) => bus,
        None => {
            WARN_NO_DISPATCHER.call_once(|| {
                log::warn!(
                    "obsinity: no dispatcher installed (call obsinity::init/try_init); \
                     flows and steps will be tracked but no handler will run"
                );
            });
            Arc::new(NoopEmitter)
        }
    }
}

/// An in-flight flow, opened with [`begin_flow`]. Finish it with
/// [`success`](FlowGuard::success) or [`failure`](FlowGuard::failure)/
/// [`failure_opaque`](FlowGuard::failure_opaque).
#[derive(Debug)]
pub struct FlowGuard(Session);

/// An in-flight step, opened with [`begin_step`]. Same finishing API as
/// [`FlowGuard`]; kept as a distinct type so call sites read clearly.
#[derive(Debug)]
pub struct StepGuard(Session);

macro_rules! guard_impl {
    ($t:ty) => {
        impl $t {
            /// Finish successfully.
            pub fn success(self) {
                self.0.end(SessionOutcome::Success);
            }

            /// Finish with a classified error (spec §4.4 "throwable
            /// capture").
            pub fn failure<E: Classify>(self, error: E) {
                self.0.end(SessionOutcome::Failure(Throwable::capture(error)));
            }

            /// Finish with an error that has no declared classification
            /// chain; it is assignable only to the generic throwable class.
            pub fn failure_opaque<E: std::error::Error + Send + Sync + 'static>(self, error: E) {
                self.0
                    .end(SessionOutcome::Failure(Throwable::capture_opaque(error)));
            }

            /// The underlying holder handle, for advanced use (e.g. passing
            /// it to a propagation hook).
            pub fn handle(&self) -> &HolderHandle {
                self.0.handle()
            }
        }
    };
}

guard_impl!(FlowGuard);
guard_impl!(StepGuard);

/// Open a new flow (spec §4.3 step 2: `isStepIntent = false` always starts a
/// new root-or-nested flow).
pub fn begin_flow(name: impl Into<String>) -> FlowGuard {
    FlowGuard(obsinity_core::state::begin(
        active_emitter(),
        BeginOptions::flow(name),
    ))
}

/// Open a new step. If there is no active flow on this thread, it is
/// promoted to a root flow and a notice is logged at `options.orphan_severity`
/// (default `ERROR`; spec §4.3 step 1).
pub fn begin_step(name: impl Into<String>) -> StepGuard {
    StepGuard(obsinity_core::state::begin(
        active_emitter(),
        BeginOptions::step(name),
    ))
}

/// Open a flow/step from fully custom [`BeginOptions`] (kind override,
/// orphan severity, producer-side pushes). Returns the raw
/// [`obsinity_core::state::Session`]; prefer [`begin_flow`]/[`begin_step`]
/// for the common case.
pub fn begin_with(options: BeginOptions) -> Session {
    obsinity_core::state::begin(active_emitter(), options)
}

/// Write (or overwrite) a persisted attribute on the current flow/step, if
/// one is active on this thread.
pub fn put_attr(key: impl Into<String>, value: impl Into<AttrValue>) {
    if let Some(handle) = obsinity_core::state::current_handle() {
        handle.lock().put_attr(key, value);
    }
}

/// Write every `(key, value)` pair as a persisted attribute.
pub fn put_all_attrs(values: impl IntoIterator<Item = (String, AttrValue)>) {
    if let Some(handle) = obsinity_core::state::current_handle() {
        let mut holder = handle.lock();
        for (key, value) in values {
            holder.put_attr(key, value);
        }
    }
}

/// Write (or overwrite) an ephemeral event-context value on the current
/// flow/step.
pub fn put_context(key: impl Into<String>, value: impl Into<AttrValue>) {
    if let Some(handle) = obsinity_core::state::current_handle() {
        handle.lock().put_context(key, value);
    }
}

/// Write every `(key, value)` pair into the ephemeral event context.
pub fn put_all_context(values: impl IntoIterator<Item = (String, AttrValue)>) {
    if let Some(handle) = obsinity_core::state::current_handle() {
        let mut holder = handle.lock();
        for (key, value) in values {
            holder.put_context(key, value);
        }
    }
}

/// Build a [`ParamPush`] destined for the holder's persisted attributes,
/// applied the instant the holder is created (spec §6).
pub fn push_attr(key: impl Into<String>, value: impl Into<AttrValue>) -> ParamPush {
    ParamPush {
        key: key.into(),
        value: Some(value.into()),
        destination: PushDestination::Attributes,
        omit_if_null: false,
    }
}

/// Build a [`ParamPush`] destined for the holder's ephemeral event context.
pub fn push_context(key: impl Into<String>, value: impl Into<AttrValue>) -> ParamPush {
    ParamPush {
        key: key.into(),
        value: Some(value.into()),
        destination: PushDestination::Context,
        omit_if_null: false,
    }
}
