//! Core primitives for `obsinity`.
//!
//! `obsinity` is a framework for instrumenting Rust programs with a tree of
//! **flows** (root operations) and **steps** (nested units of work), emitting
//! lifecycle signals and routing them to declaratively-registered handlers.
//! This crate defines the core primitives:
//!
//! * [`Holder`] — the in-memory record for one flow or step.
//! * [`ids`] — OpenTelemetry-compatible trace/span id generation.
//! * [`state`] — the per-thread flow/step state machine.
//! * [`registry`] — the handler compiler and per-component registry.
//! * [`dispatch`] — the signal router (scope, dot-chop, specificity, fallback).
//! * [`binder`] — parameter binders used to build handler argument lists.
//!
//! Application authors will typically not use this crate directly; they will
//! use the `obsinity` crate, which provides the ergonomic `begin`/`end`
//! driver and a registration builder on top of these primitives.

#![deny(missing_debug_implementations)]
#![warn(missing_docs)]

pub mod attrs;
pub mod binder;
pub mod dispatch;
pub mod error;
pub mod holder;
pub mod ids;
pub mod metadata;
pub mod registry;
pub mod state;
pub mod throwable;

#[doc(inline)]
pub use crate::{
    attrs::AttrValue,
    binder::{HandlerContext, RequiredBindings, Selector},
    dispatch::{DispatchBus, Emitter},
    error::{BindingError, RegistrationError},
    holder::{Batch, Event, Holder, HolderHandle, Status, RESERVED_BATCH_KEY},
    ids::{SpanId, TraceId},
    metadata::{Kind, Lifecycle, Outcome, OutcomeBucket},
    registry::{
        compile, ComponentId, ComponentScope, ComponentSpec, Handler, HandlerGroup, HandlerSpec,
        Intent, Registry, ThrowableBinding,
    },
    state::{begin, BeginOptions, ParamPush, PushDestination, Session, SessionOutcome},
    throwable::{Classify, Throwable},
};
