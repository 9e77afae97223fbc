//! Ergonomic facade over `obsinity-core`: the `begin`/`end` driver, the
//! attribute/context write facade, the [`HandlerSetBuilder`] registration
//! DSL, and `init`/`try_init` to install a compiled dispatcher process-wide.
//!
//! Application authors depend on this crate, not `obsinity-core` directly,
//! the same way most `tracing` users depend on `tracing` rather than
//! `tracing-core`.

#![deny(missing_debug_implementations)]
#![warn(missing_docs)]

mod builder;
mod flow;
mod init;

pub use obsinity_core::{
    AttrValue, BeginOptions, Classify, HandlerContext, Kind, Lifecycle, Outcome, ParamPush,
    PushDestination, Selector, Throwable,
};

pub use crate::builder::{ComponentBuilder, HandlerDecl, HandlerSetBuilder};
pub use crate::flow::{
    begin_flow, begin_step, begin_with, put_all_attrs, put_all_context, put_attr, put_context,
    push_attr, push_context, FlowGuard, StepGuard,
};
pub use crate::init::{init, try_init, InitError};
