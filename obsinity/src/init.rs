//! Installing a compiled [`DispatchBus`] as the process-wide dispatcher.
//!
//! Mirrors `tracing_core::dispatch::set_global_default`: a dispatcher may be
//! installed at most once per process, [`begin_flow`](crate::begin_flow) and
//! friends read whichever one is installed, and installing a second one is a
//! caller error rather than silently replacing the first.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use thiserror::Error;

use obsinity_core::{DispatchBus, RegistrationError};

use crate::builder::HandlerSetBuilder;

static GLOBAL: OnceCell<Arc<DispatchBus>> = OnceCell::new();

/// Errors from [`init`]/[`try_init`].
#[derive(Debug, Error)]
pub enum InitError {
    /// One or more handlers failed to compile (spec §7, kind 1).
    #[error("{} handler registration error(s): {0:?}", .0.len())]
    Registration(Vec<RegistrationError>),
    /// A dispatcher was already installed in this process.
    #[error("a dispatcher has already been installed")]
    AlreadyInstalled,
}

/// Compile `builder` and install it as the process-wide dispatcher.
///
/// Returns [`InitError::AlreadyInstalled`] if called more than once; use
/// [`try_init`] to treat that case as a no-op instead.
pub fn init(builder: HandlerSetBuilder) -> Result<(), InitError> {
    let bus = builder.build().map_err(InitError::Registration)?;
    GLOBAL
        .set(Arc::new(bus))
        .map_err(|_| InitError::AlreadyInstalled)
}

/// Like [`init`], but a dispatcher already being installed is logged at
/// `warn!` rather than returned as an error (matching
/// `tracing_subscriber`'s `try_init`/`init` split: library code calls
/// `try_init` defensively, application entry points call `init` and expect to
/// own the decision).
pub fn try_init(builder: HandlerSetBuilder) -> Result<(), InitError> {
    match init(builder) {
        Err(InitError::AlreadyInstalled) => {
            log::warn!("obsinity::try_init: a dispatcher was already installed; keeping it");
            Ok(())
        }
        other => other,
    }
}

/// The installed dispatcher, if any.
pub(crate) fn global() -> Option<Arc<DispatchBus>> {
    GLOBAL.get().cloned()
}

#[cfg(test)]
mod tests {
    // `init`/`try_init` touch process-global state (`OnceCell`), so they are
    // exercised only by the crate's `tests/` integration binaries, each of
    // which runs in its own process.
}
