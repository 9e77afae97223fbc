//! The error taxonomy from spec §7: configuration errors discovered at
//! registration time, and binding errors discovered per-invocation.

use thiserror::Error;

/// Errors discovered while compiling a component's declared handlers into
/// [`Handler`](crate::registry::Handler) descriptors (spec §7, kind 1:
/// "Configuration error"). A non-empty set of these must prevent the
/// registry from being built; callers treat this as a fatal startup failure.
///
/// The source taxonomy (spec §4.5) also lists configuration errors for
/// ambiguous/duplicate parameter bindings (mixed batch+holder parameters,
/// multiple throwable-bind parameters, ambiguous pull intents, pull-all
/// against a non-mapping type). Those all describe failure modes of a
/// *reflective, positional-parameter* binder. [`crate::binder::HandlerContext`]
/// replaces positional parameter binding with pull methods the handler body
/// calls directly (`ctx.attr("k")`, `ctx.throwable()`, `ctx.batch()`, ...),
/// so those ambiguities cannot arise here — there is no parameter list left
/// to mis-declare. `BatchOutsideRoot` and `ReservedContextKey` remain
/// reachable because batch-wanting and required-context-key declarations are
/// still explicit registration-time data.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum RegistrationError {
    /// An event name failed the `[A-Za-z0-9_]+(\.[A-Za-z0-9_]+)*` grammar
    /// (this also covers a blank name, folding the source taxonomy's
    /// separate "both name and value blank" case into one check).
    #[error("handler name `{0}` is not a valid dotted identifier")]
    InvalidName(String),

    /// Two handlers on the same component collided on
    /// `(exactName, phase, outcomeBucket, failureThrowableType)`.
    #[error(
        "component `{component}` has two handlers registered for the same \
         (name={name:?}, phase={phase}, outcome={outcome}, throwable={throwable}) slot"
    )]
    ConflictingDescriptor {
        /// The component the conflict was found on.
        component: String,
        /// The exact name key the handlers collided on, if any.
        name: Option<String>,
        /// The lifecycle phase the handlers collided on.
        phase: String,
        /// The outcome bucket the handlers collided on.
        outcome: String,
        /// The bound throwable class the handlers collided on.
        throwable: String,
    },

    /// A batch-wanting handler was declared on a fixed phase other than
    /// `ROOT_FLOW_FINISHED`.
    #[error("handler {0}: a batch binding is only permitted on ROOT_FLOW_FINISHED handlers")]
    BatchOutsideRoot(String),

    /// A fixed-phase intent (`flowStarted`/`flowSuccess`/`flowFailure`)
    /// declared an explicit lifecycle scope that excludes its own phase.
    #[error(
        "handler {handler}: declared lifecycle scope {declared:?} does not include \
         the required phase {required}"
    )]
    LifecycleMismatch {
        /// The handler's diagnostic id.
        handler: String,
        /// The lifecycle scope the component declared.
        declared: Vec<String>,
        /// The phase the handler intent requires.
        required: String,
    },

    /// A required-context-key declaration targeted the reserved root-batch
    /// key.
    #[error("handler {0}: cannot require the reserved root-batch context key")]
    ReservedContextKey(String),
}

/// Errors discovered while invoking a single compiled handler (spec §7, kind
/// 2: "Binding error"). These never propagate to the producing caller; the
/// dispatch bus catches them, logs at `warn!`, and skips that one handler.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum BindingError {
    /// A required attribute key was missing (or null) on the holder.
    #[error("required attribute `{0}` was not present")]
    MissingAttribute(String),
    /// A required context key was missing (or null) on the holder.
    #[error("required context value `{0}` was not present")]
    MissingContext(String),
    /// A required throwable source (self/cause/root-cause) was absent.
    #[error("required throwable source `{0}` was absent")]
    MissingThrowable(&'static str),
}
