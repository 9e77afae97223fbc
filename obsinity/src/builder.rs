//! The registration DSL: the code-generation-free equivalent of reading
//! handler methods off an annotated class (spec §9, "Implementations without
//! an annotation system should take the same information via registration
//! calls"). Callers build a [`HandlerSetBuilder`], add components, and
//! declare handlers on each; [`HandlerSetBuilder::build`] runs the C5
//! compiler and wraps the result as a [`DispatchBus`].

use std::sync::Arc;

use obsinity_core::{
    compile, ComponentSpec, DispatchBus, HandlerContext, HandlerSpec, Intent, Lifecycle, Outcome,
    RegistrationError, RequiredBindings, Selector, ThrowableBinding,
};

/// A handler body: a plain closure pulling whatever it needs from the
/// [`HandlerContext`] it's invoked with.
pub type HandlerFn = dyn Fn(&HandlerContext) + Send + Sync;

/// The top-level registration builder. Accumulates [`ComponentSpec`]s and
/// compiles them into a [`DispatchBus`] (spec §4.5–§4.6).
#[derive(Debug, Default)]
pub struct HandlerSetBuilder {
    components: Vec<ComponentSpec>,
}

impl HandlerSetBuilder {
    /// An empty builder.
    pub fn new() -> Self {
        HandlerSetBuilder::default()
    }

    /// Declare one component. `build` receives a fresh [`ComponentBuilder`]
    /// for `name` and must return it (possibly after chaining `.scope(...)`,
    /// `.on_flow_started(...)`, etc.) so its accumulated handlers are kept.
    pub fn component(
        mut self,
        name: impl Into<String>,
        build: impl FnOnce(ComponentBuilder) -> ComponentBuilder,
    ) -> Self {
        let built = build(ComponentBuilder::new(name.into()));
        self.components.push(built.spec);
        self
    }

    /// Compile every declared component into an immutable [`Registry`],
    /// surfacing every validation failure at once (spec §4.5).
    ///
    /// [`Registry`]: obsinity_core::Registry
    pub fn build(self) -> Result<DispatchBus, Vec<RegistrationError>> {
        compile(self.components).map(DispatchBus::new)
    }
}

/// A single component under construction.
#[derive(Debug)]
pub struct ComponentBuilder {
    spec: ComponentSpec,
}

impl ComponentBuilder {
    fn new(name: String) -> Self {
        ComponentBuilder {
            spec: ComponentSpec::new(name),
        }
    }

    /// Restrict this component to names with `prefix` (repeatable; spec
    /// §4.4 "Component scope"). A component with no scope calls matches
    /// every name.
    pub fn scope(mut self, prefix: impl Into<String>) -> Self {
        self.spec.scope_prefixes.push(prefix.into());
        self
    }

    /// Restrict this component to `phase` (repeatable). A component with no
    /// lifecycle restriction is eligible at every phase.
    pub fn allowed_lifecycle(mut self, phase: Lifecycle) -> Self {
        self.spec.scope_lifecycles.push(phase);
        self
    }

    /// Mark this component as a receiver of the global-fallback signal
    /// (spec §4.7.3: invoked only when no component matched by name or
    /// component-level fallback).
    pub fn global_fallback(mut self) -> Self {
        self.spec.is_global_fallback = true;
        self
    }

    /// Declare a `flowStarted(name)` handler.
    pub fn on_flow_started(self, name: impl Into<String>) -> HandlerDecl {
        HandlerDecl::new(self, Intent::Started, Some(name.into()))
    }

    /// Declare a `flowSuccess(name)` handler.
    pub fn on_flow_success(self, name: impl Into<String>) -> HandlerDecl {
        HandlerDecl::new(self, Intent::Success, Some(name.into()))
    }

    /// Declare a `flowFailure(name)` handler, bound to the generic throwable
    /// class unless narrowed with [`HandlerDecl::catches`].
    pub fn on_flow_failure(self, name: impl Into<String>) -> HandlerDecl {
        HandlerDecl::new(self, Intent::Failure, Some(name.into()))
    }

    /// Declare a `flowCompleted(name)` handler, matching either outcome
    /// unless narrowed with [`HandlerDecl::outcome`]. Call
    /// [`HandlerDecl::wants_batch`] to receive the root batch instead of a
    /// plain per-flow finish.
    pub fn on_flow_completed(self, name: impl Into<String>) -> HandlerDecl {
        HandlerDecl::new(
            self,
            Intent::Completed {
                outcome: None,
                wants_batch: false,
            },
            Some(name.into()),
        )
    }

    /// Declare a component-level (or, with [`ComponentBuilder::global_fallback`],
    /// global-level) unmatched-signal fallback (spec §4.7.3–4).
    pub fn on_unmatched(self) -> HandlerDecl {
        HandlerDecl::new(self, Intent::Unmatched, None)
    }
}

/// One handler declaration in progress; finished by calling
/// [`HandlerDecl::invoke`].
#[derive(Debug)]
pub struct HandlerDecl {
    parent: ComponentBuilder,
    intent: Intent,
    name: Option<String>,
    required: RequiredBindings,
    throwable: ThrowableBinding,
    explicit_lifecycles: Option<Vec<Lifecycle>>,
}

impl HandlerDecl {
    fn new(parent: ComponentBuilder, intent: Intent, name: Option<String>) -> Self {
        HandlerDecl {
            parent,
            intent,
            name,
            required: RequiredBindings::none(),
            throwable: ThrowableBinding::default(),
            explicit_lifecycles: None,
        }
    }

    /// Narrow a `flowCompleted` handler to one outcome. No-op on any other
    /// intent.
    pub fn outcome(mut self, outcome: Outcome) -> Self {
        if let Intent::Completed { outcome: o, .. } = &mut self.intent {
            *o = Some(outcome);
        }
        self
    }

    /// Request the accumulated root batch (forces `ROOT_FLOW_FINISHED`
    /// rather than `FLOW_FINISHED`, spec §4.5 batch-wanting rule). No-op on
    /// any intent other than `flowCompleted`.
    pub fn wants_batch(mut self) -> Self {
        if let Intent::Completed { wants_batch, .. } = &mut self.intent {
            *wants_batch = true;
        }
        self
    }

    /// Require the named attribute to be present (and non-null) for this
    /// handler to be eligible (spec §4.7.4).
    pub fn require_attr(mut self, key: impl Into<String>) -> Self {
        self.required.attrs.push(key.into());
        self
    }

    /// Require the named context value to be present (and non-null).
    pub fn require_context(mut self, key: impl Into<String>) -> Self {
        self.required.context.push(key.into());
        self
    }

    /// Require a throwable source to resolve via `selector` (only
    /// meaningful on failure-eligible buckets).
    pub fn require_throwable(mut self, selector: Selector) -> Self {
        self.required.throwable = Some(selector);
        self
    }

    /// Narrow the failure binding to the most specific class `E` declares
    /// (spec §4.7.5 "failure specificity"); defaults to the generic class.
    pub fn catches<E: obsinity_core::Classify>(mut self) -> Self {
        self.throwable = match E::classes().first().copied() {
            Some(class) => ThrowableBinding { class },
            None => ThrowableBinding::default(),
        };
        self
    }

    /// Restrict this one handler to an explicit lifecycle set, beyond the
    /// component's own scope (rarely needed).
    pub fn restrict_to(mut self, phases: impl IntoIterator<Item = Lifecycle>) -> Self {
        self.explicit_lifecycles = Some(phases.into_iter().collect());
        self
    }

    /// Finish this declaration with its body, returning the owning
    /// [`ComponentBuilder`] so further handlers can be chained.
    pub fn invoke(self, f: impl Fn(&HandlerContext) + Send + Sync + 'static) -> ComponentBuilder {
        let HandlerDecl {
            mut parent,
            intent,
            name,
            required,
            throwable,
            explicit_lifecycles,
        } = self;
        parent.spec.handlers.push(HandlerSpec {
            intent,
            name,
            required,
            throwable,
            explicit_lifecycles,
            func: Arc::new(f),
        });
        parent
    }
}
