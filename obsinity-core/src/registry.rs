//! The handler compiler (C5) and per-component registry (C6), spec §4.5–§4.6.
//!
//! Callers (the `obsinity` facade's `HandlerSetBuilder`) describe components
//! and handlers as plain data — [`ComponentSpec`] / [`HandlerSpec`] — rather
//! than metadata read off a class, matching the fallback spec §9 names for
//! systems with no annotation reader: "take the same information via
//! registration calls". [`compile`] is C5: it validates every spec and, on
//! success, builds the immutable [`Registry`] (C6) the dispatch bus (C7)
//! consults.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::binder::{HandlerContext, RequiredBindings};
use crate::error::RegistrationError;
use crate::holder::RESERVED_BATCH_KEY;
use crate::metadata::{is_valid_name, Lifecycle, Outcome, OutcomeBucket};
use crate::throwable::GENERIC_CLASS;

/// An opaque, registration-order-assigned component identifier (spec §5,
/// "component registration order").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ComponentId(pub(crate) u32);

/// The method-level handler intent (spec §4.4): which phase(s)/outcome(s) a
/// handler matches, before compilation resolves it to a concrete
/// `(Lifecycle, OutcomeBucket)`.
#[derive(Clone, Copy, Debug)]
pub enum Intent {
    /// `flowStarted(name)`.
    Started,
    /// `flowSuccess(name)`.
    Success,
    /// `flowFailure(name)`.
    Failure,
    /// `flowCompleted(name)`, with an optional declared outcome (`None` =
    /// both) and whether the handler wants the root batch (which forces the
    /// phase to `ROOT_FLOW_FINISHED` rather than `FLOW_FINISHED`).
    Completed {
        /// The declared outcome restriction, if any.
        outcome: Option<Outcome>,
        /// Whether this handler wants the accumulated root batch.
        wants_batch: bool,
    },
    /// `flowNotMatched`: a component-level fallback, not tied to a name.
    Unmatched,
}

/// The throwable binding a handler declares for failure-specificity
/// resolution (spec §4.5.5, §4.7.5).
#[derive(Clone, Debug)]
pub struct ThrowableBinding {
    /// The most-specific class name this handler is bound to. Defaults to
    /// [`GENERIC_CLASS`] when the handler doesn't narrow its binding.
    pub class: &'static str,
}

impl Default for ThrowableBinding {
    fn default() -> Self {
        ThrowableBinding { class: GENERIC_CLASS }
    }
}

/// One declared handler on a component, prior to compilation.
pub struct HandlerSpec {
    /// The method intent.
    pub intent: Intent,
    /// The exact name key (`None` only for `Intent::Unmatched`).
    pub name: Option<String>,
    /// Required preconditions checked by the dispatch bus's eligibility
    /// filter.
    pub required: RequiredBindings,
    /// The declared throwable binding, meaningful only at failure-eligible
    /// buckets.
    pub throwable: ThrowableBinding,
    /// An explicit lifecycle restriction for this one handler, beyond the
    /// component's scope (rarely needed; `None` defers entirely to the
    /// component scope and the intent's fixed phase).
    pub explicit_lifecycles: Option<Vec<Lifecycle>>,
    /// The handler body.
    pub func: Arc<dyn Fn(&HandlerContext) + Send + Sync>,
}

impl fmt::Debug for HandlerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSpec")
            .field("intent", &self.intent)
            .field("name", &self.name)
            .finish()
    }
}

/// A component's declared scope (spec §4.4 "Component scope").
#[derive(Clone, Debug, Default)]
pub struct ComponentScope {
    pub(crate) prefixes: Vec<String>,
    pub(crate) lifecycles: Vec<Lifecycle>,
}

impl ComponentScope {
    /// Whether `name` passes this scope's prefix test (spec §4.7.2.1: a
    /// no-prefixes scope accepts everything).
    pub fn allows_name(&self, name: &str) -> bool {
        self.prefixes.is_empty() || self.prefixes.iter().any(|p| name.starts_with(p.as_str()))
    }

    /// Whether `phase` passes this scope's lifecycle test.
    pub fn allows_phase(&self, phase: Lifecycle) -> bool {
        self.lifecycles.is_empty() || self.lifecycles.contains(&phase)
    }
}

/// A component's declaration, prior to compilation.
#[derive(Debug)]
pub struct ComponentSpec {
    /// A human-readable name, used in diagnostics and `ConflictingDescriptor`.
    pub name: String,
    /// The declared prefix scope.
    pub scope_prefixes: Vec<String>,
    /// The declared lifecycle scope.
    pub scope_lifecycles: Vec<Lifecycle>,
    /// Whether this component is the (or a) global-fallback receiver.
    pub is_global_fallback: bool,
    /// The declared handlers.
    pub handlers: Vec<HandlerSpec>,
}

impl ComponentSpec {
    /// A component with empty scope (matches everything), no handlers yet.
    pub fn new(name: impl Into<String>) -> Self {
        ComponentSpec {
            name: name.into(),
            scope_prefixes: Vec::new(),
            scope_lifecycles: Vec::new(),
            is_global_fallback: false,
            handlers: Vec::new(),
        }
    }
}

/// A compiled handler descriptor (spec §3 "Handler descriptor").
pub struct Handler {
    diagnostic_id: String,
    exact_name: Option<String>,
    phase: Lifecycle,
    bucket: OutcomeBucket,
    bound_class: &'static str,
    required: RequiredBindings,
    wants_batch: bool,
    func: Arc<dyn Fn(&HandlerContext) + Send + Sync>,
}

impl Handler {
    /// An opaque identifier for logging (component name + method intent).
    pub fn diagnostic_id(&self) -> &str {
        &self.diagnostic_id
    }

    /// The exact name key this handler was registered under, if any.
    pub fn exact_name(&self) -> Option<&str> {
        self.exact_name.as_deref()
    }

    /// The lifecycle phase this handler runs at.
    pub fn phase(&self) -> Lifecycle {
        self.phase
    }

    /// The outcome bucket this handler runs at.
    pub fn bucket(&self) -> OutcomeBucket {
        self.bucket
    }

    /// The throwable class this handler is bound to (failure paths only).
    pub fn bound_class(&self) -> &'static str {
        self.bound_class
    }

    /// This handler's required preconditions.
    pub fn required(&self) -> &RequiredBindings {
        &self.required
    }

    /// Whether this handler wants the root batch.
    pub fn wants_batch(&self) -> bool {
        self.wants_batch
    }

    /// Invoke this handler's body.
    pub fn invoke(&self, ctx: &HandlerContext) {
        (self.func)(ctx)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("diagnostic_id", &self.diagnostic_id)
            .field("exact_name", &self.exact_name)
            .field("phase", &self.phase.to_string())
            .field("bucket", &self.bucket)
            .field("bound_class", &self.bound_class)
            .finish()
    }
}

/// The compiled per-component registry (spec §4.6).
pub struct HandlerGroup {
    id: ComponentId,
    name: String,
    scope: ComponentScope,
    is_global_fallback: bool,
    named: IndexMap<(String, Lifecycle), Vec<Handler>>,
    component_unmatched: IndexMap<Lifecycle, Vec<Handler>>,
    global_unmatched: IndexMap<Lifecycle, Vec<Handler>>,
}

impl HandlerGroup {
    /// This component's registration-order id.
    pub fn id(&self) -> ComponentId {
        self.id
    }

    /// This component's declared name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// This component's compiled scope.
    pub fn scope(&self) -> &ComponentScope {
        &self.scope
    }

    /// Whether this component is a global-fallback receiver.
    pub fn is_global_fallback(&self) -> bool {
        self.is_global_fallback
    }

    /// Dot-chop lookup (spec §4.6): try `name`, then each parent tier, and
    /// return the first tier that yields any handler matching both `phase`
    /// *and* `outcome`'s bucket (spec §4.7.2: "dot-chop on name over g's
    /// registrations for phase and the required outcome bucket"). A tier
    /// with handlers registered only for the wrong bucket does not count as
    /// present; lookup falls through to the next broader tier instead.
    pub fn lookup(&self, name: &str, phase: Lifecycle, outcome: Option<Outcome>) -> Option<Vec<&Handler>> {
        for tier in dot_chop_tiers(name) {
            if let Some(handlers) = self.named.get(&(tier.to_string(), phase)) {
                let matching: Vec<&Handler> = handlers
                    .iter()
                    .filter(|h| match outcome {
                        Some(o) => h.bucket().matches(o),
                        None => h.bucket() == OutcomeBucket::Started,
                    })
                    .collect();
                if !matching.is_empty() {
                    return Some(matching);
                }
            }
        }
        None
    }

    /// This component's fallback handlers for `phase`.
    pub fn component_unmatched(&self, phase: Lifecycle) -> &[Handler] {
        self.component_unmatched
            .get(&phase)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// This component's global-fallback handlers for `phase` (empty unless
    /// `is_global_fallback`).
    pub fn global_unmatched(&self, phase: Lifecycle) -> &[Handler] {
        self.global_unmatched
            .get(&phase)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

impl fmt::Debug for HandlerGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerGroup")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("is_global_fallback", &self.is_global_fallback)
            .finish()
    }
}

/// The compiled, immutable registry (spec §5: "built at startup and treated
/// as immutable thereafter").
#[derive(Debug)]
pub struct Registry {
    pub(crate) groups: Vec<HandlerGroup>,
}

impl Registry {
    /// The compiled component groups, in registration order.
    pub fn groups(&self) -> &[HandlerGroup] {
        &self.groups
    }
}

/// Dot-chop tiers of `name`: `name` itself, then each successively shorter
/// prefix up to (but not including) the empty string (spec §4.6: "the empty
/// string is never a key").
fn dot_chop_tiers(name: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(Some(name), |tier| tier.rfind('.').map(|i| &tier[..i]))
}

fn resolve_phase_bucket(intent: &Intent) -> (Lifecycle, OutcomeBucket, bool) {
    match intent {
        Intent::Started => (Lifecycle::FlowStarted, OutcomeBucket::Started, false),
        Intent::Success => (Lifecycle::FlowFinished, OutcomeBucket::Success, false),
        Intent::Failure => (Lifecycle::FlowFinished, OutcomeBucket::Failure, false),
        Intent::Completed { outcome, wants_batch } => {
            let phase = if *wants_batch {
                Lifecycle::RootFlowFinished
            } else {
                Lifecycle::FlowFinished
            };
            let bucket = match outcome {
                Some(Outcome::Success) => OutcomeBucket::Success,
                Some(Outcome::Failure) => OutcomeBucket::Failure,
                None => OutcomeBucket::Completed,
            };
            (phase, bucket, *wants_batch)
        }
        Intent::Unmatched => (Lifecycle::FlowStarted, OutcomeBucket::Started, false), // unused
    }
}

/// Compile a set of component declarations into an immutable [`Registry`]
/// (C5, spec §4.5). Returns every validation failure found, across every
/// component, rather than stopping at the first (so a caller's startup
/// failure is fully diagnosable in one pass).
pub fn compile(components: Vec<ComponentSpec>) -> Result<Registry, Vec<RegistrationError>> {
    let mut errors = Vec::new();
    let mut groups = Vec::with_capacity(components.len());

    for (index, spec) in components.into_iter().enumerate() {
        let id = ComponentId(index as u32);
        let scope = ComponentScope {
            prefixes: spec.scope_prefixes,
            lifecycles: spec.scope_lifecycles,
        };

        let mut named: IndexMap<(String, Lifecycle), Vec<Handler>> = IndexMap::new();
        let mut component_unmatched: IndexMap<Lifecycle, Vec<Handler>> = IndexMap::new();
        let mut global_unmatched: IndexMap<Lifecycle, Vec<Handler>> = IndexMap::new();
        let mut seen_slots: HashSet<(Option<String>, Lifecycle, String, &'static str)> = HashSet::new();

        for handler_spec in spec.handlers {
            let diagnostic_id = format!(
                "{}::{}",
                spec.name,
                handler_spec.name.as_deref().unwrap_or("<unmatched>")
            );

            if let Some(name) = &handler_spec.name {
                if !is_valid_name(name) {
                    errors.push(RegistrationError::InvalidName(diagnostic_id.clone()));
                    continue;
                }
            }

            if handler_spec.required.context.iter().any(|k| k == RESERVED_BATCH_KEY) {
                errors.push(RegistrationError::ReservedContextKey(diagnostic_id.clone()));
                continue;
            }

            let (phase, bucket, wants_batch) = resolve_phase_bucket(&handler_spec.intent);

            if wants_batch && phase != Lifecycle::RootFlowFinished {
                errors.push(RegistrationError::BatchOutsideRoot(diagnostic_id.clone()));
                continue;
            }

            if !matches!(handler_spec.intent, Intent::Unmatched) {
                if let Some(declared) = &handler_spec.explicit_lifecycles {
                    if !declared.contains(&phase) {
                        errors.push(RegistrationError::LifecycleMismatch {
                            handler: diagnostic_id.clone(),
                            declared: declared.iter().map(Lifecycle::to_string).collect(),
                            required: phase.to_string(),
                        });
                        continue;
                    }
                }
            }

            let bound_class = handler_spec.throwable.class;

            let outcome_key = match bucket {
                OutcomeBucket::Started => "STARTED",
                OutcomeBucket::Success => "SUCCESS",
                OutcomeBucket::Failure => "FAILURE",
                OutcomeBucket::Completed => "COMPLETED",
            }
            .to_string();

            // `Intent::Unmatched` always resolves to the same placeholder
            // (phase, bucket) regardless of which phases it's actually
            // fanned out to, so slot-collision detection is meaningless for
            // it; spec §4.7.3 models componentUnmatched[phase] as a list,
            // so more than one unmatched handler per component is legal.
            if !matches!(handler_spec.intent, Intent::Unmatched) {
                let slot = (handler_spec.name.clone(), phase, outcome_key.clone(), bound_class);
                if !seen_slots.insert(slot) {
                    errors.push(RegistrationError::ConflictingDescriptor {
                        component: spec.name.clone(),
                        name: handler_spec.name.clone(),
                        phase: phase.to_string(),
                        outcome: outcome_key,
                        throwable: bound_class.to_string(),
                    });
                    continue;
                }
            }

            let handler = Handler {
                diagnostic_id,
                exact_name: handler_spec.name.clone(),
                phase,
                bucket,
                bound_class,
                required: handler_spec.required,
                wants_batch,
                func: handler_spec.func,
            };

            match handler_spec.intent {
                Intent::Unmatched => {
                    // An unmatched handler fires at whichever phases the
                    // component's own scope allows (all phases if it
                    // declared no lifecycle restriction).
                    let target = if spec.is_global_fallback {
                        &mut global_unmatched
                    } else {
                        &mut component_unmatched
                    };
                    for p in Lifecycle::ALL {
                        if scope.allows_phase(p) {
                            target.entry(p).or_default().push(clone_handler(&handler));
                        }
                    }
                }
                _ => {
                    named.entry((handler.exact_name.clone().unwrap_or_default(), phase))
                        .or_default()
                        .push(handler);
                }
            }
        }

        groups.push(HandlerGroup {
            id,
            name: spec.name,
            scope,
            is_global_fallback: spec.is_global_fallback,
            named,
            component_unmatched,
            global_unmatched,
        });
    }

    if errors.is_empty() {
        Ok(Registry { groups })
    } else {
        Err(errors)
    }
}

// `Handler` deliberately has no `Clone` impl (its body is a trait object and
// cloning would be a foot-gun for identity-sensitive diagnostics); the
// `Intent::Unmatched` fan-out across every allowed phase needs independent
// copies sharing the same closure, so we build them by hand from the shared
// `Arc<dyn Fn>` rather than deriving `Clone` on `Handler` itself.
fn clone_handler(h: &Handler) -> Handler {
    Handler {
        diagnostic_id: h.diagnostic_id.clone(),
        exact_name: h.exact_name.clone(),
        phase: h.phase,
        bucket: h.bucket,
        bound_class: h.bound_class,
        required: h.required.clone(),
        wants_batch: h.wants_batch,
        func: h.func.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler(intent: Intent, name: Option<&str>) -> HandlerSpec {
        HandlerSpec {
            intent,
            name: name.map(str::to_string),
            required: RequiredBindings::none(),
            throwable: ThrowableBinding::default(),
            explicit_lifecycles: None,
            func: Arc::new(|_ctx| {}),
        }
    }

    #[test]
    fn rejects_malformed_name() {
        let spec = ComponentSpec {
            handlers: vec![noop_handler(Intent::Started, Some("bad name"))],
            ..ComponentSpec::new("c")
        };
        let err = compile(vec![spec]).unwrap_err();
        assert_eq!(err, vec![RegistrationError::InvalidName("c::bad name".into())]);
    }

    #[test]
    fn completed_with_batch_resolves_to_root_flow_finished() {
        let spec = ComponentSpec {
            handlers: vec![noop_handler(
                Intent::Completed { outcome: None, wants_batch: true },
                Some("root"),
            )],
            ..ComponentSpec::new("c")
        };
        let registry = compile(vec![spec]).unwrap();
        let handlers = registry.groups()[0]
            .lookup("root", Lifecycle::RootFlowFinished, Some(Outcome::Success))
            .unwrap();
        assert_eq!(handlers.len(), 1);
        assert!(handlers[0].wants_batch());
    }

    #[test]
    fn dot_chop_tiers_walk_to_the_root_segment() {
        let tiers: Vec<&str> = dot_chop_tiers("a.b.c").collect();
        assert_eq!(tiers, vec!["a.b.c", "a.b", "a"]);
    }

    #[test]
    fn duplicate_slot_is_rejected() {
        let spec = ComponentSpec {
            handlers: vec![
                noop_handler(Intent::Success, Some("checkout")),
                noop_handler(Intent::Success, Some("checkout")),
            ],
            ..ComponentSpec::new("c")
        };
        let err = compile(vec![spec]).unwrap_err();
        assert_eq!(err.len(), 1);
        assert!(matches!(err[0], RegistrationError::ConflictingDescriptor { .. }));
    }

    #[test]
    fn reserved_context_key_requirement_is_rejected() {
        let mut handler = noop_handler(Intent::Started, Some("x"));
        handler.required.context.push(RESERVED_BATCH_KEY.to_string());
        let spec = ComponentSpec {
            handlers: vec![handler],
            ..ComponentSpec::new("c")
        };
        let err = compile(vec![spec]).unwrap_err();
        assert_eq!(err, vec![RegistrationError::ReservedContextKey("c::x".into())]);
    }

    #[test]
    fn multiple_unmatched_handlers_on_one_component_are_all_kept() {
        let spec = ComponentSpec {
            handlers: vec![
                noop_handler(Intent::Unmatched, None),
                noop_handler(Intent::Unmatched, None),
            ],
            ..ComponentSpec::new("c")
        };
        let registry = compile(vec![spec]).unwrap();
        assert_eq!(registry.groups()[0].component_unmatched(Lifecycle::FlowStarted).len(), 2);
    }
}
