//! The dispatch bus (C7, spec §4.7): routes a signal to the eligible
//! handlers in the compiled [`Registry`](crate::registry::Registry).

use std::panic::{self, AssertUnwindSafe};

use crate::attrs::AttrValue;
use crate::binder::HandlerContext;
use crate::holder::{Batch, Holder};
use crate::metadata::{Lifecycle, Outcome};
use crate::registry::{Handler, Registry};
use crate::throwable::Throwable;

/// The three entry points [`crate::state`] calls into once a holder's phase
/// is decided (spec §4.7: "Entry points (called by C3)").
pub trait Emitter: Send + Sync {
    /// A flow or step was just opened.
    fn flow_started(&self, holder: &Holder);
    /// A flow or step just finished.
    fn flow_finished(&self, holder: &Holder);
    /// A root flow just finished, with its accumulated batch.
    fn root_flow_finished(&self, batch: &Batch);
}

/// The compiled registry plus the routing algorithm over it.
#[derive(Debug)]
pub struct DispatchBus {
    registry: Registry,
}

impl DispatchBus {
    /// Wrap a compiled registry as a dispatch bus.
    pub fn new(registry: Registry) -> Self {
        DispatchBus { registry }
    }

    /// The compiled registry, for inspection (spec §6 "handlerGroups()").
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn dispatch(&self, phase: Lifecycle, holder: &Holder, batch: Option<&[Holder]>) {
        let name = holder.name();
        let outcome = match phase {
            Lifecycle::FlowStarted => None,
            _ => Some(if holder.throwable().is_some() {
                Outcome::Failure
            } else {
                Outcome::Success
            }),
        };
        let ctx = HandlerContext::new(holder, phase, outcome, batch);

        let mut any_ran = false;

        for group in self.registry.groups() {
            if !group.scope().allows_name(name) || !group.scope().allows_phase(phase) {
                continue;
            }

            let mut component_matched = false;

            if let Some(candidates) = group.lookup(name, phase, outcome) {
                let eligible: Vec<&Handler> = candidates
                    .into_iter()
                    .filter(|h| self.is_eligible(h, holder, outcome))
                    .collect();

                let winners = if matches!(outcome, Some(Outcome::Failure)) {
                    most_specific(&eligible, holder.throwable())
                } else {
                    eligible
                };

                if !winners.is_empty() {
                    component_matched = true;
                    any_ran = true;
                    for handler in &winners {
                        self.invoke(handler, &ctx);
                    }
                }
            }

            if !component_matched {
                let fallback = group.component_unmatched(phase);
                if !fallback.is_empty() {
                    any_ran = true;
                    for handler in fallback {
                        self.invoke(handler, &ctx);
                    }
                }
            }
        }

        if !any_ran {
            for group in self.registry.groups() {
                if !group.is_global_fallback() {
                    continue;
                }
                let fallback = group.global_unmatched(phase);
                if !fallback.is_empty() {
                    any_ran = true;
                    for handler in fallback {
                        self.invoke(handler, &ctx);
                    }
                }
            }
        }

        if !any_ran {
            log::error!(
                "unhandled signal: name=`{}` phase={} trace={} span={}{}",
                name,
                phase,
                holder.trace_id(),
                holder.span_id(),
                holder
                    .throwable()
                    .map(|t| format!(" error={t}"))
                    .unwrap_or_default(),
            );
        }
    }

    fn is_eligible(&self, handler: &Handler, holder: &Holder, outcome: Option<Outcome>) -> bool {
        let required = handler.required();

        for key in &required.attrs {
            if !present(holder.attributes().get(key.as_str())) {
                log::warn!(
                    "handler `{}` dropped: required attribute `{}` was not present",
                    handler.diagnostic_id(),
                    key
                );
                return false;
            }
        }
        for key in &required.context {
            if !present(holder.event_context().get(key.as_str())) {
                log::warn!(
                    "handler `{}` dropped: required context `{}` was not present",
                    handler.diagnostic_id(),
                    key
                );
                return false;
            }
        }
        if let Some(selector) = required.throwable {
            let resolved = holder.throwable().and_then(|t| selector.resolve(t));
            if resolved.is_none() {
                log::warn!(
                    "handler `{}` dropped: required throwable source `{}` was absent",
                    handler.diagnostic_id(),
                    selector.label()
                );
                return false;
            }
        }

        if matches!(outcome, Some(Outcome::Failure)) {
            match holder.throwable() {
                Some(t) => t.specificity_of(handler.bound_class()).is_some(),
                None => false,
            }
        } else {
            true
        }
    }

    fn invoke(&self, handler: &Handler, ctx: &HandlerContext) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| handler.invoke(ctx)));
        if result.is_err() {
            log::warn!(
                "handler `{}` panicked handling `{}` at {}; suppressed",
                handler.diagnostic_id(),
                ctx.holder().name(),
                ctx.lifecycle()
            );
        }
    }
}

impl Emitter for DispatchBus {
    fn flow_started(&self, holder: &Holder) {
        self.dispatch(Lifecycle::FlowStarted, holder, None);
    }

    fn flow_finished(&self, holder: &Holder) {
        self.dispatch(Lifecycle::FlowFinished, holder, None);
    }

    fn root_flow_finished(&self, batch: &Batch) {
        let snapshot = batch.snapshot();
        for root in snapshot.iter().filter(|h| h.parent_span_id().is_none()) {
            self.dispatch(Lifecycle::RootFlowFinished, root, Some(&snapshot));
        }
    }
}

fn present(value: Option<&AttrValue>) -> bool {
    !matches!(value, None | Some(AttrValue::Null))
}

/// Failure-specificity resolution (spec §4.7.5): keep only the candidates
/// bound to the most specific class still assignable from `throwable`; ties
/// at that rank all run.
fn most_specific<'a>(handlers: &[&'a Handler], throwable: Option<&Throwable>) -> Vec<&'a Handler> {
    let throwable = match throwable {
        Some(t) => t,
        None => return handlers.to_vec(),
    };
    let min_rank = handlers
        .iter()
        .filter_map(|h| throwable.specificity_of(h.bound_class()))
        .min();
    match min_rank {
        Some(min_rank) => handlers
            .iter()
            .filter(|h| throwable.specificity_of(h.bound_class()) == Some(min_rank))
            .copied()
            .collect(),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::RequiredBindings;
    use crate::ids::{SpanId, TraceId};
    use crate::metadata::Kind;
    use crate::registry::{compile, ComponentSpec, HandlerSpec, Intent, ThrowableBinding};
    use crate::state::{self, BeginOptions, SessionOutcome};
    use std::sync::{Arc, Mutex};

    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("bad argument")]
    struct IllegalArgumentError;
    impl crate::throwable::Classify for IllegalArgumentError {
        fn classes() -> &'static [&'static str] {
            &["IllegalArgumentError", "RuntimeError"]
        }
    }

    fn recorder_handler(log: Arc<Mutex<Vec<String>>>, intent: Intent, name: &str) -> HandlerSpec {
        let tag = format!("{name}");
        HandlerSpec {
            intent,
            name: Some(name.to_string()),
            required: RequiredBindings::none(),
            throwable: ThrowableBinding::default(),
            explicit_lifecycles: None,
            func: Arc::new(move |_ctx| log.lock().unwrap().push(tag.clone())),
        }
    }

    fn leaf_holder(name: &str) -> Holder {
        let trace = TraceId::generate();
        let span = SpanId::generate();
        Holder::new(name, Kind::Internal, trace, span, None, trace, false)
    }

    #[test]
    fn simple_flow_dispatches_once_with_correct_outcome() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let spec = ComponentSpec {
            handlers: vec![recorder_handler(
                log.clone(),
                Intent::Completed { outcome: None, wants_batch: false },
                "checkout.start",
            )],
            ..ComponentSpec::new("c")
        };
        let bus = DispatchBus::new(compile(vec![spec]).unwrap());

        let holder = leaf_holder("checkout.start");
        bus.flow_finished(&holder);

        assert_eq!(*log.lock().unwrap(), vec!["checkout.start"]);
    }

    #[test]
    fn dot_chop_prefers_the_most_specific_registered_tier() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let spec = ComponentSpec {
            handlers: vec![
                recorder_handler(
                    log.clone(),
                    Intent::Completed { outcome: None, wants_batch: false },
                    "orders",
                ),
                recorder_handler(
                    log.clone(),
                    Intent::Completed { outcome: None, wants_batch: false },
                    "orders.create",
                ),
            ],
            ..ComponentSpec::new("c")
        };
        let bus = DispatchBus::new(compile(vec![spec]).unwrap());

        let holder = leaf_holder("orders.create.details");
        bus.flow_finished(&holder);

        assert_eq!(*log.lock().unwrap(), vec!["orders.create"]);
    }

    #[test]
    fn dot_chop_falls_through_to_a_broader_tier_when_the_narrow_tier_has_the_wrong_bucket() {
        // "orders.create" only has a SUCCESS handler; a failed flow named
        // "orders.create" must fall through to the broader "orders" tier's
        // FAILURE handler rather than stopping at "orders.create" just
        // because *some* handler is registered there.
        let log = Arc::new(Mutex::new(Vec::new()));
        let success_only = HandlerSpec {
            intent: Intent::Success,
            name: Some("orders.create".to_string()),
            required: RequiredBindings::none(),
            throwable: ThrowableBinding::default(),
            explicit_lifecycles: None,
            func: {
                let log = log.clone();
                Arc::new(move |_ctx| log.lock().unwrap().push("orders.create:success".to_string()))
            },
        };
        let failure_broad = HandlerSpec {
            intent: Intent::Failure,
            name: Some("orders".to_string()),
            required: RequiredBindings::none(),
            throwable: ThrowableBinding::default(),
            explicit_lifecycles: None,
            func: {
                let log = log.clone();
                Arc::new(move |_ctx| log.lock().unwrap().push("orders:failure".to_string()))
            },
        };
        let spec = ComponentSpec {
            handlers: vec![success_only, failure_broad],
            ..ComponentSpec::new("c")
        };
        let bus = DispatchBus::new(compile(vec![spec]).unwrap());

        let mut holder = leaf_holder("orders.create");
        holder.attach_throwable(Throwable::capture_opaque(IllegalArgumentError));
        bus.flow_finished(&holder);

        assert_eq!(*log.lock().unwrap(), vec!["orders:failure"]);
    }

    #[test]
    fn failure_specificity_picks_the_most_derived_binding() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = |class: &'static str| HandlerSpec {
            intent: Intent::Failure,
            name: Some("billing".to_string()),
            required: RequiredBindings::none(),
            throwable: ThrowableBinding { class },
            explicit_lifecycles: None,
            func: {
                let log = log.clone();
                Arc::new(move |_ctx| log.lock().unwrap().push(class.to_string()))
            },
        };
        let spec = ComponentSpec {
            handlers: vec![
                make("Throwable"),
                make("RuntimeError"),
                make("IllegalArgumentError"),
            ],
            ..ComponentSpec::new("c")
        };
        let bus = DispatchBus::new(compile(vec![spec]).unwrap());

        let mut holder = leaf_holder("billing");
        holder.attach_throwable(Throwable::capture(IllegalArgumentError));
        bus.flow_finished(&holder);

        assert_eq!(*log.lock().unwrap(), vec!["IllegalArgumentError"]);
    }

    #[test]
    fn scope_excludes_component_and_its_unmatched_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let scoped = ComponentSpec {
            scope_prefixes: vec!["orders.".to_string()],
            handlers: vec![recorder_handler(log.clone(), Intent::Unmatched, "scoped-unmatched")],
            ..ComponentSpec::new("A")
        };
        let global = ComponentSpec {
            is_global_fallback: true,
            handlers: vec![recorder_handler(log.clone(), Intent::Unmatched, "global-unmatched")],
            ..ComponentSpec::new("B")
        };
        let bus = DispatchBus::new(compile(vec![scoped, global]).unwrap());

        let holder = leaf_holder("payments.charge");
        bus.flow_finished(&holder);

        assert_eq!(*log.lock().unwrap(), vec!["global-unmatched"]);
    }

    #[test]
    fn batch_binding_delivers_root_and_child_in_start_order() {
        let log: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let log_for_handler = log.clone();
        let spec = ComponentSpec {
            handlers: vec![HandlerSpec {
                intent: Intent::Completed { outcome: None, wants_batch: true },
                name: Some("root".to_string()),
                required: RequiredBindings::none(),
                throwable: ThrowableBinding::default(),
                explicit_lifecycles: None,
                func: Arc::new(move |ctx| {
                    log_for_handler.lock().unwrap().push(ctx.batch().unwrap().len());
                }),
            }],
            ..ComponentSpec::new("c")
        };
        let registry = compile(vec![spec]).unwrap();
        let bus: Arc<dyn Emitter> = Arc::new(DispatchBus::new(registry));

        let root = state::begin(bus.clone(), BeginOptions::flow("root"));
        let child = state::begin(bus.clone(), BeginOptions::step("root.child"));
        child.end(SessionOutcome::Success);
        root.end(SessionOutcome::Success);

        assert_eq!(*log.lock().unwrap(), vec![2]);
    }
}
