//! End-to-end tests driving the builder → compile → dispatch → handler path
//! through the public facade, mirroring `tracing-core/tests/dispatch.rs`'s
//! style of hand-rolled recorder state rather than a mocking crate.

use std::sync::{Arc, Mutex};

use obsinity::{
    begin_flow, begin_step, push_attr, put_attr, put_context, Classify, HandlerSetBuilder, Outcome,
    Selector,
};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("checkout rejected: {0}")]
struct CheckoutRejected(String);

impl Classify for CheckoutRejected {
    fn classes() -> &'static [&'static str] {
        &["CheckoutRejected"]
    }
}

fn recorder_bus(
    log: Arc<Mutex<Vec<String>>>,
) -> Result<obsinity_core::DispatchBus, Vec<obsinity_core::RegistrationError>> {
    let success_log = log.clone();
    let failure_log = log.clone();
    let batch_log = log.clone();

    HandlerSetBuilder::new()
        .component("checkout", |c| {
            c.on_flow_started("checkout.start")
                .invoke({
                    let log = log.clone();
                    move |ctx| log.lock().unwrap().push(format!("started:{}", ctx.holder().name()))
                })
                .on_flow_completed("checkout.start")
                .outcome(Outcome::Success)
                .invoke(move |ctx| {
                    let user: Option<String> = ctx.attr("user_id");
                    success_log
                        .lock()
                        .unwrap()
                        .push(format!("success:{}", user.unwrap_or_default()))
                })
                .on_flow_failure("checkout.start")
                .catches::<CheckoutRejected>()
                .require_throwable(Selector::Itself)
                .invoke(move |ctx| {
                    failure_log
                        .lock()
                        .unwrap()
                        .push(format!("failure:{}", ctx.throwable().unwrap()))
                })
                .on_flow_completed("checkout.start")
                .wants_batch()
                .invoke(move |ctx| {
                    batch_log
                        .lock()
                        .unwrap()
                        .push(format!("batch:{}", ctx.batch().unwrap().len()))
                })
        })
        .build()
}

#[test]
fn successful_flow_with_nested_step_runs_started_success_and_batch_handlers() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let bus: Arc<dyn obsinity_core::Emitter> = Arc::new(recorder_bus(log.clone()).unwrap());

    let flow = obsinity_core::state::begin(bus.clone(), obsinity_core::BeginOptions::flow("checkout.start").push(push_attr("user_id", "u-42")));
    let step = obsinity_core::state::begin(bus.clone(), obsinity_core::BeginOptions::step("checkout.start.validate"));
    step.end(obsinity_core::SessionOutcome::Success);
    flow.end(obsinity_core::SessionOutcome::Success);

    let entries = log.lock().unwrap();
    assert!(entries.contains(&"started:checkout.start".to_string()));
    assert!(entries.contains(&"success:u-42".to_string()));
    assert!(entries.contains(&"batch:2".to_string()));
    assert!(!entries.iter().any(|e| e.starts_with("failure:")));
}

#[test]
fn failed_flow_runs_the_matching_typed_failure_handler() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let bus: Arc<dyn obsinity_core::Emitter> = Arc::new(recorder_bus(log.clone()).unwrap());

    let flow = obsinity_core::state::begin(bus, obsinity_core::BeginOptions::flow("checkout.start"));
    flow.end(obsinity_core::SessionOutcome::Failure(
        obsinity_core::Throwable::capture(CheckoutRejected("insufficient funds".into())),
    ));

    let entries = log.lock().unwrap();
    assert!(entries
        .iter()
        .any(|e| e == "failure:checkout rejected: insufficient funds"));
    assert!(!entries.iter().any(|e| e.starts_with("success:")));
}

#[test]
fn dropped_guard_without_end_still_completes_as_a_failure() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let bus: Arc<dyn obsinity_core::Emitter> = Arc::new(recorder_bus(log.clone()).unwrap());

    {
        let _flow = obsinity_core::state::begin(bus, obsinity_core::BeginOptions::flow("checkout.start"));
        // intentionally dropped without end()
    }

    // The generic failure is captured (no CheckoutRejected binding matches a
    // DroppedWithoutEnd throwable), so only the batch handler (which matches
    // either outcome) and nothing typed to CheckoutRejected should have run.
    let entries = log.lock().unwrap();
    assert!(!entries.iter().any(|e| e.starts_with("failure:")));
    assert!(entries.iter().any(|e| e.starts_with("batch:")));
}

#[test]
fn facade_begin_flow_and_begin_step_track_attrs_through_put_attr() {
    // Exercises the ergonomic facade entry points directly; since no
    // dispatcher is installed in this process, this only verifies the
    // guards drive the state machine without panicking and that put_attr
    // reaches the active holder.
    let flow = begin_flow("demo.run");
    put_attr("stage", "warm-up");
    let step = begin_step("demo.run.compute");
    put_context("note", "nested");
    step.success();
    flow.success();
}
