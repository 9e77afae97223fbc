//! Metadata describing a [`Holder`](crate::holder::Holder): its span kind,
//! the lifecycle phase a signal was emitted for, and the outcome bucket a
//! finish signal falls into.

use std::fmt;

/// The OpenTelemetry-compatible span kind of a flow or step.
///
/// Method-level kind overrides component-level kind; absent both, the
/// default is [`Kind::Internal`] (spec §6, "Span-kind mapping").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Handles an inbound request (e.g. serving an RPC).
    Server,
    /// Issues an outbound request (e.g. calling another service).
    Client,
    /// Produces a message onto a queue/topic.
    Producer,
    /// Consumes a message from a queue/topic.
    Consumer,
    /// Everything else; the default.
    Internal,
}

impl Kind {
    /// The stable, OTEL-compatible name for this kind.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Kind::Server => "SERVER",
            Kind::Client => "CLIENT",
            Kind::Producer => "PRODUCER",
            Kind::Consumer => "CONSUMER",
            Kind::Internal => "INTERNAL",
        }
    }
}

impl Default for Kind {
    /// Absent any class- or method-level override, the default is `INTERNAL`.
    fn default() -> Self {
        Kind::Internal
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The lifecycle phase a signal was emitted for.
///
/// There is deliberately no `Completed` phase: "completed" handlers are a
/// registration-time abstraction (`flowCompleted`) over `FlowFinished` (or
/// `RootFlowFinished`, inferred from a batch parameter) that accepts either
/// outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    /// A flow or step was just opened.
    FlowStarted,
    /// A flow or step just finished (normally or with an error).
    FlowFinished,
    /// A root flow just finished; delivered once, with the full batch.
    RootFlowFinished,
}

impl Lifecycle {
    /// All lifecycle phases, in emission order for a given flow.
    pub const ALL: [Lifecycle; 3] = [
        Lifecycle::FlowStarted,
        Lifecycle::FlowFinished,
        Lifecycle::RootFlowFinished,
    ];
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Lifecycle::FlowStarted => "FLOW_STARTED",
            Lifecycle::FlowFinished => "FLOW_FINISHED",
            Lifecycle::RootFlowFinished => "ROOT_FLOW_FINISHED",
        };
        f.write_str(s)
    }
}

/// The outcome of a finished flow; meaningful only at finish phases.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// The flow completed without a captured throwable.
    Success,
    /// The flow completed with a captured throwable.
    Failure,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Success => "SUCCESS",
            Outcome::Failure => "FAILURE",
        };
        f.write_str(s)
    }
}

/// The outcome bucket a compiled handler is registered under.
///
/// This is the compiler-time generalization of `Outcome`: a `flowStarted`
/// handler lives in the `Started` bucket (no outcome is meaningful yet), and
/// a `flowCompleted` handler with no declared outcome lives in both `Success`
/// and `Failure` simultaneously (modeled here as `Completed`, which matches
/// either).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OutcomeBucket {
    /// Matches `FLOW_STARTED` only.
    Started,
    /// Matches a successful finish only.
    Success,
    /// Matches a failed finish only.
    Failure,
    /// Matches either outcome at a finish phase.
    Completed,
}

impl OutcomeBucket {
    /// Whether this bucket is eligible given the flow's concrete outcome.
    pub fn matches(&self, outcome: Outcome) -> bool {
        match (self, outcome) {
            (OutcomeBucket::Completed, _) => true,
            (OutcomeBucket::Success, Outcome::Success) => true,
            (OutcomeBucket::Failure, Outcome::Failure) => true,
            _ => false,
        }
    }
}

/// Validates the identifier grammar required of flow/step names:
/// `[A-Za-z0-9_]+(\.[A-Za-z0-9_]+)*`.
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    name.split('.').all(|segment| {
        !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_dotted_identifiers() {
        assert!(is_valid_name("orders"));
        assert!(is_valid_name("orders.create_details"));
        assert!(is_valid_name("a.b.c"));
    }

    #[test]
    fn rejects_malformed_identifiers() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("."));
        assert!(!is_valid_name(".orders"));
        assert!(!is_valid_name("orders."));
        assert!(!is_valid_name("orders..create"));
        assert!(!is_valid_name("orders create"));
        assert!(!is_valid_name("orders-create"));
    }

    #[test]
    fn default_kind_is_internal() {
        assert_eq!(Kind::default(), Kind::Internal);
    }
}
