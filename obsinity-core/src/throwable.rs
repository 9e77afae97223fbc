//! Captured errors and the classification chain used for failure
//! specificity (spec §4.7, §9 "Throwable sub-typing selection").
//!
//! Rust has no class hierarchy to reflect on, so a captured error's
//! "superclasses" are declared explicitly by implementing [`Classify`] for
//! the concrete error type, most-specific class name first. A handler bound
//! to a name from that chain is "assignable from" the captured error; the
//! chain's index doubles as the specificity rank the dispatch bus uses to
//! pick the most specific matching handler.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// The reserved class name every captured error answers to, win or lose:
/// a handler bound to `Throwable`/`Exception` in the source spec collapses
/// to this generic slot (spec §4.5, "bare `Throwable`/`Exception` collapse
/// to a single 'generic' slot").
pub const GENERIC_CLASS: &str = "Throwable";

/// Declares the single-inheritance classification chain for a concrete
/// error type, most specific first. Types that don't implement this can
/// still be captured via [`Throwable::capture_opaque`], which classifies
/// them as generic only.
pub trait Classify: StdError + Send + Sync + 'static {
    /// The chain of class names this error answers to, most specific first.
    /// Must not include [`GENERIC_CLASS`]; it is appended implicitly.
    fn classes() -> &'static [&'static str];
}

/// A captured, type-erased error plus its classification chain — the
/// Rust analogue of a caught `Throwable` together with its runtime class.
#[derive(Clone)]
pub struct Throwable {
    inner: Arc<dyn StdError + Send + Sync + 'static>,
    classes: Vec<&'static str>,
}

impl Throwable {
    /// Capture a concrete, classified error.
    pub fn capture<E: Classify>(error: E) -> Self {
        let mut classes: Vec<&'static str> = E::classes().to_vec();
        classes.push(GENERIC_CLASS);
        Throwable {
            inner: Arc::new(error),
            classes,
        }
    }

    /// Capture an error with no declared classification; it is only
    /// assignable to the generic slot. Used for `cause`/`root-cause`
    /// selections, whose underlying type is erased by
    /// `std::error::Error::source`, and for ad hoc errors at the
    /// instrumentation boundary.
    pub fn capture_opaque<E: StdError + Send + Sync + 'static>(error: E) -> Self {
        Throwable {
            inner: Arc::new(error),
            classes: vec![GENERIC_CLASS],
        }
    }

    /// The classification chain, most specific first, always ending in
    /// [`GENERIC_CLASS`].
    pub fn classes(&self) -> &[&'static str] {
        &self.classes
    }

    /// Whether `class_name` appears anywhere in this throwable's chain,
    /// i.e. whether a handler bound to `class_name` is "assignable from"
    /// this error.
    pub fn is_a(&self, class_name: &str) -> bool {
        self.classes.iter().any(|c| *c == class_name)
    }

    /// The specificity rank of `class_name` against this throwable: its
    /// index in the chain (0 = exact match, the most specific possible).
    /// `None` if not assignable.
    pub fn specificity_of(&self, class_name: &str) -> Option<usize> {
        self.classes.iter().position(|c| *c == class_name)
    }

    /// The underlying error, type-erased.
    pub fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.inner
    }

    /// The `cause` of this throwable: `std::error::Error::source`, captured
    /// as an opaque (generic-only) throwable.
    pub fn cause(&self) -> Option<Throwable> {
        source_message(self.as_error()).map(Throwable::from_display)
    }

    /// The `root-cause`: walk the `source()` chain to its end.
    pub fn root_cause(&self) -> Option<Throwable> {
        let mut current: &(dyn StdError + 'static) = self.as_error();
        let mut last = None;
        while let Some(next) = current.source() {
            last = Some(next);
            current = next;
        }
        last.map(|e| Throwable::from_display(e.to_string()))
    }

    fn from_display(message: String) -> Self {
        Throwable {
            inner: Arc::new(OpaqueMessage(message)),
            classes: vec![GENERIC_CLASS],
        }
    }
}

fn source_message(error: &(dyn StdError + 'static)) -> Option<String> {
    error.source().map(|s| s.to_string())
}

impl fmt::Debug for Throwable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Throwable")
            .field("classes", &self.classes)
            .field("message", &self.inner.to_string())
            .finish()
    }
}

impl fmt::Display for Throwable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

#[derive(Debug)]
struct OpaqueMessage(String);

impl fmt::Display for OpaqueMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StdError for OpaqueMessage {}

#[cfg(test)]
mod tests {
    use super::*;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("bad argument: {0}")]
    struct IllegalArgumentError(String);

    impl Classify for IllegalArgumentError {
        fn classes() -> &'static [&'static str] {
            &["IllegalArgumentError", "RuntimeError"]
        }
    }

    #[test]
    fn classification_chain_ends_in_generic() {
        let t = Throwable::capture(IllegalArgumentError("x".into()));
        assert_eq!(
            t.classes(),
            &["IllegalArgumentError", "RuntimeError", "Throwable"]
        );
    }

    #[test]
    fn specificity_prefers_lower_index() {
        let t = Throwable::capture(IllegalArgumentError("x".into()));
        assert_eq!(t.specificity_of("IllegalArgumentError"), Some(0));
        assert_eq!(t.specificity_of("RuntimeError"), Some(1));
        assert_eq!(t.specificity_of("Throwable"), Some(2));
        assert_eq!(t.specificity_of("SomethingElse"), None);
    }

    #[test]
    fn opaque_capture_is_generic_only() {
        let t = Throwable::capture_opaque(OpaqueMessage("boom".into()));
        assert!(t.is_a(GENERIC_CLASS));
        assert!(!t.is_a("RuntimeError"));
    }
}
