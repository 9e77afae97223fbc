//! OpenTelemetry-compatible trace and span identifiers (C1).
//!
//! Trace ids are 128-bit values rendered as 32 lowercase hex characters; span
//! ids are 64-bit values rendered as 16 lowercase hex characters. The
//! all-zero value is reserved and is never produced by [`TraceId::generate`]
//! or [`SpanId::generate`].

use std::fmt;
use std::num::ParseIntError;

use rand::{rngs, Rng, SeedableRng};
use std::cell::RefCell;

thread_local! {
    static CURRENT_RNG: RefCell<rngs::SmallRng> = RefCell::new(rngs::SmallRng::from_entropy());
}

/// A 128-bit value which identifies a trace.
///
/// The id is valid if it contains at least one non-zero byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId(u128);

impl TraceId {
    /// The reserved, invalid all-zero trace id.
    pub const INVALID: TraceId = TraceId(0);

    /// Generate a new random trace id, retrying on the (astronomically
    /// unlikely) all-zero case so the result is always valid.
    pub fn generate() -> Self {
        loop {
            let candidate = CURRENT_RNG.with(|rng| rng.borrow_mut().gen::<u128>());
            if candidate != 0 {
                return TraceId(candidate);
            }
        }
    }

    /// Construct a trace id from its big-endian byte representation.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        TraceId(u128::from_be_bytes(bytes))
    }

    /// Return the big-endian byte representation of this trace id.
    pub const fn to_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    /// Parse a 32-character lowercase (or mixed-case) hex string into a trace id.
    pub fn from_hex(hex: &str) -> Result<Self, ParseIntError> {
        u128::from_str_radix(hex, 16).map(TraceId)
    }

    /// Returns `true` unless this is the reserved all-zero value.
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl From<u128> for TraceId {
    fn from(value: u128) -> Self {
        TraceId(value)
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// A 64-bit value which identifies a span within a trace.
///
/// The id is valid if it contains at least one non-zero byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId(u64);

impl SpanId {
    /// The reserved, invalid all-zero span id.
    pub const INVALID: SpanId = SpanId(0);

    /// Generate a new random span id, retrying on the all-zero case.
    pub fn generate() -> Self {
        loop {
            let candidate = CURRENT_RNG.with(|rng| rng.borrow_mut().gen::<u64>());
            if candidate != 0 {
                return SpanId(candidate);
            }
        }
    }

    /// Construct a span id from its big-endian byte representation.
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        SpanId(u64::from_be_bytes(bytes))
    }

    /// Return the big-endian byte representation of this span id.
    pub const fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Parse a 16-character hex string into a span id.
    pub fn from_hex(hex: &str) -> Result<Self, ParseIntError> {
        u64::from_str_radix(hex, 16).map(SpanId)
    }

    /// Returns `true` unless this is the reserved all-zero value.
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl From<u64> for SpanId {
    fn from(value: u64) -> Self {
        SpanId(value)
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_ids_are_never_invalid() {
        for _ in 0..1000 {
            assert!(TraceId::generate().is_valid());
        }
    }

    #[test]
    fn span_ids_are_never_invalid() {
        for _ in 0..1000 {
            assert!(SpanId::generate().is_valid());
        }
    }

    #[test]
    fn trace_id_hex_round_trips() {
        let id = TraceId::generate();
        let rendered = format!("{}", id);
        assert_eq!(rendered.len(), 32);
        assert_eq!(TraceId::from_hex(&rendered).unwrap(), id);
    }

    #[test]
    fn span_id_hex_round_trips() {
        let id = SpanId::generate();
        let rendered = format!("{}", id);
        assert_eq!(rendered.len(), 16);
        assert_eq!(SpanId::from_hex(&rendered).unwrap(), id);
    }
}
