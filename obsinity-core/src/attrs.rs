//! The dynamic value type stored in a [`Holder`](crate::holder::Holder)'s
//! `attributes` and `eventContext` maps, plus the coercions the parameter
//! binders (C8) apply when pulling a value into a typed handler argument.

use indexmap::IndexMap;
use std::fmt;

/// An insertion-ordered string-keyed map, used for both the persisted
/// `attributes` and the ephemeral `eventContext` of a [`Holder`](crate::holder::Holder).
pub type AttrMap = IndexMap<String, AttrValue>;

/// A value placed into a holder's attributes or event context.
///
/// This mirrors the primitive set `tracing-core` records field values as
/// (`i64`, `u64`, `f64`, `bool`, string), but as an owned, dynamically typed
/// enum rather than a `dyn Value` trait object, since attributes here are
/// written at runtime via `put_attr`/`put_context` rather than declared
/// statically at a callsite.
#[derive(Clone, Debug, PartialEq)]
pub enum AttrValue {
    /// The explicit absence of a value. Writes of `None` are accepted by the
    /// holder but the producer-side binder may elide them (spec §4.2).
    Null,
    /// A boolean value.
    Bool(bool),
    /// A signed integer value.
    Int(i64),
    /// An unsigned integer value.
    UInt(u64),
    /// A floating point value.
    Float(f64),
    /// A string value.
    Str(String),
}

impl AttrValue {
    /// Render this value with `Display` semantics, used when the binder's
    /// target type is a string (spec §4.8, "`toString` when target is
    /// string").
    pub fn render(&self) -> String {
        match self {
            AttrValue::Null => String::new(),
            AttrValue::Bool(b) => b.to_string(),
            AttrValue::Int(i) => i.to_string(),
            AttrValue::UInt(u) => u.to_string(),
            AttrValue::Float(f) => f.to_string(),
            AttrValue::Str(s) => s.clone(),
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}
impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}
impl From<i32> for AttrValue {
    fn from(v: i32) -> Self {
        AttrValue::Int(v as i64)
    }
}
impl From<u64> for AttrValue {
    fn from(v: u64) -> Self {
        AttrValue::UInt(v)
    }
}
impl From<u32> for AttrValue {
    fn from(v: u32) -> Self {
        AttrValue::UInt(v as u64)
    }
}
impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}
impl From<f32> for AttrValue {
    fn from(v: f32) -> Self {
        AttrValue::Float(v as f64)
    }
}
impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Str(v)
    }
}
impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_owned())
    }
}
impl<T: Into<AttrValue>> From<Option<T>> for AttrValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => AttrValue::Null,
        }
    }
}

/// A value that can be coerced *from* an [`AttrValue`] for a parameter
/// binder, per spec §4.8: identity for assignable, widening numeric
/// coercions for the numeric target types, and `toString` when the target is
/// a string. Coercions never narrow: an unassignable conversion yields
/// `None`, producing an unbound argument for that parameter rather than a
/// silent downcast.
pub trait FromAttrValue: Sized {
    /// Attempt to coerce `value` into `Self`.
    fn coerce(value: &AttrValue) -> Option<Self>;
}

impl FromAttrValue for AttrValue {
    fn coerce(value: &AttrValue) -> Option<Self> {
        Some(value.clone())
    }
}

impl FromAttrValue for bool {
    fn coerce(value: &AttrValue) -> Option<Self> {
        match value {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl FromAttrValue for i64 {
    fn coerce(value: &AttrValue) -> Option<Self> {
        match value {
            AttrValue::Int(i) => Some(*i),
            AttrValue::UInt(u) if i64::try_from(*u).is_ok() => i64::try_from(*u).ok(),
            _ => None,
        }
    }
}

impl FromAttrValue for u64 {
    fn coerce(value: &AttrValue) -> Option<Self> {
        match value {
            AttrValue::UInt(u) => Some(*u),
            AttrValue::Int(i) if *i >= 0 => Some(*i as u64),
            _ => None,
        }
    }
}

impl FromAttrValue for f64 {
    fn coerce(value: &AttrValue) -> Option<Self> {
        // Widening numeric coercion: integers may always widen to float
        // without a meaningful loss of precision, but floats never narrow
        // back to an integer type.
        match value {
            AttrValue::Float(f) => Some(*f),
            AttrValue::Int(i) => Some(*i as f64),
            AttrValue::UInt(u) => Some(*u as f64),
            _ => None,
        }
    }
}

impl FromAttrValue for String {
    fn coerce(value: &AttrValue) -> Option<Self> {
        Some(value.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_widens_to_float_but_not_the_reverse() {
        let i = AttrValue::Int(42);
        assert_eq!(f64::coerce(&i), Some(42.0));
        let f = AttrValue::Float(1.5);
        assert_eq!(i64::coerce(&f), None);
        assert_eq!(u64::coerce(&f), None);
    }

    #[test]
    fn string_target_uses_to_string() {
        assert_eq!(String::coerce(&AttrValue::Int(7)), Some("7".to_string()));
        assert_eq!(
            String::coerce(&AttrValue::Bool(true)),
            Some("true".to_string())
        );
    }

    #[test]
    fn unassignable_conversion_yields_none_not_a_downcast() {
        assert_eq!(bool::coerce(&AttrValue::Str("true".into())), None);
        assert_eq!(i64::coerce(&AttrValue::Str("7".into())), None);
    }

    #[test]
    fn negative_int_does_not_coerce_to_unsigned() {
        assert_eq!(u64::coerce(&AttrValue::Int(-1)), None);
    }
}
