//! Field restrictions: per-value predicates evaluated after parsing and
//! before every write.

use std::fmt;

use crate::fieldtypes::FieldValue;

/// A predicate over a single field value.
///
/// Implementations report the violation as a human-readable reason; the
/// state wraps it with the field name.
pub trait FieldRestriction: fmt::Debug + Send + Sync {
    fn check(&self, value: &FieldValue) -> Result<(), String>;
}

/// Rejects null values.
#[derive(Debug)]
pub struct NonNull;

impl FieldRestriction for NonNull {
    fn check(&self, value: &FieldValue) -> Result<(), String> {
        if matches!(value, FieldValue::Null) {
            Err("value must not be null".to_string())
        } else {
            Ok(())
        }
    }
}

/// Bounds an integer field inclusively.
#[derive(Debug)]
pub struct IntRange {
    pub min: i64,
    pub max: i64,
}

impl FieldRestriction for IntRange {
    fn check(&self, value: &FieldValue) -> Result<(), String> {
        let v = match value {
            FieldValue::I8(x) => i64::from(*x),
            FieldValue::I16(x) => i64::from(*x),
            FieldValue::I32(x) => i64::from(*x),
            FieldValue::I64(x) => *x,
            other => return Err(format!("range restriction on non-integer value {other:?}")),
        };
        if v < self.min || v > self.max {
            return Err(format!("{v} outside [{}, {}]", self.min, self.max));
        }
        Ok(())
    }
}
