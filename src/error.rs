use std::io;

use thiserror::Error;

use crate::streams::StreamError;

/// Errors surfaced by the runtime.
///
/// Lookup misses on the hot path (`get_by_id` with an out-of-range id) are
/// reported as `None` instead of an error; everything else ends up here.
#[derive(Debug, Error)]
pub enum SkillError {
    /// An id or string index was out of range on an explicit lookup.
    #[error("invalid index {index} into a table of size {size}")]
    InvalidPoolIndex { index: u64, size: usize },

    /// A chunk's declared byte length did not match what decoding or
    /// encoding actually consumed.
    #[error("field data of {field} does not match its chunk: {expected} bytes declared, {consumed} consumed")]
    PoolSizeMismatch {
        field: String,
        expected: u64,
        consumed: u64,
    },

    /// A field-level predicate failed.
    #[error("restriction violated on field {field}: {reason}")]
    RestrictionViolation { field: String, reason: String },

    /// Structural mutation was attempted while the pool was fixed.
    #[error("pool {pool} is fixed and cannot be modified")]
    PoolFixed { pool: String },

    /// A constant-length array value had the wrong number of elements.
    #[error("constant length array expects {expected} elements, got {actual}")]
    WrongConstantLength { expected: u64, actual: usize },

    #[error("invalid field type tag {0}")]
    InvalidFieldTag(i64),

    /// The string at `id` is absent, unmapped or not valid UTF-8.
    #[error("string {id} cannot be materialized")]
    InvalidString { id: u64 },

    /// A value handed to a field does not match the field's type.
    #[error("value does not match the field type, expected {expected}")]
    TypeMismatch { expected: &'static str },

    #[error("malformed type section: {0}")]
    InvalidTypeSection(String),

    #[error("malformed field data: {0}")]
    MalformedData(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The state has no backing file, so there is nothing to append to.
    #[error("state has no backing file to append to")]
    NoBackingFile,

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Io(#[from] io::Error),
}
