use thiserror::Error;

use crate::record::RecordType;

/// Errors raised by record accessors and record arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    /// Accessor or operator does not apply to the record's current type.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: RecordType,
    },
    /// Integer division or modulus by zero.
    #[error("division by zero")]
    DivisionByZero,
    /// Array write past the maximum array length.
    #[error("index {index} exceeds the array limit of {limit}")]
    IndexTooLarge { index: usize, limit: usize },
}
