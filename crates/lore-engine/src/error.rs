use lore_core::RecordError;
use thiserror::Error;

/// Errors returned by knowledge base operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KbError {
    /// Malformed expression text. The context is untouched.
    #[error("syntax error at {position}: {message}")]
    Syntax { position: usize, message: String },
    /// Record accessor or arithmetic failure during evaluation.
    #[error(transparent)]
    Record(#[from] RecordError),
    /// Reentrant call from inside a callback on the same context.
    #[error("knowledge base is locked by an active callback on this thread")]
    Locked,
    /// Call to a function that was never defined.
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    /// Name pattern with a wildcard anywhere but the end.
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),
    /// Negative array index, or a write past the array limit.
    #[error("invalid index: {0}")]
    InvalidIndex(i64),
    /// `to_list` range longer than the list limit.
    #[error("list range {start}..={end} exceeds {limit} entries")]
    RangeTooLarge { start: i64, end: i64, limit: usize },
    /// Expression evaluation nested past the depth limit.
    #[error("evaluation nested deeper than {0} levels")]
    NestingLimit(usize),
    /// Nested function calls exceeded the depth limit.
    #[error("recursion limit of {0} calls exceeded")]
    RecursionLimit(usize),
    /// A user callback failed or panicked.
    #[error("callback failed: {0}")]
    Callback(String),
    /// An attached transport rejected the outbound batch.
    #[error("dissemination failed: {0}")]
    Dissemination(String),
}

impl KbError {
    pub(crate) fn syntax(position: usize, message: impl Into<String>) -> Self {
        KbError::Syntax {
            position,
            message: message.into(),
        }
    }
}
