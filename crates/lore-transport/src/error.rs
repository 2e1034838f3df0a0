use lore_codec::CodecError;
use lore_engine::KbError;
use thiserror::Error;

/// Errors returned by transport send/receive paths.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Outbound message failed to encode.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    /// The knowledge base refused the operation.
    #[error("engine error: {0}")]
    Engine(#[from] KbError),
    /// The byte adapter rejected a send.
    #[error("adapter error: {0}")]
    Adapter(String),
    /// Settings failed to load or parse.
    #[error("config error: {0}")]
    Config(String),
    /// Encoded packet is larger than the configured queue length.
    #[error("packet of {size} bytes exceeds queue length {limit}")]
    Oversized { size: usize, limit: usize },
}

/// Failure reported by a single filter. The pipeline logs it and keeps the
/// pre-filter value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("filter failed: {0}")]
pub struct FilterError(pub String);

impl FilterError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<lore_core::RecordError> for FilterError {
    fn from(err: lore_core::RecordError) -> Self {
        Self(err.to_string())
    }
}
