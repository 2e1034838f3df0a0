use thiserror::Error;

/// Errors returned by message codec operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// CBOR serialization failure.
    #[error("encode error: {0}")]
    Encode(String),
    /// CBOR deserialization failure.
    #[error("decode error: {0}")]
    Decode(String),
    /// Message-level schema validation failure.
    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),
}

#[cfg(test)]
mod tests {
    use super::CodecError;

    #[test]
    fn error_messages_are_stable() {
        assert_eq!(
            CodecError::InvalidMessage("empty originator").to_string(),
            "invalid message: empty originator"
        );
        assert_eq!(
            CodecError::Decode("eof".to_string()).to_string(),
            "decode error: eof"
        );
    }
}
