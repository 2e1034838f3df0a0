use std::collections::BTreeMap;

use lore_core::{is_local_name, Clock, Quality, Record};
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Message schema version for `Message`.
pub const MESSAGE_V1_VERSION: u16 = 1;
/// Maximum domain length in bytes.
pub const MAX_DOMAIN_LEN: usize = 32;
/// Maximum originator identifier length in bytes.
pub const MAX_ORIGINATOR_LEN: usize = 64;

/// Per-packet metadata shared by every update in the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Wire version.
    pub version: u16,
    /// Knowledge domain; peers ignore packets for other domains.
    pub domain: String,
    /// Identifier of the peer that first produced the updates.
    pub originator: String,
    /// Sender's global clock at emission.
    pub clock: Clock,
    /// Highest write quality among the updates.
    pub quality: Quality,
    /// Remaining rebroadcast hops.
    pub ttl: u8,
    /// UNIX seconds at original emission. Rebroadcasts keep it.
    pub timestamp: u64,
}

impl MessageHeader {
    pub fn new(domain: impl Into<String>, originator: impl Into<String>) -> Self {
        Self {
            version: MESSAGE_V1_VERSION,
            domain: domain.into(),
            originator: originator.into(),
            clock: 0,
            quality: 0,
            ttl: 0,
            timestamp: 0,
        }
    }
}

/// One update batch on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub header: MessageHeader,
    /// Name to record, each record carrying its own clock and quality.
    pub updates: BTreeMap<String, Record>,
}

impl Message {
    pub fn new(header: MessageHeader, updates: BTreeMap<String, Record>) -> Self {
        Self { header, updates }
    }

    /// Validates header fields and update names.
    pub fn validate(&self) -> Result<(), CodecError> {
        let header = &self.header;
        if header.version != MESSAGE_V1_VERSION {
            return Err(CodecError::InvalidMessage("unsupported message version"));
        }
        if header.originator.is_empty() {
            return Err(CodecError::InvalidMessage("originator must not be empty"));
        }
        if header.originator.len() > MAX_ORIGINATOR_LEN {
            return Err(CodecError::InvalidMessage("originator too long"));
        }
        if header.domain.len() > MAX_DOMAIN_LEN {
            return Err(CodecError::InvalidMessage("domain too long"));
        }
        for name in self.updates.keys() {
            if name.is_empty() {
                return Err(CodecError::InvalidMessage("update name must not be empty"));
            }
            if is_local_name(name) {
                return Err(CodecError::InvalidMessage(
                    "local variables must not be disseminated",
                ));
            }
        }
        Ok(())
    }
}

/// Encodes `Message` as CBOR after validation.
pub fn encode_message_cbor(message: &Message) -> Result<Vec<u8>, CodecError> {
    message.validate()?;
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(message, &mut bytes)
        .map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(bytes)
}

/// Decodes and validates a full CBOR message.
pub fn decode_message_cbor(bytes: &[u8]) -> Result<Message, CodecError> {
    let message: Message =
        ciborium::de::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))?;
    message.validate()?;
    Ok(message)
}

/// Decodes one message prefix from a byte slice, returning bytes consumed.
pub fn decode_message_cbor_prefix(bytes: &[u8]) -> Result<(Message, usize), CodecError> {
    let mut cursor = std::io::Cursor::new(bytes);
    let message: Message =
        ciborium::de::from_reader(&mut cursor).map_err(|e| CodecError::Decode(e.to_string()))?;
    message.validate()?;
    Ok((message, cursor.position() as usize))
}
