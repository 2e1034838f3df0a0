//! LORE wire codec.
//!
//! Defines the update message exchanged between peers and its CBOR
//! encode/decode helpers.

pub mod error;
pub mod message;

pub use error::CodecError;
pub use message::{
    decode_message_cbor, decode_message_cbor_prefix, encode_message_cbor, Message, MessageHeader,
    MAX_DOMAIN_LEN, MAX_ORIGINATOR_LEN, MESSAGE_V1_VERSION,
};
