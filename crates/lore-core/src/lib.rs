//! Core LORE primitives shared across crates.
//!
//! Includes the typed knowledge record, its coercion and arithmetic rules,
//! naming helpers, and base errors.

pub mod error;
pub mod ops;
pub mod record;
pub mod types;

pub use error::RecordError;
pub use record::{Record, RecordType, Value};
pub use types::{is_local_name, Clock, Quality, LOCAL_PREFIX};
