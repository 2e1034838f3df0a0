use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RecordError;
use crate::types::{Clock, Quality};

/// Type tag of a record's current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecordType {
    /// Absent / uninitialized.
    Empty,
    Integer,
    Double,
    String,
    /// Opaque byte blob (images, files).
    Binary,
    IntegerArray,
    DoubleArray,
}

impl RecordType {
    /// Every type tag, in declaration order.
    pub const ALL: [RecordType; 7] = [
        RecordType::Empty,
        RecordType::Integer,
        RecordType::Double,
        RecordType::String,
        RecordType::Binary,
        RecordType::IntegerArray,
        RecordType::DoubleArray,
    ];

    /// Stable lowercase name, used by `#type` and in error messages.
    pub fn name(self) -> &'static str {
        match self {
            RecordType::Empty => "empty",
            RecordType::Integer => "integer",
            RecordType::Double => "double",
            RecordType::String => "string",
            RecordType::Binary => "binary",
            RecordType::IntegerArray => "integer_array",
            RecordType::DoubleArray => "double_array",
        }
    }

    /// Whether this tag holds an array of numbers.
    pub fn is_array(self) -> bool {
        matches!(self, RecordType::IntegerArray | RecordType::DoubleArray)
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Closed set of values a record can hold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Empty,
    Integer(i64),
    Double(f64),
    String(String),
    Binary(Vec<u8>),
    IntegerArray(Vec<i64>),
    DoubleArray(Vec<f64>),
}

impl Value {
    /// Returns the type tag for this value.
    pub fn record_type(&self) -> RecordType {
        match self {
            Value::Empty => RecordType::Empty,
            Value::Integer(_) => RecordType::Integer,
            Value::Double(_) => RecordType::Double,
            Value::String(_) => RecordType::String,
            Value::Binary(_) => RecordType::Binary,
            Value::IntegerArray(_) => RecordType::IntegerArray,
            Value::DoubleArray(_) => RecordType::DoubleArray,
        }
    }
}

/// A typed value plus the consistency metadata used to order updates.
///
/// Records are plain values: cloning yields an independent copy with the
/// same clock and quality.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    value: Value,
    /// Logical version of this value.
    pub clock: Clock,
    /// Tie-break rank among updates with equal clocks.
    pub quality: Quality,
}

impl Record {
    /// Creates a record with zero clock and quality.
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            clock: 0,
            quality: 0,
        }
    }

    /// The absent record returned for unknown names.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn integer(value: i64) -> Self {
        Self::new(Value::Integer(value))
    }

    pub fn double(value: f64) -> Self {
        Self::new(Value::Double(value))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::new(Value::String(value.into()))
    }

    pub fn binary(value: impl Into<Vec<u8>>) -> Self {
        Self::new(Value::Binary(value.into()))
    }

    pub fn integers(value: impl Into<Vec<i64>>) -> Self {
        Self::new(Value::IntegerArray(value.into()))
    }

    pub fn doubles(value: impl Into<Vec<f64>>) -> Self {
        Self::new(Value::DoubleArray(value.into()))
    }

    /// Builder-style clock override.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Builder-style quality override.
    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    /// Replaces the value, keeping clock and quality.
    pub fn set_value(&mut self, value: impl Into<Value>) {
        self.value = value.into();
    }

    /// Drops the value back to `Empty`, keeping clock and quality.
    pub fn clear_value(&mut self) {
        self.value = Value::Empty;
    }

    pub fn record_type(&self) -> RecordType {
        self.value.record_type()
    }

    /// Whether the record holds anything other than `Empty`.
    pub fn exists(&self) -> bool {
        !matches!(self.value, Value::Empty)
    }

    /// Compares only the values, ignoring clock and quality.
    pub fn value_eq(&self, other: &Record) -> bool {
        self.value == other.value
    }

    /// Element count for arrays, byte length for strings and blobs,
    /// 1 for scalars and 0 for `Empty`.
    pub fn size(&self) -> usize {
        match &self.value {
            Value::Empty => 0,
            Value::Integer(_) | Value::Double(_) => 1,
            Value::String(s) => s.len(),
            Value::Binary(b) => b.len(),
            Value::IntegerArray(a) => a.len(),
            Value::DoubleArray(a) => a.len(),
        }
    }

    pub fn is_true(&self) -> bool {
        match &self.value {
            Value::Empty => false,
            Value::Integer(v) => *v != 0,
            Value::Double(v) => *v != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Binary(b) => !b.is_empty(),
            Value::IntegerArray(a) => !a.is_empty(),
            Value::DoubleArray(a) => !a.is_empty(),
        }
    }

    pub fn is_false(&self) -> bool {
        !self.is_true()
    }

    /// Scalar integer view. Doubles truncate toward zero (saturating),
    /// strings parse as decimal, `Empty` reads as zero.
    pub fn to_integer(&self) -> Result<i64, RecordError> {
        match &self.value {
            Value::Empty => Ok(0),
            Value::Integer(v) => Ok(*v),
            Value::Double(v) => Ok(*v as i64),
            Value::String(s) => Ok(parse_integer(s)),
            _ => Err(self.mismatch("scalar")),
        }
    }

    /// Scalar double view. Integers widen, strings parse as decimal.
    pub fn to_double(&self) -> Result<f64, RecordError> {
        match &self.value {
            Value::Empty => Ok(0.0),
            Value::Integer(v) => Ok(*v as f64),
            Value::Double(v) => Ok(*v),
            Value::String(s) => Ok(parse_double(s)),
            _ => Err(self.mismatch("scalar")),
        }
    }

    /// Decimal string rendering of the value (same as `Display`).
    pub fn to_string_value(&self) -> String {
        self.to_string()
    }

    pub fn to_integer_array(&self) -> Result<Vec<i64>, RecordError> {
        match &self.value {
            Value::Empty => Ok(Vec::new()),
            Value::IntegerArray(a) => Ok(a.clone()),
            Value::DoubleArray(a) => Ok(a.iter().map(|v| *v as i64).collect()),
            _ => Err(self.mismatch("array")),
        }
    }

    pub fn to_double_array(&self) -> Result<Vec<f64>, RecordError> {
        match &self.value {
            Value::Empty => Ok(Vec::new()),
            Value::IntegerArray(a) => Ok(a.iter().map(|v| *v as f64).collect()),
            Value::DoubleArray(a) => Ok(a.clone()),
            _ => Err(self.mismatch("array")),
        }
    }

    pub fn to_binary(&self) -> Result<Vec<u8>, RecordError> {
        match &self.value {
            Value::Empty => Ok(Vec::new()),
            Value::Binary(b) => Ok(b.clone()),
            _ => Err(self.mismatch("binary")),
        }
    }

    pub(crate) fn mismatch(&self, expected: &'static str) -> RecordError {
        RecordError::TypeMismatch {
            expected,
            found: self.record_type(),
        }
    }
}

fn parse_integer(s: &str) -> i64 {
    let trimmed = s.trim();
    if let Ok(v) = trimmed.parse::<i64>() {
        return v;
    }
    trimmed.parse::<f64>().map(|v| v as i64).unwrap_or(0)
}

fn parse_double(s: &str) -> f64 {
    s.trim().parse::<f64>().unwrap_or(0.0)
}

fn join<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    for (idx, item) in items.iter().enumerate() {
        if idx > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Value::Empty => Ok(()),
            Value::Integer(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::String(s) => f.write_str(s),
            Value::Binary(b) => write!(f, "<{} bytes>", b.len()),
            Value::IntegerArray(a) => join(f, a),
            Value::DoubleArray(a) => join(f, a),
        }
    }
}

impl From<Value> for Record {
    fn from(value: Value) -> Self {
        Record::new(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(i64::from(value))
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Integer(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Binary(value)
    }
}

impl From<Vec<i64>> for Value {
    fn from(value: Vec<i64>) -> Self {
        Value::IntegerArray(value)
    }
}

impl From<Vec<f64>> for Value {
    fn from(value: Vec<f64>) -> Self {
        Value::DoubleArray(value)
    }
}

impl From<&[i64]> for Value {
    fn from(value: &[i64]) -> Self {
        Value::IntegerArray(value.to_vec())
    }
}

impl From<&[f64]> for Value {
    fn from(value: &[f64]) -> Self {
        Value::DoubleArray(value.to_vec())
    }
}

macro_rules! record_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Record {
                fn from(value: $ty) -> Self {
                    Record::new(value)
                }
            }
        )*
    };
}

record_from!(i64, i32, bool, f64, &str, String, Vec<u8>, Vec<i64>, Vec<f64>);
