//! Arithmetic, comparison, and indexing rules for records.
//!
//! Integer with integer stays integral (wrapping on overflow), any double
//! operand promotes the result to a double, and `+` with a string operand
//! concatenates. Arrays and blobs are not arithmetic operands.

use std::cmp::Ordering;

use crate::error::RecordError;
use crate::record::{Record, RecordType, Value};

enum Numeric {
    Int(i64, i64),
    Float(f64, f64),
}

fn numeric_pair(lhs: &Record, rhs: &Record) -> Result<Numeric, RecordError> {
    for side in [lhs, rhs] {
        match side.record_type() {
            RecordType::Binary | RecordType::IntegerArray | RecordType::DoubleArray => {
                return Err(side.mismatch("scalar"));
            }
            _ => {}
        }
    }
    let promote = is_floating(lhs) || is_floating(rhs);
    if promote {
        Ok(Numeric::Float(lhs.to_double()?, rhs.to_double()?))
    } else {
        Ok(Numeric::Int(lhs.to_integer()?, rhs.to_integer()?))
    }
}

fn is_floating(record: &Record) -> bool {
    match record.value() {
        Value::Double(_) => true,
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().is_err() && s.parse::<f64>().is_ok()
        }
        _ => false,
    }
}

fn is_string(record: &Record) -> bool {
    matches!(record.value(), Value::String(_))
}

pub fn add(lhs: &Record, rhs: &Record) -> Result<Record, RecordError> {
    if is_string(lhs) || is_string(rhs) {
        return Ok(Record::string(format!("{lhs}{rhs}")));
    }
    Ok(match numeric_pair(lhs, rhs)? {
        Numeric::Int(a, b) => Record::integer(a.wrapping_add(b)),
        Numeric::Float(a, b) => Record::double(a + b),
    })
}

pub fn sub(lhs: &Record, rhs: &Record) -> Result<Record, RecordError> {
    Ok(match numeric_pair(lhs, rhs)? {
        Numeric::Int(a, b) => Record::integer(a.wrapping_sub(b)),
        Numeric::Float(a, b) => Record::double(a - b),
    })
}

pub fn mul(lhs: &Record, rhs: &Record) -> Result<Record, RecordError> {
    Ok(match numeric_pair(lhs, rhs)? {
        Numeric::Int(a, b) => Record::integer(a.wrapping_mul(b)),
        Numeric::Float(a, b) => Record::double(a * b),
    })
}

/// Division. Integer division by zero is an error; double division follows
/// IEEE-754 and yields an infinity or NaN.
pub fn div(lhs: &Record, rhs: &Record) -> Result<Record, RecordError> {
    Ok(match numeric_pair(lhs, rhs)? {
        Numeric::Int(_, 0) => return Err(RecordError::DivisionByZero),
        Numeric::Int(a, b) => Record::integer(a.wrapping_div(b)),
        Numeric::Float(a, b) => Record::double(a / b),
    })
}

pub fn rem(lhs: &Record, rhs: &Record) -> Result<Record, RecordError> {
    Ok(match numeric_pair(lhs, rhs)? {
        Numeric::Int(_, 0) => return Err(RecordError::DivisionByZero),
        Numeric::Int(a, b) => Record::integer(a.wrapping_rem(b)),
        Numeric::Float(a, b) => Record::double(a % b),
    })
}

pub fn negate(value: &Record) -> Result<Record, RecordError> {
    match value.value() {
        Value::Empty => Ok(Record::integer(0)),
        Value::Integer(v) => Ok(Record::integer(v.wrapping_neg())),
        Value::Double(v) => Ok(Record::double(-v)),
        Value::String(_) => {
            if is_floating(value) {
                Ok(Record::double(-value.to_double()?))
            } else {
                Ok(Record::integer(value.to_integer()?.wrapping_neg()))
            }
        }
        _ => Err(value.mismatch("scalar")),
    }
}

/// Logical not: integer 1 for falsy input, 0 otherwise.
pub fn not(value: &Record) -> Record {
    Record::integer(i64::from(value.is_false()))
}

/// Orders two records. Two strings compare lexicographically, arrays compare
/// element-wise when both sides are arrays, scalars compare numerically.
/// Returns `None` for unordered pairs (NaN or mixed array/scalar).
pub fn compare(lhs: &Record, rhs: &Record) -> Option<Ordering> {
    match (lhs.value(), rhs.value()) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Binary(a), Value::Binary(b)) => Some(a.cmp(b)),
        (Value::IntegerArray(a), Value::IntegerArray(b)) => Some(a.cmp(b)),
        _ if lhs.record_type().is_array() && rhs.record_type().is_array() => {
            let a = lhs.to_double_array().ok()?;
            let b = rhs.to_double_array().ok()?;
            a.partial_cmp(&b)
        }
        _ => match numeric_pair(lhs, rhs).ok()? {
            Numeric::Int(a, b) => Some(a.cmp(&b)),
            Numeric::Float(a, b) => a.partial_cmp(&b),
        },
    }
}

/// Value equality with numeric coercion (`1 == 1.0`).
pub fn equals(lhs: &Record, rhs: &Record) -> bool {
    if lhs.value_eq(rhs) {
        return true;
    }
    compare(lhs, rhs) == Some(Ordering::Equal)
}

fn truth(value: bool) -> Record {
    Record::integer(i64::from(value))
}

pub fn eq(lhs: &Record, rhs: &Record) -> Record {
    truth(equals(lhs, rhs))
}

pub fn ne(lhs: &Record, rhs: &Record) -> Record {
    truth(!equals(lhs, rhs))
}

pub fn lt(lhs: &Record, rhs: &Record) -> Record {
    truth(compare(lhs, rhs) == Some(Ordering::Less))
}

pub fn le(lhs: &Record, rhs: &Record) -> Record {
    truth(matches!(
        compare(lhs, rhs),
        Some(Ordering::Less | Ordering::Equal)
    ))
}

pub fn gt(lhs: &Record, rhs: &Record) -> Record {
    truth(compare(lhs, rhs) == Some(Ordering::Greater))
}

pub fn ge(lhs: &Record, rhs: &Record) -> Record {
    truth(matches!(
        compare(lhs, rhs),
        Some(Ordering::Greater | Ordering::Equal)
    ))
}

/// Returns the greater of two records, preferring `lhs` on ties or when
/// unordered.
pub fn max(lhs: Record, rhs: Record) -> Record {
    if compare(&lhs, &rhs) == Some(Ordering::Less) {
        rhs
    } else {
        lhs
    }
}

/// Reads element `index` of an array record. Out-of-range reads yield an
/// empty record.
pub fn retrieve_index(record: &Record, index: usize) -> Result<Record, RecordError> {
    match record.value() {
        Value::Empty => Ok(Record::empty()),
        Value::IntegerArray(a) => Ok(a.get(index).map_or_else(Record::empty, |v| Record::integer(*v))),
        Value::DoubleArray(a) => Ok(a.get(index).map_or_else(Record::empty, |v| Record::double(*v))),
        _ => Err(record.mismatch("array")),
    }
}

/// Longest array `set_index` will grow.
pub const MAX_ARRAY_LEN: usize = 1 << 20;

/// Writes element `index`, growing the array with zeros as needed.
///
/// An `Empty` record becomes an array whose element type follows `value`.
/// Writing a double into an integer array promotes the whole array.
pub fn set_index(record: &mut Record, index: usize, value: &Record) -> Result<(), RecordError> {
    match value.record_type() {
        RecordType::Integer | RecordType::Double | RecordType::Empty | RecordType::String => {}
        _ => return Err(value.mismatch("scalar")),
    }
    if index >= MAX_ARRAY_LEN {
        return Err(RecordError::IndexTooLarge {
            index,
            limit: MAX_ARRAY_LEN,
        });
    }
    let floating = is_floating(value);
    let next = match record.value() {
        Value::Empty if floating => {
            Value::DoubleArray(grown(Vec::new(), index, value.to_double()?, 0.0))
        }
        Value::Empty => Value::IntegerArray(grown(Vec::new(), index, value.to_integer()?, 0)),
        Value::IntegerArray(a) if floating => {
            let promoted = a.iter().map(|v| *v as f64).collect();
            Value::DoubleArray(grown(promoted, index, value.to_double()?, 0.0))
        }
        Value::IntegerArray(a) => Value::IntegerArray(grown(a.clone(), index, value.to_integer()?, 0)),
        Value::DoubleArray(a) => Value::DoubleArray(grown(a.clone(), index, value.to_double()?, 0.0)),
        _ => return Err(record.mismatch("array")),
    };
    record.set_value(next);
    Ok(())
}

fn grown<T: Copy>(mut items: Vec<T>, index: usize, value: T, fill: T) -> Vec<T> {
    if let Some(len) = index.checked_add(1).filter(|len| *len > items.len()) {
        items.resize(len, fill);
    }
    items[index] = value;
    items
}
