//! Single-line encoding of a [`Point`].
//!
//! Output shape: `measurement[,tagk=tagv]* fieldk=fieldv[,...] [timestamp]`.
//!
//! NaN and infinite float fields are dropped rather than encoded; a point
//! whose field set is empty after dropping cannot be represented and is an
//! error.  Tag ordering is byte-wise lexicographic on the *escaped* key.

use crate::escape::{escape_key, escape_measurement, escape_string_field_value};
use crate::point::{FieldValue, Point};
use crate::precision::Precision;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// The measurement name is empty.
    EmptyMeasurement,
    /// No field survived encoding (empty set, or all NaN/infinite floats).
    EmptyFieldSet,
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodeError::EmptyMeasurement => write!(f, "point has an empty measurement"),
            EncodeError::EmptyFieldSet => {
                write!(f, "point has no encodable fields (empty, NaN, or infinite)")
            }
        }
    }
}

impl std::error::Error for EncodeError {}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode one point as a single line, timestamps in `precision` units.
///
/// The caller resolves the effective precision beforehand; a precision
/// pinned on the point itself does not rescale the timestamp here.
pub fn encode_line(point: &Point, _precision: Precision) -> Result<String, EncodeError> {
    if point.measurement().is_empty() {
        return Err(EncodeError::EmptyMeasurement);
    }

    let mut fields = Vec::with_capacity(point.fields().len());
    for (key, value) in point.fields() {
        if let Some(encoded) = encode_field_value(value) {
            fields.push((escape_key(key), encoded));
        }
    }
    if fields.is_empty() {
        return Err(EncodeError::EmptyFieldSet);
    }

    let mut tags: Vec<(String, String)> = point
        .tags()
        .iter()
        .filter(|(_, v)| !v.trim().is_empty())
        .map(|(k, v)| (escape_key(k), escape_key(v)))
        .collect();
    tags.sort_by(|a, b| a.0.cmp(&b.0));

    let mut line = escape_measurement(point.measurement());
    for (key, value) in &tags {
        line.push(',');
        line.push_str(key);
        line.push('=');
        line.push_str(value);
    }
    line.push(' ');
    for (i, (key, value)) in fields.iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        line.push_str(key);
        line.push('=');
        line.push_str(value);
    }
    if let Some(ts) = point.timestamp_value() {
        line.push(' ');
        line.push_str(&ts.to_string());
    }
    Ok(line)
}

/// Encode one field value, or `None` when the value cannot appear on the
/// wire (NaN / infinite floats).
fn encode_field_value(value: &FieldValue) -> Option<String> {
    match value {
        FieldValue::Float(v) => {
            if v.is_finite() {
                Some(format!("{}", v))
            } else {
                None
            }
        }
        FieldValue::Int(v) => Some(format!("{}i", v)),
        FieldValue::UInt(v) => Some(format!("{}u", v)),
        FieldValue::Bool(v) => Some(if *v { "true".to_owned() } else { "false".to_owned() }),
        FieldValue::String(v) => Some(format!("\"{}\"", escape_string_field_value(v))),
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
