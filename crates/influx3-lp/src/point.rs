//! Point and field-value types.
//!
//! A point is one measurement row: tag set, field set, optional timestamp.
//! Tags and fields are kept in `BTreeMap`s, so both serialize in
//! lexicographic key order and encoding is deterministic.

use std::collections::BTreeMap;

use crate::precision::Precision;

// ---------------------------------------------------------------------------
// FieldValue
// ---------------------------------------------------------------------------

/// A single field value.
///
/// Integers carry an `i`/`u` suffix on the wire, strings are quoted, floats
/// use the shortest round-trip decimal form.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Int(i64),
    UInt(u64),
    Bool(bool),
    String(String),
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Int(i64::from(v))
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::UInt(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

// ---------------------------------------------------------------------------
// Point
// ---------------------------------------------------------------------------

/// A structured measurement row.
///
/// Built with consuming setters:
///
/// ```
/// use influx3_lp::Point;
///
/// let p = Point::new("cpu")
///     .tag("host", "h1")
///     .field("usage", 0.64)
///     .timestamp(1_700_000_000_000_000_000);
/// assert_eq!(p.measurement(), "cpu");
/// ```
///
/// A point with no fields cannot be encoded; the encoder reports it rather
/// than emitting an invalid line.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Point {
    measurement: String,
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, FieldValue>,
    timestamp: Option<i64>,
    precision: Option<Precision>,
}

impl Point {
    pub fn new(measurement: impl Into<String>) -> Point {
        Point {
            measurement: measurement.into(),
            ..Point::default()
        }
    }

    /// Add or replace a tag.
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Point {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Add or replace a field.
    pub fn field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Point {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Set the timestamp, interpreted in the point's effective precision.
    pub fn timestamp(mut self, ts: i64) -> Point {
        self.timestamp = Some(ts);
        self
    }

    /// Pin this point to a precision, overriding the write call's default.
    pub fn precision(mut self, precision: Precision) -> Point {
        self.precision = Some(precision);
        self
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    pub fn timestamp_value(&self) -> Option<i64> {
        self.timestamp
    }

    /// The precision pinned on this point, if any.
    pub fn pinned_precision(&self) -> Option<Precision> {
        self.precision
    }

    /// Insert `value` under `key` only when the point does not already carry
    /// that tag.  Used for write-api default tags.
    pub fn tag_if_absent(mut self, key: impl Into<String>, value: impl Into<String>) -> Point {
        self.tags.entry(key.into()).or_insert_with(|| value.into());
        self
    }
}
