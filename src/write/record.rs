//! Record shapes accepted by `write`, and their normalization into
//! line-protocol payloads.
//!
//! Any accepted shape reduces to UTF-8 line-protocol bytes keyed by
//! precision: raw strings and bytes pass through under the call precision,
//! points encode through the codec (honoring a precision pinned on the
//! point), JSON objects build a point from the recognized keys
//! (`measurement`, `tags`, `fields`, `time`), frames go through the frame
//! serializer, and collections flatten recursively.  Collections are owned
//! values, so reference cycles cannot be constructed.

use std::collections::BTreeMap;

use arrow_array::RecordBatch;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use influx3_lp::{encode_line, FieldValue, Point, Precision};

use crate::error::Error;
use crate::write::frame::{FrameSerializer, FrameWriteOptions};

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// A frame record: a columnar batch plus its serialization options.
#[derive(Debug, Clone)]
pub struct FrameRecord {
    pub batch: RecordBatch,
    pub options: FrameWriteOptions,
}

/// Anything `write` accepts.
#[derive(Debug, Clone)]
pub enum Record {
    /// One or more already-encoded lines.
    Line(String),
    /// Raw line-protocol bytes, appended as-is.
    Bytes(Vec<u8>),
    Point(Point),
    /// A JSON object with the recognized keys `measurement`, `tags`,
    /// `fields`, and `time`.
    Json(serde_json::Value),
    Frame(Box<FrameRecord>),
    /// A collection; flattens recursively.
    Many(Vec<Record>),
}

impl From<&str> for Record {
    fn from(s: &str) -> Record {
        Record::Line(s.to_owned())
    }
}

impl From<String> for Record {
    fn from(s: String) -> Record {
        Record::Line(s)
    }
}

impl From<Vec<u8>> for Record {
    fn from(bytes: Vec<u8>) -> Record {
        Record::Bytes(bytes)
    }
}

impl From<Point> for Record {
    fn from(point: Point) -> Record {
        Record::Point(point)
    }
}

impl From<serde_json::Value> for Record {
    fn from(value: serde_json::Value) -> Record {
        Record::Json(value)
    }
}

impl From<FrameRecord> for Record {
    fn from(frame: FrameRecord) -> Record {
        Record::Frame(Box::new(frame))
    }
}

impl From<Vec<Record>> for Record {
    fn from(items: Vec<Record>) -> Record {
        Record::Many(items)
    }
}

impl From<Vec<Point>> for Record {
    fn from(points: Vec<Point>) -> Record {
        Record::Many(points.into_iter().map(Record::Point).collect())
    }
}

impl From<Vec<&str>> for Record {
    fn from(lines: Vec<&str>) -> Record {
        Record::Many(lines.into_iter().map(Record::from).collect())
    }
}

impl From<Vec<String>> for Record {
    fn from(lines: Vec<String>) -> Record {
        Record::Many(lines.into_iter().map(Record::Line).collect())
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Reduce a record to line-protocol payloads keyed by precision.
///
/// Fragments within one payload are joined by single newlines with no
/// trailing newline.  An empty collection yields an empty map (and thus no
/// HTTP call).
pub(crate) fn normalize(
    record: Record,
    call_precision: Precision,
    default_tags: &BTreeMap<String, String>,
) -> Result<BTreeMap<Precision, Vec<u8>>, Error> {
    let mut payloads = BTreeMap::new();
    append_record(record, call_precision, default_tags, &mut payloads)?;
    payloads.retain(|_, buf: &mut Vec<u8>| !buf.is_empty());
    Ok(payloads)
}

fn append_record(
    record: Record,
    call_precision: Precision,
    default_tags: &BTreeMap<String, String>,
    payloads: &mut BTreeMap<Precision, Vec<u8>>,
) -> Result<(), Error> {
    match record {
        Record::Line(s) => {
            append_fragment(payloads, call_precision, s.trim_end_matches('\n').as_bytes());
            Ok(())
        }
        Record::Bytes(bytes) => {
            let trimmed = match bytes.iter().rposition(|b| *b != b'\n') {
                Some(last) => &bytes[..=last],
                None => &[][..],
            };
            append_fragment(payloads, call_precision, trimmed);
            Ok(())
        }
        Record::Point(point) => append_point(point, call_precision, default_tags, payloads),
        Record::Json(value) => {
            let point = point_from_json(&value, call_precision)?;
            append_point(point, call_precision, default_tags, payloads)
        }
        Record::Frame(frame) => {
            let serializer = FrameSerializer::new(
                &frame.batch,
                &frame.options,
                call_precision,
                default_tags,
            )?;
            match frame.options.chunk_size {
                Some(chunk_size) => {
                    for chunk in serializer.serialize_chunked(chunk_size)? {
                        for line in chunk {
                            append_fragment(payloads, call_precision, line.as_bytes());
                        }
                    }
                }
                None => {
                    for line in serializer.serialize()? {
                        append_fragment(payloads, call_precision, line.as_bytes());
                    }
                }
            }
            Ok(())
        }
        Record::Many(records) => {
            for record in records {
                append_record(record, call_precision, default_tags, payloads)?;
            }
            Ok(())
        }
    }
}

fn append_point(
    point: Point,
    call_precision: Precision,
    default_tags: &BTreeMap<String, String>,
    payloads: &mut BTreeMap<Precision, Vec<u8>>,
) -> Result<(), Error> {
    let precision = point.pinned_precision().unwrap_or(call_precision);
    let mut point = point;
    for (key, value) in default_tags {
        point = point.tag_if_absent(key.clone(), value.clone());
    }
    let line = encode_line(&point, precision)?;
    append_fragment(payloads, precision, line.as_bytes());
    Ok(())
}

fn append_fragment(
    payloads: &mut BTreeMap<Precision, Vec<u8>>,
    precision: Precision,
    fragment: &[u8],
) {
    if fragment.is_empty() {
        return;
    }
    let buf = payloads.entry(precision).or_default();
    if !buf.is_empty() {
        buf.push(b'\n');
    }
    buf.extend_from_slice(fragment);
}

// ---------------------------------------------------------------------------
// JSON object -> Point
// ---------------------------------------------------------------------------

fn point_from_json(value: &serde_json::Value, call_precision: Precision) -> Result<Point, Error> {
    let object = value
        .as_object()
        .ok_or_else(|| Error::client_misuse("record JSON must be an object"))?;

    let measurement = object
        .get("measurement")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| {
            Error::client_misuse("record JSON requires a string 'measurement' key")
        })?;
    let mut point = Point::new(measurement);

    if let Some(tags) = object.get("tags") {
        let tags = tags
            .as_object()
            .ok_or_else(|| Error::client_misuse("record JSON 'tags' must be an object"))?;
        for (key, value) in tags {
            let value = value
                .as_str()
                .ok_or_else(|| Error::client_misuse("record JSON tag values must be strings"))?;
            point = point.tag(key.clone(), value);
        }
    }

    if let Some(fields) = object.get("fields") {
        let fields = fields
            .as_object()
            .ok_or_else(|| Error::client_misuse("record JSON 'fields' must be an object"))?;
        for (key, value) in fields {
            point = point.field(key.clone(), field_from_json(key, value)?);
        }
    }

    if let Some(time) = object.get("time") {
        point = point.timestamp(timestamp_from_json(time, call_precision)?);
    }

    Ok(point)
}

fn field_from_json(key: &str, value: &serde_json::Value) -> Result<FieldValue, Error> {
    match value {
        serde_json::Value::Bool(b) => Ok(FieldValue::Bool(*b)),
        serde_json::Value::String(s) => Ok(FieldValue::String(s.clone())),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(FieldValue::Int(i))
            } else if let Some(u) = n.as_u64() {
                Ok(FieldValue::UInt(u))
            } else if let Some(f) = n.as_f64() {
                Ok(FieldValue::Float(f))
            } else {
                Err(Error::client_misuse(format!(
                    "field '{}' has an unrepresentable numeric value",
                    key
                )))
            }
        }
        _ => Err(Error::client_misuse(format!(
            "field '{}' must be a number, string, or boolean",
            key
        ))),
    }
}

fn timestamp_from_json(value: &serde_json::Value, precision: Precision) -> Result<i64, Error> {
    match value {
        serde_json::Value::Number(n) => n.as_i64().ok_or_else(|| {
            Error::client_misuse("record JSON 'time' integer must fit a signed 64-bit value")
        }),
        serde_json::Value::String(s) => {
            let nanos = parse_instant_nanos(s).ok_or_else(|| {
                Error::client_misuse(format!("record JSON 'time' is not a timestamp: '{}'", s))
            })?;
            Ok(nanos.div_euclid(precision.nanos_per_unit()))
        }
        _ => Err(Error::client_misuse(
            "record JSON 'time' must be an integer or a timestamp string",
        )),
    }
}

/// Parse a timestamp string into epoch nanoseconds.  Naive values are
/// taken as UTC.
pub(crate) fn parse_instant_nanos(s: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc).timestamp_nanos_opt();
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return naive.and_utc().timestamp_nanos_opt();
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0)?.and_utc().timestamp_nanos_opt();
    }
    None
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
