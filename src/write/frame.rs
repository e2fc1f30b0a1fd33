//! Columnar frame serialization into line protocol.
//!
//! A frame is an `arrow` `RecordBatch` with a declared timestamp column, an
//! optional measurement (fixed name or per-row column), and a declared set
//! of tag columns; every remaining column is a field.
//!
//! Column names are escaped once here, at construction; only values are
//! escaped per row.  Nullability is hoisted the same way: when no column
//! carries nulls the row loop runs a dense path with no per-row null
//! checks, because that branch sits in the hot loop.
//!
//! Rows whose every field is null (or NaN) are skipped entirely.  Null,
//! empty, and whitespace-only tag values are omitted from the tag set.

use std::collections::BTreeMap;

use arrow_array::{
    Array, BooleanArray, Float32Array, Float64Array, Int8Array, Int16Array, Int32Array,
    Int64Array, LargeStringArray, RecordBatch, StringArray, TimestampMicrosecondArray,
    TimestampMillisecondArray, TimestampNanosecondArray, TimestampSecondArray, UInt8Array,
    UInt16Array, UInt32Array, UInt64Array,
};
use arrow_schema::{DataType, TimeUnit};

use influx3_lp::{escape_key, escape_measurement, escape_string_field_value, Precision};

use crate::error::Error;
use crate::write::record::parse_instant_nanos;

/// Default timestamp column name when none is declared.
const DEFAULT_TIMESTAMP_COLUMN: &str = "time";

/// Column names recognized as an implicit per-row measurement.
const MEASUREMENT_COLUMNS: [&str; 2] = ["measurement", "iox::measurement"];

// ---------------------------------------------------------------------------
// FrameWriteOptions
// ---------------------------------------------------------------------------

/// Serialization options for one frame write.
#[derive(Debug, Clone, Default)]
pub struct FrameWriteOptions {
    /// Fixed measurement name.  When unset, the frame must carry a
    /// `measurement` (or `iox::measurement`) column.
    pub measurement: Option<String>,
    /// Columns serialized as tags; everything else becomes a field.
    pub tag_columns: Vec<String>,
    /// Timestamp column; defaults to `time`.
    pub timestamp_column: Option<String>,
    /// Yield the output in chunks of this many rows.
    pub chunk_size: Option<usize>,
}

impl FrameWriteOptions {
    pub fn measurement(mut self, name: impl Into<String>) -> Self {
        self.measurement = Some(name.into());
        self
    }

    pub fn tag_columns(mut self, columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tag_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn timestamp_column(mut self, name: impl Into<String>) -> Self {
        self.timestamp_column = Some(name.into());
        self
    }

    pub fn chunk_size(mut self, rows: usize) -> Self {
        self.chunk_size = Some(rows);
        self
    }
}

// ---------------------------------------------------------------------------
// Column views
// ---------------------------------------------------------------------------

enum StrColumn<'a> {
    Utf8(&'a StringArray),
    LargeUtf8(&'a LargeStringArray),
}

impl<'a> StrColumn<'a> {
    fn downcast(name: &str, array: &'a dyn Array) -> Result<StrColumn<'a>, Error> {
        if let Some(a) = array.as_any().downcast_ref::<StringArray>() {
            Ok(StrColumn::Utf8(a))
        } else if let Some(a) = array.as_any().downcast_ref::<LargeStringArray>() {
            Ok(StrColumn::LargeUtf8(a))
        } else {
            Err(Error::client_misuse(format!(
                "column '{}' must be string-typed, found {}",
                name,
                array.data_type()
            )))
        }
    }

    fn value(&self, row: usize) -> &str {
        match self {
            StrColumn::Utf8(a) => a.value(row),
            StrColumn::LargeUtf8(a) => a.value(row),
        }
    }

    fn is_null(&self, row: usize) -> bool {
        match self {
            StrColumn::Utf8(a) => a.is_null(row),
            StrColumn::LargeUtf8(a) => a.is_null(row),
        }
    }

    fn null_count(&self) -> usize {
        match self {
            StrColumn::Utf8(a) => a.null_count(),
            StrColumn::LargeUtf8(a) => a.null_count(),
        }
    }
}

enum FieldColumnValues<'a> {
    Int8(&'a Int8Array),
    Int16(&'a Int16Array),
    Int32(&'a Int32Array),
    Int64(&'a Int64Array),
    UInt8(&'a UInt8Array),
    UInt16(&'a UInt16Array),
    UInt32(&'a UInt32Array),
    UInt64(&'a UInt64Array),
    Float32(&'a Float32Array),
    Float64(&'a Float64Array),
    Bool(&'a BooleanArray),
    Str(StrColumn<'a>),
}

impl<'a> FieldColumnValues<'a> {
    fn downcast(name: &str, array: &'a dyn Array) -> Result<FieldColumnValues<'a>, Error> {
        macro_rules! view {
            ($variant:ident, $ty:ty) => {
                FieldColumnValues::$variant(
                    array
                        .as_any()
                        .downcast_ref::<$ty>()
                        .ok_or_else(|| Error::client_misuse("column type mismatch"))?,
                )
            };
        }
        Ok(match array.data_type() {
            DataType::Int8 => view!(Int8, Int8Array),
            DataType::Int16 => view!(Int16, Int16Array),
            DataType::Int32 => view!(Int32, Int32Array),
            DataType::Int64 => view!(Int64, Int64Array),
            DataType::UInt8 => view!(UInt8, UInt8Array),
            DataType::UInt16 => view!(UInt16, UInt16Array),
            DataType::UInt32 => view!(UInt32, UInt32Array),
            DataType::UInt64 => view!(UInt64, UInt64Array),
            DataType::Float32 => view!(Float32, Float32Array),
            DataType::Float64 => view!(Float64, Float64Array),
            DataType::Boolean => view!(Bool, BooleanArray),
            DataType::Utf8 | DataType::LargeUtf8 => {
                FieldColumnValues::Str(StrColumn::downcast(name, array)?)
            }
            other => {
                return Err(Error::client_misuse(format!(
                    "column '{}' has unsupported field type {}",
                    name, other
                )));
            }
        })
    }

    /// Render one value, or `None` for a non-encodable float (NaN/±∞).
    fn render(&self, row: usize) -> Option<String> {
        match self {
            FieldColumnValues::Int8(a) => Some(format!("{}i", a.value(row))),
            FieldColumnValues::Int16(a) => Some(format!("{}i", a.value(row))),
            FieldColumnValues::Int32(a) => Some(format!("{}i", a.value(row))),
            FieldColumnValues::Int64(a) => Some(format!("{}i", a.value(row))),
            FieldColumnValues::UInt8(a) => Some(format!("{}u", a.value(row))),
            FieldColumnValues::UInt16(a) => Some(format!("{}u", a.value(row))),
            FieldColumnValues::UInt32(a) => Some(format!("{}u", a.value(row))),
            FieldColumnValues::UInt64(a) => Some(format!("{}u", a.value(row))),
            FieldColumnValues::Float32(a) => {
                let v = a.value(row);
                v.is_finite().then(|| format!("{}", v))
            }
            FieldColumnValues::Float64(a) => {
                let v = a.value(row);
                v.is_finite().then(|| format!("{}", v))
            }
            FieldColumnValues::Bool(a) => {
                Some(if a.value(row) { "true".to_owned() } else { "false".to_owned() })
            }
            FieldColumnValues::Str(a) => {
                Some(format!("\"{}\"", escape_string_field_value(a.value(row))))
            }
        }
    }

    fn is_null(&self, row: usize) -> bool {
        match self {
            FieldColumnValues::Int8(a) => a.is_null(row),
            FieldColumnValues::Int16(a) => a.is_null(row),
            FieldColumnValues::Int32(a) => a.is_null(row),
            FieldColumnValues::Int64(a) => a.is_null(row),
            FieldColumnValues::UInt8(a) => a.is_null(row),
            FieldColumnValues::UInt16(a) => a.is_null(row),
            FieldColumnValues::UInt32(a) => a.is_null(row),
            FieldColumnValues::UInt64(a) => a.is_null(row),
            FieldColumnValues::Float32(a) => a.is_null(row),
            FieldColumnValues::Float64(a) => a.is_null(row),
            FieldColumnValues::Bool(a) => a.is_null(row),
            FieldColumnValues::Str(a) => a.is_null(row),
        }
    }

    fn null_count(&self) -> usize {
        match self {
            FieldColumnValues::Int8(a) => a.null_count(),
            FieldColumnValues::Int16(a) => a.null_count(),
            FieldColumnValues::Int32(a) => a.null_count(),
            FieldColumnValues::Int64(a) => a.null_count(),
            FieldColumnValues::UInt8(a) => a.null_count(),
            FieldColumnValues::UInt16(a) => a.null_count(),
            FieldColumnValues::UInt32(a) => a.null_count(),
            FieldColumnValues::UInt64(a) => a.null_count(),
            FieldColumnValues::Float32(a) => a.null_count(),
            FieldColumnValues::Float64(a) => a.null_count(),
            FieldColumnValues::Bool(a) => a.null_count(),
            FieldColumnValues::Str(a) => a.null_count(),
        }
    }
}

enum MeasurementSource<'a> {
    Fixed(String),
    Column(StrColumn<'a>),
}

enum TagSource<'a> {
    Column { key: String, values: StrColumn<'a> },
    /// A write-api default tag with no matching column.
    Fixed { key: String, value: String },
}

struct FieldColumn<'a> {
    key: String,
    values: FieldColumnValues<'a>,
}

// ---------------------------------------------------------------------------
// FrameSerializer
// ---------------------------------------------------------------------------

/// Projects a `RecordBatch` into line-protocol lines.
pub(crate) struct FrameSerializer<'a> {
    rows: usize,
    measurement: MeasurementSource<'a>,
    tags: Vec<TagSource<'a>>,
    fields: Vec<FieldColumn<'a>>,
    timestamps: Vec<i64>,
    /// True when any consumed column carries nulls; selects the checked
    /// row path.
    any_nullable: bool,
}

impl<'a> FrameSerializer<'a> {
    pub fn new(
        batch: &'a RecordBatch,
        options: &FrameWriteOptions,
        precision: Precision,
        default_tags: &BTreeMap<String, String>,
    ) -> Result<FrameSerializer<'a>, Error> {
        let schema = batch.schema();
        let column_index = |name: &str| schema.fields().iter().position(|f| f.name() == name);

        // Measurement: explicit name, else an implicit measurement column.
        let mut measurement_column_name = None;
        let measurement = if let Some(name) = &options.measurement {
            MeasurementSource::Fixed(escape_measurement(name))
        } else {
            let found = MEASUREMENT_COLUMNS
                .iter()
                .find_map(|name| column_index(name).map(|idx| (*name, idx)));
            match found {
                Some((name, idx)) => {
                    measurement_column_name = Some(name);
                    MeasurementSource::Column(StrColumn::downcast(
                        name,
                        batch.column(idx).as_ref(),
                    )?)
                }
                None => {
                    return Err(Error::client_misuse(
                        "frame write requires a measurement name or a 'measurement' column",
                    ));
                }
            }
        };

        // Timestamp column is mandatory; a frame has no row index to fall
        // back on, and emitting epoch-0 timestamps would be worse.
        let ts_name = options
            .timestamp_column
            .as_deref()
            .unwrap_or(DEFAULT_TIMESTAMP_COLUMN);
        let ts_index = column_index(ts_name).ok_or_else(|| {
            Error::client_misuse(format!("frame has no timestamp column '{}'", ts_name))
        })?;
        let timestamps = scale_timestamps(ts_name, batch.column(ts_index).as_ref(), precision)?;

        // Tag columns.
        let mut tags = Vec::with_capacity(options.tag_columns.len() + default_tags.len());
        for name in &options.tag_columns {
            if name == ts_name || Some(name.as_str()) == measurement_column_name {
                continue;
            }
            let idx = column_index(name).ok_or_else(|| {
                Error::client_misuse(format!("frame has no tag column '{}'", name))
            })?;
            tags.push(TagSource::Column {
                key: escape_key(name),
                values: StrColumn::downcast(name, batch.column(idx).as_ref())?,
            });
        }
        for (key, value) in default_tags {
            if column_index(key).is_none() && !value.trim().is_empty() {
                tags.push(TagSource::Fixed {
                    key: escape_key(key),
                    value: escape_key(value),
                });
            }
        }
        tags.sort_by(|a, b| tag_key(a).cmp(tag_key(b)));

        // Every remaining column is a field.
        let mut fields = Vec::new();
        for (idx, field) in schema.fields().iter().enumerate() {
            let name = field.name().as_str();
            if name == ts_name
                || Some(name) == measurement_column_name
                || options.tag_columns.iter().any(|t| t == name)
            {
                continue;
            }
            fields.push(FieldColumn {
                key: escape_key(name),
                values: FieldColumnValues::downcast(name, batch.column(idx).as_ref())?,
            });
        }
        fields.sort_by(|a, b| a.key.cmp(&b.key));
        if fields.is_empty() {
            return Err(Error::client_misuse("frame has no field columns"));
        }

        let any_nullable = fields.iter().any(|f| f.values.null_count() > 0)
            || tags.iter().any(|t| match t {
                TagSource::Column { values, .. } => values.null_count() > 0,
                TagSource::Fixed { .. } => false,
            })
            || matches!(&measurement, MeasurementSource::Column(c) if c.null_count() > 0);

        Ok(FrameSerializer {
            rows: batch.num_rows(),
            measurement,
            tags,
            fields,
            timestamps,
            any_nullable,
        })
    }

    /// Serialize every row into lines, skipping rows with no live field.
    pub fn serialize(&self) -> Result<Vec<String>, Error> {
        self.render_rows(0, self.rows)
    }

    /// Serialize in chunks of `chunk_size` rows; yields
    /// `ceil(rows / chunk_size)` chunks.
    pub fn serialize_chunked(&self, chunk_size: usize) -> Result<Vec<Vec<String>>, Error> {
        if chunk_size == 0 {
            return Err(Error::client_misuse("chunk_size must be positive"));
        }
        let chunks = self.chunk_count(chunk_size);
        let mut out = Vec::with_capacity(chunks);
        for chunk in 0..chunks {
            let start = chunk * chunk_size;
            let end = usize::min(start + chunk_size, self.rows);
            out.push(self.render_rows(start, end)?);
        }
        Ok(out)
    }

    pub fn chunk_count(&self, chunk_size: usize) -> usize {
        self.rows.div_ceil(chunk_size)
    }

    fn render_rows(&self, start: usize, end: usize) -> Result<Vec<String>, Error> {
        let mut lines = Vec::with_capacity(end - start);
        if self.any_nullable {
            for row in start..end {
                if let Some(line) = self.render_row_checked(row)? {
                    lines.push(line);
                }
            }
        } else {
            for row in start..end {
                if let Some(line) = self.render_row_dense(row) {
                    lines.push(line);
                }
            }
        }
        Ok(lines)
    }

    /// Dense path: no per-row null checks.
    fn render_row_dense(&self, row: usize) -> Option<String> {
        let mut line = match &self.measurement {
            MeasurementSource::Fixed(name) => name.clone(),
            MeasurementSource::Column(col) => escape_measurement(col.value(row)),
        };
        for tag in &self.tags {
            match tag {
                TagSource::Column { key, values } => {
                    let value = values.value(row);
                    if value.trim().is_empty() {
                        continue;
                    }
                    line.push(',');
                    line.push_str(key);
                    line.push('=');
                    line.push_str(&escape_key(value));
                }
                TagSource::Fixed { key, value } => {
                    line.push(',');
                    line.push_str(key);
                    line.push('=');
                    line.push_str(value);
                }
            }
        }
        line.push(' ');
        let mut emitted = 0;
        for field in &self.fields {
            if let Some(value) = field.values.render(row) {
                if emitted > 0 {
                    line.push(',');
                }
                line.push_str(&field.key);
                line.push('=');
                line.push_str(&value);
                emitted += 1;
            }
        }
        if emitted == 0 {
            return None;
        }
        line.push(' ');
        line.push_str(&self.timestamps[row].to_string());
        Some(line)
    }

    /// Checked path: nullable columns are tested per row.
    fn render_row_checked(&self, row: usize) -> Result<Option<String>, Error> {
        let mut line = match &self.measurement {
            MeasurementSource::Fixed(name) => name.clone(),
            MeasurementSource::Column(col) => {
                if col.is_null(row) {
                    return Err(Error::client_misuse(format!(
                        "null measurement in frame row {}",
                        row
                    )));
                }
                escape_measurement(col.value(row))
            }
        };
        for tag in &self.tags {
            match tag {
                TagSource::Column { key, values } => {
                    if values.is_null(row) {
                        continue;
                    }
                    let value = values.value(row);
                    if value.trim().is_empty() {
                        continue;
                    }
                    line.push(',');
                    line.push_str(key);
                    line.push('=');
                    line.push_str(&escape_key(value));
                }
                TagSource::Fixed { key, value } => {
                    line.push(',');
                    line.push_str(key);
                    line.push('=');
                    line.push_str(value);
                }
            }
        }
        line.push(' ');
        let mut emitted = 0;
        for field in &self.fields {
            if field.values.is_null(row) {
                continue;
            }
            if let Some(value) = field.values.render(row) {
                if emitted > 0 {
                    line.push(',');
                }
                line.push_str(&field.key);
                line.push('=');
                line.push_str(&value);
                emitted += 1;
            }
        }
        if emitted == 0 {
            return Ok(None);
        }
        line.push(' ');
        line.push_str(&self.timestamps[row].to_string());
        Ok(Some(line))
    }
}

fn tag_key<'a>(tag: &'a TagSource<'_>) -> &'a str {
    match tag {
        TagSource::Column { key, .. } => key,
        TagSource::Fixed { key, .. } => key,
    }
}

// ---------------------------------------------------------------------------
// Timestamp scaling
// ---------------------------------------------------------------------------

/// Precompute per-row timestamps in the target precision.
///
/// Integer columns are taken as already scaled; arrow timestamps scale from
/// their unit through nanoseconds with floor division; strings parse as
/// instants (UTC when naive).
fn scale_timestamps(
    name: &str,
    array: &dyn Array,
    precision: Precision,
) -> Result<Vec<i64>, Error> {
    let rows = array.len();
    let null_ts = |row: usize| {
        Error::client_misuse(format!(
            "null timestamp in column '{}' at row {}",
            name, row
        ))
    };
    let npu = precision.nanos_per_unit();

    let mut out = Vec::with_capacity(rows);
    match array.data_type() {
        DataType::Int64 => {
            let a = array
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| Error::client_misuse("timestamp type mismatch"))?;
            for row in 0..rows {
                if a.is_null(row) {
                    return Err(null_ts(row));
                }
                out.push(a.value(row));
            }
        }
        DataType::Int32 => {
            let a = array
                .as_any()
                .downcast_ref::<Int32Array>()
                .ok_or_else(|| Error::client_misuse("timestamp type mismatch"))?;
            for row in 0..rows {
                if a.is_null(row) {
                    return Err(null_ts(row));
                }
                out.push(i64::from(a.value(row)));
            }
        }
        DataType::Timestamp(unit, _tz) => {
            let to_nanos: Box<dyn Fn(usize) -> Option<i64>> = match unit {
                TimeUnit::Second => {
                    let a = array.as_any().downcast_ref::<TimestampSecondArray>();
                    let a = a.ok_or_else(|| Error::client_misuse("timestamp type mismatch"))?;
                    Box::new(move |row| (!a.is_null(row)).then(|| a.value(row) * 1_000_000_000))
                }
                TimeUnit::Millisecond => {
                    let a = array.as_any().downcast_ref::<TimestampMillisecondArray>();
                    let a = a.ok_or_else(|| Error::client_misuse("timestamp type mismatch"))?;
                    Box::new(move |row| (!a.is_null(row)).then(|| a.value(row) * 1_000_000))
                }
                TimeUnit::Microsecond => {
                    let a = array.as_any().downcast_ref::<TimestampMicrosecondArray>();
                    let a = a.ok_or_else(|| Error::client_misuse("timestamp type mismatch"))?;
                    Box::new(move |row| (!a.is_null(row)).then(|| a.value(row) * 1_000))
                }
                TimeUnit::Nanosecond => {
                    let a = array.as_any().downcast_ref::<TimestampNanosecondArray>();
                    let a = a.ok_or_else(|| Error::client_misuse("timestamp type mismatch"))?;
                    Box::new(move |row| (!a.is_null(row)).then(|| a.value(row)))
                }
            };
            for row in 0..rows {
                let nanos = to_nanos(row).ok_or_else(|| null_ts(row))?;
                out.push(nanos.div_euclid(npu));
            }
        }
        DataType::Utf8 | DataType::LargeUtf8 => {
            let col = StrColumn::downcast(name, array)?;
            for row in 0..rows {
                if col.is_null(row) {
                    return Err(null_ts(row));
                }
                let raw = col.value(row);
                let nanos = parse_instant_nanos(raw).ok_or_else(|| {
                    Error::client_misuse(format!(
                        "column '{}' row {}: cannot parse '{}' as a timestamp",
                        name, row, raw
                    ))
                })?;
                out.push(nanos.div_euclid(npu));
            }
        }
        other => {
            return Err(Error::client_misuse(format!(
                "column '{}' has unsupported timestamp type {}",
                name, other
            )));
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
