// influx3-lp: line-protocol core types and encoding.
//
// This crate is deliberately dependency-free.  It owns the wire-format
// primitives (precision, field values, points, escaping) shared by the
// point and frame serializers in the client crate.

mod escape;
mod line;
mod point;
mod precision;

pub use escape::{escape_key, escape_measurement, escape_string_field_value};
pub use line::{encode_line, EncodeError};
pub use point::{FieldValue, Point};
pub use precision::Precision;
