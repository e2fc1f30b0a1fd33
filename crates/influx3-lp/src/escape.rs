//! Line-protocol escaping.
//!
//! Three distinct escape sets exist on the wire:
//! - measurement: `,` and space;
//! - tag keys, tag values, field keys: `,`, `=`, and space;
//! - string field values: `"` and `\` (the value is wrapped in quotes).
//!
//! Carriage return, newline, and tab are escaped as `\r`, `\n`, `\t` in
//! measurements and keys so a single point always stays on a single line.

/// Escape a measurement name.
pub fn escape_measurement(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            ',' => out.push_str("\\,"),
            ' ' => out.push_str("\\ "),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out
}

/// Escape a tag key, tag value, or field key.
pub fn escape_key(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            ',' => out.push_str("\\,"),
            '=' => out.push_str("\\="),
            ' ' => out.push_str("\\ "),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out
}

/// Escape the contents of a string field value (quotes are added by the
/// encoder, not here).
pub fn escape_string_field_value(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out
}
