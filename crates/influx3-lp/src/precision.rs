//! Timestamp precision for line-protocol writes.
//!
//! Every batch carries exactly one precision; it selects the unit of the
//! trailing timestamp integer and the value of the `precision` query
//! parameter on the write endpoints.  The v2 endpoint takes the short name
//! (`ns`), the v3 endpoint the long name (`nanosecond`).

use std::fmt;
use std::str::FromStr;

/// The unit of timestamps within a line-protocol payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Precision {
    #[default]
    Nanosecond,
    Microsecond,
    Millisecond,
    Second,
}

impl Precision {
    /// Short name used by the `/api/v2/write` query string.
    pub fn as_short_name(self) -> &'static str {
        match self {
            Precision::Nanosecond => "ns",
            Precision::Microsecond => "us",
            Precision::Millisecond => "ms",
            Precision::Second => "s",
        }
    }

    /// Long name used by the `/api/v3/write_lp` query string.
    pub fn as_long_name(self) -> &'static str {
        match self {
            Precision::Nanosecond => "nanosecond",
            Precision::Microsecond => "microsecond",
            Precision::Millisecond => "millisecond",
            Precision::Second => "second",
        }
    }

    /// How many nanoseconds one unit of this precision spans.
    pub fn nanos_per_unit(self) -> i64 {
        match self {
            Precision::Nanosecond => 1,
            Precision::Microsecond => 1_000,
            Precision::Millisecond => 1_000_000,
            Precision::Second => 1_000_000_000,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_short_name())
    }
}

impl FromStr for Precision {
    type Err = &'static str;

    /// Accepts both the short (`ns`) and long (`nanosecond`) spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ns" | "nanosecond" => Ok(Precision::Nanosecond),
            "us" | "microsecond" => Ok(Precision::Microsecond),
            "ms" | "millisecond" => Ok(Precision::Millisecond),
            "s" | "second" => Ok(Precision::Second),
            _ => Err("Invalid precision"),
        }
    }
}
