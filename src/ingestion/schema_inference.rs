//! Schema Inference - Deterministic column typing from a bounded sample of rows

use crate::ingestion::reader::RawRecord;
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

lazy_static! {
    static ref INTEGER: Regex = Regex::new(r"^[+-]?\d+$").unwrap();
    static ref REAL: Regex = Regex::new(r"^[+-]?(\d+\.?\d*|\.\d+)([eE][+-]?\d+)?$").unwrap();
    static ref DATE: Regex = Regex::new(r"^\d{4}[-/]\d{2}[-/]\d{2}$").unwrap();
    static ref TIME: Regex = Regex::new(
        r"^(\d{2}):(\d{2})(?::(\d{2})(?:\.(\d{1,9}))?)?\s*(Z|[+-]\d{2}:?\d{2})?$"
    )
    .unwrap();
}

pub const DEFAULT_SAMPLE_SIZE: usize = 100;

/// Storage type chosen for one column
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "width")]
pub enum ColumnType {
    TinyInt,
    SmallInt,
    MediumInt,
    Int,
    BigInt,
    Double,
    Date,
    DateTime,
    VarChar(u32),
    Text,
    MediumText,
    LongText,
}

impl ColumnType {
    /// Narrowest integer type holding `max_abs`.
    pub fn for_integer(max_abs: u64) -> Self {
        match max_abs {
            0..=127 => ColumnType::TinyInt,
            128..=32_767 => ColumnType::SmallInt,
            32_768..=8_388_607 => ColumnType::MediumInt,
            8_388_608..=2_147_483_647 => ColumnType::Int,
            _ => ColumnType::BigInt,
        }
    }

    /// String type for a maximum length in characters.
    pub fn for_text(max_len: usize) -> Self {
        match max_len {
            0..=255 => ColumnType::VarChar(max_len.max(1) as u32),
            256..=65_535 => ColumnType::Text,
            65_536..=16_777_215 => ColumnType::MediumText,
            _ => ColumnType::LongText,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            ColumnType::TinyInt
                | ColumnType::SmallInt
                | ColumnType::MediumInt
                | ColumnType::Int
                | ColumnType::BigInt
        )
    }

    pub fn is_text(self) -> bool {
        matches!(
            self,
            ColumnType::VarChar(_)
                | ColumnType::Text
                | ColumnType::MediumText
                | ColumnType::LongText
        )
    }

    /// Upper bound on absolute value for integer types.
    pub fn integer_limit(self) -> Option<u64> {
        match self {
            ColumnType::TinyInt => Some(127),
            ColumnType::SmallInt => Some(32_767),
            ColumnType::MediumInt => Some(8_388_607),
            ColumnType::Int => Some(2_147_483_647),
            ColumnType::BigInt => Some(u64::MAX),
            _ => None,
        }
    }

    /// Upper bound on length in characters for string types.
    pub fn length_limit(self) -> Option<usize> {
        match self {
            ColumnType::VarChar(n) => Some(n as usize),
            ColumnType::Text => Some(65_535),
            ColumnType::MediumText => Some(16_777_215),
            _ => None,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::TinyInt => write!(f, "TINYINT"),
            ColumnType::SmallInt => write!(f, "SMALLINT"),
            ColumnType::MediumInt => write!(f, "MEDIUMINT"),
            ColumnType::Int => write!(f, "INT"),
            ColumnType::BigInt => write!(f, "BIGINT"),
            ColumnType::Double => write!(f, "DOUBLE"),
            ColumnType::Date => write!(f, "DATE"),
            ColumnType::DateTime => write!(f, "DATETIME"),
            ColumnType::VarChar(n) => write!(f, "VARCHAR({})", n),
            ColumnType::Text => write!(f, "TEXT"),
            ColumnType::MediumText => write!(f, "MEDIUMTEXT"),
            ColumnType::LongText => write!(f, "LONGTEXT"),
        }
    }
}

/// Inferred naming and type metadata for one output column
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnProfile {
    pub original_name: String,
    pub normalized_name: String,
    pub inferred_type: ColumnType,
    pub max_observed_length: usize,
}

/// Empty, whitespace-only, `NULL`/`null` and `\N` all mean "no value".
pub fn is_null_marker(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") || trimmed == "\\N"
}

pub fn parse_integer(value: &str) -> Option<i64> {
    let trimmed = value.trim();
    if !INTEGER.is_match(trimmed) {
        return None;
    }
    trimmed.parse::<i64>().ok()
}

pub fn parse_real(value: &str) -> Option<f64> {
    let trimmed = value.trim();
    if !REAL.is_match(trimmed) {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Strict `YYYY-MM-DD` or `YYYY/MM/DD`, same separator twice, real calendar day.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let trimmed = value.trim();
    if !DATE.is_match(trimmed) {
        return None;
    }
    let bytes = trimmed.as_bytes();
    let format = match (bytes[4], bytes[7]) {
        (b'-', b'-') => "%Y-%m-%d",
        (b'/', b'/') => "%Y/%m/%d",
        _ => return None,
    };
    NaiveDate::parse_from_str(trimmed, format).ok()
}

/// A date, a `T` or space, then `HH:MM[:SS[.fraction]]` with an optional
/// `Z` or `±HH[:]MM` offset. Offsets are folded into UTC.
pub fn parse_datetime(value: &str) -> Option<NaiveDateTime> {
    let trimmed = value.trim();
    if trimmed.len() < 16 || !trimmed.is_char_boundary(10) || !trimmed.is_char_boundary(11) {
        return None;
    }
    let date = parse_date(&trimmed[..10])?;
    if !matches!(&trimmed[10..11], "T" | " ") {
        return None;
    }

    let caps = TIME.captures(&trimmed[11..])?;
    let hour: u32 = caps[1].parse().ok()?;
    let minute: u32 = caps[2].parse().ok()?;
    let second: u32 = caps.get(3).map_or(Some(0), |m| m.as_str().parse().ok())?;
    let nanos: u32 = match caps.get(4) {
        Some(m) => {
            let digits = m.as_str();
            digits.parse::<u32>().ok()? * 10u32.pow(9 - digits.len() as u32)
        }
        None => 0,
    };
    let time = NaiveTime::from_hms_nano_opt(hour, minute, second, nanos)?;
    let local = NaiveDateTime::new(date, time);

    match caps.get(5).map(|m| m.as_str()) {
        None | Some("Z") => Some(local),
        Some(offset) => {
            let sign = if offset.starts_with('-') { -1 } else { 1 };
            let digits: String = offset[1..].chars().filter(char::is_ascii_digit).collect();
            let hours: i64 = digits[..2].parse().ok()?;
            let minutes: i64 = digits[2..].parse().ok()?;
            let shift = Duration::minutes(sign * (hours * 60 + minutes));
            local.checked_sub_signed(shift)
        }
    }
}

/// Schema Inference Engine
pub struct SchemaInference {
    sample_size: usize,
}

impl SchemaInference {
    pub fn new(sample_size: usize) -> Self {
        Self {
            sample_size: sample_size.max(1),
        }
    }

    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    /// One profile per header, in header order.
    ///
    /// `normalized` must be aligned with `headers`. Only the first
    /// `sample_size` records are examined.
    pub fn infer(
        &self,
        headers: &[String],
        normalized: &[String],
        sample: &[RawRecord],
    ) -> Vec<ColumnProfile> {
        let sample = &sample[..sample.len().min(self.sample_size)];

        headers
            .iter()
            .zip(normalized)
            .enumerate()
            .map(|(idx, (original, name))| {
                let values: Vec<&str> = sample
                    .iter()
                    .filter_map(|record| record.value(idx))
                    .filter(|v| !is_null_marker(v))
                    .collect();
                let max_observed_length = values
                    .iter()
                    .map(|v| v.chars().count())
                    .max()
                    .unwrap_or(0);

                ColumnProfile {
                    original_name: original.clone(),
                    normalized_name: name.clone(),
                    inferred_type: self.infer_column_type(&values),
                    max_observed_length,
                }
            })
            .collect()
    }

    /// Apply the detection rules in order; the first one every value satisfies wins.
    pub fn infer_column_type(&self, values: &[&str]) -> ColumnType {
        if values.is_empty() {
            return ColumnType::Text;
        }

        let integers: Option<Vec<i64>> = values.iter().map(|v| parse_integer(v)).collect();
        if let Some(integers) = integers {
            let max_abs = integers.iter().map(|v| v.unsigned_abs()).max().unwrap_or(0);
            return ColumnType::for_integer(max_abs);
        }

        if values.iter().all(|v| parse_real(v).is_some()) {
            return ColumnType::Double;
        }

        if values.iter().all(|v| parse_date(v).is_some()) {
            return ColumnType::Date;
        }

        if values.iter().all(|v| parse_datetime(v).is_some()) {
            return ColumnType::DateTime;
        }

        let max_len = values.iter().map(|v| v.chars().count()).max().unwrap_or(0);
        ColumnType::for_text(max_len)
    }
}

impl Default for SchemaInference {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_SIZE)
    }
}
