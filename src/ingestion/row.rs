//! Normalized rows - Fixed-shape values aligned to the inferred columns

use crate::error::{IngestError, Result};
use crate::ingestion::reader::RawRecord;
use crate::ingestion::schema_inference::{
    is_null_marker, parse_date, parse_datetime, parse_integer, parse_real, ColumnProfile,
    ColumnType,
};

/// A single bindable value
#[derive(Clone, Debug, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Double(f64),
    Text(String),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

/// Values in profile order, never in header order.
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedRow {
    pub row: u64,
    pub values: Vec<SqlValue>,
}

impl NormalizedRow {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Convert one raw value to the column's storage type.
///
/// `None` means the value violates the type (outside the inference sample).
pub fn convert_value(column_type: ColumnType, raw: &str) -> Option<SqlValue> {
    if is_null_marker(raw) {
        return Some(SqlValue::Null);
    }

    match column_type {
        ColumnType::TinyInt
        | ColumnType::SmallInt
        | ColumnType::MediumInt
        | ColumnType::Int
        | ColumnType::BigInt => {
            let value = parse_integer(raw)?;
            let limit = column_type.integer_limit()?;
            (value.unsigned_abs() <= limit).then_some(SqlValue::Int(value))
        }
        ColumnType::Double => parse_real(raw).map(SqlValue::Double),
        ColumnType::Date => {
            parse_date(raw).map(|d| SqlValue::Text(d.format("%Y-%m-%d").to_string()))
        }
        ColumnType::DateTime => parse_datetime(raw)
            .map(|dt| SqlValue::Text(dt.format("%Y-%m-%d %H:%M:%S%.f").to_string())),
        ColumnType::VarChar(_) | ColumnType::Text | ColumnType::MediumText => {
            let limit = column_type.length_limit()?;
            (raw.chars().count() <= limit).then(|| SqlValue::Text(raw.to_string()))
        }
        ColumnType::LongText => Some(SqlValue::Text(raw.to_string())),
    }
}

/// Build the positional row for `record`, or reject it with `TypeMismatch`.
pub fn normalize_record(profiles: &[ColumnProfile], record: &RawRecord) -> Result<NormalizedRow> {
    if record.len() != profiles.len() {
        return Err(IngestError::FieldCountMismatch {
            row: record.row(),
            line: record.line(),
            expected: profiles.len(),
            found: record.len(),
        });
    }

    let mut values = Vec::with_capacity(profiles.len());
    for (idx, profile) in profiles.iter().enumerate() {
        let raw = record.value(idx).unwrap_or_default();
        match convert_value(profile.inferred_type, raw) {
            Some(value) => values.push(value),
            None => {
                return Err(IngestError::TypeMismatch {
                    row: record.row(),
                    column: profile.normalized_name.clone(),
                    expected: profile.inferred_type.to_string(),
                    value: raw.chars().take(64).collect(),
                })
            }
        }
    }

    Ok(NormalizedRow {
        row: record.row(),
        values,
    })
}
