use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every failure the loader can report, from a single bad row up to a
/// rejected table definition.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Row {row} (line {line}): expected {expected} fields, found {found}")]
    FieldCountMismatch {
        row: u64,
        line: u64,
        expected: usize,
        found: usize,
    },

    #[error("Row {row} (line {line}): field {field} is not valid UTF-8")]
    InvalidEncoding { row: u64, line: u64, field: usize },

    #[error("Row {row}: value {value:?} does not fit column `{column}` ({expected})")]
    TypeMismatch {
        row: u64,
        column: String,
        expected: String,
        value: String,
    },

    #[error("Schema conflict: headers {headers:?} all normalize to `{normalized}`")]
    SchemaConflict {
        normalized: String,
        headers: Vec<String>,
    },

    #[error(
        "Table `{table}` exists with different columns \
         (not in table: {missing_columns:?}, not in file: {extra_columns:?})"
    )]
    TableSchemaMismatch {
        table: String,
        missing_columns: Vec<String>,
        extra_columns: Vec<String>,
    },

    #[error("Failed to create table `{table}`: {source}")]
    TableCreationFailure {
        table: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Failed to create index `{index}` on `{table}`: {source}")]
    IndexCreationFailure {
        index: String,
        table: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Batch covering rows {first_row}..={last_row} ({rows} rows) rolled back: {source}")]
    BatchInsertFailure {
        first_row: u64,
        last_row: u64,
        rows: usize,
        #[source]
        source: sqlx::Error,
    },

    #[error("Failed to read source after row {after_row}: {source}")]
    SourceReadFailure {
        after_row: u64,
        #[source]
        source: csv::Error,
    },

    #[error("Source has no header line")]
    EmptySource,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Coarse classification used for counting and for deciding whether a
/// pipeline may keep going.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    FieldCountMismatch,
    InvalidEncoding,
    TypeMismatch,
    SchemaConflict,
    TableCreationFailure,
    IndexCreationFailure,
    BatchInsertFailure,
    SourceReadFailure,
    EmptySource,
    Io,
    Config,
    Database,
}

impl IngestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::FieldCountMismatch { .. } => ErrorKind::FieldCountMismatch,
            IngestError::InvalidEncoding { .. } => ErrorKind::InvalidEncoding,
            IngestError::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            IngestError::SchemaConflict { .. } | IngestError::TableSchemaMismatch { .. } => {
                ErrorKind::SchemaConflict
            }
            IngestError::TableCreationFailure { .. } => ErrorKind::TableCreationFailure,
            IngestError::IndexCreationFailure { .. } => ErrorKind::IndexCreationFailure,
            IngestError::BatchInsertFailure { .. } => ErrorKind::BatchInsertFailure,
            IngestError::SourceReadFailure { .. } => ErrorKind::SourceReadFailure,
            IngestError::EmptySource => ErrorKind::EmptySource,
            IngestError::Io(_) => ErrorKind::Io,
            IngestError::Config(_) => ErrorKind::Config,
            IngestError::Database(_) => ErrorKind::Database,
        }
    }

    /// Row-level errors skip one row and never stop the pipeline.
    pub fn is_row_level(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::FieldCountMismatch | ErrorKind::InvalidEncoding | ErrorKind::TypeMismatch
        )
    }

    /// Inclusive source row range the error refers to, if any.
    pub fn row_range(&self) -> Option<(u64, u64)> {
        match self {
            IngestError::FieldCountMismatch { row, .. }
            | IngestError::InvalidEncoding { row, .. }
            | IngestError::TypeMismatch { row, .. } => Some((*row, *row)),
            IngestError::BatchInsertFailure {
                first_row,
                last_row,
                ..
            } => Some((*first_row, *last_row)),
            IngestError::SourceReadFailure { after_row, .. } => Some((*after_row, *after_row)),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_mismatch_is_a_schema_conflict() {
        let error = IngestError::TableSchemaMismatch {
            table: "performance".to_string(),
            missing_columns: vec!["name".to_string()],
            extra_columns: vec!["label".to_string()],
        };
        assert_eq!(error.kind(), ErrorKind::SchemaConflict);
        assert!(!error.is_row_level());
        assert_eq!(error.row_range(), None);
        assert!(error.to_string().contains("[\"name\"]"));
    }

    #[test]
    fn test_index_failure_has_its_own_kind() {
        let error = IngestError::IndexCreationFailure {
            index: "idx_performance_name".to_string(),
            table: "performance".to_string(),
            source: sqlx::Error::Protocol("duplicate key name".into()),
        };
        assert_eq!(error.kind(), ErrorKind::IndexCreationFailure);
        assert!(!error.is_row_level());
    }
}
