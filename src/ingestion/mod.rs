//! Ingestion Module - streaming delimited files into a SQL table
//!
//! Handles one file per pipeline with:
//! - Lazy record reading with per-row error tagging
//! - Schema inference from a bounded sample
//! - Column name normalization
//! - Fixed-size batching with backpressure
//! - One transaction per batch

pub mod batch;
pub mod column_names;
pub mod coordinator;
pub mod loader;
pub mod reader;
pub mod row;
pub mod runner;
pub mod schema_inference;

pub use batch::{Batch, BatchAccumulator, FlushSignal};
pub use column_names::{normalize_column_name, normalize_headers};
pub use coordinator::{
    BatchErrorPolicy, PipelineCoordinator, PipelineFailure, PipelineOptions, PipelineState,
};
pub use loader::{BatchSink, SqlLoader, TableDefinition};
pub use reader::{Delimiter, DelimitedReader, RawRecord};
pub use row::{NormalizedRow, SqlValue};
pub use runner::{discover_sources, run_all, FileOutcome, RunSummary};
pub use schema_inference::{ColumnProfile, ColumnType, SchemaInference};

use crate::error::{ErrorKind, IngestError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One counted error, kept for the final report
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    /// Inclusive source row range, when the error has one
    pub row_range: Option<(u64, u64)>,
    pub message: String,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum IngestionStatus {
    Success,
    Partial,
    Failed,
}

/// Ingestion result for one source file
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestionReport {
    /// Ingestion run ID
    pub run_id: String,
    pub source: String,
    pub table: String,
    pub status: IngestionStatus,
    pub final_state: PipelineState,

    /// Data rows read, malformed ones included, blank lines excluded
    pub total_rows: u64,
    pub inserted_rows: u64,
    pub skipped_rows: u64,
    pub blank_lines: u64,

    pub batches_committed: u64,
    pub batches_failed: u64,
    /// Most rows held in memory at once (sample look-ahead plus buffer)
    pub peak_buffered_rows: usize,

    pub columns: Vec<ColumnProfile>,
    pub indexes: Vec<String>,

    /// Every error counted by kind, including ones not kept in `errors`
    pub error_counts: BTreeMap<ErrorKind, u64>,
    pub errors: Vec<ErrorRecord>,
    #[serde(skip)]
    max_errors: usize,

    pub elapsed_ms: u64,
}

impl IngestionReport {
    pub fn new(source: impl Into<String>, table: impl Into<String>, max_errors: usize) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            source: source.into(),
            table: table.into(),
            status: IngestionStatus::Success,
            final_state: PipelineState::Idle,
            total_rows: 0,
            inserted_rows: 0,
            skipped_rows: 0,
            blank_lines: 0,
            batches_committed: 0,
            batches_failed: 0,
            peak_buffered_rows: 0,
            columns: Vec::new(),
            indexes: Vec::new(),
            error_counts: BTreeMap::new(),
            errors: Vec::new(),
            max_errors,
            elapsed_ms: 0,
        }
    }

    /// Count `error`; its detail is kept while under the cap.
    pub fn record_error(&mut self, error: &IngestError) {
        *self.error_counts.entry(error.kind()).or_insert(0) += 1;
        if self.errors.len() < self.max_errors {
            self.errors.push(ErrorRecord {
                kind: error.kind(),
                row_range: error.row_range(),
                message: error.to_string(),
            });
        }
    }

    pub fn error_count(&self) -> u64 {
        self.error_counts.values().sum()
    }

    pub fn count_of(&self, kind: ErrorKind) -> u64 {
        self.error_counts.get(&kind).copied().unwrap_or(0)
    }

    /// `total_rows == inserted_rows + skipped_rows`
    pub fn is_balanced(&self) -> bool {
        self.total_rows == self.inserted_rows + self.skipped_rows
    }

    pub(crate) fn observe_buffered(&mut self, rows: usize) {
        self.peak_buffered_rows = self.peak_buffered_rows.max(rows);
    }

    pub(crate) fn finish(&mut self, state: PipelineState, elapsed_ms: u64) {
        self.final_state = state;
        self.elapsed_ms = elapsed_ms;
        self.status = match state {
            PipelineState::Done if self.skipped_rows == 0 && self.error_count() == 0 => {
                IngestionStatus::Success
            }
            PipelineState::Done => IngestionStatus::Partial,
            _ => IngestionStatus::Failed,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_details_are_capped_but_counted() {
        let mut report = IngestionReport::new("a.tsv", "performance", 2);
        for row in 1..=5 {
            report.record_error(&IngestError::FieldCountMismatch {
                row,
                line: row + 1,
                expected: 3,
                found: 2,
            });
        }
        report.record_error(&IngestError::EmptySource);

        assert_eq!(report.errors.len(), 2);
        assert_eq!(report.errors[1].row_range, Some((2, 2)));
        assert_eq!(report.count_of(ErrorKind::FieldCountMismatch), 5);
        assert_eq!(report.count_of(ErrorKind::EmptySource), 1);
        assert_eq!(report.error_count(), 6);
    }

    #[test]
    fn test_status_follows_final_state() {
        let mut report = IngestionReport::new("a.tsv", "t", 10);
        report.finish(PipelineState::Done, 5);
        assert_eq!(report.status, IngestionStatus::Success);

        report.skipped_rows = 1;
        report.finish(PipelineState::Done, 5);
        assert_eq!(report.status, IngestionStatus::Partial);

        report.finish(PipelineState::Failed, 5);
        assert_eq!(report.status, IngestionStatus::Failed);
    }

    #[test]
    fn test_report_serializes_counts_by_kind() {
        let mut report = IngestionReport::new("a.tsv", "t", 10);
        report.record_error(&IngestError::TypeMismatch {
            row: 3,
            column: "score".into(),
            expected: "TINYINT".into(),
            value: "abc".into(),
        });
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["error_counts"]["type_mismatch"], 1);
        assert_eq!(json["errors"][0]["kind"], "type_mismatch");
        assert!(json.get("max_errors").is_none());
    }
}
