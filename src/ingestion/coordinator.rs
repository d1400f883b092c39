//! Pipeline Coordinator - Drives reader, inference, batching and loading for one file

use crate::error::{IngestError, Result};
use crate::ingestion::batch::{BatchAccumulator, FlushSignal, DEFAULT_BATCH_SIZE};
use crate::ingestion::column_names::normalize_headers;
use crate::ingestion::loader::{
    check_existing_columns, BatchSink, TableDefinition, DEFAULT_PRIMARY_KEY,
};
use crate::ingestion::reader::{DelimitedReader, Delimiter, RawRecord};
use crate::ingestion::row::normalize_record;
use crate::ingestion::schema_inference::{SchemaInference, DEFAULT_SAMPLE_SIZE};
use crate::ingestion::IngestionReport;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::str::FromStr;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Skipped rows logged at `warn!` per file before dropping to `debug!`.
const ROW_WARNING_LIMIT: u64 = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Reading,
    Accumulating,
    Flushing,
    Draining,
    Done,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }
}

/// What to do when a batch is rolled back
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchErrorPolicy {
    /// Count the batch's rows as skipped and keep loading.
    #[default]
    Skip,
    /// Fail the file.
    Abort,
}

impl FromStr for BatchErrorPolicy {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" | "continue" => Ok(BatchErrorPolicy::Skip),
            "abort" | "fail" => Ok(BatchErrorPolicy::Abort),
            other => Err(IngestError::Config(format!(
                "batch error policy must be skip or abort, got {:?}",
                other
            ))),
        }
    }
}

/// Per-pipeline settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineOptions {
    pub table: String,
    pub primary_key: String,
    pub batch_size: usize,
    pub sample_size: usize,
    pub delimiter: Option<Delimiter>,
    pub index_patterns: Vec<String>,
    pub on_batch_error: BatchErrorPolicy,
    /// Error details kept in the report; counts are always complete.
    pub max_recorded_errors: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            table: "performance".to_string(),
            primary_key: DEFAULT_PRIMARY_KEY.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            sample_size: DEFAULT_SAMPLE_SIZE,
            delimiter: None,
            index_patterns: Vec::new(),
            on_batch_error: BatchErrorPolicy::Skip,
            max_recorded_errors: 1000,
        }
    }
}

/// Fatal error plus everything counted before it happened
#[derive(Debug, Error)]
#[error("Ingestion of {} failed", .report.source)]
pub struct PipelineFailure {
    #[source]
    pub error: IngestError,
    pub report: IngestionReport,
}

type ProgressFn = Box<dyn Fn(u64) + Send + Sync>;

/// Runs one source through `Idle -> Reading -> (Accumulating <-> Flushing)
/// -> Draining -> Done`, or into `Failed`.
///
/// Rows are pulled from the reader only while no batch is in flight, so at
/// most one batch plus the accumulator buffer (plus the inference sample
/// before loading starts) is held in memory regardless of file size.
pub struct PipelineCoordinator<S: BatchSink> {
    sink: S,
    options: PipelineOptions,
    progress: Option<ProgressFn>,
    state: PipelineState,
    row_warnings: u64,
}

impl<S: BatchSink> PipelineCoordinator<S> {
    pub fn new(sink: S, options: PipelineOptions) -> Self {
        Self {
            sink,
            options,
            progress: None,
            state: PipelineState::Idle,
            row_warnings: 0,
        }
    }

    /// Called with the running inserted-row total after every commit.
    pub fn with_progress<F>(mut self, progress: F) -> Self
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.progress = Some(Box::new(progress));
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Load `source` into the configured table.
    ///
    /// `name` identifies the source in logs and in the report.
    pub async fn run<R>(
        &mut self,
        name: &str,
        source: R,
    ) -> std::result::Result<IngestionReport, PipelineFailure>
    where
        R: Read + Send,
    {
        let started = Instant::now();
        let mut report = IngestionReport::new(
            name,
            &self.options.table,
            self.options.max_recorded_errors,
        );
        self.state = PipelineState::Idle;
        self.row_warnings = 0;

        let span = info_span!("pipeline", file = %name, table = %self.options.table);
        let outcome = self.execute(source, &mut report).instrument(span).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => {
                self.transition(PipelineState::Done);
                report.finish(PipelineState::Done, elapsed_ms);
                info!(
                    "Finished {}: {} rows read, {} inserted, {} skipped in {} ms",
                    name, report.total_rows, report.inserted_rows, report.skipped_rows, elapsed_ms
                );
                Ok(report)
            }
            Err(error) => {
                self.transition(PipelineState::Failed);
                report.skipped_rows = report.total_rows.saturating_sub(report.inserted_rows);
                report.record_error(&error);
                report.finish(PipelineState::Failed, elapsed_ms);
                error!(
                    "Ingestion of {} failed after {} inserted rows: {}",
                    name, report.inserted_rows, error
                );
                Err(PipelineFailure { error, report })
            }
        }
    }

    async fn execute<R>(&mut self, source: R, report: &mut IngestionReport) -> Result<()>
    where
        R: Read + Send,
    {
        self.transition(PipelineState::Reading);
        let mut reader = DelimitedReader::new(source, self.options.delimiter)?;
        debug!(
            "Read {} headers ({:?} delimited)",
            reader.headers().len(),
            reader.delimiter()
        );

        let headers = reader.headers().to_vec();
        let normalized = normalize_headers(&headers, &[self.options.primary_key.as_str()])?;

        // Look ahead for the inference sample; these rows are replayed below.
        let inference = SchemaInference::new(self.options.sample_size);
        let mut sample = Vec::with_capacity(inference.sample_size());
        while sample.len() < inference.sample_size() {
            match pull(&mut reader, report)? {
                Pulled::Record(record) => sample.push(record),
                Pulled::Malformed(e) => self.skip_row(report, &e),
                Pulled::End => break,
            }
        }
        report.observe_buffered(sample.len());

        let columns = inference.infer(&headers, &normalized, &sample);
        for column in &columns {
            debug!(
                "Column {} -> {} ({})",
                column.original_name, column.normalized_name, column.inferred_type
            );
        }
        let table = TableDefinition::new(&self.options.table, &self.options.primary_key, columns);

        self.sink.create_table(&table).await?;

        // The table may predate this file (an earlier run or a sibling file).
        let existing = self.sink.existing_columns(&table.name).await?;
        if existing.is_empty() {
            warn!("Could not list the columns of {}; not checking them", table.name);
        } else {
            check_existing_columns(&table, &existing)?;
        }

        for index in self
            .sink
            .create_indexes(&table, &self.options.index_patterns)
            .await
        {
            match index {
                Ok(name) => report.indexes.push(name),
                Err(e) => {
                    warn!("Skipping index: {}", e);
                    report.record_error(&e);
                }
            }
        }
        report.columns = table.columns.clone();

        let mut accumulator = BatchAccumulator::new(self.options.batch_size);
        let mut replay = sample.into_iter();
        self.transition(PipelineState::Accumulating);

        loop {
            let next = match replay.next() {
                Some(record) => Pulled::Record(record),
                None => pull(&mut reader, report)?,
            };
            let record = match next {
                Pulled::Record(record) => record,
                Pulled::Malformed(e) => {
                    self.skip_row(report, &e);
                    continue;
                }
                Pulled::End => break,
            };

            match normalize_record(&table.columns, &record) {
                Ok(row) => {
                    if accumulator.offer(row) == FlushSignal::Flush {
                        report.observe_buffered(accumulator.len() + replay.len());
                        self.transition(PipelineState::Flushing);
                        self.flush(&table, &mut accumulator, report).await?;
                        self.transition(PipelineState::Accumulating);
                    }
                }
                Err(e) => self.skip_row(report, &e),
            }
        }

        self.transition(PipelineState::Draining);
        report.observe_buffered(accumulator.len());
        self.flush(&table, &mut accumulator, report).await?;
        report.blank_lines = reader.blank_rows();
        Ok(())
    }

    fn skip_row(&mut self, report: &mut IngestionReport, error: &IngestError) {
        report.skipped_rows += 1;
        report.record_error(error);

        self.row_warnings += 1;
        if self.row_warnings <= ROW_WARNING_LIMIT {
            warn!("Skipping row: {}", error);
            if self.row_warnings == ROW_WARNING_LIMIT {
                warn!("Further skipped rows in this file are logged at debug level");
            }
        } else {
            debug!("Skipping row: {}", error);
        }
    }

    /// Hand the buffered rows to the sink and wait for the commit.
    async fn flush(
        &mut self,
        table: &TableDefinition,
        accumulator: &mut BatchAccumulator,
        report: &mut IngestionReport,
    ) -> Result<()> {
        let Some(batch) = accumulator.drain() else {
            return Ok(());
        };
        let (sequence, rows) = (batch.sequence(), batch.len() as u64);

        match self.sink.insert_batch(table, batch).await {
            Ok(inserted) => {
                report.inserted_rows += inserted;
                report.batches_committed += 1;
                info!("Inserted {} rows ({} total)", inserted, report.inserted_rows);
                if let Some(progress) = &self.progress {
                    progress(report.inserted_rows);
                }
                Ok(())
            }
            Err(e) => {
                report.batches_failed += 1;
                match self.options.on_batch_error {
                    BatchErrorPolicy::Skip => {
                        warn!("Skipping batch {}: {}", sequence, e);
                        report.skipped_rows += rows;
                        report.record_error(&e);
                        Ok(())
                    }
                    BatchErrorPolicy::Abort => Err(e),
                }
            }
        }
    }

    fn transition(&mut self, next: PipelineState) {
        if self.state != next {
            debug!("{} -> {}", self.state, next);
            self.state = next;
        }
    }
}

/// One step of the reader as the coordinator sees it
enum Pulled {
    Record(RawRecord),
    Malformed(IngestError),
    End,
}

/// Pull the next row, counting it. Fatal reader errors come back as `Err`.
fn pull<R: Read>(reader: &mut DelimitedReader<R>, report: &mut IngestionReport) -> Result<Pulled> {
    let pulled = match reader.next() {
        None => Pulled::End,
        Some(Ok(record)) => Pulled::Record(record),
        Some(Err(e)) if e.is_row_level() => Pulled::Malformed(e),
        Some(Err(e)) => return Err(e),
    };
    if !matches!(pulled, Pulled::End) {
        report.total_rows += 1;
    }
    report.blank_lines = reader.blank_rows();
    Ok(pulled)
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::Reading => "reading",
            PipelineState::Accumulating => "accumulating",
            PipelineState::Flushing => "flushing",
            PipelineState::Draining => "draining",
            PipelineState::Done => "done",
            PipelineState::Failed => "failed",
        };
        f.write_str(name)
    }
}
