//! Streaming loader for tab/comma delimited files into a SQL table.
//!
//! Each file runs through its own pipeline: records are read lazily,
//! column types are inferred from a sample, and rows are inserted in
//! fixed-size batches, one transaction per batch.

pub mod config;
pub mod db;
pub mod error;
pub mod ingestion;
pub mod logging;

pub use config::IngestConfig;
pub use error::{ErrorKind, IngestError, Result};
pub use ingestion::{
    run_all, BatchErrorPolicy, BatchSink, IngestionReport, IngestionStatus, PipelineCoordinator,
    PipelineOptions, PipelineState, RunSummary, SqlLoader,
};
