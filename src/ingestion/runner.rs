//! Multi-file runner - independent pipelines on a bounded set of worker slots

use crate::config::IngestConfig;
use crate::db::{DbPool, Dialect};
use crate::error::{IngestError, Result};
use crate::ingestion::coordinator::{PipelineCoordinator, PipelineOptions, PipelineState};
use crate::ingestion::loader::SqlLoader;
use crate::ingestion::{IngestionReport, IngestionStatus};
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

const SOURCE_EXTENSIONS: &[&str] = &["csv", "tsv", "txt"];

/// Result of one file's pipeline
#[derive(Clone, Debug, Serialize)]
pub struct FileOutcome {
    pub path: PathBuf,
    pub report: IngestionReport,
    /// Fatal error message when the pipeline failed
    pub error: Option<String>,
}

impl FileOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Totals over every file of a run
#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub files: Vec<FileOutcome>,
    pub total_rows: u64,
    pub inserted_rows: u64,
    pub skipped_rows: u64,
    pub failed_files: usize,
    pub elapsed_ms: u64,
}

impl RunSummary {
    fn from_outcomes(files: Vec<FileOutcome>, elapsed_ms: u64) -> Self {
        let reports = files.iter().map(|f| &f.report);
        Self {
            total_rows: reports.clone().map(|r| r.total_rows).sum(),
            inserted_rows: reports.clone().map(|r| r.inserted_rows).sum(),
            skipped_rows: reports.map(|r| r.skipped_rows).sum(),
            failed_files: files.iter().filter(|f| !f.succeeded()).count(),
            files,
            elapsed_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed_files == 0
    }
}

/// A file is loaded as-is; a directory contributes its `.csv`, `.tsv` and
/// `.txt` files (not recursive), in name order.
pub fn discover_sources(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        return Err(IngestError::Config(format!(
            "Source {} is neither a file nor a directory",
            path.display()
        )));
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry_path = entry?.path();
        let wanted = entry_path.is_file()
            && entry_path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| SOURCE_EXTENSIONS.iter().any(|e| e.eq_ignore_ascii_case(ext)));
        if wanted {
            files.push(entry_path);
        }
    }
    files.sort();

    if files.is_empty() {
        warn!("No delimited files found in {}", path.display());
    }
    Ok(files)
}

/// Load every source under `config.source`.
///
/// Each file gets its own pipeline and its own pooled connection; at most
/// `config.concurrency` pipelines run at once. A failed file never stops the
/// others. Outcomes come back in discovery order.
pub async fn run_all(pool: &DbPool, config: &IngestConfig) -> Result<RunSummary> {
    let started = Instant::now();
    let dialect = config.dialect()?;
    let files = discover_sources(&config.source)?;
    info!(
        "Loading {} file(s) into {} with {} worker(s)",
        files.len(),
        config.table,
        config.concurrency
    );

    let slots = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let options = config.pipeline_options();
    let mut tasks = JoinSet::new();

    for (idx, path) in files.into_iter().enumerate() {
        let slots = Arc::clone(&slots);
        let pool = pool.clone();
        let options = options.clone();
        tasks.spawn(async move {
            let _slot = slots.acquire_owned().await.ok();
            (idx, load_file(&pool, dialect, options, path).await)
        });
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => error!("Pipeline task ended early: {}", e),
        }
    }
    outcomes.sort_by_key(|(idx, _)| *idx);

    let summary = RunSummary::from_outcomes(
        outcomes.into_iter().map(|(_, outcome)| outcome).collect(),
        started.elapsed().as_millis() as u64,
    );
    info!(
        "Run finished: {} rows read, {} inserted, {} skipped, {} failed file(s)",
        summary.total_rows, summary.inserted_rows, summary.skipped_rows, summary.failed_files
    );
    Ok(summary)
}

/// One pipeline: open the file, take a connection, run to a terminal state.
pub async fn load_file(
    pool: &DbPool,
    dialect: Dialect,
    options: PipelineOptions,
    path: PathBuf,
) -> FileOutcome {
    let name = path.display().to_string();

    let prepared = match File::open(&path) {
        Ok(file) => SqlLoader::acquire(pool, dialect).await.map(|loader| (file, loader)),
        Err(e) => Err(IngestError::Io(e)),
    };
    let (file, loader) = match prepared {
        Ok(prepared) => prepared,
        Err(e) => {
            error!("Could not start {}: {}", name, e);
            let mut report =
                IngestionReport::new(&name, &options.table, options.max_recorded_errors);
            report.record_error(&e);
            report.finish(PipelineState::Failed, 0);
            return FileOutcome {
                path,
                report,
                error: Some(e.to_string()),
            };
        }
    };

    let mut coordinator = PipelineCoordinator::new(loader, options);
    match coordinator.run(&name, file).await {
        Ok(report) => {
            if report.status == IngestionStatus::Partial {
                warn!("{} loaded with {} skipped row(s)", name, report.skipped_rows);
            }
            FileOutcome {
                path,
                report,
                error: None,
            }
        }
        Err(failure) => FileOutcome {
            path,
            error: Some(failure.error.to_string()),
            report: failure.report,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_discover_sources_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.tsv", "a.csv", "c.TXT", "notes.md", "d.json"] {
            fs::write(dir.path().join(name), "x\n1\n").unwrap();
        }
        fs::create_dir(dir.path().join("nested.csv")).unwrap();

        let files = discover_sources(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.csv", "b.tsv", "c.TXT"]);
    }

    #[test]
    fn test_discover_single_file_regardless_of_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.dat");
        fs::write(&path, "x\n1\n").unwrap();
        assert_eq!(discover_sources(&path).unwrap(), vec![path]);
    }

    #[test]
    fn test_discover_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            discover_sources(&dir.path().join("missing")),
            Err(IngestError::Config(_))
        ));
    }

    #[test]
    fn test_summary_totals() {
        let mut ok = IngestionReport::new("a.csv", "t", 10);
        ok.total_rows = 5;
        ok.inserted_rows = 4;
        ok.skipped_rows = 1;
        let mut failed = IngestionReport::new("b.csv", "t", 10);
        failed.total_rows = 2;
        failed.skipped_rows = 2;

        let summary = RunSummary::from_outcomes(
            vec![
                FileOutcome { path: "a.csv".into(), report: ok, error: None },
                FileOutcome { path: "b.csv".into(), report: failed, error: Some("boom".into()) },
            ],
            3,
        );
        assert_eq!((summary.total_rows, summary.inserted_rows, summary.skipped_rows), (7, 4, 3));
        assert_eq!(summary.failed_files, 1);
        assert!(!summary.is_success());
    }
}
