//! Load delimited files into a SQL table
//!
//! Run with: cargo run --bin tabload
//! Settings come from the environment or a `.env` file (see `IngestConfig`).

use anyhow::{Context, Result};
use tabload::db::{dialect::redact, ensure_database, init_pool};
use tabload::{logging, run_all, IngestConfig};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_tracing();

    let config = IngestConfig::from_env().context("Invalid configuration")?;
    info!(
        "Source {} -> table {} at {}",
        config.source.display(),
        config.table,
        redact(&config.database_url)
    );

    if config.create_database {
        ensure_database(&config.database_url)
            .await
            .context("Failed to create target database")?;
    }

    let pool = init_pool(&config.database_url, &config.pool_settings())
        .await
        .context("Failed to connect to database")?;

    let summary = run_all(&pool, &config).await.context("Load failed")?;
    pool.close().await;

    println!("{}", serde_json::to_string_pretty(&summary)?);

    if !summary.is_success() {
        for file in summary.files.iter().filter(|f| !f.succeeded()) {
            error!(
                "{}: {}",
                file.path.display(),
                file.error.as_deref().unwrap_or("failed")
            );
        }
        std::process::exit(1);
    }
    Ok(())
}
