//! Database connection management using sqlx

use crate::db::dialect::{redact, Dialect};
use crate::error::{IngestError, Result};
use sqlx::any::{AnyPoolOptions, install_default_drivers};
use sqlx::{AnyConnection, AnyPool, Connection};
use std::time::Duration;
use tracing::{debug, info};

pub type DbPool = AnyPool;

/// Pool sizing shared by every file pipeline
#[derive(Clone, Debug)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Initialize the database connection pool
pub async fn init_pool(database_url: &str, settings: &PoolSettings) -> Result<DbPool> {
    install_default_drivers();

    let pool = AnyPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout)
        .connect(database_url)
        .await?;

    // Test the connection
    sqlx::query("SELECT 1").execute(&pool).await?;

    info!(
        "Connected to {} (max {} connections)",
        redact(database_url),
        settings.max_connections
    );
    Ok(pool)
}

/// Create the target database when it does not exist yet.
///
/// MySQL uses `CREATE DATABASE IF NOT EXISTS`; PostgreSQL checks
/// `pg_database` first because it has no such clause. SQLite files are
/// created by the connection itself (`mode=rwc`), so nothing happens here.
pub async fn ensure_database(database_url: &str) -> Result<()> {
    install_default_drivers();

    let dialect = Dialect::from_url(database_url)?;
    if dialect == Dialect::Sqlite {
        return Ok(());
    }

    let (server_url, database) = split_database(database_url, dialect).ok_or_else(|| {
        IngestError::Config(format!("No database name in {}", redact(database_url)))
    })?;

    let mut conn = AnyConnection::connect(&server_url).await?;
    let quoted = dialect.quote_ident(&database);

    match dialect {
        Dialect::MySql => {
            sqlx::query(&format!("CREATE DATABASE IF NOT EXISTS {}", quoted))
                .execute(&mut conn)
                .await?;
            debug!("Database {} created or already exists", database);
        }
        Dialect::Postgres => {
            let exists = sqlx::query("SELECT 1 FROM pg_database WHERE datname = $1")
                .bind(database.clone())
                .fetch_optional(&mut conn)
                .await?
                .is_some();
            if exists {
                debug!("Database {} already exists", database);
            } else {
                info!("Creating database {}", database);
                sqlx::query(&format!("CREATE DATABASE {}", quoted))
                    .execute(&mut conn)
                    .await?;
            }
        }
        Dialect::Sqlite => {}
    }

    conn.close().await?;
    Ok(())
}

/// Split `scheme://authority/db?params` into a server-level URL and the
/// database name. PostgreSQL needs some database to connect to, so the
/// maintenance database `postgres` stands in.
pub fn split_database(url: &str, dialect: Dialect) -> Option<(String, String)> {
    let (scheme, rest) = url.split_once("://")?;
    let (authority, path) = rest.split_once('/')?;
    let (database, query) = match path.split_once('?') {
        Some((db, query)) => (db, Some(query)),
        None => (path, None),
    };
    if database.is_empty() {
        return None;
    }

    let fallback = match dialect {
        Dialect::Postgres => "postgres",
        _ => "",
    };
    let mut server = format!("{}://{}/{}", scheme, authority, fallback);
    if let Some(query) = query {
        server.push('?');
        server.push_str(query);
    }
    Some((server, database.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_database_mysql() {
        let url = "mysql://root:pw@localhost:3306/performance_data";
        let (server, db) = split_database(url, Dialect::MySql).unwrap();
        assert_eq!(server, "mysql://root:pw@localhost:3306/");
        assert_eq!(db, "performance_data");
    }

    #[test]
    fn test_split_database_postgres_keeps_params() {
        let (server, db) = split_database(
            "postgres://postgres@localhost/perf?sslmode=disable",
            Dialect::Postgres,
        )
        .unwrap();
        assert_eq!(server, "postgres://postgres@localhost/postgres?sslmode=disable");
        assert_eq!(db, "perf");
    }

    #[test]
    fn test_split_database_requires_name() {
        assert!(split_database("mysql://localhost/", Dialect::MySql).is_none());
        assert!(split_database("mysql://localhost", Dialect::MySql).is_none());
    }

    #[tokio::test]
    async fn test_ensure_database_is_noop_for_sqlite() {
        ensure_database("sqlite::memory:").await.unwrap();
    }
}
