//! Transactional Loader - DDL from inferred profiles and one transaction per batch

use crate::db::{DbPool, Dialect};
use crate::error::{IngestError, Result};
use crate::ingestion::batch::Batch;
use crate::ingestion::column_names::MAX_IDENTIFIER_LEN;
use crate::ingestion::row::SqlValue;
use crate::ingestion::schema_inference::{ColumnProfile, ColumnType};
use async_trait::async_trait;
use sqlx::any::AnyArguments;
use sqlx::pool::PoolConnection;
use sqlx::query::Query;
use sqlx::{Any, Connection};
use tracing::{debug, warn};

pub const DEFAULT_PRIMARY_KEY: &str = "id";

/// Target table: synthetic key plus one column per profile
#[derive(Clone, Debug)]
pub struct TableDefinition {
    pub name: String,
    pub primary_key: String,
    pub columns: Vec<ColumnProfile>,
}

impl TableDefinition {
    pub fn new(
        name: impl Into<String>,
        primary_key: impl Into<String>,
        columns: Vec<ColumnProfile>,
    ) -> Self {
        Self {
            name: name.into(),
            primary_key: primary_key.into(),
            columns,
        }
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.normalized_name.as_str())
    }
}

/// Where batches go. One sink serves one file pipeline.
#[async_trait]
pub trait BatchSink: Send {
    /// Issue the idempotent `CREATE TABLE IF NOT EXISTS`.
    async fn create_table(&mut self, table: &TableDefinition) -> Result<()>;

    /// Column names of `table` as it exists in the database, key included.
    async fn existing_columns(&mut self, table: &str) -> Result<Vec<String>>;

    /// Secondary indexes on columns whose name contains one of `patterns`.
    /// One entry per matching column: the index name, or why it is missing.
    async fn create_indexes(
        &mut self,
        table: &TableDefinition,
        patterns: &[String],
    ) -> Vec<Result<String>>;

    /// Insert every row of `batch` atomically. Returns the rows written.
    async fn insert_batch(&mut self, table: &TableDefinition, batch: Batch) -> Result<u64>;
}

pub fn create_table_sql(dialect: Dialect, table: &TableDefinition) -> String {
    let mut sql = format!(
        "CREATE TABLE IF NOT EXISTS {} (\n  {}",
        dialect.quote_ident(&table.name),
        dialect.primary_key_column(&table.primary_key)
    );
    for column in &table.columns {
        sql.push_str(&format!(
            ",\n  {} {}",
            dialect.quote_ident(&column.normalized_name),
            dialect.column_type(column.inferred_type)
        ));
    }
    sql.push_str("\n)");
    sql
}

/// Fails unless the existing table has exactly the file's columns besides
/// the key. Names compare case-insensitively.
pub fn check_existing_columns(table: &TableDefinition, existing: &[String]) -> Result<()> {
    fn contains(columns: &[&String], name: &str) -> bool {
        columns.iter().any(|c| c.eq_ignore_ascii_case(name))
    }

    let existing: Vec<&String> = existing
        .iter()
        .filter(|c| !c.eq_ignore_ascii_case(&table.primary_key))
        .collect();

    let missing_columns: Vec<String> = table
        .column_names()
        .filter(|c| !contains(&existing, c))
        .map(String::from)
        .collect();
    let wanted: Vec<&String> = table.columns.iter().map(|c| &c.normalized_name).collect();
    let extra_columns: Vec<String> = existing
        .iter()
        .filter(|c| !contains(&wanted, c))
        .map(|c| c.to_string())
        .collect();

    if missing_columns.is_empty() && extra_columns.is_empty() {
        Ok(())
    } else {
        Err(IngestError::TableSchemaMismatch {
            table: table.name.clone(),
            missing_columns,
            extra_columns,
        })
    }
}

/// Multi-row insert with `rows` groups of placeholders.
pub fn insert_sql(dialect: Dialect, table: &TableDefinition, rows: usize) -> String {
    let columns = table
        .column_names()
        .map(|c| dialect.quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    let mut param = 0usize;
    let groups = (0..rows)
        .map(|_| {
            let placeholders = table
                .columns
                .iter()
                .map(|c| {
                    param += 1;
                    dialect.placeholder(param, c.inferred_type)
                })
                .collect::<Vec<_>>()
                .join(", ");
            format!("({})", placeholders)
        })
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "INSERT INTO {} ({}) VALUES {}",
        dialect.quote_ident(&table.name),
        columns,
        groups
    )
}

/// Rows that fit in one statement under the dialect's parameter limit.
pub fn rows_per_statement(dialect: Dialect, columns: usize) -> usize {
    (dialect.max_bind_params() / columns.max(1)).max(1)
}

pub fn index_name(table: &str, column: &str) -> String {
    let mut name = format!("idx_{}_{}", table, column);
    name.truncate(MAX_IDENTIFIER_LEN);
    name
}

/// `(index name, statement)` for every column matching a pattern.
pub fn index_statements(
    dialect: Dialect,
    table: &TableDefinition,
    patterns: &[String],
) -> Vec<(String, String)> {
    let patterns: Vec<String> = patterns
        .iter()
        .map(|p| p.trim().to_ascii_lowercase())
        .filter(|p| !p.is_empty())
        .collect();

    table
        .columns
        .iter()
        .filter(|c| {
            let lower = c.normalized_name.to_ascii_lowercase();
            patterns.iter().any(|p| lower.contains(p.as_str()))
        })
        .map(|c| {
            let name = index_name(&table.name, &c.normalized_name);
            let if_not_exists = if dialect.supports_create_index_if_not_exists() {
                "IF NOT EXISTS "
            } else {
                ""
            };
            let sql = format!(
                "CREATE INDEX {}{} ON {} ({})",
                if_not_exists,
                dialect.quote_ident(&name),
                dialect.quote_ident(&table.name),
                dialect.index_column(&c.normalized_name, c.inferred_type)
            );
            (name, sql)
        })
        .collect()
}

fn bind_value<'q>(
    query: Query<'q, Any, AnyArguments<'q>>,
    value: &SqlValue,
    column_type: ColumnType,
) -> Query<'q, Any, AnyArguments<'q>> {
    match value {
        SqlValue::Null if column_type.is_integer() => query.bind(None::<i64>),
        SqlValue::Null if column_type == ColumnType::Double => query.bind(None::<f64>),
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Int(v) => query.bind(*v),
        SqlValue::Double(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.clone()),
    }
}

/// sqlx-backed sink holding one pooled connection for the life of a pipeline.
pub struct SqlLoader {
    conn: PoolConnection<Any>,
    dialect: Dialect,
}

impl SqlLoader {
    /// Take a connection from the pool, waiting while it is exhausted.
    ///
    /// The pool's acquire timeout only bounds each wait; a timed-out wait is
    /// retried, so a busy pool delays a pipeline but never fails it.
    pub async fn acquire(pool: &DbPool, dialect: Dialect) -> Result<Self> {
        let mut waits = 0u32;
        loop {
            match pool.acquire().await {
                Ok(conn) => return Ok(Self { conn, dialect }),
                Err(sqlx::Error::PoolTimedOut) => {
                    waits += 1;
                    debug!(
                        "Connection pool exhausted ({} in use), still waiting (attempt {})",
                        pool.size(),
                        waits
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }
}

#[async_trait]
impl BatchSink for SqlLoader {
    async fn create_table(&mut self, table: &TableDefinition) -> Result<()> {
        let sql = create_table_sql(self.dialect, table);
        debug!("Creating table:\n{}", sql);

        sqlx::query(&sql)
            .execute(&mut *self.conn)
            .await
            .map_err(|source| IngestError::TableCreationFailure {
                table: table.name.clone(),
                source,
            })?;
        Ok(())
    }

    async fn existing_columns(&mut self, table: &str) -> Result<Vec<String>> {
        let columns = sqlx::query_scalar::<_, String>(self.dialect.table_columns_sql())
            .bind(table.to_string())
            .fetch_all(&mut *self.conn)
            .await?;
        Ok(columns)
    }

    async fn create_indexes(
        &mut self,
        table: &TableDefinition,
        patterns: &[String],
    ) -> Vec<Result<String>> {
        let mut outcomes = Vec::new();
        for (name, sql) in index_statements(self.dialect, table, patterns) {
            let failure = |source: sqlx::Error| IngestError::IndexCreationFailure {
                index: name.clone(),
                table: table.name.clone(),
                source,
            };

            if let Some(exists_sql) = self.dialect.index_exists_sql() {
                let found = sqlx::query_scalar::<_, i64>(exists_sql)
                    .bind(table.name.clone())
                    .bind(name.clone())
                    .fetch_one(&mut *self.conn)
                    .await;
                match found {
                    Ok(0) => {}
                    Ok(_) => {
                        debug!("Index {} already exists", name);
                        outcomes.push(Ok(name));
                        continue;
                    }
                    Err(source) => {
                        outcomes.push(Err(failure(source)));
                        continue;
                    }
                }
            }

            match sqlx::query(&sql).execute(&mut *self.conn).await {
                Ok(_) => {
                    debug!("Created index {}", name);
                    outcomes.push(Ok(name));
                }
                Err(source) => outcomes.push(Err(failure(source))),
            }
        }
        outcomes
    }

    async fn insert_batch(&mut self, table: &TableDefinition, batch: Batch) -> Result<u64> {
        let (first_row, last_row, rows) = (batch.first_row(), batch.last_row(), batch.len());
        let failure = |source: sqlx::Error| IngestError::BatchInsertFailure {
            first_row,
            last_row,
            rows,
            source,
        };

        let chunk_rows = rows_per_statement(self.dialect, table.columns.len());
        let mut tx = self.conn.begin().await.map_err(failure)?;

        for chunk in batch.rows().chunks(chunk_rows) {
            let sql = insert_sql(self.dialect, table, chunk.len());
            let mut query = sqlx::query(&sql);
            for row in chunk {
                debug_assert_eq!(row.values.len(), table.columns.len());
                for (value, column) in row.values.iter().zip(&table.columns) {
                    query = bind_value(query, value, column.inferred_type);
                }
            }

            if let Err(source) = query.execute(&mut *tx).await {
                if let Err(e) = tx.rollback().await {
                    warn!("Rollback of rows {}..={} failed: {}", first_row, last_row, e);
                }
                return Err(failure(source));
            }
        }

        tx.commit().await.map_err(failure)?;
        Ok(rows as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, inferred_type: ColumnType) -> ColumnProfile {
        ColumnProfile {
            original_name: name.to_string(),
            normalized_name: name.to_string(),
            inferred_type,
            max_observed_length: 0,
        }
    }

    fn table() -> TableDefinition {
        TableDefinition::new(
            "performance",
            DEFAULT_PRIMARY_KEY,
            vec![
                column("model_name", ColumnType::VarChar(40)),
                column("eval_count", ColumnType::SmallInt),
                column("run_date", ColumnType::Date),
                column("notes", ColumnType::Text),
            ],
        )
    }

    #[test]
    fn test_create_table_sql_mysql() {
        let sql = create_table_sql(Dialect::MySql, &table());
        assert_eq!(
            sql,
            "CREATE TABLE IF NOT EXISTS `performance` (\n  \
             `id` BIGINT AUTO_INCREMENT PRIMARY KEY,\n  \
             `model_name` VARCHAR(40),\n  \
             `eval_count` SMALLINT,\n  \
             `run_date` DATE,\n  \
             `notes` TEXT\n)"
        );
    }

    #[test]
    fn test_create_table_sql_postgres_key() {
        let sql = create_table_sql(Dialect::Postgres, &table());
        assert!(sql.starts_with(
            "CREATE TABLE IF NOT EXISTS \"performance\" (\n  \"id\" BIGSERIAL PRIMARY KEY"
        ));
    }

    #[test]
    fn test_insert_sql_numbers_postgres_params() {
        let sql = insert_sql(Dialect::Postgres, &table(), 2);
        assert_eq!(
            sql,
            "INSERT INTO \"performance\" (\"model_name\", \"eval_count\", \"run_date\", \"notes\") \
             VALUES ($1, $2, $3::date, $4), ($5, $6, $7::date, $8)"
        );
    }

    #[test]
    fn test_insert_sql_mysql_uses_question_marks() {
        let sql = insert_sql(Dialect::MySql, &table(), 1);
        assert!(sql.ends_with("VALUES (?, ?, ?, ?)"));
    }

    #[test]
    fn test_rows_per_statement_respects_limit() {
        assert_eq!(rows_per_statement(Dialect::MySql, 70), 936);
        assert_eq!(rows_per_statement(Dialect::Sqlite, 4), 8191);
        assert_eq!(rows_per_statement(Dialect::Sqlite, 0), 32_766);
        assert_eq!(rows_per_statement(Dialect::MySql, 100_000), 1);
    }

    #[test]
    fn test_index_statements_match_patterns() {
        let patterns = vec!["name".to_string(), "DATE".to_string(), " ".to_string()];
        let statements = index_statements(Dialect::MySql, &table(), &patterns);
        let names: Vec<_> = statements.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["idx_performance_model_name", "idx_performance_run_date"]);
        assert_eq!(
            statements[0].1,
            "CREATE INDEX `idx_performance_model_name` ON `performance` (`model_name`)"
        );

        let sqlite = index_statements(Dialect::Sqlite, &table(), &["notes".to_string()]);
        assert_eq!(
            sqlite[0].1,
            "CREATE INDEX IF NOT EXISTS \"idx_performance_notes\" ON \"performance\" (\"notes\")"
        );
    }

    #[test]
    fn test_existing_columns_must_match_file() {
        let same: Vec<String> = ["ID", "Model_Name", "eval_count", "run_date", "notes"]
            .iter()
            .map(|c| c.to_string())
            .collect();
        assert!(check_existing_columns(&table(), &same).is_ok());

        let other: Vec<String> = ["id", "label", "eval_count"]
            .iter()
            .map(|c| c.to_string())
            .collect();
        match check_existing_columns(&table(), &other) {
            Err(IngestError::TableSchemaMismatch {
                table,
                missing_columns,
                extra_columns,
            }) => {
                assert_eq!(table, "performance");
                assert_eq!(missing_columns, vec!["model_name", "run_date", "notes"]);
                assert_eq!(extra_columns, vec!["label"]);
            }
            other => panic!("expected a table schema mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_index_name_is_truncated() {
        let name = index_name(&"t".repeat(40), &"c".repeat(40));
        assert_eq!(name.len(), MAX_IDENTIFIER_LEN);
    }
}
