//! Database module: pooled connections, bootstrap and SQL dialects
//!
//! Everything goes through the sqlx `Any` driver so one pool type serves
//! MySQL, PostgreSQL and SQLite targets.

pub mod connection;
pub mod dialect;

pub use connection::{ensure_database, init_pool, DbPool, PoolSettings};
pub use dialect::Dialect;
