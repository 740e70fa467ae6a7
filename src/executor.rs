//! Database execution abstraction over `may_postgres`.
//!
//! The [`SqlExecutor`] trait is the seam between the migration engine and the
//! database driver. The store talks to its session exclusively through this
//! trait, which keeps the bookkeeping logic testable and leaves the driver
//! swappable.

use may_postgres::types::ToSql;
use may_postgres::{Client, Error as PostgresError, Row};
use std::fmt;

/// Execution error type
#[derive(Debug)]
pub enum SqlError {
    /// PostgreSQL error from `may_postgres`
    Postgres(PostgresError),
    /// Other execution errors
    Other(String),
}

impl fmt::Display for SqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlError::Postgres(e) => write!(f, "PostgreSQL error: {e}"),
            SqlError::Other(s) => write!(f, "execution error: {s}"),
        }
    }
}

impl std::error::Error for SqlError {}

impl From<PostgresError> for SqlError {
    fn from(err: PostgresError) -> Self {
        SqlError::Postgres(err)
    }
}

/// Trait for executing statements against a single database session.
///
/// Implementations are expected to be bound to one session for their entire
/// lifetime: advisory locks taken through an executor are session-scoped, so
/// swapping connections underneath the store would silently drop them.
pub trait SqlExecutor: Send + Sync {
    /// Execute a statement and return the number of rows affected.
    fn execute(&self, query: &str, params: &[&dyn ToSql]) -> Result<u64, SqlError>;

    /// Execute a query expected to return exactly one row.
    fn query_one(&self, query: &str, params: &[&dyn ToSql]) -> Result<Row, SqlError>;

    /// Execute a query and return all rows.
    fn query_all(&self, query: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>, SqlError>;
}

/// [`SqlExecutor`] implementation backed by a `may_postgres::Client`.
///
/// The client is coroutine-native: calls block the current coroutine, not the
/// OS thread, so one executor per schema composes with the runner's
/// per-schema coroutines.
pub struct MayPostgresExecutor {
    client: Client,
}

impl MayPostgresExecutor {
    /// Create a new executor owning the given client session.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl SqlExecutor for MayPostgresExecutor {
    fn execute(&self, query: &str, params: &[&dyn ToSql]) -> Result<u64, SqlError> {
        self.client
            .execute(query, params)
            .map_err(SqlError::Postgres)
    }

    fn query_one(&self, query: &str, params: &[&dyn ToSql]) -> Result<Row, SqlError> {
        self.client
            .query_one(query, params)
            .map_err(SqlError::Postgres)
    }

    fn query_all(&self, query: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>, SqlError> {
        self.client.query(query, params).map_err(SqlError::Postgres)
    }
}
