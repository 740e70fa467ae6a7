//! # Floodgate
//!
//! Graph-based schema migration engine for PostgreSQL, built on the `may`
//! coroutine runtime and `may_postgres`.
//!
//! Each schema's migrations form a directed acyclic graph of definitions
//! read from disk. The [`runner::Runner`] plans up and down sequences over
//! that graph, executes them through a per-schema [`store::Store`] while
//! holding a session-scoped advisory lock, and records every attempt in an
//! append-only migration log so that concurrent migrators and failed
//! attempts are always visible.
//!
//! ## Architecture
//!
//! - **definition**: the migration graph and its traversal algebra
//! - **store**: durable state, advisory locking, transactional bookkeeping
//! - **runner**: operation planning, concurrency guards, execution
//! - **schemas**: the registered schema set and graph loading

pub mod config;
pub mod connection;
pub mod definition;
pub mod error;
pub mod executor;
pub mod runner;
pub mod schemas;
pub mod store;

// Re-export connection types for convenience
pub use connection::{connect, validate_connection_string, ConnectionError};

// Re-export executor types for convenience
pub use executor::{MayPostgresExecutor, SqlError, SqlExecutor};

pub use definition::{read_definitions, Definition, Definitions, Metadata};
pub use error::MigrationError;
pub use runner::{MigrationOperation, MigrationOperationType, Options, Runner};
pub use schemas::{version_table_name, Schema, SCHEMA_NAMES};
pub use store::{lock_key, MigrationStore, SchemaVersion, Store};
