//! Schema registry
//!
//! A schema is a named logical database with its own migration graph and its
//! own version table. The registry holds the well-known schema set and loads
//! each schema's definitions from its migrations directory.

use crate::definition::{read_definitions, Definitions};
use crate::error::MigrationError;
use std::path::Path;
use std::sync::Arc;

/// The registered schema names, in the order `--db all` expands them.
pub const SCHEMA_NAMES: [&str; 3] = ["frontend", "codeintel", "codeinsights"];

/// The version table tracking a registered schema, or `None` for an
/// unregistered name.
pub fn version_table_name(schema_name: &str) -> Option<&'static str> {
    match schema_name {
        "frontend" => Some("schema_migrations"),
        "codeintel" => Some("codeintel_schema_migrations"),
        "codeinsights" => Some("codeinsights_schema_migrations"),
        _ => None,
    }
}

/// A named logical database bound to its migration graph and version table.
///
/// The definitions are behind an `Arc`: the graph is immutable after load and
/// shared across parallel schema runs.
#[derive(Clone)]
pub struct Schema {
    /// Schema name (e.g. `frontend`)
    pub name: String,

    /// Name of the table holding this schema's version row
    pub table_name: String,

    /// The parsed migration graph
    pub definitions: Arc<Definitions>,
}

impl Schema {
    /// Bind a name and version table to an already-loaded graph.
    pub fn new(
        name: impl Into<String>,
        table_name: impl Into<String>,
        definitions: Definitions,
    ) -> Self {
        Self {
            name: name.into(),
            table_name: table_name.into(),
            definitions: Arc::new(definitions),
        }
    }

    /// Load a registered schema's definitions from
    /// `<migrations_dir>/<schema_name>/`.
    ///
    /// # Errors
    ///
    /// Fails with `UnknownSchema` for unregistered names and with the reader
    /// errors of [`read_definitions`] for malformed migration directories.
    pub fn load(schema_name: &str, migrations_dir: &Path) -> Result<Self, MigrationError> {
        let table_name = version_table_name(schema_name)
            .ok_or_else(|| MigrationError::UnknownSchema(schema_name.to_string()))?;

        let definitions = read_definitions(&migrations_dir.join(schema_name))?;

        Ok(Self::new(schema_name, table_name, definitions))
    }
}
