//! Migration definition loading
//!
//! A schema's migrations live on disk as a set of numeric directories, each
//! holding the pair of queries and the metadata that links the node into the
//! graph:
//!
//! ```text
//! migrations/frontend/
//!   1528395834/
//!     up.sql
//!     down.sql
//!     metadata.yaml
//!   1528395835/
//!     ...
//! ```

use crate::definition::{Definition, Definitions, Metadata};
use crate::error::MigrationError;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct MetadataPayload {
    #[serde(default)]
    name: String,
    #[serde(default)]
    parents: Vec<i64>,
}

/// Read and validate a schema's migration definitions from disk.
///
/// Every top-level directory must be named by a numeric migration identifier
/// and contain `up.sql`, `down.sql`, and `metadata.yaml`. Plain files at the
/// top level (such as editor droppings or a README) are ignored.
///
/// # Errors
///
/// Fails with a malformed-definition error when a required file is missing or
/// unreadable, and with the graph errors of [`Definitions::build`] when the
/// parsed set has no root, multiple roots, unresolved parents, or a cycle.
pub fn read_definitions(dir: &Path) -> Result<Definitions, MigrationError> {
    let entries = fs::read_dir(dir).map_err(|e| MigrationError::UnreadableDirectory {
        path: dir.display().to_string(),
        detail: e.to_string(),
    })?;

    let mut definitions = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| MigrationError::UnreadableDirectory {
            path: dir.display().to_string(),
            detail: e.to_string(),
        })?;
        if !entry.path().is_dir() {
            continue;
        }

        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();
        let id: i64 = name
            .parse()
            .map_err(|_| MigrationError::MalformedName(name.to_string()))?;

        definitions.push(read_definition(&entry.path(), id)?);
    }

    Definitions::build(definitions)
}

fn read_definition(dir: &Path, id: i64) -> Result<Definition, MigrationError> {
    let up_query = read_definition_file(dir, id, "up.sql")?;
    let down_query = read_definition_file(dir, id, "down.sql")?;

    let raw_metadata = read_definition_file(dir, id, "metadata.yaml")?;
    let payload: MetadataPayload = serde_yaml::from_str(&raw_metadata).map_err(|_| {
        MigrationError::MalformedDefinition {
            id,
            file: "metadata.yaml".to_string(),
        }
    })?;

    Ok(Definition {
        id,
        up_query,
        down_query,
        metadata: Metadata {
            name: payload.name,
            parents: payload.parents,
        },
    })
}

fn read_definition_file(dir: &Path, id: i64, file: &str) -> Result<String, MigrationError> {
    fs::read_to_string(dir.join(file)).map_err(|_| MigrationError::MalformedDefinition {
        id,
        file: file.to_string(),
    })
}
