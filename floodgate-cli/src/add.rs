//! Scaffolding for new migrations
//!
//! `floodgate add` creates the next migration directory for a schema:
//! templated `up.sql` / `down.sql` files plus a `metadata.yaml` whose
//! parents are the current leaves of the on-disk graph, so concurrent
//! branches merge the next time someone adds a migration.

use anyhow::{bail, Context, Result};
use floodgate::read_definitions;
use std::fs;
use std::path::{Path, PathBuf};

const UP_MIGRATION_TEMPLATE: &str = "BEGIN;

-- Perform migration here.
--
-- Guidelines:
--  * Make migrations idempotent (use IF EXISTS / IF NOT EXISTS)
--  * Keep migrations backwards-compatible: old readers and writers must
--    continue to work against the new schema
--  * CREATE INDEX CONCURRENTLY cannot run inside a transaction; migrations
--    using it must contain only that statement, with the BEGIN/COMMIT pair
--    removed

COMMIT;
";

const DOWN_MIGRATION_TEMPLATE: &str = "BEGIN;

-- Undo the changes made in the up migration

COMMIT;
";

/// Files created for a scaffolded migration.
pub struct ScaffoldedMigration {
    pub id: i64,
    pub up_path: PathBuf,
    pub down_path: PathBuf,
    pub metadata_path: PathBuf,
}

/// Create a new migration directory for the schema under
/// `<migrations_dir>/<schema_name>/`.
///
/// The new migration takes the next unused integer identifier and names the
/// current leaves as its parents. If any write fails, files created so far
/// are removed so the filesystem is left unmodified.
pub fn run_add(
    migrations_dir: &Path,
    schema_name: &str,
    migration_name: &str,
) -> Result<ScaffoldedMigration> {
    let schema_dir = migrations_dir.join(schema_name);
    let definitions = read_definitions(&schema_dir)
        .with_context(|| format!("no valid migrations exist for schema {schema_name:?}"))?;

    let id = definitions
        .all()
        .iter()
        .map(|d| d.id)
        .max()
        .map(|max| max + 1)
        .unwrap_or(1);
    let parents: Vec<i64> = definitions.leaves().iter().map(|d| d.id).collect();

    let dir = schema_dir.join(id.to_string());
    if dir.exists() {
        bail!("migration directory {} already exists", dir.display());
    }

    let parent_list = parents
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let metadata = format!("name: {migration_name}\nparents: [{parent_list}]\n");

    let up_path = dir.join("up.sql");
    let down_path = dir.join("down.sql");
    let metadata_path = dir.join("metadata.yaml");

    let contents: [(&Path, &str); 3] = [
        (&up_path, UP_MIGRATION_TEMPLATE),
        (&down_path, DOWN_MIGRATION_TEMPLATE),
        (&metadata_path, &metadata),
    ];

    if let Err(err) = write_migration_files(&dir, &contents) {
        // Leave the tree the way we found it.
        let _ = fs::remove_dir_all(&dir);
        return Err(err);
    }

    Ok(ScaffoldedMigration { id, up_path, down_path, metadata_path })
}

fn write_migration_files(dir: &Path, contents: &[(&Path, &str)]) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    for (path, body) in contents {
        fs::write(path, body).with_context(|| format!("writing {}", path.display()))?;
    }

    Ok(())
}
