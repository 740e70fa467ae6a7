//! Startup validation
//!
//! Services call `Runner::validate` at startup to confirm the database
//! matches the schema versions they were built against. Validation is
//! read-only: it never mutates the version row or the log, and it tolerates
//! databases that are *newer* than the local graph so that rolling
//! deployments do not take down the old instances.

use super::{release_lock, Runner, SchemaContext};
use crate::definition::Definitions;
use crate::error::MigrationError;
use crate::store::SchemaVersion;

impl Runner {
    /// Confirm every named schema is at (or beyond) the local graph.
    ///
    /// # Errors
    ///
    /// Returns `SchemaOutOfDate` with the missing versions when migrations
    /// still need to run, and `DirtyDatabase` when a failed attempt requires
    /// operator attention.
    pub fn validate(&self, schema_names: &[String]) -> Result<(), MigrationError> {
        self.for_each_schema(schema_names, schema_names.len().max(1), |context: &SchemaContext| {
            validate_schema(context)
        })
    }
}

fn validate_schema(context: &SchemaContext) -> Result<(), MigrationError> {
    let definitions = &context.schema.definitions;

    // A strictly newer database means a deployment is in progress and the
    // running instance has everything it needs. Do not fail here even if the
    // database is dirty: that would let a troubled deployment cause an
    // outage on the old instances.
    if is_database_newer(&context.initial_version.applied, definitions) {
        return Ok(());
    }

    let (version, dirty) = wait_for_migration(context)?;

    let leaf_ids: Vec<i64> = definitions.leaves().iter().map(|d| d.id).collect();
    let plan = match definitions.up(&version.applied, &leaf_ids) {
        Ok(plan) => plan,
        Err(err) => {
            // Planning errors here mean the database and the local graph
            // disagree about history; report the full expected set so the
            // operator can see what this build wants.
            let missing_versions: Vec<i64> = definitions.all().iter().map(|d| d.id).collect();
            if missing_versions.is_empty() {
                return Err(err);
            }

            return Err(MigrationError::SchemaOutOfDate {
                schema_name: context.schema.name.clone(),
                missing_versions,
            });
        }
    };

    if dirty {
        if is_database_newer(&version.applied, definitions) {
            return Ok(());
        }

        // No migrator is running; the dirty flag marks a real failure.
        return Err(MigrationError::DirtyDatabase {
            pending: version.pending.clone(),
            failed: version.failed.clone(),
        });
    }

    if plan.is_empty() {
        return Ok(());
    }

    Err(MigrationError::SchemaOutOfDate {
        schema_name: context.schema.name.clone(),
        missing_versions: plan.iter().map(|d| d.id).collect(),
    })
}

/// While the schema looks dirty, block on the advisory lock and re-read: a
/// concurrent migrator making progress keeps us polling, so callers that
/// would succeed once it finishes do not fail fast. Returns the last
/// observed snapshot and whether it was still dirty once the applied set
/// stopped moving.
fn wait_for_migration(context: &SchemaContext) -> Result<(SchemaVersion, bool), MigrationError> {
    let mut version = context.initial_version.clone();

    loop {
        if !version.is_dirty() {
            return Ok((version, false));
        }

        let locked = locked_version(context)?;
        if locked.applied == version.applied {
            // We got the lock without the applied set moving: no migrator is
            // running, so the dirty state is settled.
            return Ok((locked, true));
        }

        version = locked;
    }
}

fn locked_version(context: &SchemaContext) -> Result<SchemaVersion, MigrationError> {
    context.store.lock()?;
    release_lock(&context.store, context.store.versions())
}

/// True when every definition in the local graph has been applied — the
/// database may know migrations this build does not.
fn is_database_newer(applied: &[i64], definitions: &Definitions) -> bool {
    definitions
        .all()
        .iter()
        .all(|definition| applied.contains(&definition.id))
}
