//! Migration engine error types

use crate::executor::SqlError;
use std::fmt;

/// Errors produced by the definition graph, the store, and the runner.
///
/// Variants are deliberately fine-grained so that callers (and the CLI) can
/// distinguish conditions that require operator intervention (`DirtyDatabase`)
/// from transient coordination failures (`MigrationContention`) and from
/// outright bugs (`InvariantViolation`).
#[derive(Debug)]
pub enum MigrationError {
    /// Database execution error
    Database(SqlError),
    /// A migration directory is missing a required file or has unparseable contents
    MalformedDefinition { id: i64, file: String },
    /// A top-level entry in the migrations directory is not a numeric directory
    MalformedName(String),
    /// The migrations directory itself cannot be read
    UnreadableDirectory { path: String, detail: String },
    /// Two definitions share the same identifier
    DuplicateIdentifier(i64),
    /// The migration graph has no root
    NoRoots,
    /// The migration graph has more than one root
    MultipleRoots(Vec<i64>),
    /// The migration graph contains a cycle
    Cycle,
    /// A target or parent reference does not resolve to a known definition
    UnknownMigration {
        id: i64,
        referenced_from: Option<i64>,
    },
    /// A filtered subgraph retained a definition whose parent was filtered out
    OutstandingReferences { id: i64, parent: i64 },
    /// The log shows pending or failed versions; no safe forward progress
    DirtyDatabase { pending: Vec<i64>, failed: Vec<i64> },
    /// Another migrator holds the advisory lock or changed state underfoot
    MigrationContention,
    /// Validation found leaves that have not been applied
    SchemaOutOfDate {
        schema_name: String,
        missing_versions: Vec<i64>,
    },
    /// A revert cannot identify a unique last-applied migration
    AmbiguousRevert,
    /// The store refused to re-apply an applied migration
    AlreadyApplied(i64),
    /// The store refused to revert a migration that was never applied
    NotApplied(i64),
    /// Wrapper applied by the store when it refuses a transition the runner
    /// should have made impossible
    InvariantViolation(Box<MigrationError>),
    /// The database refused the advisory lock
    LockAcquisitionFailed { cause: Box<MigrationError> },
    /// Two operations in one call named the same schema
    DuplicateOperations,
    /// An operation named a schema the runner does not know
    UnknownSchema(String),
    /// A migration body failed; records which definition and direction
    MigrationFailed {
        id: i64,
        up: bool,
        cause: Box<MigrationError>,
    },
    /// A per-schema run failed; records which schema
    SchemaFailed {
        schema_name: String,
        cause: Box<MigrationError>,
    },
    /// Several independent errors (parallel runs, appended cleanup failures)
    Multiple(Vec<MigrationError>),
}

impl MigrationError {
    /// Attach a secondary error (an unlock or log-finalisation failure) to
    /// this one without shadowing it.
    pub(crate) fn append(self, other: MigrationError) -> MigrationError {
        match self {
            MigrationError::Multiple(mut errors) => {
                errors.push(other);
                MigrationError::Multiple(errors)
            }
            primary => MigrationError::Multiple(vec![primary, other]),
        }
    }
}

fn join_ids(ids: &[i64]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for MigrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationError::Database(e) => write!(f, "database error: {e}"),
            MigrationError::MalformedDefinition { id, file } => {
                write!(f, "malformed migration definition {id}: missing or unreadable {file}")
            }
            MigrationError::MalformedName(name) => {
                write!(f, "malformed migration directory name {name:?}: expected a numeric identifier")
            }
            MigrationError::UnreadableDirectory { path, detail } => {
                write!(f, "cannot read migrations directory {path}: {detail}")
            }
            MigrationError::DuplicateIdentifier(id) => {
                write!(f, "duplicate migration identifier {id}")
            }
            MigrationError::NoRoots => write!(f, "migration graph has no roots"),
            MigrationError::MultipleRoots(ids) => {
                write!(f, "migration graph has multiple roots: {}", join_ids(ids))
            }
            MigrationError::Cycle => write!(f, "migration graph contains a cycle"),
            MigrationError::UnknownMigration { id, referenced_from } => match referenced_from {
                Some(parent) => {
                    write!(f, "unknown migration {id} referenced from migration {parent}")
                }
                None => write!(f, "unknown migration {id}"),
            },
            MigrationError::OutstandingReferences { id, parent } => {
                write!(f, "migration {id} has an outstanding reference to filtered migration {parent}")
            }
            MigrationError::DirtyDatabase { pending, failed } => {
                write!(
                    f,
                    "dirty database: pending=[{}] failed=[{}]; a previous migration attempt did not complete and requires operator attention",
                    join_ids(pending),
                    join_ids(failed),
                )
            }
            MigrationError::MigrationContention => {
                write!(f, "migration contention: another migrator is operating on this schema")
            }
            MigrationError::SchemaOutOfDate { schema_name, missing_versions } => {
                write!(
                    f,
                    "schema {schema_name:?} is out of date: missing migrations [{}]",
                    join_ids(missing_versions),
                )
            }
            MigrationError::AmbiguousRevert => {
                write!(f, "ambiguous revert: cannot identify a unique last-applied migration")
            }
            MigrationError::AlreadyApplied(id) => {
                write!(f, "migration {id} is already applied")
            }
            MigrationError::NotApplied(id) => {
                write!(f, "migration {id} has not been applied; nothing to revert")
            }
            MigrationError::InvariantViolation(cause) => {
                write!(
                    f,
                    "{cause}\n\nThis condition is not reachable through normal use of the \
                     migration store via the runner and indicates a bug. Please report this issue.",
                )
            }
            MigrationError::LockAcquisitionFailed { cause } => {
                write!(f, "failed to acquire migration lock: {cause}")
            }
            MigrationError::DuplicateOperations => {
                write!(f, "multiple operations defined on the same schema")
            }
            MigrationError::UnknownSchema(name) => {
                write!(f, "unknown schema {name:?}")
            }
            MigrationError::MigrationFailed { id, up, cause } => {
                let direction = if *up { "upgrade" } else { "downgrade" };
                write!(f, "failed {direction} migration {id}: {cause}")
            }
            MigrationError::SchemaFailed { schema_name, cause } => {
                write!(f, "failed to run migration for schema {schema_name:?}: {cause}")
            }
            MigrationError::Multiple(errors) => {
                let messages = errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("\n");
                write!(f, "{messages}")
            }
        }
    }
}

impl std::error::Error for MigrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MigrationError::Database(e) => Some(e),
            MigrationError::InvariantViolation(cause)
            | MigrationError::LockAcquisitionFailed { cause }
            | MigrationError::MigrationFailed { cause, .. }
            | MigrationError::SchemaFailed { cause, .. } => Some(cause.as_ref()),
            _ => None,
        }
    }
}

impl From<SqlError> for MigrationError {
    fn from(error: SqlError) -> Self {
        MigrationError::Database(error)
    }
}
