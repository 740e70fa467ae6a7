//! Durable migration state
//!
//! The store is the only component that writes to a schema's version row and
//! to the shared `migration_logs` table. It binds to one schema (by version
//! table name), owns its own database session, and implements the advisory
//! lock and transactional bookkeeping protocol that keeps the runner honest:
//! every attempt gets a log row, the version row is flipped dirty before the
//! migration body runs, and illegal transitions are refused outright.

use crate::definition::Definition;
use crate::error::MigrationError;
use crate::executor::SqlExecutor;
use may_postgres::types::ToSql;
use sha2::{Digest, Sha256};

const MIGRATION_LOG_SCHEMA_VERSION: i32 = 1;

/// Schemas that predate the `migration_logs` table, mapped to the first
/// migration identifier ever defined for them. `ensure_schema_table`
/// back-fills synthetic log rows over this range so that `versions` can be
/// derived from the log alone.
const MIN_MIGRATION_VERSIONS: [(&str, i64); 3] = [
    ("schema_migrations", 1528395834),
    ("codeintel_schema_migrations", 1000000015),
    ("codeinsights_schema_migrations", 1000000000),
];

/// A snapshot of a schema's migration state, derived from the most recent
/// log row per version. Each list is sorted ascending.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SchemaVersion {
    /// Versions whose latest attempt was a successful up-migration
    pub applied: Vec<i64>,
    /// Versions whose latest attempt has not finished (`success IS NULL`)
    pub pending: Vec<i64>,
    /// Versions whose latest attempt failed
    pub failed: Vec<i64>,
}

impl SchemaVersion {
    /// True when any pending or failed versions block forward progress.
    pub fn is_dirty(&self) -> bool {
        !self.pending.is_empty() || !self.failed.is_empty()
    }
}

/// The store interface the runner consumes.
///
/// Kept object-safe so runner logic can be exercised against an in-memory
/// store in tests.
pub trait MigrationStore: Send + Sync {
    /// Idempotently create the version table and the shared log table.
    fn ensure_schema_table(&self) -> Result<(), MigrationError>;

    /// Snapshot the schema's applied/pending/failed versions.
    fn versions(&self) -> Result<SchemaVersion, MigrationError>;

    /// Block until this schema's advisory lock is held by this session.
    fn lock(&self) -> Result<(), MigrationError>;

    /// Attempt to take the advisory lock without blocking; returns whether it
    /// was acquired.
    fn try_lock(&self) -> Result<bool, MigrationError>;

    /// Release the advisory lock.
    fn unlock(&self) -> Result<(), MigrationError>;

    /// Apply one up-migration, recording the attempt in the log.
    fn up(&self, definition: &Definition) -> Result<(), MigrationError>;

    /// Apply one down-migration, recording the attempt in the log.
    fn down(&self, definition: &Definition) -> Result<(), MigrationError>;
}

/// PostgreSQL-backed [`MigrationStore`] bound to a single schema.
pub struct Store {
    executor: Box<dyn SqlExecutor>,
    schema_name: String,
}

impl Store {
    /// Create a store for the schema tracked by the given version table.
    ///
    /// The executor must wrap a dedicated session: the advisory lock taken by
    /// [`MigrationStore::lock`] is session-scoped and held across the
    /// multiple transactions of a migration sequence.
    pub fn new(executor: Box<dyn SqlExecutor>, schema_name: impl Into<String>) -> Self {
        Self {
            executor,
            schema_name: schema_name.into(),
        }
    }

    fn execute(&self, query: &str, params: &[&dyn ToSql]) -> Result<u64, MigrationError> {
        Ok(self.executor.execute(query, params)?)
    }

    /// Run `f` inside a transaction on this store's session, committing on
    /// success and rolling back on error.
    fn in_transaction<T>(
        &self,
        f: impl FnOnce(&Self) -> Result<T, MigrationError>,
    ) -> Result<T, MigrationError> {
        self.execute("BEGIN", &[])?;

        match f(self) {
            Ok(value) => {
                self.execute("COMMIT", &[])?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.execute("ROLLBACK", &[]) {
                    return Err(err.append(rollback_err));
                }
                Err(err)
            }
        }
    }

    fn run_migration_query(&self, version: i64, up: bool, query: &str) -> Result<(), MigrationError> {
        let log_id = self.create_migration_log(version, up)?;

        let result = self.apply_migration_body(query);

        // The log row must be finalised on every path so a failed body shows
        // up as failed rather than pending forever.
        let error_message = result.as_ref().err().map(|e| e.to_string());
        let finalised = self.execute(
            "UPDATE migration_logs SET finished_at = NOW(), success = $1, error_message = $2 WHERE id = $3",
            &[&result.is_ok(), &error_message, &log_id],
        );

        match finalised {
            Ok(_) => result,
            Err(finalise_err) => Err(match result {
                Ok(()) => finalise_err,
                Err(err) => err.append(finalise_err),
            }),
        }
    }

    /// Execute a migration body on the bare session. Bookkeeping runs in its
    /// own short transaction; the body stays outside so that statements like
    /// `CREATE INDEX CONCURRENTLY` remain legal.
    fn apply_migration_body(&self, query: &str) -> Result<(), MigrationError> {
        self.execute(query, &[])?;

        self.execute(&format!("UPDATE {} SET dirty = false", self.schema_name), &[])?;

        Ok(())
    }

    /// Within a short transaction: refuse illegal transitions, swap the
    /// version row to the new version with `dirty = true`, and insert the
    /// pending log row. Returns the log row's primary key.
    fn create_migration_log(&self, version: i64, up: bool) -> Result<i32, MigrationError> {
        self.in_transaction(|tx| {
            tx.validate_version(version, up)?;

            tx.execute(&format!("DELETE FROM {}", tx.schema_name), &[])?;
            tx.execute(
                &format!("INSERT INTO {} (version, dirty) VALUES ($1, true)", tx.schema_name),
                &[&version],
            )?;

            let row = tx.executor.query_one(
                "INSERT INTO migration_logs (
                    migration_logs_schema_version,
                    schema,
                    version,
                    up,
                    started_at
                ) VALUES ($1, $2, $3, $4, NOW())
                RETURNING id",
                &[
                    &MIGRATION_LOG_SCHEMA_VERSION,
                    &tx.schema_name,
                    &(version as i32),
                    &up,
                ],
            )?;

            Ok(row.get(0))
        })
    }

    /// Refuse transitions the runner should have made impossible: operating
    /// on a dirty schema, re-applying an applied migration, or reverting one
    /// that was never applied.
    fn validate_version(&self, version: i64, up: bool) -> Result<(), MigrationError> {
        self.check_version_transition(version, up)
            .map_err(|e| MigrationError::InvariantViolation(Box::new(e)))
    }

    fn check_version_transition(&self, version: i64, up: bool) -> Result<(), MigrationError> {
        let schema_version = self.versions()?;

        if schema_version.is_dirty() {
            return Err(MigrationError::DirtyDatabase {
                pending: schema_version.pending,
                failed: schema_version.failed,
            });
        }

        let applied = schema_version.applied.contains(&version);
        if up && applied {
            return Err(MigrationError::AlreadyApplied(version));
        }
        if !up && !applied {
            return Err(MigrationError::NotApplied(version));
        }

        Ok(())
    }
}

const VERSIONS_QUERY: &str = "
WITH ranked_migration_logs AS (
    SELECT
        migration_logs.*,
        ROW_NUMBER() OVER (PARTITION BY version ORDER BY finished_at DESC) AS row_number
    FROM migration_logs
    WHERE schema = $1
)
SELECT version, up, success
FROM ranked_migration_logs
WHERE row_number = 1
ORDER BY version
";

impl MigrationStore for Store {
    fn ensure_schema_table(&self) -> Result<(), MigrationError> {
        let mut queries = vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {} (version bigint NOT NULL PRIMARY KEY)",
                self.schema_name
            ),
            format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS dirty boolean NOT NULL",
                self.schema_name
            ),
            "CREATE TABLE IF NOT EXISTS migration_logs (id SERIAL PRIMARY KEY)".to_string(),
            "ALTER TABLE migration_logs ADD COLUMN IF NOT EXISTS migration_logs_schema_version integer NOT NULL".to_string(),
            "ALTER TABLE migration_logs ADD COLUMN IF NOT EXISTS schema text NOT NULL".to_string(),
            "ALTER TABLE migration_logs ADD COLUMN IF NOT EXISTS version integer NOT NULL".to_string(),
            "ALTER TABLE migration_logs ADD COLUMN IF NOT EXISTS up bool NOT NULL".to_string(),
            "ALTER TABLE migration_logs ADD COLUMN IF NOT EXISTS started_at timestamptz NOT NULL".to_string(),
            "ALTER TABLE migration_logs ADD COLUMN IF NOT EXISTS finished_at timestamptz".to_string(),
            "ALTER TABLE migration_logs ADD COLUMN IF NOT EXISTS success boolean".to_string(),
            "ALTER TABLE migration_logs ADD COLUMN IF NOT EXISTS error_message text".to_string(),
        ];

        // Installations that predate the log table have only the version row.
        // Synthesise one successful up-log per version in the known range so
        // the log becomes the single source of truth. Skipped when the row is
        // dirty (we cannot tell what actually ran) or a log already exists.
        let min_version = MIN_MIGRATION_VERSIONS
            .iter()
            .find(|(schema, _)| *schema == self.schema_name)
            .map(|(_, version)| *version);

        self.in_transaction(|tx| {
            for query in queries.drain(..) {
                tx.execute(&query, &[])?;
            }

            if let Some(min_version) = min_version {
                tx.execute(
                    &format!(
                        "WITH schema_version AS (
                            SELECT * FROM {} LIMIT 1
                        )
                        INSERT INTO migration_logs (
                            migration_logs_schema_version,
                            schema,
                            version,
                            up,
                            success,
                            started_at,
                            finished_at
                        )
                        SELECT $1, $2, version, true, true, NOW(), NOW()
                        FROM generate_series($3::bigint, (SELECT version FROM schema_version)) version
                        WHERE NOT (SELECT dirty FROM schema_version)
                          AND NOT EXISTS (SELECT 1 FROM migration_logs WHERE schema = $2)",
                        tx.schema_name
                    ),
                    &[&MIGRATION_LOG_SCHEMA_VERSION, &tx.schema_name, &min_version],
                )?;
            }

            Ok(())
        })
    }

    fn versions(&self) -> Result<SchemaVersion, MigrationError> {
        let rows = self.executor.query_all(VERSIONS_QUERY, &[&self.schema_name])?;

        let mut schema_version = SchemaVersion::default();
        for row in rows {
            let version: i32 = row.get(0);
            let up: bool = row.get(1);
            let success: Option<bool> = row.get(2);

            match success {
                None => schema_version.pending.push(version as i64),
                Some(false) => schema_version.failed.push(version as i64),
                Some(true) if up => schema_version.applied.push(version as i64),
                Some(true) => {}
            }
        }

        Ok(schema_version)
    }

    fn lock(&self) -> Result<(), MigrationError> {
        let key = lock_key(&self.schema_name);

        self.execute("SELECT pg_advisory_lock($1, $2)", &[&key, &0i32])
            .map_err(|e| MigrationError::LockAcquisitionFailed { cause: Box::new(e) })?;

        Ok(())
    }

    fn try_lock(&self) -> Result<bool, MigrationError> {
        let key = lock_key(&self.schema_name);

        let row = self
            .executor
            .query_one("SELECT pg_try_advisory_lock($1, $2)", &[&key, &0i32])
            .map_err(|e| MigrationError::LockAcquisitionFailed {
                cause: Box::new(MigrationError::Database(e)),
            })?;

        Ok(row.get(0))
    }

    fn unlock(&self) -> Result<(), MigrationError> {
        let key = lock_key(&self.schema_name);

        let row = self
            .executor
            .query_one("SELECT pg_advisory_unlock($1, $2)", &[&key, &0i32])?;

        let released: bool = row.get(0);
        if !released {
            log::warn!("advisory lock for {} was not held at release", self.schema_name);
        }

        Ok(())
    }

    fn up(&self, definition: &Definition) -> Result<(), MigrationError> {
        self.run_migration_query(definition.id, true, &definition.up_query)
    }

    fn down(&self, definition: &Definition) -> Result<(), MigrationError> {
        self.run_migration_query(definition.id, false, &definition.down_query)
    }
}

/// Advisory lock key for a schema: the first four bytes of
/// `SHA-256("<schemaName>:migrations")`, big-endian. A pure function of the
/// schema name, so every migrator derives the same named mutex.
pub fn lock_key(schema_name: &str) -> i32 {
    let digest = Sha256::digest(format!("{schema_name}:migrations").as_bytes());
    i32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}
