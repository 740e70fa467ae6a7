//! Migration runner
//!
//! The runner orchestrates migration operations across schemas: it produces a
//! per-run [`SchemaContext`] for every requested schema, fans the work out
//! over `may` coroutines bounded by a counting semaphore, and drives each
//! schema's plan through its store while holding that schema's advisory lock.

mod run;
mod validate;

pub use run::{MigrationOperation, MigrationOperationType, Options};

use crate::error::MigrationError;
use crate::executor::SqlError;
use crate::schemas::Schema;
use crate::store::{MigrationStore, SchemaVersion};
use crossbeam_channel::{bounded, unbounded};
use std::collections::HashMap;
use std::sync::Arc;

/// Orchestrates migration operations over a set of registered schemas.
///
/// Each schema is paired with its own store (and thus its own database
/// session); the shared definition graphs are immutable and travel by `Arc`.
pub struct Runner {
    entries: HashMap<String, RunnerSchema>,
}

struct RunnerSchema {
    schema: Schema,
    store: Arc<dyn MigrationStore>,
}

/// Everything a per-schema run needs: the schema's graph, its store handle,
/// and the version snapshot taken before the advisory lock. Owned, so it can
/// move into the coroutine running that schema.
pub(crate) struct SchemaContext {
    pub(crate) schema: Schema,
    pub(crate) store: Arc<dyn MigrationStore>,
    pub(crate) initial_version: SchemaVersion,
}

impl Runner {
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    /// Register a schema and the store bound to its database.
    pub fn register(&mut self, schema: Schema, store: Arc<dyn MigrationStore>) {
        self.entries.insert(schema.name.clone(), RunnerSchema { schema, store });
    }

    /// Run `f` once per named schema, at most `concurrency` at a time.
    ///
    /// Every schema gets its own coroutine; a bounded channel acts as the
    /// counting semaphore (capacity 1 serialises the runs entirely). Context
    /// construction — the idempotent `ensure_schema_table` plus the pre-lock
    /// version snapshot — happens inside the semaphore so that concurrent
    /// DDL against a shared database instance stays bounded too.
    fn for_each_schema<F>(
        &self,
        schema_names: &[String],
        concurrency: usize,
        f: F,
    ) -> Result<(), MigrationError>
    where
        F: Fn(&SchemaContext) -> Result<(), MigrationError> + Send + Sync + 'static,
    {
        let mut entries = Vec::with_capacity(schema_names.len());
        for name in schema_names {
            let entry = self
                .entries
                .get(name)
                .ok_or_else(|| MigrationError::UnknownSchema(name.clone()))?;
            entries.push((entry.schema.clone(), entry.store.clone()));
        }

        let (slot_tx, slot_rx) = bounded::<()>(concurrency.max(1));
        let (err_tx, err_rx) = unbounded::<MigrationError>();
        let f = Arc::new(f);

        // Spawned coroutines own everything they touch: a clone of the
        // schema, the store handle, and the shared callback.
        let mut handles = Vec::with_capacity(entries.len());
        for (schema, store) in entries {
            let schema_name = schema.name.clone();
            let slot_tx = slot_tx.clone();
            let slot_rx = slot_rx.clone();
            let err_tx = err_tx.clone();
            let f = f.clone();

            let handle = may::go!(move || {
                // Holding a slot bounds how many schemas run at once.
                let _ = slot_tx.send(());
                let result = run_one(schema, store, f.as_ref());
                let _ = slot_rx.recv();

                if let Err(err) = result {
                    let _ = err_tx.send(err);
                }
            });
            handles.push((schema_name, handle));
        }

        for (schema_name, handle) in handles {
            if handle.join().is_err() {
                let _ = err_tx.send(MigrationError::Database(SqlError::Other(format!(
                    "migration coroutine for schema {schema_name:?} panicked"
                ))));
            }
        }

        drop(err_tx);
        let mut errors: Vec<MigrationError> = err_rx.try_iter().collect();
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(MigrationError::Multiple(errors)),
        }
    }
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

fn run_one<F>(
    schema: Schema,
    store: Arc<dyn MigrationStore>,
    f: &F,
) -> Result<(), MigrationError>
where
    F: Fn(&SchemaContext) -> Result<(), MigrationError>,
{
    store.ensure_schema_table()?;
    let initial_version = store.versions()?;

    let context = SchemaContext { schema, store, initial_version };

    f(&context)
}

/// Release the advisory lock on the way out of a locked section, appending
/// any unlock failure to the primary result rather than shadowing it.
pub(crate) fn release_lock<T>(
    store: &dyn MigrationStore,
    result: Result<T, MigrationError>,
) -> Result<T, MigrationError> {
    match store.unlock() {
        Ok(()) => result,
        Err(unlock_err) => Err(match result {
            Ok(_) => unlock_err,
            Err(err) => err.append(unlock_err),
        }),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::definition::{Definition, Definitions, Metadata};
    use crate::error::MigrationError;
    use crate::executor::SqlError;
    use crate::schemas::Schema;
    use crate::store::{MigrationStore, SchemaVersion};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// In-memory store for exercising runner logic without a database.
    ///
    /// `versions` answers from the queued snapshots first (one per call) and
    /// falls back to the live state, which `up`/`down` mutate.
    pub(crate) struct MockStore {
        state: Mutex<MockState>,
    }

    #[derive(Default)]
    struct MockState {
        queued_versions: VecDeque<SchemaVersion>,
        current: SchemaVersion,
        lock_held_elsewhere: bool,
        fail_up_at: Option<i64>,
        up_calls: Vec<i64>,
        down_calls: Vec<i64>,
    }

    impl MockStore {
        pub fn new(current: SchemaVersion) -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(MockState { current, ..Default::default() }),
            })
        }

        pub fn with_queued(queued: Vec<SchemaVersion>, current: SchemaVersion) -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(MockState {
                    queued_versions: queued.into(),
                    current,
                    ..Default::default()
                }),
            })
        }

        pub fn hold_lock_elsewhere(&self) {
            self.state.lock().unwrap().lock_held_elsewhere = true;
        }

        pub fn fail_up_at(&self, id: i64) {
            self.state.lock().unwrap().fail_up_at = Some(id);
        }

        pub fn up_calls(&self) -> Vec<i64> {
            self.state.lock().unwrap().up_calls.clone()
        }

        pub fn down_calls(&self) -> Vec<i64> {
            self.state.lock().unwrap().down_calls.clone()
        }

        pub fn applied(&self) -> Vec<i64> {
            self.state.lock().unwrap().current.applied.clone()
        }
    }

    impl MigrationStore for MockStore {
        fn ensure_schema_table(&self) -> Result<(), MigrationError> {
            Ok(())
        }

        fn versions(&self) -> Result<SchemaVersion, MigrationError> {
            let mut state = self.state.lock().unwrap();
            match state.queued_versions.pop_front() {
                Some(version) => Ok(version),
                None => Ok(state.current.clone()),
            }
        }

        fn lock(&self) -> Result<(), MigrationError> {
            Ok(())
        }

        fn try_lock(&self) -> Result<bool, MigrationError> {
            Ok(!self.state.lock().unwrap().lock_held_elsewhere)
        }

        fn unlock(&self) -> Result<(), MigrationError> {
            Ok(())
        }

        fn up(&self, definition: &Definition) -> Result<(), MigrationError> {
            let mut state = self.state.lock().unwrap();
            if state.fail_up_at == Some(definition.id) {
                return Err(MigrationError::Database(SqlError::Other(
                    "injected failure".to_string(),
                )));
            }

            state.up_calls.push(definition.id);
            state.current.applied.push(definition.id);
            state.current.applied.sort_unstable();
            Ok(())
        }

        fn down(&self, definition: &Definition) -> Result<(), MigrationError> {
            let mut state = self.state.lock().unwrap();
            state.down_calls.push(definition.id);
            state.current.applied.retain(|id| *id != definition.id);
            Ok(())
        }
    }

    pub(crate) fn definition(id: i64, parents: &[i64]) -> Definition {
        Definition {
            id,
            up_query: format!("-- {id} up"),
            down_query: format!("-- {id} down"),
            metadata: Metadata {
                name: format!("migration {id}"),
                parents: parents.to_vec(),
            },
        }
    }

    /// A linear graph `ids[0] → ids[1] → ...` wrapped in a test schema.
    pub(crate) fn chain_schema(name: &str, ids: &[i64]) -> Schema {
        let definitions = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                if i == 0 {
                    definition(*id, &[])
                } else {
                    definition(*id, &[ids[i - 1]])
                }
            })
            .collect();

        Schema::new(
            name,
            format!("{name}_migrations_table"),
            Definitions::build(definitions).expect("test chain is well-formed"),
        )
    }

    pub(crate) fn applied(ids: &[i64]) -> SchemaVersion {
        SchemaVersion {
            applied: ids.to_vec(),
            ..Default::default()
        }
    }
}
