//! Operation execution
//!
//! `Runner::run` takes a list of per-schema operations, refuses conflicting
//! or racy work up front, and executes each schema's plan under its advisory
//! lock.

use super::{release_lock, Runner, SchemaContext};
use crate::definition::{Definition, Definitions};
use crate::error::MigrationError;
use crate::store::SchemaVersion;
use std::collections::HashMap;

/// Options for a single `Runner::run` call.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub operations: Vec<MigrationOperation>,

    /// Run schema operations concurrently. Off by default: schemas often
    /// share a backing database instance, and concurrent extension
    /// installation is not transaction-safe.
    pub parallel: bool,
}

/// One unit of work: a schema name, an operation type, and (for targeted
/// operations) the explicit target versions.
#[derive(Debug, Clone)]
pub struct MigrationOperation {
    pub schema_name: String,
    pub operation_type: MigrationOperationType,
    pub target_versions: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOperationType {
    /// Apply up-migrations to reach the given explicit targets
    TargetedUp,
    /// Revert applied descendants of the given targets
    TargetedDown,
    /// Apply up-migrations to reach the current leaves
    TargetedUpgrade,
    /// Revert the single last-applied migration
    TargetedRevert,
}

/// The shape an operation takes after normalisation against the
/// under-lock version snapshot.
enum NormalizedOperation {
    Up(Vec<i64>),
    Down(Vec<i64>),
    /// Revert exactly this migration
    Revert(i64),
}

impl Runner {
    /// Execute the given operations, one coroutine per schema, sequentially
    /// unless `options.parallel` is set.
    ///
    /// # Errors
    ///
    /// Fails fast with `DuplicateOperations` when two operations name the
    /// same schema; per-schema failures come back wrapped in `SchemaFailed`
    /// (collected into `Multiple` when parallel runs produce several).
    pub fn run(&self, options: Options) -> Result<(), MigrationError> {
        let mut operation_map: HashMap<String, MigrationOperation> =
            HashMap::with_capacity(options.operations.len());
        for operation in &options.operations {
            operation_map.insert(operation.schema_name.clone(), operation.clone());
        }
        if operation_map.len() != options.operations.len() {
            return Err(MigrationError::DuplicateOperations);
        }

        let schema_names: Vec<String> = options
            .operations
            .iter()
            .map(|o| o.schema_name.clone())
            .collect();
        let concurrency = if options.parallel { schema_names.len() } else { 1 };

        self.for_each_schema(&schema_names, concurrency, move |context: &SchemaContext| {
            let operation = &operation_map[&context.schema.name];
            run_schema(operation, context).map_err(|e| MigrationError::SchemaFailed {
                schema_name: context.schema.name.clone(),
                cause: Box::new(e),
            })
        })
    }
}

fn run_schema(
    operation: &MigrationOperation,
    context: &SchemaContext,
) -> Result<(), MigrationError> {
    // Plain upgrade-to-latest tolerates racing another migrator toward the
    // same place. Downgrades and explicitly-targeted upgrades do not: any
    // sign of concurrent or incomplete work aborts the run before we take
    // the lock ourselves.
    let upgrading_to_latest = operation.operation_type == MigrationOperationType::TargetedUpgrade;

    if !upgrading_to_latest {
        let initial = &context.initial_version;
        if !initial.failed.is_empty() {
            return Err(dirty_error(initial));
        }

        if !initial.pending.is_empty() {
            // A pending entry means either a crashed attempt or a migrator
            // holding the advisory lock right now; probing the lock tells
            // the two apart.
            if !context.store.try_lock()? {
                return Err(MigrationError::MigrationContention);
            }
            return release_lock(&context.store, Err(dirty_error(initial)));
        }
    }

    context.store.lock()?;
    release_lock(
        &context.store,
        run_schema_locked(operation, context, upgrading_to_latest),
    )
}

fn run_schema_locked(
    operation: &MigrationOperation,
    context: &SchemaContext,
    upgrading_to_latest: bool,
) -> Result<(), MigrationError> {
    // The under-lock snapshot is authoritative for planning.
    let version = context.store.versions()?;

    if !upgrading_to_latest && version != context.initial_version {
        return Err(MigrationError::MigrationContention);
    }
    if version.is_dirty() {
        return Err(dirty_error(&version));
    }

    let definitions = &context.schema.definitions;
    match normalize_operation(operation, definitions, &version)? {
        NormalizedOperation::Up(targets) => run_schema_up(context, &version, &targets),
        NormalizedOperation::Down(targets) => run_schema_down(context, &version, &targets),
        NormalizedOperation::Revert(id) => {
            let definition = definitions
                .get_by_id(id)
                .ok_or(MigrationError::UnknownMigration { id, referenced_from: None })?;

            log::info!("Reverting last applied migration {id} on schema {}", context.schema.name);
            execute_down(context, std::slice::from_ref(definition))
        }
    }
}

fn run_schema_up(
    context: &SchemaContext,
    version: &SchemaVersion,
    targets: &[i64],
) -> Result<(), MigrationError> {
    log::info!("Upgrading schema {}", context.schema.name);

    let plan = context.schema.definitions.up(&version.applied, targets)?;
    for definition in &plan {
        log::info!("Running up migration {} on schema {}", definition.id, context.schema.name);

        context
            .store
            .up(definition)
            .map_err(|e| MigrationError::MigrationFailed {
                id: definition.id,
                up: true,
                cause: Box::new(e),
            })?;
    }

    Ok(())
}

fn run_schema_down(
    context: &SchemaContext,
    version: &SchemaVersion,
    targets: &[i64],
) -> Result<(), MigrationError> {
    log::info!("Downgrading schema {}", context.schema.name);

    let plan = context.schema.definitions.down(&version.applied, targets)?;
    execute_down(context, &plan)
}

fn execute_down(context: &SchemaContext, plan: &[Definition]) -> Result<(), MigrationError> {
    for definition in plan {
        log::info!("Running down migration {} on schema {}", definition.id, context.schema.name);

        context
            .store
            .down(definition)
            .map_err(|e| MigrationError::MigrationFailed {
                id: definition.id,
                up: false,
                cause: Box::new(e),
            })?;
    }

    Ok(())
}

fn dirty_error(version: &SchemaVersion) -> MigrationError {
    MigrationError::DirtyDatabase {
        pending: version.pending.clone(),
        failed: version.failed.clone(),
    }
}

fn normalize_operation(
    operation: &MigrationOperation,
    definitions: &Definitions,
    version: &SchemaVersion,
) -> Result<NormalizedOperation, MigrationError> {
    match operation.operation_type {
        MigrationOperationType::TargetedUp => {
            Ok(NormalizedOperation::Up(operation.target_versions.clone()))
        }
        MigrationOperationType::TargetedDown => {
            Ok(NormalizedOperation::Down(operation.target_versions.clone()))
        }
        MigrationOperationType::TargetedUpgrade => Ok(NormalizedOperation::Up(
            definitions.leaves().iter().map(|d| d.id).collect(),
        )),
        MigrationOperationType::TargetedRevert => {
            Ok(NormalizedOperation::Revert(last_applied(definitions, &version.applied)?))
        }
    }
}

/// The unique applied migration with no applied descendant. Anything else —
/// zero applied migrations, or several branch tips applied — makes the revert
/// ambiguous and requires an explicit `TargetedDown`.
fn last_applied(definitions: &Definitions, applied: &[i64]) -> Result<i64, MigrationError> {
    let mut applied_child_counts: HashMap<i64, usize> =
        applied.iter().map(|id| (*id, 0)).collect();

    for id in applied {
        let definition = definitions
            .get_by_id(*id)
            .ok_or(MigrationError::UnknownMigration { id: *id, referenced_from: None })?;

        for parent in &definition.metadata.parents {
            if let Some(count) = applied_child_counts.get_mut(parent) {
                *count += 1;
            }
        }
    }

    let tips: Vec<i64> = applied_child_counts
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| *id)
        .collect();

    match tips.as_slice() {
        [tip] => Ok(*tip),
        _ => Err(MigrationError::AmbiguousRevert),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::Definitions;
    use crate::runner::testing::{applied, chain_schema, definition, MockStore};
    use crate::schemas::Schema;
    use crate::store::SchemaVersion;
    use std::sync::Arc;

    fn operation(schema: &str, operation_type: MigrationOperationType, targets: &[i64]) -> MigrationOperation {
        MigrationOperation {
            schema_name: schema.to_string(),
            operation_type,
            target_versions: targets.to_vec(),
        }
    }

    fn run_single(
        schema: Schema,
        store: Arc<MockStore>,
        operation: MigrationOperation,
    ) -> Result<(), MigrationError> {
        let mut runner = Runner::new();
        runner.register(schema, store);
        runner.run(Options { operations: vec![operation], parallel: false })
    }

    fn unwrap_schema_failure(err: MigrationError) -> MigrationError {
        match err {
            MigrationError::SchemaFailed { cause, .. } => *cause,
            other => panic!("expected SchemaFailed wrapper, got {other:?}"),
        }
    }

    #[test]
    fn test_upgrade_applies_whole_chain() {
        let store = MockStore::new(SchemaVersion::default());
        let result = run_single(
            chain_schema("frontend", &[1, 2, 3]),
            store.clone(),
            operation("frontend", MigrationOperationType::TargetedUpgrade, &[]),
        );

        assert!(result.is_ok(), "unexpected error: {result:?}");
        assert_eq!(store.up_calls(), vec![1, 2, 3]);
        assert_eq!(store.applied(), vec![1, 2, 3]);
    }

    #[test]
    fn test_upgrade_reaches_every_leaf() {
        let definitions = Definitions::build(vec![
            definition(1, &[]),
            definition(2, &[1]),
            definition(3, &[2]),
            definition(4, &[2]),
        ])
        .unwrap();
        let schema = Schema::new("frontend", "schema_migrations", definitions);
        let store = MockStore::new(SchemaVersion::default());

        run_single(
            schema,
            store.clone(),
            operation("frontend", MigrationOperationType::TargetedUpgrade, &[]),
        )
        .unwrap();

        assert_eq!(store.up_calls(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_targeted_up_skips_applied_prefix() {
        let store = MockStore::new(applied(&[1]));
        run_single(
            chain_schema("frontend", &[1, 2, 3]),
            store.clone(),
            operation("frontend", MigrationOperationType::TargetedUp, &[3]),
        )
        .unwrap();

        assert_eq!(store.up_calls(), vec![2, 3]);
    }

    #[test]
    fn test_targeted_up_noop_when_target_applied() {
        let store = MockStore::new(applied(&[1, 2, 3]));
        run_single(
            chain_schema("frontend", &[1, 2, 3]),
            store.clone(),
            operation("frontend", MigrationOperationType::TargetedUp, &[3]),
        )
        .unwrap();

        assert!(store.up_calls().is_empty());
    }

    #[test]
    fn test_failed_version_blocks_targeted_operation() {
        let store = MockStore::new(SchemaVersion { failed: vec![2], ..Default::default() });
        let err = run_single(
            chain_schema("frontend", &[1, 2, 3]),
            store,
            operation("frontend", MigrationOperationType::TargetedUp, &[3]),
        )
        .unwrap_err();

        match unwrap_schema_failure(err) {
            MigrationError::DirtyDatabase { failed, .. } => assert_eq!(failed, vec![2]),
            other => panic!("expected dirty database error, got {other:?}"),
        }
    }

    #[test]
    fn test_pending_version_with_held_lock_is_contention() {
        let store = MockStore::new(SchemaVersion { pending: vec![2], ..Default::default() });
        store.hold_lock_elsewhere();

        let err = run_single(
            chain_schema("frontend", &[1, 2, 3]),
            store,
            operation("frontend", MigrationOperationType::TargetedUp, &[3]),
        )
        .unwrap_err();

        match unwrap_schema_failure(err) {
            MigrationError::MigrationContention => {}
            other => panic!("expected contention error, got {other:?}"),
        }
    }

    #[test]
    fn test_pending_version_without_live_migrator_is_dirty() {
        let store = MockStore::new(SchemaVersion { pending: vec![2], ..Default::default() });
        let err = run_single(
            chain_schema("frontend", &[1, 2, 3]),
            store,
            operation("frontend", MigrationOperationType::TargetedUp, &[3]),
        )
        .unwrap_err();

        match unwrap_schema_failure(err) {
            MigrationError::DirtyDatabase { pending, .. } => assert_eq!(pending, vec![2]),
            other => panic!("expected dirty database error, got {other:?}"),
        }
    }

    #[test]
    fn test_version_change_under_lock_is_contention() {
        // Another migrator applies 2 between our snapshot and our lock.
        let store = MockStore::with_queued(vec![applied(&[1])], applied(&[1, 2]));
        let err = run_single(
            chain_schema("frontend", &[1, 2, 3]),
            store,
            operation("frontend", MigrationOperationType::TargetedUp, &[3]),
        )
        .unwrap_err();

        match unwrap_schema_failure(err) {
            MigrationError::MigrationContention => {}
            other => panic!("expected contention error, got {other:?}"),
        }
    }

    #[test]
    fn test_upgrade_tolerates_version_change_under_lock() {
        let store = MockStore::with_queued(vec![applied(&[1])], applied(&[1, 2]));
        run_single(
            chain_schema("frontend", &[1, 2, 3]),
            store.clone(),
            operation("frontend", MigrationOperationType::TargetedUpgrade, &[]),
        )
        .unwrap();

        // Plans from the authoritative under-lock snapshot: only 3 remains.
        assert_eq!(store.up_calls(), vec![3]);
    }

    #[test]
    fn test_upgrade_still_refuses_dirty_state_under_lock() {
        let store = MockStore::new(SchemaVersion {
            applied: vec![1],
            pending: vec![2],
            ..Default::default()
        });
        let err = run_single(
            chain_schema("frontend", &[1, 2, 3]),
            store,
            operation("frontend", MigrationOperationType::TargetedUpgrade, &[]),
        )
        .unwrap_err();

        match unwrap_schema_failure(err) {
            MigrationError::DirtyDatabase { pending, .. } => assert_eq!(pending, vec![2]),
            other => panic!("expected dirty database error, got {other:?}"),
        }
    }

    #[test]
    fn test_targeted_down_reverts_descendants() {
        let store = MockStore::new(applied(&[1, 2, 3]));
        run_single(
            chain_schema("frontend", &[1, 2, 3]),
            store.clone(),
            operation("frontend", MigrationOperationType::TargetedDown, &[1]),
        )
        .unwrap();

        assert_eq!(store.down_calls(), vec![3, 2]);
        assert_eq!(store.applied(), vec![1]);
    }

    #[test]
    fn test_revert_undoes_exactly_the_last_applied() {
        let store = MockStore::new(applied(&[1, 2, 3]));
        run_single(
            chain_schema("frontend", &[1, 2, 3]),
            store.clone(),
            operation("frontend", MigrationOperationType::TargetedRevert, &[]),
        )
        .unwrap();

        assert_eq!(store.down_calls(), vec![3]);
        assert_eq!(store.applied(), vec![1, 2]);
    }

    #[test]
    fn test_revert_of_sole_root_migration() {
        let store = MockStore::new(applied(&[1]));
        run_single(
            chain_schema("frontend", &[1]),
            store.clone(),
            operation("frontend", MigrationOperationType::TargetedRevert, &[]),
        )
        .unwrap();

        assert_eq!(store.down_calls(), vec![1]);
        assert!(store.applied().is_empty());
    }

    #[test]
    fn test_revert_with_two_applied_tips_is_ambiguous() {
        let definitions = Definitions::build(vec![
            definition(1, &[]),
            definition(2, &[1]),
            definition(3, &[1]),
        ])
        .unwrap();
        let schema = Schema::new("frontend", "schema_migrations", definitions);
        let store = MockStore::new(applied(&[1, 2, 3]));

        let err = run_single(
            schema,
            store,
            operation("frontend", MigrationOperationType::TargetedRevert, &[]),
        )
        .unwrap_err();

        match unwrap_schema_failure(err) {
            MigrationError::AmbiguousRevert => {}
            other => panic!("expected ambiguous revert error, got {other:?}"),
        }
    }

    #[test]
    fn test_revert_with_nothing_applied_is_ambiguous() {
        let store = MockStore::new(SchemaVersion::default());
        let err = run_single(
            chain_schema("frontend", &[1, 2]),
            store,
            operation("frontend", MigrationOperationType::TargetedRevert, &[]),
        )
        .unwrap_err();

        match unwrap_schema_failure(err) {
            MigrationError::AmbiguousRevert => {}
            other => panic!("expected ambiguous revert error, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_operations_rejected() {
        let mut runner = Runner::new();
        runner.register(
            chain_schema("frontend", &[1]),
            MockStore::new(SchemaVersion::default()),
        );

        let err = runner
            .run(Options {
                operations: vec![
                    operation("frontend", MigrationOperationType::TargetedUpgrade, &[]),
                    operation("frontend", MigrationOperationType::TargetedRevert, &[]),
                ],
                parallel: false,
            })
            .unwrap_err();

        match err {
            MigrationError::DuplicateOperations => {}
            other => panic!("expected duplicate operations error, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_schema_rejected() {
        let runner = Runner::new();
        let err = runner
            .run(Options {
                operations: vec![operation("nope", MigrationOperationType::TargetedUpgrade, &[])],
                parallel: false,
            })
            .unwrap_err();

        match err {
            MigrationError::UnknownSchema(name) => assert_eq!(name, "nope"),
            other => panic!("expected unknown schema error, got {other:?}"),
        }
    }

    #[test]
    fn test_failed_migration_reported_with_id() {
        let store = MockStore::new(SchemaVersion::default());
        store.fail_up_at(2);

        let err = run_single(
            chain_schema("frontend", &[1, 2, 3]),
            store.clone(),
            operation("frontend", MigrationOperationType::TargetedUpgrade, &[]),
        )
        .unwrap_err();

        match unwrap_schema_failure(err) {
            MigrationError::MigrationFailed { id: 2, up: true, .. } => {}
            other => panic!("expected migration failure, got {other:?}"),
        }

        // Execution stops at the failure; 3 is never attempted.
        assert_eq!(store.up_calls(), vec![1]);
        assert_eq!(store.applied(), vec![1]);
    }

    #[test]
    fn test_parallel_schemas_both_complete() {
        let frontend_store = MockStore::new(SchemaVersion::default());
        let codeintel_store = MockStore::new(SchemaVersion::default());

        let mut runner = Runner::new();
        runner.register(chain_schema("frontend", &[1, 2]), frontend_store.clone());
        runner.register(chain_schema("codeintel", &[10, 11]), codeintel_store.clone());

        runner
            .run(Options {
                operations: vec![
                    operation("frontend", MigrationOperationType::TargetedUpgrade, &[]),
                    operation("codeintel", MigrationOperationType::TargetedUpgrade, &[]),
                ],
                parallel: true,
            })
            .unwrap();

        assert_eq!(frontend_store.up_calls(), vec![1, 2]);
        assert_eq!(codeintel_store.up_calls(), vec![10, 11]);
    }
}
