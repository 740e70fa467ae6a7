//! Floodgate migration CLI
//!
//! Command-line interface for running and scaffolding schema migrations.
//! Exit code 0 on success, 1 on any error.

mod add;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use floodgate::config::DatabaseConfig;
use floodgate::{
    connect, MayPostgresExecutor, MigrationOperation, MigrationOperationType, Options, Runner,
    Schema, Store, SCHEMA_NAMES,
};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "floodgate")]
#[command(about = "Schema migration tool for PostgreSQL")]
#[command(version)]
struct Cli {
    /// Database connection URL
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Migrations directory (one subdirectory per schema)
    #[arg(long, global = true, default_value = "migrations")]
    migrations_dir: PathBuf,

    /// Run multi-schema operations concurrently
    #[arg(long, global = true)]
    parallel: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet output (errors only)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply all migrations up to the current leaves
    Up {
        /// The schema(s) to migrate; "all" expands to every registered schema
        #[arg(long, default_value = "all")]
        db: String,
    },

    /// Ensure the given migrations have been applied, applying dependencies
    /// as needed
    Upto {
        /// The schema to migrate
        #[arg(long)]
        db: String,

        /// Migration identifiers to reach (comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        target: Vec<i64>,
    },

    /// Revert the last applied migration
    Undo {
        /// The schema to migrate
        #[arg(long)]
        db: String,
    },

    /// Revert all applied migrations that are children of the given targets
    Downto {
        /// The schema to migrate
        #[arg(long)]
        db: String,

        /// Migration identifiers to keep as the new floor (comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        target: Vec<i64>,
    },

    /// Check that the named schemas are up to date
    Validate {
        /// The schema(s) to check; "all" expands to every registered schema
        #[arg(long, default_value = "all")]
        db: String,
    },

    /// Scaffold a new migration for a schema
    Add {
        /// The schema to add a migration to
        #[arg(long)]
        db: String,

        /// Human-readable migration name
        name: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    if let Err(err) = run(cli) {
        log::error!("{err:#}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Up { ref db } => {
            let operations = expand_schemas(db)
                .into_iter()
                .map(|schema_name| MigrationOperation {
                    schema_name,
                    operation_type: MigrationOperationType::TargetedUpgrade,
                    target_versions: vec![],
                })
                .collect();
            run_operations(&cli, operations)
        }
        Commands::Upto { ref db, ref target } => run_operations(
            &cli,
            vec![MigrationOperation {
                schema_name: db.clone(),
                operation_type: MigrationOperationType::TargetedUp,
                target_versions: target.clone(),
            }],
        ),
        Commands::Undo { ref db } => run_operations(
            &cli,
            vec![MigrationOperation {
                schema_name: db.clone(),
                operation_type: MigrationOperationType::TargetedRevert,
                target_versions: vec![],
            }],
        ),
        Commands::Downto { ref db, ref target } => run_operations(
            &cli,
            vec![MigrationOperation {
                schema_name: db.clone(),
                operation_type: MigrationOperationType::TargetedDown,
                target_versions: target.clone(),
            }],
        ),
        Commands::Validate { ref db } => {
            let schema_names = expand_schemas(db);
            let runner = build_runner(&cli, &schema_names)?;
            runner.validate(&schema_names)?;
            log::info!("schemas up to date: {}", schema_names.join(", "));
            Ok(())
        }
        Commands::Add { ref db, ref name } => {
            let scaffolded = add::run_add(&cli.migrations_dir, db, name)?;
            log::info!("created migration {}:", scaffolded.id);
            println!("{}", scaffolded.up_path.display());
            println!("{}", scaffolded.down_path.display());
            println!("{}", scaffolded.metadata_path.display());
            Ok(())
        }
    }
}

fn run_operations(cli: &Cli, operations: Vec<MigrationOperation>) -> Result<()> {
    let schema_names: Vec<String> = operations.iter().map(|o| o.schema_name.clone()).collect();
    let runner = build_runner(cli, &schema_names)?;

    runner.run(Options { operations, parallel: cli.parallel })?;
    log::info!("migrations complete");
    Ok(())
}

/// Expand `all` to the registered schema list; otherwise split on commas.
fn expand_schemas(db: &str) -> Vec<String> {
    if db == "all" {
        SCHEMA_NAMES.iter().map(|s| s.to_string()).collect()
    } else {
        db.split(',').map(|s| s.trim().to_string()).collect()
    }
}

/// Load each schema's graph and give it a store over its own session.
///
/// Every store gets a dedicated connection: advisory locks are
/// session-scoped, so schemas cannot share one.
fn build_runner(cli: &Cli, schema_names: &[String]) -> Result<Runner> {
    let database_url = resolve_database_url(cli)?;

    let mut runner = Runner::new();
    for schema_name in schema_names {
        let schema = Schema::load(schema_name, &cli.migrations_dir)?;
        let client = connect(&database_url)?;
        let store = Store::new(
            Box::new(MayPostgresExecutor::new(client)),
            schema.table_name.clone(),
        );
        runner.register(schema, Arc::new(store));
    }

    Ok(runner)
}

fn resolve_database_url(cli: &Cli) -> Result<String> {
    if let Some(url) = &cli.database_url {
        return Ok(url.clone());
    }
    if let Ok(url) = std::env::var("FLOODGATE_DATABASE_URL") {
        return Ok(url);
    }
    if let Ok(url) = std::env::var("DATABASE_URL") {
        return Ok(url);
    }

    DatabaseConfig::load()
        .map(|config| config.url)
        .map_err(|e| anyhow!("database URL not provided and config loading failed: {e}"))
}
