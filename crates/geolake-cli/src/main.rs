//! Command-line interface for `geolake`, moving spatial tables from PostGIS into an S3 data lake.
//!
//! This binary provides a thin CLI over the [`geolake_core`] library: it loads the
//! configuration from the environment, configures logging and runs one table through
//! extraction, validation, transformation, loading and verification.
//!
//! # Architecture
//!
//! The CLI is built using [`clap`] for argument parsing and [`tracing`] for structured logging.
//! Command handlers return [`anyhow::Result`]; library errors keep their
//! [`MigrationError`] type so that the user message and recovery hint can be printed.
//!
//! # Available Commands
//!
//! - `migrate` - Migrate one table to Parquet on S3 and register it in the catalog
//! - `validate` - Extract a table and report geometry problems without loading it
//! - `verify` - Reconcile the row count of an already loaded table
//! - `config` - Print the effective configuration

mod display;

use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};
use tracing_log::LogTracer;
use tracing_subscriber::FmtSubscriber;

use geolake_core::config::Config;
use geolake_core::error::MigrationError;
use geolake_core::extractor::{PostgisExtractor, Predicate, SourceFilter};
use geolake_core::operations::{
    MigrationOptions, SpatialMigration, load_sdk_config, query_runner, validate_table,
};
use geolake_core::utils::catalog_table_name;
use geolake_core::validator::Validator;
use geolake_core::verify::{VerificationCheck, Verifier};

#[derive(Parser)]
#[command(
    name = "geolake",
    version,
    about = "Move PostGIS tables into an S3 data lake",
    long_about = "geolake extracts a PostGIS table, validates its geometries, writes it as Parquet\n\
                  to S3 and registers it as an external table queryable through Athena."
)]
/// Command-line arguments and options for the `geolake` CLI.
///
/// Connection settings come from the environment (and an optional `.env` file);
/// the flags here only select what to run and how verbose to be.
struct Cli {
    /// Enable verbose (INFO level) logging output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug (DEBUG level) logging output with detailed diagnostics.
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available subcommands for the `geolake` CLI.
#[derive(Subcommand)]
enum Commands {
    /// Migrates one table to the data lake.
    ///
    /// The table is read from PostGIS, validated, written as a single Parquet
    /// object and registered in the catalog. Row counts are reconciled
    /// through Athena afterwards.
    Migrate {
        /// Source table, optionally schema-qualified (e.g. "gis.parks").
        #[arg(value_name = "TABLE")]
        table: String,

        /// Catalog table name; defaults to the lowercased source table name.
        #[arg(long, value_name = "NAME")]
        target_table: Option<String>,

        /// Drop rows repeating this key column (the first row wins).
        #[arg(long, value_name = "COLUMN")]
        dedup_key: Option<String>,

        /// Only migrate rows matching COLUMN<op>VALUE; may be repeated.
        #[arg(long = "filter", value_name = "PREDICATE")]
        filters: Vec<Predicate>,

        /// Stop before upload when validation reports errors.
        #[arg(long)]
        strict: bool,

        /// Repair invalid polygonal geometries before validation.
        ///
        /// Geometries with a Z ordinate are left as they are.
        #[arg(long)]
        repair: bool,

        /// Skip geometry validation.
        #[arg(long, conflicts_with = "strict")]
        no_validate: bool,

        /// Skip row-count verification after the load.
        #[arg(long)]
        no_verify: bool,

        /// Warn before extracting when the catalog table already exists.
        #[arg(long)]
        check_exists: bool,
    },

    /// Validates the geometries of a table without loading it.
    Validate {
        /// Source table, optionally schema-qualified.
        #[arg(value_name = "TABLE")]
        table: String,

        /// Only validate rows matching COLUMN<op>VALUE; may be repeated.
        #[arg(long = "filter", value_name = "PREDICATE")]
        filters: Vec<Predicate>,
    },

    /// Reconciles the row count of a loaded table through Athena.
    Verify {
        /// Catalog table name.
        #[arg(value_name = "TABLE")]
        table: String,

        /// Number of rows the table should contain.
        #[arg(long, value_name = "ROWS")]
        expected: u64,

        /// Also count distinct values of this column.
        #[arg(long, value_name = "COLUMN")]
        key_column: Option<String>,

        /// Column holding the WKT geometry.
        #[arg(long, value_name = "COLUMN", default_value = "geom")]
        wkt_column: String,
    },

    /// Prints the effective configuration with secrets masked.
    Config,
}

/// Entry point for the `geolake` command-line interface.
///
/// Exits with status 0 when the command succeeded and 1 otherwise.
///
/// # Errors
///
/// Returns an error if the logging system cannot be initialized.
#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let log_level = if cli.debug {
        Level::DEBUG
    } else if cli.verbose {
        Level::INFO
    } else {
        Level::WARN
    };

    // Bridge logs from the `log` crate to the `tracing` ecosystem.
    LogTracer::init()?;

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling; press Ctrl-C again to exit immediately");
                cancel.cancel();
            }
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        }
    });

    match dispatch(cli.command, cancel).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            report_error(&e);
            Ok(ExitCode::FAILURE)
        },
    }
}

async fn dispatch(command: Commands, cancel: CancellationToken) -> Result<()> {
    let config = Config::from_env().map_err(MigrationError::from)?;

    match command {
        Commands::Migrate {
            table,
            target_table,
            dedup_key,
            filters,
            strict,
            repair,
            no_validate,
            no_verify,
            check_exists,
        } => {
            info!("Migrating {table}");
            let options = MigrationOptions::default()
                .with_validation(!no_validate)
                .with_strict_validation(strict)
                .with_repair(repair)
                .with_verification(!no_verify)
                .with_existence_check(check_exists);
            let options = apply_optional(options, target_table, dedup_key, filters);
            handle_migrate(&config, &table, &options, cancel).await
        },
        Commands::Validate { table, filters } => {
            info!("Validating {table}");
            handle_validate(&config, &table, source_filter(filters).as_ref()).await
        },
        Commands::Verify {
            table,
            expected,
            key_column,
            wkt_column,
        } => {
            let check = VerificationCheck {
                table: catalog_table_name(&table),
                key_column,
                wkt_column,
                sentinel: config.geometry.sentinel(),
                expected_rows: expected,
            };
            handle_verify(&config, &check, cancel).await
        },
        Commands::Config => {
            display::display_config(&config);
            Ok(())
        },
    }
}

fn apply_optional(
    mut options: MigrationOptions,
    target_table: Option<String>,
    dedup_key: Option<String>,
    filters: Vec<Predicate>,
) -> MigrationOptions {
    if let Some(name) = target_table {
        options = options.with_target_table(name);
    }
    if let Some(key) = dedup_key {
        options = options.with_dedup_key(key);
    }
    if let Some(filter) = source_filter(filters) {
        options = options.with_filter(filter);
    }
    options
}

fn source_filter(predicates: Vec<Predicate>) -> Option<SourceFilter> {
    if predicates.is_empty() {
        return None;
    }
    Some(
        predicates
            .into_iter()
            .fold(SourceFilter::new(), SourceFilter::with_predicate),
    )
}

async fn handle_migrate(
    config: &Config,
    table: &str,
    options: &MigrationOptions,
    cancel: CancellationToken,
) -> Result<()> {
    let migration = SpatialMigration::from_config(config, cancel).await?;

    // Queries stop their remote execution when the token fires.
    let summary = migration.execute(table, options).await?;

    display::display_summary(&summary);
    Ok(())
}

async fn handle_validate(config: &Config, table: &str, filter: Option<&SourceFilter>) -> Result<()> {
    let extractor = PostgisExtractor::new(config.source.clone());
    let validator = Validator::new(config.source.required_srid);

    let result = validate_table(&extractor, table, filter, &validator).await;
    extractor.close().await;
    let report = result?;

    display::display_validation(table, &report);
    report.into_result().map_err(MigrationError::from)?;
    Ok(())
}

async fn handle_verify(
    config: &Config,
    check: &VerificationCheck,
    cancel: CancellationToken,
) -> Result<()> {
    let sdk = load_sdk_config(&config.sink).await;
    let verifier = Verifier::new(query_runner(&sdk, &config.sink, cancel));

    let report = verifier.verify(check).await.map_err(MigrationError::from)?;
    display::display_verification(&report);
    report.ensure_matches().map_err(MigrationError::from)?;
    Ok(())
}

/// Prints an error with its recovery hint, if the library provides one.
fn report_error(error: &anyhow::Error) {
    match error.downcast_ref::<MigrationError>() {
        Some(e) => {
            eprintln!("Error: {}", e.user_message());
            if let Some(hint) = e.recovery_suggestion() {
                eprintln!("Hint: {hint}");
            }
        },
        None => eprintln!("Error: {error:#}"),
    }
}
