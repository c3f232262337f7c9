//! Migration orchestration.
//!
//! [`SpatialMigration`] runs one table through extract, quality checks,
//! validation, transform, load and verification, strictly in that order.
//! Each run gets its own `migration` tracing span; every stage runs inside
//! it, so all log lines of a run carry the table and run id.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use aws_config::{BehaviorVersion, Region, SdkConfig};
use chrono::{DateTime, Utc};
use object_store::aws::AmazonS3Builder;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::catalog::{AthenaDdlCatalog, CatalogClient, GlueCatalog};
use crate::config::{CatalogBackend, Config, SinkConfig};
use crate::error::{ConfigError, Result};
use crate::extractor::{PostgisExtractor, RowSource, SourceFilter};
use crate::geometry::repair_invalid;
use crate::loader::{DataLakeLoader, LoadReceipt};
use crate::quality::{DuplicateKeys, deduplicate, duplicate_keys};
use crate::query::{AthenaQueryService, QueryRunner, WaitOptions};
use crate::transformer::{SpatialTransformer, TransformOptions};
use crate::types::{MigrationTarget, TableSchema};
use crate::utils::catalog_table_name;
use crate::validator::{ValidationReport, Validator};
use crate::verify::{VerificationCheck, VerificationReport, Verifier};

/// Where a migration run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MigrationState {
    /// Not started
    #[default]
    Idle,
    /// Reading from the source
    Extracting,
    /// Checking geometries
    Validating,
    /// Building the Parquet buffer
    Transforming,
    /// Uploading and registering
    Loading,
    /// Reconciling row counts
    Verifying,
    /// Finished successfully
    Succeeded,
    /// Stopped by an error
    Failed,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Extracting => "extracting",
            Self::Validating => "validating",
            Self::Transforming => "transforming",
            Self::Loading => "loading",
            Self::Verifying => "verifying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Per-run options.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationOptions {
    /// Run the validator
    pub validate: bool,
    /// Fail the run when validation reports errors
    pub strict_validation: bool,
    /// Repair invalid polygonal geometries before validation
    pub repair_invalid: bool,
    /// Report and drop rows repeating this key (first row wins)
    pub dedup_key: Option<String>,
    /// Row selection at the source
    pub filter: Option<SourceFilter>,
    /// Catalog table name; derived from the source table when `None`
    pub target_table: Option<String>,
    /// Reconcile row counts after the load when a verifier is configured
    pub verify: bool,
    /// Ask the catalog whether the target table exists before extracting
    pub check_existing: bool,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            validate: true,
            strict_validation: false,
            repair_invalid: false,
            dedup_key: None,
            filter: None,
            target_table: None,
            verify: true,
            check_existing: false,
        }
    }
}

impl MigrationOptions {
    /// Enable or disable validation.
    #[must_use]
    pub fn with_validation(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    /// Fail on validation errors.
    #[must_use]
    pub fn with_strict_validation(mut self, strict: bool) -> Self {
        self.strict_validation = strict;
        self
    }

    /// Repair invalid geometries.
    #[must_use]
    pub fn with_repair(mut self, repair: bool) -> Self {
        self.repair_invalid = repair;
        self
    }

    /// Deduplicate on `key`.
    #[must_use]
    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    /// Restrict the extracted rows.
    #[must_use]
    pub fn with_filter(mut self, filter: SourceFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Override the catalog table name.
    #[must_use]
    pub fn with_target_table(mut self, table: impl Into<String>) -> Self {
        self.target_table = Some(table.into());
        self
    }

    /// Enable or disable post-load verification.
    #[must_use]
    pub fn with_verification(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Check for an existing target table before extracting.
    #[must_use]
    pub fn with_existence_check(mut self, check: bool) -> Self {
        self.check_existing = check;
        self
    }
}

/// Everything a successful run produced.
#[derive(Debug, Clone)]
pub struct MigrationSummary {
    /// Table read from the source
    pub source_table: String,
    /// Where the data went
    pub target: MigrationTarget,
    /// Whether the target table was registered before the run, when checked
    pub table_existed: Option<bool>,
    /// Rows returned by the source
    pub rows_extracted: usize,
    /// Rows written to the Parquet object
    pub rows_loaded: usize,
    /// Duplicate statistics, when deduplication was requested
    pub duplicates: Option<DuplicateKeys>,
    /// Rows dropped by deduplication
    pub duplicates_removed: usize,
    /// Geometries replaced by repair
    pub repaired: usize,
    /// Validation report, when validation ran
    pub validation: Option<ValidationReport>,
    /// Schema registered in the catalog
    pub schema: TableSchema,
    /// Upload and registration outcome
    pub load: LoadReceipt,
    /// Reconciliation report, when verification ran
    pub verification: Option<VerificationReport>,
    /// Start of the run
    pub started_at: DateTime<Utc>,
    /// End of the run
    pub finished_at: DateTime<Utc>,
}

/// Runs migrations of single tables.
pub struct SpatialMigration {
    source: Arc<dyn RowSource>,
    loader: DataLakeLoader,
    sink: SinkConfig,
    validator: Validator,
    transformer: SpatialTransformer,
    verifier: Option<Verifier>,
    state: Mutex<MigrationState>,
}

impl SpatialMigration {
    /// Creates an orchestrator from its parts.
    ///
    /// The validator requires the configured SRID and the transformer uses
    /// the configured empty geometry policy. No verifier is attached.
    pub fn new(source: Arc<dyn RowSource>, loader: DataLakeLoader, config: &Config) -> Self {
        Self {
            source,
            loader,
            sink: config.sink.clone(),
            validator: Validator::new(config.source.required_srid),
            transformer: SpatialTransformer::new(
                TransformOptions::default().with_empty_geometry(config.geometry),
            ),
            verifier: None,
            state: Mutex::new(MigrationState::Idle),
        }
    }

    /// Attach a verifier for post-load reconciliation.
    #[must_use]
    pub fn with_verifier(mut self, verifier: Verifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Replace the transformer.
    #[must_use]
    pub fn with_transformer(mut self, transformer: SpatialTransformer) -> Self {
        self.transformer = transformer;
        self
    }

    /// Builds the production wiring: PostGIS source, S3 store, Glue or
    /// Athena DDL catalog and an Athena verifier.
    ///
    /// Nothing is contacted yet; the database pool is opened on first use.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOption`] when the object store cannot
    /// be configured.
    pub async fn from_config(config: &Config, cancel: CancellationToken) -> Result<Self> {
        let sdk = load_sdk_config(&config.sink).await;
        let store = AmazonS3Builder::from_env()
            .with_region(&config.sink.region)
            .with_bucket_name(&config.sink.bucket)
            .build()
            .map_err(|e| ConfigError::InvalidOption {
                option: "S3_BUCKET".to_string(),
                message: e.to_string(),
            })?;
        let runner = query_runner(&sdk, &config.sink, cancel);
        let catalog: Arc<dyn CatalogClient> = match config.sink.catalog_backend {
            CatalogBackend::Glue => Arc::new(GlueCatalog::new(aws_sdk_glue::Client::new(&sdk))),
            CatalogBackend::Athena => Arc::new(AthenaDdlCatalog::new(runner.clone())),
        };
        let loader = DataLakeLoader::new(Arc::new(store), catalog, config.sink.clone());
        let source = Arc::new(PostgisExtractor::new(config.source.clone()));

        Ok(Self::new(source, loader, config).with_verifier(Verifier::new(runner)))
    }

    /// State of the most recent run.
    pub fn state(&self) -> MigrationState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: MigrationState) {
        debug!(state = %state, "migration state");
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Migrates `table` and reports success as a boolean.
    ///
    /// Errors are logged, never returned.
    pub async fn run(&self, table: &str, options: &MigrationOptions) -> bool {
        match self.execute(table, options).await {
            Ok(_) => true,
            Err(e) => {
                error!(table, stage = e.stage(), error = %e, "migration failed");
                false
            },
        }
    }

    /// Migrates `table`.
    ///
    /// # Errors
    ///
    /// Returns the [`MigrationError`](crate::error::MigrationError) of the
    /// first stage that failed. A failure after the upload does not remove
    /// data already written, except for the loader's orphan cleanup.
    pub async fn execute(&self, table: &str, options: &MigrationOptions) -> Result<MigrationSummary> {
        let started_at = Utc::now();
        let table_name = options
            .target_table
            .clone()
            .unwrap_or_else(|| catalog_table_name(table));
        let target = MigrationTarget::new(&self.sink, table_name, started_at);
        let span = info_span!("migration", table, run = %target.run_id());

        let result = self
            .run_stages(table, target, options, started_at)
            .instrument(span)
            .await;
        self.set_state(if result.is_ok() {
            MigrationState::Succeeded
        } else {
            MigrationState::Failed
        });
        result
    }

    async fn run_stages(
        &self,
        table: &str,
        target: MigrationTarget,
        options: &MigrationOptions,
        started_at: DateTime<Utc>,
    ) -> Result<MigrationSummary> {
        info!(target = %target.location(), "starting migration");

        let table_existed = match (&self.verifier, options.check_existing) {
            (Some(verifier), true) => {
                let exists = verifier.table_exists(&target.table_name).await?;
                if exists {
                    warn!(
                        table = %target.table_name,
                        "table already registered, its definition will not be updated"
                    );
                }
                Some(exists)
            },
            _ => None,
        };

        self.set_state(MigrationState::Extracting);
        let mut rows = self.source.extract(table, options.filter.as_ref()).await?;
        let rows_extracted = rows.len();

        let mut duplicates = None;
        let mut duplicates_removed = 0;
        if let Some(key) = &options.dedup_key {
            let stats = duplicate_keys(&rows, key)?;
            if stats.has_duplicates() {
                warn!(key = %key, duplicated = stats.duplicated, "found duplicate keys");
            }
            duplicates_removed = deduplicate(&mut rows, key)?;
            duplicates = Some(stats);
        }

        let repaired = if options.repair_invalid {
            repair_invalid(&mut rows)
        } else {
            0
        };

        let validation = if options.validate {
            self.set_state(MigrationState::Validating);
            let report = self.validator.validate(&rows);
            for warning in &report.warnings {
                warn!("{warning}");
            }
            for problem in &report.errors {
                warn!("{problem}");
            }
            if options.strict_validation {
                Some(report.into_result()?)
            } else {
                Some(report)
            }
        } else {
            None
        };

        self.set_state(MigrationState::Transforming);
        let batch = self.transformer.to_record_batch(&rows)?;
        let schema = TableSchema::from_arrow(&batch.schema());
        let buffer = self.transformer.write_parquet(&batch)?;
        info!(rows = rows.len(), bytes = buffer.len(), "transformed rows");

        self.set_state(MigrationState::Loading);
        let load = self.loader.load_into(&target, buffer, &schema).await?;

        let verification = match (&self.verifier, options.verify) {
            (Some(verifier), true) => {
                self.set_state(MigrationState::Verifying);
                let check = VerificationCheck {
                    table: target.table_name.clone(),
                    key_column: options.dedup_key.clone(),
                    wkt_column: self.transformer.wkt_column(&rows).to_string(),
                    sentinel: self.transformer.sentinel(),
                    expected_rows: rows.len() as u64,
                };
                Some(verifier.verify(&check).await?.ensure_matches()?)
            },
            _ => None,
        };

        info!(rows = rows.len(), key = %load.key, "migration completed");
        Ok(MigrationSummary {
            source_table: table.to_string(),
            target,
            table_existed,
            rows_extracted,
            rows_loaded: rows.len(),
            duplicates,
            duplicates_removed,
            repaired,
            validation,
            schema,
            load,
            verification,
            started_at,
            finished_at: Utc::now(),
        })
    }
}

/// Extracts `table` and validates it without loading anything.
///
/// # Errors
///
/// Returns the extraction error when the table cannot be read.
pub async fn validate_table(
    source: &dyn RowSource,
    table: &str,
    filter: Option<&SourceFilter>,
    validator: &Validator,
) -> Result<ValidationReport> {
    let rows = source.extract(table, filter).await?;
    Ok(validator.validate(&rows))
}

/// Loads AWS settings for the configured region.
pub async fn load_sdk_config(sink: &SinkConfig) -> SdkConfig {
    aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(sink.region.clone()))
        .load()
        .await
}

/// Athena-backed query runner for the catalog database.
#[must_use]
pub fn query_runner(sdk: &SdkConfig, sink: &SinkConfig, cancel: CancellationToken) -> QueryRunner {
    let service = Arc::new(AthenaQueryService::new(aws_sdk_athena::Client::new(sdk)));
    QueryRunner::new(service, &sink.catalog_database, sink.query_output_location())
        .with_wait(WaitOptions::from_config(sink))
        .with_cancellation(cancel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = MigrationOptions::default();
        assert!(options.validate);
        assert!(options.verify);
        assert!(!options.strict_validation);
        assert!(!options.repair_invalid);
        assert!(options.dedup_key.is_none());
        assert!(!options.check_existing);
    }

    #[test]
    fn test_option_builders() {
        let options = MigrationOptions::default()
            .with_strict_validation(true)
            .with_dedup_key("id")
            .with_target_table("parks")
            .with_verification(false);
        assert!(options.strict_validation);
        assert_eq!(options.dedup_key.as_deref(), Some("id"));
        assert_eq!(options.target_table.as_deref(), Some("parks"));
        assert!(!options.verify);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(MigrationState::Extracting.to_string(), "extracting");
        assert_eq!(MigrationState::default(), MigrationState::Idle);
    }
}
