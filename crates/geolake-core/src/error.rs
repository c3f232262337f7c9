//! Custom error types for `geolake` migrations.
//!
//! Every pipeline stage wraps the errors of the library it drives into its
//! own enum. [`MigrationError`] is the root type the orchestrator returns;
//! it delegates display formatting to the stage error underneath.

use thiserror::Error;

/// Boxed error from a third-party client (SDK, driver, object store).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for `geolake` operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Reading rows from the source database failed
    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    /// Data did not pass validation in strict mode
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Conversion to the columnar buffer failed
    #[error(transparent)]
    Transformation(#[from] TransformationError),

    /// Upload or catalog registration failed
    #[error(transparent)]
    Load(#[from] LoadError),

    /// Post-load reconciliation failed
    #[error(transparent)]
    Verification(#[from] VerificationError),

    /// Configuration errors
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Interactive query service errors
    #[error(transparent)]
    Query(#[from] QueryError),
}

/// Errors raised while extracting a table from the source database.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// Could not connect to the source database
    #[error("Failed to connect to source database: {source}")]
    Connection {
        /// The underlying driver error
        #[source]
        source: BoxError,
    },

    /// The query failed to execute
    #[error("Query against '{table}' failed: {source}")]
    Query {
        /// The source table
        table: String,
        /// The underlying driver error
        #[source]
        source: BoxError,
    },

    /// The table does not exist or has no visible columns
    #[error("Table '{table}' was not found in the source database")]
    TableNotFound {
        /// The requested table
        table: String,
    },

    /// No geometry column could be located
    #[error("Table '{table}' has no geometry column{}", requested.as_ref().map(|c| format!(" named '{c}'")).unwrap_or_default())]
    NoGeometryColumn {
        /// The source table
        table: String,
        /// The configured column name, if any
        requested: Option<String>,
    },

    /// A filter referenced a column the table does not have
    #[error("Filter column '{column}' does not exist in '{table}'")]
    UnknownFilterColumn {
        /// The source table
        table: String,
        /// The offending column
        column: String,
    },

    /// A filter predicate cannot be applied to its column
    #[error("Invalid filter on '{column}': {message}")]
    InvalidFilter {
        /// The filtered column
        column: String,
        /// What was wrong with the predicate
        message: String,
    },

    /// A table or column name is not a plain identifier
    #[error("Invalid identifier '{identifier}'")]
    InvalidIdentifier {
        /// The rejected identifier
        identifier: String,
    },

    /// The query returned no rows
    #[error("No rows found in '{table}'")]
    Empty {
        /// The source table
        table: String,
    },

    /// The coordinate reference system differs from the required one
    #[error("SRID mismatch in '{table}': expected {expected}, found {found}")]
    SridMismatch {
        /// The source table
        table: String,
        /// The required SRID
        expected: i32,
        /// The SRID returned by the database
        found: i32,
    },

    /// A geometry could not be parsed from its WKT form
    #[error("Row {row}: invalid WKT geometry: {message}")]
    Geometry {
        /// Zero-based row index
        row: usize,
        /// Parser message
        message: String,
    },

    /// A record broke the row set invariant
    #[error("Row {row}: {message}")]
    Shape {
        /// Zero-based row index
        row: usize,
        /// What was wrong with the record
        message: String,
    },
}

/// Validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Validation reported at least one error
    #[error("Validation failed: {}", errors.join("; "))]
    Failed {
        /// The errors from the validation report
        errors: Vec<String>,
    },

    /// A quality check referenced a column that does not exist
    #[error("Column '{column}' does not exist in the row set")]
    UnknownColumn {
        /// The missing column
        column: String,
    },
}

/// Errors raised while converting rows to the columnar format.
#[derive(Debug, Error)]
pub enum TransformationError {
    /// The row set had no rows
    #[error("Cannot transform an empty row set")]
    EmptyInput,

    /// Building the Arrow record batch failed
    #[error("Failed to build record batch: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),

    /// Writing or reading the Parquet buffer failed
    #[error("Parquet serialization failed: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// A row could not be serialized
    #[error("Row {row}: {message}")]
    Row {
        /// Zero-based row index
        row: usize,
        /// Description of the problem
        message: String,
    },
}

/// Catalog service errors.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The table is already registered
    #[error("Table '{database}.{table}' already exists")]
    AlreadyExists {
        /// Catalog database
        database: String,
        /// Table name
        table: String,
    },

    /// Any other catalog failure
    #[error("Catalog request failed: {0}")]
    Service(#[source] BoxError),
}

/// Errors raised by the loader.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Uploading the buffer to object storage failed
    #[error("Failed to upload '{key}': {source}")]
    Upload {
        /// The object key
        key: String,
        /// The object store error
        #[source]
        source: object_store::Error,
    },

    /// Registering the external table failed
    #[error("Failed to register table '{table}': {source}")]
    Catalog {
        /// The table name
        table: String,
        /// The catalog error
        #[source]
        source: CatalogError,
    },

    /// Target table name is not usable in the catalog
    #[error("Invalid target table name '{table}'")]
    InvalidTableName {
        /// The rejected name
        table: String,
    },
}

/// Interactive query service errors.
#[derive(Debug, Error)]
pub enum QueryError {
    /// Submitting or polling the query failed
    #[error("Query service request failed: {0}")]
    Service(#[source] BoxError),

    /// The query reached the FAILED state
    #[error("Query {execution_id} failed: {reason}")]
    Failed {
        /// Execution identifier
        execution_id: String,
        /// Reason reported by the service
        reason: String,
    },

    /// The query was cancelled by the service or another client
    #[error("Query {execution_id} was cancelled")]
    Cancelled {
        /// Execution identifier
        execution_id: String,
    },

    /// The deadline passed before the query finished
    #[error("Query {execution_id} did not finish within {waited_ms} ms")]
    Timeout {
        /// Execution identifier
        execution_id: String,
        /// How long the caller waited
        waited_ms: u128,
    },

    /// The local wait was aborted through its cancellation token
    #[error("Waiting for query {execution_id} was aborted")]
    Aborted {
        /// Execution identifier
        execution_id: String,
    },

    /// The service answered without a field the client needs
    #[error("Malformed query service response: {0}")]
    Malformed(String),
}

/// Post-load verification errors.
#[derive(Debug, Error)]
pub enum VerificationError {
    /// The verification query could not run
    #[error(transparent)]
    Query(#[from] QueryError),

    /// The loaded row count differs from the number of rows written
    #[error("Row count mismatch for '{table}': expected {expected}, found {found}")]
    RowCountMismatch {
        /// The catalog table
        table: String,
        /// Rows written
        expected: u64,
        /// Rows visible through the query service
        found: u64,
    },

    /// The result set did not have the expected shape
    #[error("Unexpected verification result: {0}")]
    MalformedResult(String),
}

/// Configuration errors.
///
/// These errors occur when environment variables or options are invalid.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid option value
    #[error("Invalid {option} option: {message}")]
    InvalidOption {
        /// The option name
        option: String,
        /// Why it's invalid
        message: String,
    },

    /// Required option is missing
    #[error("Missing required option: {option}")]
    MissingRequired {
        /// The missing option name
        option: String,
    },

    /// Options conflict with each other
    #[error("Conflicting options: {options}")]
    ConflictingOptions {
        /// Description of the conflicting options
        options: String,
    },
}

/// Type alias for Results using `MigrationError`.
pub type Result<T> = std::result::Result<T, MigrationError>;

impl MigrationError {
    /// Get a user-friendly error message.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Extraction(e) => format!("Extraction error: {e}"),
            Self::Validation(e) => format!("Validation error: {e}"),
            Self::Transformation(e) => format!("Transformation error: {e}"),
            Self::Load(e) => e.user_message(),
            Self::Verification(e) => format!("Verification error: {e}"),
            Self::Config(e) => format!("Configuration error: {e}"),
            Self::Query(e) => format!("Query error: {e}"),
        }
    }

    /// Get recovery suggestions if available.
    #[must_use]
    pub fn recovery_suggestion(&self) -> Option<String> {
        match self {
            Self::Extraction(e) => e.recovery_suggestion(),
            Self::Validation(ValidationError::Failed { .. }) => Some(
                "Re-run with --repair to fix invalid geometries, or without --strict to continue."
                    .to_string(),
            ),
            Self::Config(ConfigError::MissingRequired { option }) => {
                Some(format!("Set the {option} environment variable or add it to .env."))
            },
            Self::Load(LoadError::Catalog { .. }) => Some(
                "Check that the catalog database exists and the credentials may create tables."
                    .to_string(),
            ),
            Self::Query(QueryError::Timeout { .. }) => {
                Some("Increase QUERY_TIMEOUT_SECS and try again.".to_string())
            },
            _ => None,
        }
    }

    /// Name of the pipeline stage the error belongs to.
    #[must_use]
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Extraction(_) => "extract",
            Self::Validation(_) => "validate",
            Self::Transformation(_) => "transform",
            Self::Load(_) => "load",
            Self::Verification(_) | Self::Query(_) => "verify",
            Self::Config(_) => "config",
        }
    }
}

impl ExtractionError {
    fn recovery_suggestion(&self) -> Option<String> {
        match self {
            Self::Connection { .. } => Some(
                "Check POSTGRES_HOST, POSTGRES_PORT and the database credentials.".to_string(),
            ),
            Self::TableNotFound { .. } => {
                Some("Use schema.table when the table is not in the public schema.".to_string())
            },
            Self::NoGeometryColumn { .. } => {
                Some("Set GEOMETRY_COLUMN to the name of the geometry column.".to_string())
            },
            Self::SridMismatch { expected, .. } => Some(format!(
                "Reproject the source with ST_Transform(geom, {expected}) or change REQUIRED_SRID."
            )),
            _ => None,
        }
    }
}

impl LoadError {
    fn user_message(&self) -> String {
        match self {
            Self::Upload { key, .. } => format!("Failed to upload data to '{key}'"),
            Self::Catalog { table, source } => {
                format!("Failed to register table '{table}' in the catalog: {source}")
            },
            Self::InvalidTableName { .. } => self.to_string(),
        }
    }
}

impl CatalogError {
    /// Returns `true` for the "table already exists" condition.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transparent_display() {
        let err: MigrationError = ExtractionError::Empty {
            table: "barrios".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "No rows found in 'barrios'");
        assert_eq!(err.stage(), "extract");
    }

    #[test]
    fn test_validation_failed_joins_errors() {
        let err = ValidationError::Failed {
            errors: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(err.to_string(), "Validation failed: a; b");
    }

    #[test]
    fn test_missing_config_suggestion() {
        let err: MigrationError = ConfigError::MissingRequired {
            option: "S3_BUCKET".to_string(),
        }
        .into();
        assert!(err.recovery_suggestion().unwrap().contains("S3_BUCKET"));
        assert_eq!(
            err.user_message(),
            "Configuration error: Missing required option: S3_BUCKET"
        );
    }

    #[test]
    fn test_srid_suggestion_mentions_expected() {
        let err: MigrationError = ExtractionError::SridMismatch {
            table: "t".to_string(),
            expected: 4326,
            found: 3857,
        }
        .into();
        assert!(err.recovery_suggestion().unwrap().contains("4326"));
    }

    #[test]
    fn test_no_geometry_column_message() {
        let err = ExtractionError::NoGeometryColumn {
            table: "t".to_string(),
            requested: Some("shape".to_string()),
        };
        assert_eq!(err.to_string(), "Table 't' has no geometry column named 'shape'");
    }
}
