//! Typed, immutable configuration loaded from environment variables.
//!
//! All values are read once by [`Config::from_env`] (after loading an
//! optional `.env` file) and validated before any connection is opened.
//! Credentials for AWS are not part of this structure: the SDK and
//! `object_store` resolve them through their default provider chains.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::geometry::{EmptyGeometryPolicy, GeometryKind};
use crate::utils::is_plain_identifier;

/// Default SRID every extracted geometry must carry (WGS 84).
pub const DEFAULT_SRID: i32 = 4326;

/// Default object key prefix.
pub const DEFAULT_KEY_PREFIX: &str = "spatial_data";

/// Default prefix for query service result files.
pub const DEFAULT_QUERY_OUTPUT_PREFIX: &str = "athena-results";

/// Full configuration for one migration process.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Source database settings
    pub source: SourceConfig,
    /// Object storage, catalog and query service settings
    pub sink: SinkConfig,
    /// How null geometries are written
    pub geometry: EmptyGeometryPolicy,
}

/// Connection settings for the PostGIS source.
#[derive(Clone, PartialEq)]
pub struct SourceConfig {
    /// Database host
    pub host: String,
    /// Database port
    pub port: u16,
    /// Database name
    pub database: String,
    /// Login role
    pub user: String,
    /// Password, never printed
    pub password: String,
    /// SRID every extracted geometry must carry
    pub required_srid: i32,
    /// Geometry column to read; auto-detected when `None`
    pub geometry_column: Option<String>,
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("required_srid", &self.required_srid)
            .field("geometry_column", &self.geometry_column)
            .finish()
    }
}

impl SourceConfig {
    /// Connection URL with the password masked, for log lines.
    #[must_use]
    pub fn display_url(&self) -> String {
        format!(
            "postgresql://{}:***@{}:{}/{}",
            self.user, self.host, self.port, self.database
        )
    }
}

/// Which service registers the external table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CatalogBackend {
    /// Glue `CreateTable`
    #[default]
    Glue,
    /// `CREATE EXTERNAL TABLE` DDL through Athena
    Athena,
}

impl CatalogBackend {
    /// Lowercase name as accepted in `CATALOG_BACKEND`.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Glue => "glue",
            Self::Athena => "athena",
        }
    }
}

impl FromStr for CatalogBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "glue" => Ok(Self::Glue),
            "athena" => Ok(Self::Athena),
            other => Err(format!("expected 'glue' or 'athena', got '{other}'")),
        }
    }
}

/// Settings for object storage, catalog and query service.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkConfig {
    /// AWS region
    pub region: String,
    /// Bucket receiving the Parquet objects
    pub bucket: String,
    /// Key prefix inside the bucket, without slashes at either end
    pub key_prefix: String,
    /// Catalog database the external tables are created in
    pub catalog_database: String,
    /// Catalog implementation
    pub catalog_backend: CatalogBackend,
    /// Bucket for query service result files
    pub query_output_bucket: String,
    /// Prefix for query service result files
    pub query_output_prefix: String,
    /// Deadline for a single query
    pub query_timeout: Duration,
    /// Delay between status polls
    pub poll_interval: Duration,
}

impl SinkConfig {
    /// `s3://` location where the query service writes result files.
    #[must_use]
    pub fn query_output_location(&self) -> String {
        if self.query_output_prefix.is_empty() {
            format!("s3://{}/", self.query_output_bucket)
        } else {
            format!(
                "s3://{}/{}/",
                self.query_output_bucket, self.query_output_prefix
            )
        }
    }
}

impl Config {
    /// Loads `.env` if present, then reads the process environment.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when a required variable is missing or a
    /// value cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is not an error.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when a required key is missing or a value
    /// cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(&lookup);

        let geometry_column = env.optional("GEOMETRY_COLUMN");
        if let Some(column) = &geometry_column {
            if !is_plain_identifier(column) {
                return Err(invalid("GEOMETRY_COLUMN", "must be a plain identifier"));
            }
        }

        let source = SourceConfig {
            host: env.or("POSTGRES_HOST", "localhost"),
            port: env.parsed("POSTGRES_PORT", 5432)?,
            database: env.required("POSTGRES_DB")?,
            user: env.required("POSTGRES_USER")?,
            password: env.or("POSTGRES_PASSWORD", ""),
            required_srid: env.parsed("REQUIRED_SRID", DEFAULT_SRID)?,
            geometry_column,
        };

        let region = env
            .optional("AWS_REGION")
            .or_else(|| env.optional("AWS_DEFAULT_REGION"))
            .ok_or_else(|| ConfigError::MissingRequired {
                option: "AWS_REGION".to_string(),
            })?;
        let bucket = env.required("S3_BUCKET")?;
        let catalog_database = env.required("GLUE_DATABASE")?;
        if !is_plain_identifier(&catalog_database) {
            return Err(invalid("GLUE_DATABASE", "must be a plain identifier"));
        }

        let query_timeout = Duration::from_secs(env.parsed("QUERY_TIMEOUT_SECS", 300)?);
        let poll_interval = Duration::from_millis(env.parsed("QUERY_POLL_INTERVAL_MS", 1000)?);
        if poll_interval.is_zero() {
            return Err(invalid("QUERY_POLL_INTERVAL_MS", "must be greater than zero"));
        }
        if query_timeout < poll_interval {
            return Err(ConfigError::ConflictingOptions {
                options: "QUERY_TIMEOUT_SECS is shorter than QUERY_POLL_INTERVAL_MS".to_string(),
            });
        }

        let sink = SinkConfig {
            region,
            query_output_bucket: env.optional("ATHENA_OUTPUT_BUCKET").unwrap_or_else(|| bucket.clone()),
            bucket,
            key_prefix: trim_slashes(&env.or("S3_PREFIX", DEFAULT_KEY_PREFIX)),
            catalog_database,
            catalog_backend: env.parsed("CATALOG_BACKEND", CatalogBackend::default())?,
            query_output_prefix: trim_slashes(
                &env.or("ATHENA_OUTPUT_PREFIX", DEFAULT_QUERY_OUTPUT_PREFIX),
            ),
            query_timeout,
            poll_interval,
        };

        let geometry = EmptyGeometryPolicy {
            kind: env.parsed("GEOMETRY_TYPE", GeometryKind::MultiPolygon)?,
            has_z: env.flag("GEOMETRY_HAS_Z")?,
        };

        Ok(Self {
            source,
            sink,
            geometry,
        })
    }
}

struct Lookup<'a, F>(&'a F);

impl<F> Lookup<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.optional(key).ok_or_else(|| ConfigError::MissingRequired {
            option: key.to_string(),
        })
    }

    fn parsed<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.optional(key) {
            Some(raw) => raw.parse().map_err(|e: T::Err| invalid(key, &e.to_string())),
            None => Ok(default),
        }
    }

    fn flag(&self, key: &str) -> Result<bool, ConfigError> {
        match self.optional(key).map(|v| v.to_ascii_lowercase()) {
            None => Ok(false),
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
            Some(v) => Err(invalid(key, &format!("expected a boolean, got '{v}'"))),
        }
    }
}

fn invalid(option: &str, message: &str) -> ConfigError {
    ConfigError::InvalidOption {
        option: option.to_string(),
        message: message.to_string(),
    }
}

fn trim_slashes(value: &str) -> String {
    value.trim_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("POSTGRES_DB", "gis"),
            ("POSTGRES_USER", "loader"),
            ("POSTGRES_PASSWORD", "s3cret"),
            ("AWS_REGION", "us-east-1"),
            ("S3_BUCKET", "lake-bucket"),
            ("GLUE_DATABASE", "spatial"),
        ])
    }

    fn load(env: &HashMap<&'static str, &'static str>) -> Result<Config, ConfigError> {
        Config::from_lookup(|k| env.get(k).map(ToString::to_string))
    }

    #[test]
    fn test_defaults() {
        let config = load(&base_env()).unwrap();
        assert_eq!(config.source.host, "localhost");
        assert_eq!(config.source.port, 5432);
        assert_eq!(config.source.required_srid, 4326);
        assert_eq!(config.source.geometry_column, None);
        assert_eq!(config.sink.key_prefix, "spatial_data");
        assert_eq!(config.sink.query_output_bucket, "lake-bucket");
        assert_eq!(config.sink.catalog_backend, CatalogBackend::Glue);
        assert_eq!(config.sink.query_timeout, Duration::from_secs(300));
        assert_eq!(config.geometry.sentinel(), "MULTIPOLYGON EMPTY");
        assert_eq!(
            config.sink.query_output_location(),
            "s3://lake-bucket/athena-results/"
        );
    }

    #[test]
    fn test_missing_required() {
        let mut env = base_env();
        env.remove("S3_BUCKET");
        let err = load(&env).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { ref option } if option == "S3_BUCKET"));
    }

    #[test]
    fn test_region_fallback() {
        let mut env = base_env();
        env.remove("AWS_REGION");
        env.insert("AWS_DEFAULT_REGION", "eu-west-1");
        assert_eq!(load(&env).unwrap().sink.region, "eu-west-1");
    }

    #[test]
    fn test_invalid_port() {
        let mut env = base_env();
        env.insert("POSTGRES_PORT", "not-a-port");
        let err = load(&env).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOption { ref option, .. } if option == "POSTGRES_PORT"));
    }

    #[test]
    fn test_z_sentinel_and_prefix_trimming() {
        let mut env = base_env();
        env.insert("GEOMETRY_HAS_Z", "true");
        env.insert("S3_PREFIX", "/spatial_data/comisarias/");
        let config = load(&env).unwrap();
        assert_eq!(config.geometry.sentinel(), "MULTIPOLYGON Z EMPTY");
        assert_eq!(config.sink.key_prefix, "spatial_data/comisarias");
    }

    #[test]
    fn test_empty_query_output_prefix() {
        let mut env = base_env();
        env.insert("ATHENA_OUTPUT_BUCKET", "results");
        env.insert("ATHENA_OUTPUT_PREFIX", "/");
        let config = load(&env).unwrap();
        assert_eq!(config.sink.query_output_prefix, "");
        assert_eq!(config.sink.query_output_location(), "s3://results/");
    }

    #[test]
    fn test_conflicting_timeouts() {
        let mut env = base_env();
        env.insert("QUERY_TIMEOUT_SECS", "1");
        env.insert("QUERY_POLL_INTERVAL_MS", "5000");
        assert!(matches!(
            load(&env).unwrap_err(),
            ConfigError::ConflictingOptions { .. }
        ));
    }

    #[test]
    fn test_catalog_backend_and_bad_database() {
        let mut env = base_env();
        env.insert("CATALOG_BACKEND", "Athena");
        assert_eq!(load(&env).unwrap().sink.catalog_backend, CatalogBackend::Athena);

        env.insert("GLUE_DATABASE", "spatial; DROP");
        assert!(load(&env).is_err());
    }

    #[test]
    fn test_password_is_redacted() {
        let config = load(&base_env()).unwrap();
        let debug = format!("{:?}", config.source);
        assert!(!debug.contains("s3cret"));
        assert!(!config.source.display_url().contains("s3cret"));
    }
}
