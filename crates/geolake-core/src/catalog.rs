//! External table registration.
//!
//! A [`TableDefinition`] describes a Parquet-backed external table. It is
//! registered through a [`CatalogClient`]: [`GlueCatalog`] calls the Glue
//! `CreateTable` API, [`AthenaDdlCatalog`] runs a `CREATE EXTERNAL TABLE`
//! statement through the query service.

use async_trait::async_trait;
use aws_sdk_glue::types::{Column, SerDeInfo, StorageDescriptor, TableInput};
use tracing::debug;

use crate::error::CatalogError;
use crate::query::QueryRunner;
use crate::types::{ColumnType, TableSchema};

/// Input format for Parquet-backed tables.
pub const PARQUET_INPUT_FORMAT: &str =
    "org.apache.hadoop.hive.ql.io.parquet.MapredParquetInputFormat";

/// Output format for Parquet-backed tables.
pub const PARQUET_OUTPUT_FORMAT: &str =
    "org.apache.hadoop.hive.ql.io.parquet.MapredParquetOutputFormat";

/// SerDe library for Parquet-backed tables.
pub const PARQUET_SERDE: &str = "org.apache.hadoop.hive.ql.io.parquet.serde.ParquetHiveSerDe";

/// Table type of every registered table.
pub const EXTERNAL_TABLE: &str = "EXTERNAL_TABLE";

/// Catalog type name for a semantic column type.
#[must_use]
pub fn catalog_type(column_type: &ColumnType) -> &'static str {
    match column_type {
        ColumnType::Integer => "bigint",
        ColumnType::Double => "double",
        ColumnType::Boolean => "boolean",
        ColumnType::Timestamp => "timestamp",
        ColumnType::String | ColumnType::Other(_) => "string",
    }
}

/// Everything needed to register one external table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDefinition {
    /// Table name
    pub name: String,
    /// Column name and catalog type, in order
    pub columns: Vec<(String, String)>,
    /// `s3://` location of the table directory
    pub location: String,
    /// Hadoop input format
    pub input_format: String,
    /// Hadoop output format
    pub output_format: String,
    /// SerDe library
    pub serde_library: String,
    /// Table parameters
    pub parameters: Vec<(String, String)>,
}

impl TableDefinition {
    /// Parquet table at `location` with columns from `schema`.
    pub fn parquet(name: impl Into<String>, schema: &TableSchema, location: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: schema
                .columns()
                .map(|(n, t)| (n.to_string(), catalog_type(t).to_string()))
                .collect(),
            location: location.into(),
            input_format: PARQUET_INPUT_FORMAT.to_string(),
            output_format: PARQUET_OUTPUT_FORMAT.to_string(),
            serde_library: PARQUET_SERDE.to_string(),
            parameters: vec![("classification".to_string(), "parquet".to_string())],
        }
    }

    /// `CREATE EXTERNAL TABLE IF NOT EXISTS` statement for this table.
    #[must_use]
    pub fn to_ddl(&self, database: &str) -> String {
        let columns = self
            .columns
            .iter()
            .map(|(name, ty)| format!("  {} {ty}", quote_hive(name)))
            .collect::<Vec<_>>()
            .join(",\n");
        format!(
            "CREATE EXTERNAL TABLE IF NOT EXISTS {}.{} (\n{columns}\n)\n\
             STORED AS PARQUET\n\
             LOCATION '{}'\n\
             TBLPROPERTIES ('parquet.compression'='SNAPPY')",
            quote_hive(database),
            quote_hive(&self.name),
            self.location.replace('\'', "''"),
        )
    }
}

fn quote_hive(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Registers external tables.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Creates `table` in `database`.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::AlreadyExists`] when the table is already
    /// registered and [`CatalogError::Service`] for any other failure.
    async fn create_table(&self, database: &str, table: &TableDefinition) -> Result<(), CatalogError>;
}

/// Glue Data Catalog client.
#[derive(Debug, Clone)]
pub struct GlueCatalog {
    client: aws_sdk_glue::Client,
}

impl GlueCatalog {
    /// Wraps a Glue client.
    #[must_use]
    pub fn new(client: aws_sdk_glue::Client) -> Self {
        Self { client }
    }
}

fn service_error<E>(e: E) -> CatalogError
where
    E: std::error::Error + Send + Sync + 'static,
{
    CatalogError::Service(Box::new(e))
}

#[async_trait]
impl CatalogClient for GlueCatalog {
    async fn create_table(&self, database: &str, table: &TableDefinition) -> Result<(), CatalogError> {
        let columns = table
            .columns
            .iter()
            .map(|(name, ty)| Column::builder().name(name).r#type(ty).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(service_error)?;
        let storage = StorageDescriptor::builder()
            .set_columns(Some(columns))
            .location(&table.location)
            .input_format(&table.input_format)
            .output_format(&table.output_format)
            .serde_info(
                SerDeInfo::builder()
                    .serialization_library(&table.serde_library)
                    .parameters("serialization.format", "1")
                    .build(),
            )
            .build();
        let mut input = TableInput::builder()
            .name(&table.name)
            .table_type(EXTERNAL_TABLE)
            .storage_descriptor(storage);
        for (key, value) in &table.parameters {
            input = input.parameters(key, value);
        }
        let input = input.build().map_err(service_error)?;

        debug!(database, table = %table.name, "creating glue table");
        match self
            .client
            .create_table()
            .database_name(database)
            .table_input(input)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_already_exists_exception()) =>
            {
                Err(CatalogError::AlreadyExists {
                    database: database.to_string(),
                    table: table.name.clone(),
                })
            },
            Err(err) => Err(service_error(err)),
        }
    }
}

/// Registers tables with DDL through the query service.
///
/// `IF NOT EXISTS` makes an existing table a silent success, so this client
/// never reports [`CatalogError::AlreadyExists`].
#[derive(Clone)]
pub struct AthenaDdlCatalog {
    runner: QueryRunner,
}

impl AthenaDdlCatalog {
    /// Creates a catalog that runs DDL through `runner`.
    #[must_use]
    pub fn new(runner: QueryRunner) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl CatalogClient for AthenaDdlCatalog {
    async fn create_table(&self, database: &str, table: &TableDefinition) -> Result<(), CatalogError> {
        let ddl = table.to_ddl(database);
        debug!(database, table = %table.name, "creating table with DDL");
        self.runner.run(&ddl).await.map_err(service_error)?;
        Ok(())
    }
}
