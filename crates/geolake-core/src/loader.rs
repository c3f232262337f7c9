//! Loading Parquet buffers into the data lake.
//!
//! A load is two remote steps: upload the object, then register the
//! external table. The two are not atomic. When registration fails for any
//! reason other than "already exists", the uploaded object is deleted
//! again unless cleanup was disabled.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use object_store::ObjectStore;
use object_store::path::Path;
use tracing::{error, info, warn};

use crate::catalog::{CatalogClient, TableDefinition};
use crate::config::SinkConfig;
use crate::error::LoadError;
use crate::types::{MigrationTarget, TableSchema};
use crate::utils::is_plain_identifier;

/// Outcome of a successful load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReceipt {
    /// Object key of the uploaded file
    pub key: String,
    /// Catalog location of the table
    pub location: String,
    /// Catalog table name
    pub table_name: String,
    /// Uploaded size in bytes
    pub bytes: usize,
    /// `false` when the table was already registered
    pub table_created: bool,
}

/// Uploads Parquet buffers and registers external tables.
pub struct DataLakeLoader {
    store: Arc<dyn ObjectStore>,
    catalog: Arc<dyn CatalogClient>,
    sink: SinkConfig,
    cleanup_orphans: bool,
}

impl DataLakeLoader {
    /// Creates a loader writing into the bucket and prefix of `sink`.
    ///
    /// `store` must be rooted at that bucket.
    pub fn new(store: Arc<dyn ObjectStore>, catalog: Arc<dyn CatalogClient>, sink: SinkConfig) -> Self {
        Self {
            store,
            catalog,
            sink,
            cleanup_orphans: true,
        }
    }

    /// Whether to delete the uploaded object when registration fails.
    #[must_use]
    pub fn with_cleanup_orphans(mut self, cleanup: bool) -> Self {
        self.cleanup_orphans = cleanup;
        self
    }

    /// Uploads `buffer` and registers `table_name` with `schema`.
    ///
    /// # Errors
    ///
    /// See [`DataLakeLoader::load_into`].
    pub async fn load(
        &self,
        buffer: Bytes,
        table_name: &str,
        schema: &TableSchema,
    ) -> Result<LoadReceipt, LoadError> {
        let target = MigrationTarget::new(&self.sink, table_name, Utc::now());
        self.load_into(&target, buffer, schema).await
    }

    /// Uploads `buffer` to `target` and registers the table.
    ///
    /// # Errors
    ///
    /// - [`LoadError::InvalidTableName`] when the name is not a plain
    ///   identifier.
    /// - [`LoadError::Upload`] when the upload fails.
    /// - [`LoadError::Catalog`] when registration fails with anything other
    ///   than "already exists".
    pub async fn load_into(
        &self,
        target: &MigrationTarget,
        buffer: Bytes,
        schema: &TableSchema,
    ) -> Result<LoadReceipt, LoadError> {
        if !is_plain_identifier(&target.table_name) {
            return Err(LoadError::InvalidTableName {
                table: target.table_name.clone(),
            });
        }

        let key = target.object_key();
        let path = Path::from(key.as_str());
        let size = buffer.len();
        info!(key = %key, bytes = size, "uploading parquet object");
        self.store
            .put(&path, buffer.into())
            .await
            .map_err(|source| LoadError::Upload {
                key: key.clone(),
                source,
            })?;

        let location = target.location();
        let definition = TableDefinition::parquet(&target.table_name, schema, &location);
        let table_created = match self
            .catalog
            .create_table(&target.catalog_database, &definition)
            .await
        {
            Ok(()) => {
                info!(
                    database = %target.catalog_database,
                    table = %target.table_name,
                    location = %location,
                    "registered external table"
                );
                true
            },
            Err(e) if e.is_already_exists() => {
                warn!(
                    database = %target.catalog_database,
                    table = %target.table_name,
                    "table already exists, keeping its current definition"
                );
                false
            },
            Err(source) => {
                if self.cleanup_orphans {
                    self.remove_orphan(&path).await;
                }
                return Err(LoadError::Catalog {
                    table: target.table_name.clone(),
                    source,
                });
            },
        };

        Ok(LoadReceipt {
            key,
            location,
            table_name: target.table_name.clone(),
            bytes: size,
            table_created,
        })
    }

    async fn remove_orphan(&self, path: &Path) {
        match self.store.delete(path).await {
            Ok(()) => warn!(key = %path, "removed uploaded object after catalog failure"),
            Err(e) => error!(key = %path, error = %e, "failed to remove uploaded object"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CatalogBackend;
    use crate::error::CatalogError;
    use async_trait::async_trait;
    use object_store::memory::InMemory;
    use std::sync::Mutex;
    use std::time::Duration;
    use tracing_test::traced_test;

    enum Behavior {
        Create,
        Exists,
        Fail,
    }

    struct FakeCatalog {
        behavior: Behavior,
        created: Mutex<Vec<(String, TableDefinition)>>,
    }

    impl FakeCatalog {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                created: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CatalogClient for FakeCatalog {
        async fn create_table(
            &self,
            database: &str,
            table: &TableDefinition,
        ) -> Result<(), CatalogError> {
            match self.behavior {
                Behavior::Create => {
                    self.created
                        .lock()
                        .unwrap()
                        .push((database.to_string(), table.clone()));
                    Ok(())
                },
                Behavior::Exists => Err(CatalogError::AlreadyExists {
                    database: database.to_string(),
                    table: table.name.clone(),
                }),
                Behavior::Fail => Err(CatalogError::Service("access denied".into())),
            }
        }
    }

    fn sink() -> SinkConfig {
        SinkConfig {
            region: "eu-west-1".to_string(),
            bucket: "lake".to_string(),
            key_prefix: "spatial_data".to_string(),
            catalog_database: "spatial".to_string(),
            catalog_backend: CatalogBackend::Glue,
            query_output_bucket: "lake".to_string(),
            query_output_prefix: "athena-results".to_string(),
            query_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
        }
    }

    fn schema() -> TableSchema {
        TableSchema::new(vec![
            ("id".to_string(), crate::types::ColumnType::Integer),
            ("geom".to_string(), crate::types::ColumnType::String),
        ])
    }

    const KEY: &str = "spatial_data/barrios/barrios.parquet";

    #[tokio::test]
    async fn test_load_uploads_and_registers() -> anyhow::Result<()> {
        let store = Arc::new(InMemory::new());
        let catalog = FakeCatalog::new(Behavior::Create);
        let loader = DataLakeLoader::new(store.clone(), catalog.clone(), sink());

        let receipt = loader
            .load(Bytes::from_static(b"PAR1"), "barrios", &schema())
            .await?;
        assert_eq!(receipt.key, KEY);
        assert_eq!(receipt.location, "s3://lake/spatial_data/barrios/");
        assert!(receipt.table_created);

        let stored = store.get(&Path::from(KEY)).await?.bytes().await?;
        assert_eq!(stored.as_ref(), b"PAR1");

        let created = catalog.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].0, "spatial");
        assert_eq!(created[0].1.location, "s3://lake/spatial_data/barrios/");
        Ok(())
    }

    #[traced_test]
    #[tokio::test]
    async fn test_existing_table_is_a_warning() {
        let store = Arc::new(InMemory::new());
        let loader = DataLakeLoader::new(store.clone(), FakeCatalog::new(Behavior::Exists), sink());

        let receipt = loader
            .load(Bytes::from_static(b"PAR1"), "barrios", &schema())
            .await
            .unwrap();
        assert!(!receipt.table_created);
        assert!(store.head(&Path::from(KEY)).await.is_ok());
        assert!(logs_contain("table already exists"));
    }

    #[tokio::test]
    async fn test_catalog_failure_removes_object() {
        let store = Arc::new(InMemory::new());
        let loader = DataLakeLoader::new(store.clone(), FakeCatalog::new(Behavior::Fail), sink());

        let err = loader
            .load(Bytes::from_static(b"PAR1"), "barrios", &schema())
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::Catalog { .. }));
        assert!(store.head(&Path::from(KEY)).await.is_err());
    }

    #[tokio::test]
    async fn test_catalog_failure_without_cleanup_keeps_object() {
        let store = Arc::new(InMemory::new());
        let loader = DataLakeLoader::new(store.clone(), FakeCatalog::new(Behavior::Fail), sink())
            .with_cleanup_orphans(false);

        assert!(
            loader
                .load(Bytes::from_static(b"PAR1"), "barrios", &schema())
                .await
                .is_err()
        );
        assert!(store.head(&Path::from(KEY)).await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_table_name() {
        let loader = DataLakeLoader::new(
            Arc::new(InMemory::new()),
            FakeCatalog::new(Behavior::Create),
            sink(),
        );
        let err = loader
            .load(Bytes::new(), "bad name", &schema())
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::InvalidTableName { .. }));
    }
}
