//! In-memory stand-ins for the source database, the catalog and the query
//! service, shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arrow_array::{Array, Int64Array, StringArray};
use async_trait::async_trait;
use geolake_core::catalog::{CatalogClient, TableDefinition};
use geolake_core::config::Config;
use geolake_core::error::{CatalogError, ExtractionError, QueryError};
use geolake_core::extractor::{RowSource, SourceFilter};
use geolake_core::geometry::GeometryValue;
use geolake_core::loader::DataLakeLoader;
use geolake_core::operations::SpatialMigration;
use geolake_core::query::{
    QueryResults, QueryRunner, QueryService, QueryState, QueryStatus, WaitOptions,
};
use geolake_core::transformer::read_back;
use geolake_core::types::{ColumnDef, ColumnType, SpatialRowSet, Value};
use geolake_core::verify::Verifier;
use object_store::ObjectStore;
use object_store::memory::InMemory;
use object_store::path::Path;
use tokio_util::sync::CancellationToken;

pub const DATABASE: &str = "spatial";
pub const BUCKET: &str = "lake";

pub fn config() -> Config {
    let env = HashMap::from([
        ("POSTGRES_DB", "gis"),
        ("POSTGRES_USER", "loader"),
        ("AWS_REGION", "us-east-1"),
        ("S3_BUCKET", BUCKET),
        ("GLUE_DATABASE", DATABASE),
    ]);
    Config::from_lookup(|k| env.get(k).map(ToString::to_string)).expect("test config is valid")
}

/// Rows with an `id` and a `name` column; `None` is a null geometry.
pub fn row_set(srid: i32, rows: &[(i64, Option<&str>)]) -> SpatialRowSet {
    let mut set = SpatialRowSet::new(
        vec![
            ColumnDef::new("id", ColumnType::Integer),
            ColumnDef::new("name", ColumnType::String),
        ],
        "geom",
        srid,
    );
    for (id, wkt) in rows {
        let geometry = wkt.map(|w| GeometryValue::from_wkt(w).expect("test WKT is valid"));
        set.push(
            vec![Value::Integer(*id), Value::String(format!("row {id}"))],
            geometry,
        )
        .expect("test row matches columns");
    }
    set
}

/// Source serving prepared row sets by table name. Filters are ignored.
#[derive(Default)]
pub struct MemorySource {
    tables: HashMap<String, SpatialRowSet>,
}

impl MemorySource {
    pub fn with_table(mut self, name: &str, rows: SpatialRowSet) -> Self {
        self.tables.insert(name.to_string(), rows);
        self
    }
}

#[async_trait]
impl RowSource for MemorySource {
    async fn extract(
        &self,
        table: &str,
        _filter: Option<&SourceFilter>,
    ) -> Result<SpatialRowSet, ExtractionError> {
        let rows = self
            .tables
            .get(table)
            .cloned()
            .ok_or_else(|| ExtractionError::TableNotFound {
                table: table.to_string(),
            })?;
        if rows.is_empty() {
            return Err(ExtractionError::Empty {
                table: table.to_string(),
            });
        }
        Ok(rows)
    }
}

/// Catalog keeping definitions in a map; a second create of the same table
/// reports "already exists".
#[derive(Default)]
pub struct MemoryCatalog {
    pub tables: Mutex<HashMap<(String, String), TableDefinition>>,
}

#[async_trait]
impl CatalogClient for MemoryCatalog {
    async fn create_table(
        &self,
        database: &str,
        table: &TableDefinition,
    ) -> Result<(), CatalogError> {
        let mut tables = self.tables.lock().unwrap();
        let key = (database.to_string(), table.name.clone());
        if tables.contains_key(&key) {
            return Err(CatalogError::AlreadyExists {
                database: database.to_string(),
                table: table.name.clone(),
            });
        }
        tables.insert(key, table.clone());
        Ok(())
    }
}

/// Answers verification count queries by reading the uploaded Parquet
/// object back from the store, and `SHOW TABLES` from the catalog.
pub struct CountingQueryService {
    store: Arc<InMemory>,
    catalog: Arc<MemoryCatalog>,
    database: String,
    key_prefix: String,
    key_column: String,
    wkt_column: String,
    sentinel: String,
    next_id: AtomicUsize,
    queries: Mutex<HashMap<String, String>>,
    /// Report queries as running forever
    pub stalled: AtomicBool,
    /// Rows to leave out of the reported total
    pub hidden_rows: AtomicUsize,
    /// Stop requests received
    pub stops: AtomicUsize,
}

impl CountingQueryService {
    pub fn new(store: Arc<InMemory>, catalog: Arc<MemoryCatalog>, config: &Config) -> Self {
        Self {
            store,
            catalog,
            database: config.sink.catalog_database.clone(),
            key_prefix: config.sink.key_prefix.clone(),
            key_column: "id".to_string(),
            wkt_column: "geom".to_string(),
            sentinel: config.geometry.sentinel(),
            next_id: AtomicUsize::new(0),
            queries: Mutex::new(HashMap::new()),
            stalled: AtomicBool::new(false),
            hidden_rows: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }

    pub fn executed(&self) -> Vec<String> {
        self.queries.lock().unwrap().values().cloned().collect()
    }

    /// `SHOW TABLES IN `db` 'name'` lists `name` when it is registered.
    fn show_tables(&self, sql: &str) -> QueryResults {
        let pattern = sql.rsplit('\'').nth(1).unwrap_or_default().to_string();
        let tables = self.catalog.tables.lock().unwrap();
        let rows = if tables.contains_key(&(self.database.clone(), pattern.clone())) {
            vec![vec![Some(pattern)]]
        } else {
            Vec::new()
        };
        QueryResults {
            columns: vec!["tab_name".to_string()],
            rows,
        }
    }

    async fn count(&self, table: &str) -> Result<QueryResults, QueryError> {
        let path = Path::from(format!("{}/{table}/{table}.parquet", self.key_prefix));
        let bytes = self
            .store
            .get(&path)
            .await
            .map_err(|e| QueryError::Service(Box::new(e)))?
            .bytes()
            .await
            .map_err(|e| QueryError::Service(Box::new(e)))?;
        let batches = read_back(&bytes).map_err(|e| QueryError::Service(Box::new(e)))?;

        let mut total = 0;
        let mut keys = HashSet::new();
        let mut empty = 0;
        for batch in &batches {
            total += batch.num_rows();
            let ids = batch
                .column_by_name(&self.key_column)
                .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
                .ok_or_else(|| QueryError::Malformed("no key column".to_string()))?;
            keys.extend((0..ids.len()).filter(|&i| !ids.is_null(i)).map(|i| ids.value(i)));
            let wkt = batch
                .column_by_name(&self.wkt_column)
                .and_then(|c| c.as_any().downcast_ref::<StringArray>())
                .ok_or_else(|| QueryError::Malformed("no wkt column".to_string()))?;
            empty += (0..wkt.len())
                .filter(|&i| wkt.value(i) == self.sentinel)
                .count();
        }
        let total = total.saturating_sub(self.hidden_rows.load(Ordering::SeqCst));
        Ok(QueryResults {
            columns: vec![
                "total_records".to_string(),
                "unique_keys".to_string(),
                "empty_geometries".to_string(),
            ],
            rows: vec![vec![
                Some(total.to_string()),
                Some(keys.len().to_string()),
                Some(empty.to_string()),
            ]],
        })
    }
}

#[async_trait]
impl QueryService for CountingQueryService {
    async fn start_query(
        &self,
        sql: &str,
        _database: &str,
        _output_location: &str,
    ) -> Result<String, QueryError> {
        let id = format!("q-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.queries.lock().unwrap().insert(id.clone(), sql.to_string());
        Ok(id)
    }

    async fn get_status(&self, _execution_id: &str) -> Result<QueryStatus, QueryError> {
        if self.stalled.load(Ordering::SeqCst) {
            Ok(QueryStatus::new(QueryState::Running))
        } else {
            Ok(QueryStatus::new(QueryState::Succeeded))
        }
    }

    async fn get_results(&self, execution_id: &str) -> Result<QueryResults, QueryError> {
        let sql = self
            .queries
            .lock()
            .unwrap()
            .get(execution_id)
            .cloned()
            .ok_or_else(|| QueryError::Malformed(format!("unknown id {execution_id}")))?;
        if sql.starts_with("SHOW TABLES") {
            return Ok(self.show_tables(&sql));
        }
        // The table is the last quoted identifier: ... FROM "db"."table"
        let table = sql
            .rsplit('.')
            .next()
            .unwrap_or_default()
            .trim_matches('"')
            .to_string();
        self.count(&table).await
    }

    async fn stop_query(&self, _execution_id: &str) -> Result<(), QueryError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct Harness {
    pub store: Arc<InMemory>,
    pub catalog: Arc<MemoryCatalog>,
    pub queries: Arc<CountingQueryService>,
    pub migration: SpatialMigration,
}

pub fn harness(source: MemorySource) -> Harness {
    harness_with_cancellation(source, CancellationToken::new())
}

/// Harness whose verification queries watch `cancel`.
pub fn harness_with_cancellation(source: MemorySource, cancel: CancellationToken) -> Harness {
    let config = config();
    let store = Arc::new(InMemory::new());
    let catalog = Arc::new(MemoryCatalog::default());
    let queries = Arc::new(CountingQueryService::new(store.clone(), catalog.clone(), &config));
    let loader = DataLakeLoader::new(store.clone(), catalog.clone(), config.sink.clone());
    let runner = QueryRunner::new(
        queries.clone(),
        DATABASE,
        config.sink.query_output_location(),
    )
    .with_wait(WaitOptions {
        deadline: Duration::from_secs(5),
        poll_interval: Duration::from_millis(10),
    })
    .with_cancellation(cancel);
    let migration = SpatialMigration::new(Arc::new(source), loader, &config)
        .with_verifier(Verifier::new(runner));
    Harness {
        store,
        catalog,
        queries,
        migration,
    }
}

pub async fn object_exists(store: &InMemory, key: &str) -> bool {
    store.head(&Path::from(key)).await.is_ok()
}
