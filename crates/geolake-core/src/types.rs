//! Data types for spatial migrations.
//!
//! This module defines the row set produced by the extractor, the schema
//! handed to the loader, and the target a migration run writes to.

use std::fmt;

use arrow_schema::Schema;
use chrono::{DateTime, NaiveDateTime, Utc};

use crate::config::SinkConfig;
use crate::error::ExtractionError;
use crate::geometry::GeometryValue;
use crate::utils::ArrowDataTypeExt;

/// File extension of the objects written to storage.
pub const OBJECT_EXTENSION: &str = "parquet";

/// A scalar attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL
    Null,
    /// 64-bit integer
    Integer(i64),
    /// Double precision float
    Double(f64),
    /// Text
    String(String),
    /// Boolean
    Boolean(bool),
    /// Timestamp without time zone (UTC)
    Timestamp(NaiveDateTime),
}

impl Value {
    /// Returns `true` for [`Value::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Whether this value may be stored in a column of `column_type`.
    #[must_use]
    pub fn fits(&self, column_type: &ColumnType) -> bool {
        matches!(
            (self, column_type),
            (Self::Null, _)
                | (Self::Integer(_), ColumnType::Integer)
                | (Self::Double(_), ColumnType::Double)
                | (Self::String(_), ColumnType::String | ColumnType::Other(_))
                | (Self::Boolean(_), ColumnType::Boolean)
                | (Self::Timestamp(_), ColumnType::Timestamp)
        )
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::String(v) => f.write_str(v),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Timestamp(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S%.f")),
        }
    }
}

/// Semantic column type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    /// Integer of any width
    Integer,
    /// Floating point or numeric
    Double,
    /// Text
    String,
    /// Boolean
    Boolean,
    /// Timestamp
    Timestamp,
    /// Anything else, carried as text; the name is kept for diagnostics
    Other(String),
}

impl ColumnType {
    /// Lowercase name used in logs and tables.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Integer => "integer",
            Self::Double => "double",
            Self::String => "string",
            Self::Boolean => "boolean",
            Self::Timestamp => "timestamp",
            Self::Other(name) => name,
        }
    }
}

/// An attribute column of a row set.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    /// Column name
    pub name: String,
    /// Declared type
    pub column_type: ColumnType,
}

impl ColumnDef {
    /// Creates a column definition.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// One record: attribute values in column order plus the geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialRow {
    /// Values, one per attribute column
    pub values: Vec<Value>,
    /// The geometry, `None` when NULL in the source
    pub geometry: Option<GeometryValue>,
}

/// Ordered records sharing one column layout and one SRID.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialRowSet {
    columns: Vec<ColumnDef>,
    geometry_column: String,
    srid: i32,
    rows: Vec<SpatialRow>,
}

impl SpatialRowSet {
    /// Creates an empty row set.
    pub fn new(columns: Vec<ColumnDef>, geometry_column: impl Into<String>, srid: i32) -> Self {
        Self {
            columns,
            geometry_column: geometry_column.into(),
            srid,
            rows: Vec::new(),
        }
    }

    /// Appends a record after checking it against the column layout.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractionError::Shape`] when the number of values or a
    /// value's type does not match the declared columns.
    pub fn push(
        &mut self,
        values: Vec<Value>,
        geometry: Option<GeometryValue>,
    ) -> Result<(), ExtractionError> {
        let row = self.rows.len();
        if values.len() != self.columns.len() {
            return Err(ExtractionError::Shape {
                row,
                message: format!(
                    "expected {} values, got {}",
                    self.columns.len(),
                    values.len()
                ),
            });
        }
        if let Some((value, column)) = values
            .iter()
            .zip(&self.columns)
            .find(|(value, column)| !value.fits(&column.column_type))
        {
            return Err(ExtractionError::Shape {
                row,
                message: format!(
                    "value {value:?} does not fit column '{}' of type {}",
                    column.name,
                    column.column_type.name()
                ),
            });
        }
        self.rows.push(SpatialRow { values, geometry });
        Ok(())
    }

    /// Attribute columns (the geometry column is not included).
    #[must_use]
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// Name of the geometry column.
    #[must_use]
    pub fn geometry_column(&self) -> &str {
        &self.geometry_column
    }

    /// SRID shared by every geometry.
    #[must_use]
    pub fn srid(&self) -> i32 {
        self.srid
    }

    /// Records in order.
    #[must_use]
    pub fn rows(&self) -> &[SpatialRow] {
        &self.rows
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns `true` when there are no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of an attribute column.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Geometries in row order.
    pub fn geometries(&self) -> impl Iterator<Item = Option<&GeometryValue>> {
        self.rows.iter().map(|r| r.geometry.as_ref())
    }

    pub(crate) fn geometries_mut(&mut self) -> impl Iterator<Item = &mut Option<GeometryValue>> {
        self.rows.iter_mut().map(|r| &mut r.geometry)
    }

    pub(crate) fn retain_rows<F>(&mut self, keep: F)
    where
        F: FnMut(&SpatialRow) -> bool,
    {
        self.rows.retain(keep);
    }
}

/// Column name to semantic type, in output order.
///
/// Derived from the transformed batch right before load and consumed by
/// the loader to build catalog column definitions.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableSchema {
    columns: Vec<(String, ColumnType)>,
}

impl TableSchema {
    /// Creates a schema from explicit columns.
    #[must_use]
    pub fn new(columns: Vec<(String, ColumnType)>) -> Self {
        Self { columns }
    }

    /// Derives the schema from an Arrow schema.
    #[must_use]
    pub fn from_arrow(schema: &Schema) -> Self {
        Self {
            columns: schema
                .fields()
                .iter()
                .map(|f| (f.name().clone(), f.data_type().column_type()))
                .collect(),
        }
    }

    /// Columns in order.
    pub fn columns(&self) -> impl Iterator<Item = (&str, &ColumnType)> {
        self.columns.iter().map(|(n, t)| (n.as_str(), t))
    }

    /// Type of a column.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ColumnType> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    /// Number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns `true` when the schema has no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Where one migration run writes its output. Immutable for the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationTarget {
    /// Destination bucket
    pub bucket: String,
    /// Key prefix, without slashes at either end
    pub key_prefix: String,
    /// Catalog database
    pub catalog_database: String,
    /// Catalog table name
    pub table_name: String,
    /// When the run started
    pub run_timestamp: DateTime<Utc>,
}

impl MigrationTarget {
    /// Builds the target for `table_name` from the sink configuration.
    pub fn new(
        sink: &SinkConfig,
        table_name: impl Into<String>,
        run_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            bucket: sink.bucket.clone(),
            key_prefix: sink.key_prefix.clone(),
            catalog_database: sink.catalog_database.clone(),
            table_name: table_name.into(),
            run_timestamp,
        }
    }

    /// Key prefix of the table directory: `{prefix}/{table}`.
    #[must_use]
    pub fn table_prefix(&self) -> String {
        if self.key_prefix.is_empty() {
            self.table_name.clone()
        } else {
            format!("{}/{}", self.key_prefix, self.table_name)
        }
    }

    /// Object key: `{prefix}/{table}/{table}.parquet`.
    #[must_use]
    pub fn object_key(&self) -> String {
        format!(
            "{}/{}.{OBJECT_EXTENSION}",
            self.table_prefix(),
            self.table_name
        )
    }

    /// Catalog location: the table directory, with a trailing slash.
    #[must_use]
    pub fn location(&self) -> String {
        format!("s3://{}/{}/", self.bucket, self.table_prefix())
    }

    /// Run identifier derived from the timestamp.
    #[must_use]
    pub fn run_id(&self) -> String {
        self.run_timestamp.format("%Y%m%d_%H%M%S").to_string()
    }
}
