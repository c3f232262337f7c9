//! Conversion of spatial row sets into Parquet buffers.
//!
//! The geometry column is replaced by its WKT text. Null geometries become
//! the sentinel of the configured [`EmptyGeometryPolicy`], so the WKT
//! column never contains nulls. Attributes keep their semantic type.

use std::io::Cursor;
use std::sync::Arc;

use arrow_array::{
    ArrayRef, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray,
    TimestampMicrosecondArray,
};
use arrow_schema::{ArrowError, Field, Schema};
use bytes::Bytes;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use tracing::debug;

use crate::error::TransformationError;
use crate::geometry::EmptyGeometryPolicy;
use crate::types::{ColumnDef, ColumnType, SpatialRowSet, Value};
use crate::utils::arrow_type;

/// Options for [`SpatialTransformer`].
#[derive(Debug, Clone)]
pub struct TransformOptions {
    /// Sentinel used for null geometries
    pub empty_geometry: EmptyGeometryPolicy,
    /// Name of the WKT column; defaults to the geometry column name
    pub wkt_column: Option<String>,
    /// Parquet compression codec
    pub compression: Compression,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            empty_geometry: EmptyGeometryPolicy::default(),
            wkt_column: None,
            compression: Compression::SNAPPY,
        }
    }
}

impl TransformOptions {
    /// Set the empty geometry policy.
    #[must_use]
    pub fn with_empty_geometry(mut self, policy: EmptyGeometryPolicy) -> Self {
        self.empty_geometry = policy;
        self
    }

    /// Rename the WKT column.
    #[must_use]
    pub fn with_wkt_column(mut self, name: impl Into<String>) -> Self {
        self.wkt_column = Some(name.into());
        self
    }

    /// Set the compression codec.
    #[must_use]
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }
}

/// Turns row sets into Arrow batches and Parquet bytes.
#[derive(Debug, Clone, Default)]
pub struct SpatialTransformer {
    options: TransformOptions,
}

impl SpatialTransformer {
    /// Creates a transformer.
    #[must_use]
    pub fn new(options: TransformOptions) -> Self {
        Self { options }
    }

    /// The sentinel written for null geometries.
    #[must_use]
    pub fn sentinel(&self) -> String {
        self.options.empty_geometry.sentinel()
    }

    /// Name of the WKT column for `rows`.
    #[must_use]
    pub fn wkt_column<'a>(&'a self, rows: &'a SpatialRowSet) -> &'a str {
        self.options
            .wkt_column
            .as_deref()
            .unwrap_or_else(|| rows.geometry_column())
    }

    /// Converts `rows` to a complete in-memory Parquet file.
    ///
    /// # Errors
    ///
    /// Returns [`TransformationError::EmptyInput`] for an empty row set and
    /// an Arrow or Parquet error when serialization fails.
    pub fn transform_to_columnar(&self, rows: &SpatialRowSet) -> Result<Bytes, TransformationError> {
        let batch = self.to_record_batch(rows)?;
        self.write_parquet(&batch)
    }

    /// Builds one record batch: attribute columns in order, then WKT.
    ///
    /// # Errors
    ///
    /// Returns [`TransformationError::EmptyInput`] for an empty row set,
    /// [`TransformationError::Row`] when a value does not match its column
    /// and [`TransformationError::Arrow`] when the batch is inconsistent.
    pub fn to_record_batch(&self, rows: &SpatialRowSet) -> Result<RecordBatch, TransformationError> {
        if rows.is_empty() {
            return Err(TransformationError::EmptyInput);
        }
        let wkt_name = self.wkt_column(rows);
        if rows.column_index(wkt_name).is_some() {
            return Err(ArrowError::SchemaError(format!(
                "WKT column '{wkt_name}' collides with an attribute column"
            ))
            .into());
        }

        let mut fields = Vec::with_capacity(rows.columns().len() + 1);
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(rows.columns().len() + 1);
        for (index, column) in rows.columns().iter().enumerate() {
            fields.push(Field::new(&column.name, arrow_type(&column.column_type), true));
            arrays.push(column_array(rows, index, column)?);
        }

        let sentinel = self.sentinel();
        let wkt: StringArray = rows
            .geometries()
            .map(|g| Some(g.map_or(sentinel.as_str(), |g| g.wkt())))
            .collect();
        fields.push(Field::new(wkt_name, arrow_schema::DataType::Utf8, false));
        arrays.push(Arc::new(wkt));

        Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
    }

    /// Serializes a batch into Parquet bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TransformationError::Parquet`] when writing fails.
    pub fn write_parquet(&self, batch: &RecordBatch) -> Result<Bytes, TransformationError> {
        let props = WriterProperties::builder()
            .set_compression(self.options.compression)
            .set_created_by(format!("geolake {}", env!("CARGO_PKG_VERSION")))
            .build();
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let mut writer = ArrowWriter::try_new(&mut cursor, batch.schema(), Some(props))?;
        writer.write(batch)?;
        writer.close()?;

        let bytes = Bytes::from(cursor.into_inner());
        debug!(rows = batch.num_rows(), bytes = bytes.len(), "wrote parquet buffer");
        Ok(bytes)
    }
}

fn column_array(
    rows: &SpatialRowSet,
    index: usize,
    column: &ColumnDef,
) -> Result<ArrayRef, TransformationError> {
    let values = rows.rows().iter().map(|r| &r.values[index]);
    let mismatch = |row: usize, value: &Value| TransformationError::Row {
        row,
        message: format!(
            "value {value:?} does not match column '{}' of type {}",
            column.name,
            column.column_type.name()
        ),
    };

    let array: ArrayRef = match &column.column_type {
        ColumnType::Integer => Arc::new(
            values
                .enumerate()
                .map(|(row, v)| match v {
                    Value::Null => Ok(None),
                    Value::Integer(i) => Ok(Some(*i)),
                    other => Err(mismatch(row, other)),
                })
                .collect::<Result<Int64Array, _>>()?,
        ),
        ColumnType::Double => Arc::new(
            values
                .enumerate()
                .map(|(row, v)| match v {
                    Value::Null => Ok(None),
                    Value::Double(d) => Ok(Some(*d)),
                    other => Err(mismatch(row, other)),
                })
                .collect::<Result<Float64Array, _>>()?,
        ),
        ColumnType::Boolean => Arc::new(
            values
                .enumerate()
                .map(|(row, v)| match v {
                    Value::Null => Ok(None),
                    Value::Boolean(b) => Ok(Some(*b)),
                    other => Err(mismatch(row, other)),
                })
                .collect::<Result<BooleanArray, _>>()?,
        ),
        ColumnType::Timestamp => Arc::new(
            values
                .enumerate()
                .map(|(row, v)| match v {
                    Value::Null => Ok(None),
                    Value::Timestamp(t) => Ok(Some(t.and_utc().timestamp_micros())),
                    other => Err(mismatch(row, other)),
                })
                .collect::<Result<TimestampMicrosecondArray, _>>()?,
        ),
        ColumnType::String | ColumnType::Other(_) => Arc::new(
            values
                .enumerate()
                .map(|(row, v)| match v {
                    Value::Null => Ok(None),
                    Value::String(s) => Ok(Some(s.as_str())),
                    other => Err(mismatch(row, other)),
                })
                .collect::<Result<StringArray, _>>()?,
        ),
    };
    Ok(array)
}

/// Decodes a Parquet buffer into its record batches.
///
/// # Errors
///
/// Returns [`TransformationError`] when the buffer is not valid Parquet.
pub fn read_back(bytes: &Bytes) -> Result<Vec<RecordBatch>, TransformationError> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(bytes.clone())?.build()?;
    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch?);
    }
    Ok(batches)
}
