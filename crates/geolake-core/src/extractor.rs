//! Extraction of spatial tables from PostGIS.
//!
//! The [`RowSource`] trait is the seam the orchestrator talks to.
//! [`PostgisExtractor`] implements it with a lazily created `sqlx`
//! connection pool: columns are discovered from `information_schema`, the
//! select list casts every attribute to the semantic type vocabulary, and
//! geometries come back as WKT with their SRID.
//!
//! Filters are typed predicates. Column names are checked against the
//! discovered columns and quoted; values are always bound parameters.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::config::SourceConfig;
use crate::error::ExtractionError;
use crate::geometry::GeometryValue;
use crate::types::{ColumnDef, ColumnType, SpatialRowSet, Value};
use crate::utils::{is_plain_identifier, quote_ident};

/// Default schema for unqualified table names.
pub const DEFAULT_SCHEMA: &str = "public";

const MAX_CONNECTIONS: u32 = 4;
const WKT_ALIAS: &str = "__geolake_wkt";
const SRID_ALIAS: &str = "__geolake_srid";

/// Produces a spatial row set for a table.
#[async_trait]
pub trait RowSource: Send + Sync {
    /// Reads `table`, optionally restricted by `filter`.
    ///
    /// # Errors
    ///
    /// Returns an [`ExtractionError`] when the query fails, returns no
    /// rows, or yields geometries in an unexpected SRID.
    async fn extract(
        &self,
        table: &str,
        filter: Option<&SourceFilter>,
    ) -> Result<SpatialRowSet, ExtractionError>;
}

/// A `schema.table` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    /// Schema name
    pub schema: String,
    /// Table name
    pub table: String,
}

impl FromStr for TableRef {
    type Err = ExtractionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (schema, table) = match s.split_once('.') {
            Some((schema, table)) => (schema, table),
            None => (DEFAULT_SCHEMA, s),
        };
        for part in [schema, table] {
            if !is_plain_identifier(part) {
                return Err(ExtractionError::InvalidIdentifier {
                    identifier: s.to_string(),
                });
            }
        }
        Ok(Self {
            schema: schema.to_string(),
            table: table.to_string(),
        })
    }
}

impl TableRef {
    fn quoted(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// Comparison operator of a filter predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    /// `=`
    Eq,
    /// `<>`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl FilterOp {
    fn sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "<>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// One `column op value` predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    /// Attribute column
    pub column: String,
    /// Operator
    pub op: FilterOp,
    /// Comparison value; `Null` is only valid with `Eq` and `NotEq`
    pub value: Value,
}

impl FromStr for Predicate {
    type Err = String;

    /// Parses `column<op>value`, e.g. `district=Centro` or `pop>=1000`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const OPS: [(&str, FilterOp); 7] = [
            ("<>", FilterOp::NotEq),
            ("!=", FilterOp::NotEq),
            ("<=", FilterOp::Le),
            (">=", FilterOp::Ge),
            ("=", FilterOp::Eq),
            ("<", FilterOp::Lt),
            (">", FilterOp::Gt),
        ];
        let (position, token, op) = OPS
            .iter()
            .filter_map(|(token, op)| s.find(token).map(|p| (p, *token, *op)))
            .min_by_key(|(p, token, _)| (*p, std::cmp::Reverse(token.len())))
            .ok_or_else(|| format!("expected column<op>value, got '{s}'"))?;
        let column = s[..position].trim();
        if column.is_empty() {
            return Err(format!("missing column in '{s}'"));
        }
        Ok(Self {
            column: column.to_string(),
            op,
            value: parse_literal(s[position + token.len()..].trim()),
        })
    }
}

fn parse_literal(text: &str) -> Value {
    if text.eq_ignore_ascii_case("null") {
        Value::Null
    } else if let Ok(v) = text.parse::<i64>() {
        Value::Integer(v)
    } else if let Ok(v) = text.parse::<f64>() {
        Value::Double(v)
    } else if let Ok(v) = text.parse::<bool>() {
        Value::Boolean(v)
    } else {
        Value::String(text.to_string())
    }
}

/// Row selection applied at the source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceFilter {
    predicates: Vec<Predicate>,
    distinct_on: Option<String>,
}

impl SourceFilter {
    /// Creates an empty filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a predicate. Predicates are combined with `AND`.
    #[must_use]
    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// Shorthand for an equality predicate.
    #[must_use]
    pub fn eq(self, column: impl Into<String>, value: Value) -> Self {
        self.with_predicate(Predicate {
            column: column.into(),
            op: FilterOp::Eq,
            value,
        })
    }

    /// Keeps one row per value of `column` (the first in key order).
    #[must_use]
    pub fn with_distinct_on(mut self, column: impl Into<String>) -> Self {
        self.distinct_on = Some(column.into());
        self
    }

    /// Predicates in order.
    #[must_use]
    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    /// Deduplication column, if any.
    #[must_use]
    pub fn distinct_on(&self) -> Option<&str> {
        self.distinct_on.as_deref()
    }

    /// Returns `true` when the filter selects every row.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty() && self.distinct_on.is_none()
    }
}

/// A column as reported by `information_schema.columns`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SourceColumn {
    pub name: String,
    pub data_type: String,
    pub udt_name: String,
}

impl SourceColumn {
    fn is_geometry(&self) -> bool {
        self.udt_name == "geometry"
    }

    fn column_type(&self) -> ColumnType {
        match self.data_type.as_str() {
            "smallint" | "integer" | "bigint" => ColumnType::Integer,
            "real" | "double precision" | "numeric" => ColumnType::Double,
            "boolean" => ColumnType::Boolean,
            "timestamp without time zone" | "timestamp with time zone" => ColumnType::Timestamp,
            "text" | "character varying" | "character" => ColumnType::String,
            _ => ColumnType::Other(self.udt_name.clone()),
        }
    }

    /// Expression producing the column in its semantic type.
    fn cast_expr(&self) -> String {
        let q = quote_ident(&self.name);
        match self.column_type() {
            ColumnType::Integer => format!("{q}::bigint"),
            ColumnType::Double => format!("{q}::double precision"),
            ColumnType::Boolean => q,
            ColumnType::Timestamp if self.data_type == "timestamp with time zone" => {
                format!("({q} AT TIME ZONE 'UTC')")
            },
            ColumnType::Timestamp => q,
            ColumnType::String | ColumnType::Other(_) => format!("{q}::text"),
        }
    }
}

/// Splits discovered columns into attributes and the geometry column.
pub(crate) fn resolve_columns(
    table: &TableRef,
    columns: Vec<SourceColumn>,
    requested: Option<&str>,
) -> Result<(Vec<SourceColumn>, SourceColumn), ExtractionError> {
    if columns.is_empty() {
        return Err(ExtractionError::TableNotFound {
            table: table.to_string(),
        });
    }
    let position = match requested {
        Some(name) => columns
            .iter()
            .position(|c| c.name == name && c.is_geometry()),
        None => columns.iter().position(SourceColumn::is_geometry),
    };
    let Some(position) = position else {
        return Err(ExtractionError::NoGeometryColumn {
            table: table.to_string(),
            requested: requested.map(str::to_string),
        });
    };
    let mut attributes = columns;
    let geometry = attributes.remove(position);
    Ok((attributes, geometry))
}

/// SQL text plus its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ExtractQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

pub(crate) fn build_query(
    table: &TableRef,
    attributes: &[SourceColumn],
    geometry: &SourceColumn,
    filter: Option<&SourceFilter>,
) -> Result<ExtractQuery, ExtractionError> {
    let find = |name: &str| {
        attributes
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| ExtractionError::UnknownFilterColumn {
                table: table.to_string(),
                column: name.to_string(),
            })
    };

    let geom = quote_ident(&geometry.name);
    let mut select: Vec<String> = attributes
        .iter()
        .map(|c| format!("{} AS {}", c.cast_expr(), quote_ident(&c.name)))
        .collect();
    select.push(format!("ST_AsText({geom}) AS {WKT_ALIAS}"));
    select.push(format!("ST_SRID({geom}) AS {SRID_ALIAS}"));

    let mut params = Vec::new();
    let mut conditions = Vec::new();
    let mut distinct = None;
    if let Some(filter) = filter {
        for predicate in filter.predicates() {
            let column = find(&predicate.column)?;
            conditions.push(predicate_sql(column, predicate, &mut params)?);
        }
        if let Some(key) = filter.distinct_on() {
            distinct = Some(quote_ident(&find(key)?.name));
        }
    }

    let mut sql = String::from("SELECT ");
    if let Some(key) = &distinct {
        sql.push_str(&format!("DISTINCT ON ({key}) "));
    }
    sql.push_str(&select.join(", "));
    sql.push_str(&format!(" FROM {}", table.quoted()));
    if !conditions.is_empty() {
        sql.push_str(&format!(" WHERE {}", conditions.join(" AND ")));
    }
    if let Some(key) = &distinct {
        sql.push_str(&format!(" ORDER BY {key}"));
    }
    Ok(ExtractQuery { sql, params })
}

fn predicate_sql(
    column: &SourceColumn,
    predicate: &Predicate,
    params: &mut Vec<Value>,
) -> Result<String, ExtractionError> {
    let expr = column.cast_expr();
    if predicate.value.is_null() {
        return match predicate.op {
            FilterOp::Eq => Ok(format!("{expr} IS NULL")),
            FilterOp::NotEq => Ok(format!("{expr} IS NOT NULL")),
            _ => Err(ExtractionError::InvalidFilter {
                column: column.name.clone(),
                message: "NULL can only be compared with = or <>".to_string(),
            }),
        };
    }
    let value = coerce(&predicate.value, &column.column_type()).ok_or_else(|| {
        ExtractionError::InvalidFilter {
            column: column.name.clone(),
            message: format!(
                "value '{}' is not a valid {}",
                predicate.value,
                column.column_type().name()
            ),
        }
    })?;
    params.push(value);
    Ok(format!("{expr} {} ${}", predicate.op.sql(), params.len()))
}

/// Converts a filter literal to the column's semantic type.
fn coerce(value: &Value, column_type: &ColumnType) -> Option<Value> {
    match (column_type, value) {
        (ColumnType::Integer, Value::Integer(_))
        | (ColumnType::Double, Value::Double(_))
        | (ColumnType::Boolean, Value::Boolean(_))
        | (ColumnType::Timestamp, Value::Timestamp(_)) => Some(value.clone()),
        #[allow(clippy::cast_precision_loss)]
        (ColumnType::Double, Value::Integer(v)) => Some(Value::Double(*v as f64)),
        (ColumnType::Integer, Value::String(s)) => s.parse().ok().map(Value::Integer),
        (ColumnType::Double, Value::String(s)) => s.parse().ok().map(Value::Double),
        (ColumnType::Boolean, Value::String(s)) => s.parse().ok().map(Value::Boolean),
        (ColumnType::Timestamp, Value::String(s)) => parse_timestamp(s).map(Value::Timestamp),
        (ColumnType::String | ColumnType::Other(_), v) => Some(Value::String(v.to_string())),
        _ => None,
    }
}

fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// PostGIS-backed [`RowSource`].
///
/// The connection pool is created on first use and shared by every later
/// extraction through this extractor.
pub struct PostgisExtractor {
    config: SourceConfig,
    pool: OnceCell<PgPool>,
}

impl PostgisExtractor {
    /// Creates an extractor. No connection is opened yet.
    #[must_use]
    pub fn new(config: SourceConfig) -> Self {
        Self {
            config,
            pool: OnceCell::new(),
        }
    }

    async fn pool(&self) -> Result<&PgPool, ExtractionError> {
        self.pool
            .get_or_try_init(|| async {
                debug!(url = %self.config.display_url(), "connecting to source database");
                let options = PgConnectOptions::new()
                    .host(&self.config.host)
                    .port(self.config.port)
                    .database(&self.config.database)
                    .username(&self.config.user)
                    .password(&self.config.password);
                PgPoolOptions::new()
                    .max_connections(MAX_CONNECTIONS)
                    .connect_with(options)
                    .await
            })
            .await
            .map_err(|e| ExtractionError::Connection {
                source: Box::new(e),
            })
    }

    /// Closes the pool if it was opened.
    pub async fn close(&self) {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
        }
    }

    async fn discover_columns(
        &self,
        pool: &PgPool,
        table: &TableRef,
    ) -> Result<Vec<SourceColumn>, ExtractionError> {
        let rows = sqlx::query(
            "SELECT column_name::text, data_type::text, udt_name::text \
             FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 \
             ORDER BY ordinal_position",
        )
        .bind(&table.schema)
        .bind(&table.table)
        .fetch_all(pool)
        .await
        .map_err(|e| query_error(table, e))?;

        rows.iter()
            .map(|row| {
                Ok(SourceColumn {
                    name: row.try_get(0)?,
                    data_type: row.try_get(1)?,
                    udt_name: row.try_get(2)?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(|e| query_error(table, e))
    }
}

#[async_trait]
impl RowSource for PostgisExtractor {
    async fn extract(
        &self,
        table: &str,
        filter: Option<&SourceFilter>,
    ) -> Result<SpatialRowSet, ExtractionError> {
        let table_ref: TableRef = table.parse()?;
        let pool = self.pool().await?;

        let columns = self.discover_columns(pool, &table_ref).await?;
        let (attributes, geometry) =
            resolve_columns(&table_ref, columns, self.config.geometry_column.as_deref())?;
        let query = build_query(&table_ref, &attributes, &geometry, filter)?;
        debug!(table, sql = %query.sql, params = query.params.len(), "running extraction query");

        let mut statement = sqlx::query(&query.sql);
        for param in &query.params {
            statement = match param {
                Value::Integer(v) => statement.bind(*v),
                Value::Double(v) => statement.bind(*v),
                Value::Boolean(v) => statement.bind(*v),
                Value::Timestamp(v) => statement.bind(*v),
                Value::String(v) => statement.bind(v.clone()),
                Value::Null => statement.bind(None::<String>),
            };
        }
        let rows = statement
            .fetch_all(pool)
            .await
            .map_err(|e| query_error(&table_ref, e))?;

        if rows.is_empty() {
            return Err(ExtractionError::Empty {
                table: table_ref.to_string(),
            });
        }

        let defs: Vec<ColumnDef> = attributes
            .iter()
            .map(|c| ColumnDef::new(&c.name, c.column_type()))
            .collect();
        let mut row_set =
            SpatialRowSet::new(defs, &geometry.name, self.config.required_srid);
        for (index, row) in rows.iter().enumerate() {
            let (values, geometry, srid) =
                decode_row(row, row_set.columns()).map_err(|e| query_error(&table_ref, e))?;
            if let Some(found) = srid {
                if found != self.config.required_srid {
                    return Err(ExtractionError::SridMismatch {
                        table: table_ref.to_string(),
                        expected: self.config.required_srid,
                        found,
                    });
                }
            }
            let geometry = geometry
                .map(|wkt| GeometryValue::from_wkt(&wkt))
                .transpose()
                .map_err(|message| ExtractionError::Geometry { row: index, message })?;
            row_set.push(values, geometry)?;
        }

        info!(table = %table_ref, rows = row_set.len(), "extracted rows");
        Ok(row_set)
    }
}

type DecodedRow = (Vec<Value>, Option<String>, Option<i32>);

fn decode_row(row: &PgRow, columns: &[ColumnDef]) -> Result<DecodedRow, sqlx::Error> {
    let mut values = Vec::with_capacity(columns.len());
    for (i, column) in columns.iter().enumerate() {
        let value = match column.column_type {
            ColumnType::Integer => row.try_get::<Option<i64>, _>(i)?.map(Value::Integer),
            ColumnType::Double => row.try_get::<Option<f64>, _>(i)?.map(Value::Double),
            ColumnType::Boolean => row.try_get::<Option<bool>, _>(i)?.map(Value::Boolean),
            ColumnType::Timestamp => row
                .try_get::<Option<NaiveDateTime>, _>(i)?
                .map(Value::Timestamp),
            ColumnType::String | ColumnType::Other(_) => {
                row.try_get::<Option<String>, _>(i)?.map(Value::String)
            },
        };
        values.push(value.unwrap_or(Value::Null));
    }
    let wkt: Option<String> = row.try_get(WKT_ALIAS)?;
    let srid: Option<i32> = row.try_get(SRID_ALIAS)?;
    Ok((values, wkt, srid))
}

fn query_error(table: &TableRef, e: sqlx::Error) -> ExtractionError {
    ExtractionError::Query {
        table: table.to_string(),
        source: Box::new(e),
    }
}
