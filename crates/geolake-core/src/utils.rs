//! Utility functions and extension traits for spatial migrations.
//!
//! This module provides helpers for data type formatting and mapping,
//! identifier checks and table name normalization.

use arrow_schema::{DataType, TimeUnit};

use crate::types::ColumnType;

/// Extension trait for Arrow [`DataType`].
///
/// # Examples
///
/// ```
/// use arrow_schema::DataType;
/// use geolake_core::types::ColumnType;
/// use geolake_core::utils::ArrowDataTypeExt;
///
/// assert_eq!(DataType::Int64.format(), "Int64");
/// assert_eq!(DataType::Utf8.column_type(), ColumnType::String);
/// ```
pub trait ArrowDataTypeExt {
    /// Format the data type into a human-readable string.
    fn format(&self) -> String;

    /// Semantic column type of the data type.
    fn column_type(&self) -> ColumnType;
}

impl ArrowDataTypeExt for DataType {
    fn format(&self) -> String {
        match self {
            DataType::Boolean => "Boolean".to_string(),
            DataType::Int64 => "Int64".to_string(),
            DataType::Float64 => "Float64".to_string(),
            DataType::Utf8 => "String".to_string(),
            DataType::Timestamp(unit, tz) => {
                let tz_str = tz.as_ref().map_or("", |t| t.as_ref());
                format!("Timestamp({unit:?}, {tz_str})")
            },
            _ => format!("{self:?}"),
        }
    }

    fn column_type(&self) -> ColumnType {
        match self {
            DataType::Boolean => ColumnType::Boolean,
            DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64 => ColumnType::Integer,
            DataType::Float16 | DataType::Float32 | DataType::Float64 => ColumnType::Double,
            DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => ColumnType::String,
            DataType::Timestamp(_, _) => ColumnType::Timestamp,
            other => ColumnType::Other(other.format()),
        }
    }
}

/// Arrow data type used to store a column of the given type.
#[must_use]
pub fn arrow_type(column_type: &ColumnType) -> DataType {
    match column_type {
        ColumnType::Integer => DataType::Int64,
        ColumnType::Double => DataType::Float64,
        ColumnType::Boolean => DataType::Boolean,
        ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, None),
        ColumnType::String | ColumnType::Other(_) => DataType::Utf8,
    }
}

/// Returns `true` for `[A-Za-z_][A-Za-z0-9_]*`.
#[must_use]
pub fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Double-quotes an identifier for PostgreSQL.
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Catalog table name for a source table: schema dropped, lowercased.
///
/// ```
/// use geolake_core::utils::catalog_table_name;
///
/// assert_eq!(catalog_table_name("gis.Barrios"), "barrios");
/// ```
#[must_use]
pub fn catalog_table_name(source_table: &str) -> String {
    source_table
        .rsplit('.')
        .next()
        .unwrap_or(source_table)
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_common_types() {
        assert_eq!(DataType::Boolean.format(), "Boolean");
        assert_eq!(DataType::Int64.format(), "Int64");
        assert_eq!(DataType::Float64.format(), "Float64");
        assert_eq!(DataType::Utf8.format(), "String");
    }

    #[test]
    fn test_format_timestamp_without_timezone() {
        let dt = DataType::Timestamp(TimeUnit::Microsecond, None);
        let formatted = dt.format();
        assert!(formatted.starts_with("Timestamp("));
        assert!(formatted.contains("Microsecond"));
    }

    #[test]
    fn test_column_type_mapping() {
        assert_eq!(DataType::Int32.column_type(), ColumnType::Integer);
        assert_eq!(DataType::Float32.column_type(), ColumnType::Double);
        assert_eq!(DataType::LargeUtf8.column_type(), ColumnType::String);
        assert_eq!(
            DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())).column_type(),
            ColumnType::Timestamp
        );
        assert!(matches!(DataType::Binary.column_type(), ColumnType::Other(_)));
    }

    #[test]
    fn test_arrow_type_is_inverse_for_known_types() {
        for ty in [
            ColumnType::Integer,
            ColumnType::Double,
            ColumnType::String,
            ColumnType::Boolean,
            ColumnType::Timestamp,
        ] {
            assert_eq!(arrow_type(&ty).column_type(), ty);
        }
        assert_eq!(arrow_type(&ColumnType::Other("uuid".into())), DataType::Utf8);
    }

    #[test]
    fn test_plain_identifier() {
        assert!(is_plain_identifier("barrios"));
        assert!(is_plain_identifier("_t1"));
        assert!(!is_plain_identifier("1t"));
        assert!(!is_plain_identifier("t; drop table x"));
        assert!(!is_plain_identifier(""));
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("geom"), "\"geom\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_catalog_table_name() {
        assert_eq!(catalog_table_name("public.Barrios"), "barrios");
        assert_eq!(catalog_table_name("parks"), "parks");
    }
}
