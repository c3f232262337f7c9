//! Key-based quality checks: duplicate detection and deduplication.
//!
//! Rows with a null key are never treated as duplicates of each other.

use std::collections::HashSet;

use crate::error::ValidationError;
use crate::types::{SpatialRowSet, Value};

/// Duplicate statistics for a key column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DuplicateKeys {
    /// Rows inspected
    pub total: usize,
    /// Distinct non-null keys
    pub unique: usize,
    /// Rows whose key is null
    pub nulls: usize,
    /// Rows repeating a key seen earlier
    pub duplicated: usize,
}

impl DuplicateKeys {
    /// Returns `true` when at least one key repeats.
    #[must_use]
    pub fn has_duplicates(&self) -> bool {
        self.duplicated > 0
    }
}

/// Counts duplicated values of `key`.
///
/// # Errors
///
/// Returns [`ValidationError::UnknownColumn`] when `key` is not a column.
pub fn duplicate_keys(rows: &SpatialRowSet, key: &str) -> Result<DuplicateKeys, ValidationError> {
    let index = key_index(rows, key)?;
    let mut seen = HashSet::new();
    let mut stats = DuplicateKeys {
        total: rows.len(),
        ..DuplicateKeys::default()
    };
    for row in rows.rows() {
        match key_of(&row.values[index]) {
            None => stats.nulls += 1,
            Some(k) => {
                if !seen.insert(k) {
                    stats.duplicated += 1;
                }
            },
        }
    }
    stats.unique = seen.len();
    Ok(stats)
}

/// Keeps the first row for every value of `key` and returns how many rows
/// were removed.
///
/// # Errors
///
/// Returns [`ValidationError::UnknownColumn`] when `key` is not a column.
pub fn deduplicate(rows: &mut SpatialRowSet, key: &str) -> Result<usize, ValidationError> {
    let index = key_index(rows, key)?;
    let before = rows.len();
    let mut seen = HashSet::new();
    rows.retain_rows(|row| key_of(&row.values[index]).is_none_or(|k| seen.insert(k)));
    Ok(before - rows.len())
}

fn key_index(rows: &SpatialRowSet, key: &str) -> Result<usize, ValidationError> {
    rows.column_index(key)
        .ok_or_else(|| ValidationError::UnknownColumn {
            column: key.to_string(),
        })
}

/// Hashable form of a key value. The variant is part of the key, so the
/// integer `1` and the text `"1"` stay distinct.
fn key_of(value: &Value) -> Option<String> {
    (!value.is_null()).then(|| format!("{value:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ColumnDef, ColumnType};

    fn rows(ids: &[Option<i64>]) -> SpatialRowSet {
        let mut rows = SpatialRowSet::new(
            vec![
                ColumnDef::new("id", ColumnType::Integer),
                ColumnDef::new("pos", ColumnType::Integer),
            ],
            "geom",
            4326,
        );
        for (pos, id) in ids.iter().enumerate() {
            let id = id.map_or(Value::Null, Value::Integer);
            rows.push(vec![id, Value::Integer(pos as i64)], None).unwrap();
        }
        rows
    }

    #[test]
    fn test_duplicate_keys() {
        let stats = duplicate_keys(&rows(&[Some(1), Some(2), Some(2), None]), "id").unwrap();
        assert_eq!(
            stats,
            DuplicateKeys {
                total: 4,
                unique: 2,
                nulls: 1,
                duplicated: 1
            }
        );
        assert!(stats.has_duplicates());
    }

    #[test]
    fn test_deduplicate_keeps_first() {
        let mut input = rows(&[Some(1), Some(2), Some(2), Some(1), Some(3)]);
        let removed = deduplicate(&mut input, "id").unwrap();
        assert_eq!(removed, 2);
        let positions: Vec<_> = input.rows().iter().map(|r| r.values[1].clone()).collect();
        assert_eq!(
            positions,
            vec![Value::Integer(0), Value::Integer(1), Value::Integer(4)]
        );
    }

    #[test]
    fn test_null_keys_are_kept() {
        let mut input = rows(&[None, None, Some(1)]);
        assert_eq!(deduplicate(&mut input, "id").unwrap(), 0);
        assert_eq!(input.len(), 3);
    }

    #[test]
    fn test_unknown_key_column() {
        let mut input = rows(&[Some(1)]);
        assert!(matches!(
            duplicate_keys(&input, "missing"),
            Err(ValidationError::UnknownColumn { .. })
        ));
        assert!(deduplicate(&mut input, "missing").is_err());
    }
}
