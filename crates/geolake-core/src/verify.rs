//! Post-load reconciliation through the query service.
//!
//! After a load the table is counted through the query service and the
//! result is compared with the number of rows written. The same query also
//! reports distinct keys and how many geometries hold the empty sentinel.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::VerificationError;
use crate::query::{QueryResults, QueryRunner};

/// What to reconcile for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationCheck {
    /// Catalog table
    pub table: String,
    /// Column whose distinct values are counted
    pub key_column: Option<String>,
    /// WKT column
    pub wkt_column: String,
    /// Text written for null geometries
    pub sentinel: String,
    /// Rows written by the load
    pub expected_rows: u64,
}

/// Counts observed through the query service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    /// Catalog table
    pub table: String,
    /// Rows written by the load
    pub expected: u64,
    /// Rows visible through the query service
    pub total_records: u64,
    /// Distinct key values, when a key column was given
    pub unique_keys: Option<u64>,
    /// Rows whose WKT equals the empty sentinel
    pub empty_geometries: u64,
    /// When the check ran
    pub verified_at: DateTime<Utc>,
}

impl VerificationReport {
    /// Returns `true` when the visible row count equals the expected one.
    #[must_use]
    pub fn matches(&self) -> bool {
        self.total_records == self.expected
    }

    /// Converts a mismatching report into an error.
    ///
    /// # Errors
    ///
    /// Returns [`VerificationError::RowCountMismatch`] when the counts
    /// differ.
    pub fn ensure_matches(self) -> Result<Self, VerificationError> {
        if self.matches() {
            Ok(self)
        } else {
            Err(VerificationError::RowCountMismatch {
                table: self.table,
                expected: self.expected,
                found: self.total_records,
            })
        }
    }
}

/// Runs reconciliation queries.
#[derive(Clone)]
pub struct Verifier {
    runner: QueryRunner,
}

impl Verifier {
    /// Creates a verifier querying through `runner`.
    #[must_use]
    pub fn new(runner: QueryRunner) -> Self {
        Self { runner }
    }

    /// Counts rows, distinct keys and empty geometries of a loaded table.
    ///
    /// # Errors
    ///
    /// Returns [`VerificationError::Query`] when the query fails and
    /// [`VerificationError::MalformedResult`] when the result is not one
    /// row of counts.
    pub async fn verify(
        &self,
        check: &VerificationCheck,
    ) -> Result<VerificationReport, VerificationError> {
        let sql = count_query(self.runner.database(), check);
        let results = self.runner.run(&sql).await?;
        let (total_records, unique_keys, empty_geometries) = parse_counts(&results)?;

        let report = VerificationReport {
            table: check.table.clone(),
            expected: check.expected_rows,
            total_records,
            unique_keys,
            empty_geometries,
            verified_at: Utc::now(),
        };
        if report.matches() {
            info!(
                table = %report.table,
                rows = report.total_records,
                unique_keys = ?report.unique_keys,
                empty_geometries = report.empty_geometries,
                "row counts match"
            );
        } else {
            warn!(
                table = %report.table,
                expected = report.expected,
                found = report.total_records,
                "row count mismatch"
            );
        }
        Ok(report)
    }

    /// Whether `table` is registered in the runner's database.
    ///
    /// # Errors
    ///
    /// Returns [`VerificationError::Query`] when the listing fails.
    pub async fn table_exists(&self, table: &str) -> Result<bool, VerificationError> {
        let sql = format!(
            "SHOW TABLES IN `{}` '{}'",
            self.runner.database().replace('`', "``"),
            table.replace('\'', "''")
        );
        let results = self.runner.run(&sql).await?;
        Ok(results
            .rows
            .iter()
            .any(|row| row.first().and_then(Option::as_deref) == Some(table)))
    }
}

fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub(crate) fn count_query(database: &str, check: &VerificationCheck) -> String {
    let unique = check.key_column.as_deref().map_or_else(
        || "CAST(NULL AS bigint)".to_string(),
        |key| format!("COUNT(DISTINCT {})", quote(key)),
    );
    format!(
        "SELECT COUNT(*) AS total_records, {unique} AS unique_keys, \
         COUNT(CASE WHEN {} = '{}' THEN 1 END) AS empty_geometries \
         FROM {}.{}",
        quote(&check.wkt_column),
        check.sentinel.replace('\'', "''"),
        quote(database),
        quote(&check.table),
    )
}

fn parse_counts(results: &QueryResults) -> Result<(u64, Option<u64>, u64), VerificationError> {
    let [row] = results.rows.as_slice() else {
        return Err(VerificationError::MalformedResult(format!(
            "expected one row, got {}",
            results.rows.len()
        )));
    };
    let count = |index: usize| -> Result<Option<u64>, VerificationError> {
        match row.get(index) {
            None => Err(VerificationError::MalformedResult(format!(
                "missing column {index}"
            ))),
            Some(None) => Ok(None),
            Some(Some(text)) => text.parse().map(Some).map_err(|_| {
                VerificationError::MalformedResult(format!("'{text}' is not a count"))
            }),
        }
    };
    let required = |index: usize| -> Result<u64, VerificationError> {
        count(index)?.ok_or_else(|| {
            VerificationError::MalformedResult(format!("column {index} is null"))
        })
    };
    Ok((required(0)?, count(1)?, required(2)?))
}
