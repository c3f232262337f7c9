//! Geometry and SRID validation.
//!
//! Validation is read-only: it never modifies the row set. Null geometries
//! are reported as warnings, invalid geometries and an unexpected SRID as
//! errors. Whether errors stop a migration is decided by the caller.

use chrono::{DateTime, Utc};

use crate::error::ValidationError;
use crate::types::SpatialRowSet;

/// Counters collected during validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValidationDetails {
    /// Rows inspected
    pub total_rows: usize,
    /// Rows with a null geometry
    pub null_geometries: usize,
    /// Rows whose geometry failed the validity predicate
    pub invalid_geometries: usize,
    /// SRID recorded on the row set
    pub srid: i32,
}

/// Outcome of validating a row set.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    /// `true` exactly when `errors` is empty
    pub is_valid: bool,
    /// Blocking findings
    pub errors: Vec<String>,
    /// Informational findings
    pub warnings: Vec<String>,
    /// When the report was produced
    pub validated_at: DateTime<Utc>,
    /// Raw counters
    pub details: ValidationDetails,
}

impl ValidationReport {
    /// Converts the report into an error when it is not valid.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Failed`] carrying the report's errors.
    pub fn into_result(self) -> Result<Self, ValidationError> {
        if self.is_valid {
            Ok(self)
        } else {
            Err(ValidationError::Failed {
                errors: self.errors,
            })
        }
    }
}

/// Checks geometries of a row set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validator {
    expected_srid: i32,
}

impl Validator {
    /// Creates a validator requiring `expected_srid`.
    #[must_use]
    pub const fn new(expected_srid: i32) -> Self {
        Self { expected_srid }
    }

    /// Validates every geometry of `rows`.
    #[must_use]
    pub fn validate(&self, rows: &SpatialRowSet) -> ValidationReport {
        let mut details = ValidationDetails {
            total_rows: rows.len(),
            srid: rows.srid(),
            ..ValidationDetails::default()
        };
        for geometry in rows.geometries() {
            match geometry {
                None => details.null_geometries += 1,
                Some(g) if !g.is_valid() => details.invalid_geometries += 1,
                Some(_) => {},
            }
        }

        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        if details.null_geometries > 0 {
            warnings.push(format!("Found {} null geometries", details.null_geometries));
        }
        if details.invalid_geometries > 0 {
            errors.push(format!(
                "Found {} invalid geometries",
                details.invalid_geometries
            ));
        }
        if rows.srid() != self.expected_srid {
            errors.push(format!(
                "SRID mismatch: expected {}, found {}",
                self.expected_srid,
                rows.srid()
            ));
        }

        ValidationReport {
            is_valid: errors.is_empty(),
            errors,
            warnings,
            validated_at: Utc::now(),
            details,
        }
    }
}
