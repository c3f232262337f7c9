//! Display utilities for formatting CLI output.
//!
//! This module provides table row structures and formatting functions
//! for presenting migration results in a human-readable format.

use tabled::{Table, Tabled};

use geolake_core::config::Config;
use geolake_core::operations::MigrationSummary;
use geolake_core::validator::ValidationReport;
use geolake_core::verify::VerificationReport;

/// A named value, one per line of a two-column table.
#[derive(Tabled)]
pub struct PropertyRow {
    /// What is shown.
    #[tabled(rename = "Property")]
    pub property: String,
    /// Its value.
    #[tabled(rename = "Value")]
    pub value: String,
}

impl PropertyRow {
    fn new(property: &str, value: impl ToString) -> Self {
        Self {
            property: property.to_string(),
            value: value.to_string(),
        }
    }
}

/// Table row representation for a column registered in the catalog.
#[derive(Tabled)]
pub struct ColumnRow {
    /// Column name.
    #[tabled(rename = "Column")]
    pub name: String,
    /// Catalog type of the column.
    #[tabled(rename = "Type")]
    pub column_type: String,
}

/// Table row representation for a validation finding.
#[derive(Tabled)]
pub struct FindingRow {
    /// `error` or `warning`.
    #[tabled(rename = "Level")]
    pub level: String,
    /// Finding text.
    #[tabled(rename = "Message")]
    pub message: String,
}

fn yes_no(value: bool) -> &'static str {
    if value { "Yes" } else { "No" }
}

/// Rows describing a finished migration.
#[must_use]
pub fn summary_rows(summary: &MigrationSummary) -> Vec<PropertyRow> {
    let target = &summary.target;
    let mut rows = vec![
        PropertyRow::new("Source table", &summary.source_table),
        PropertyRow::new(
            "Catalog table",
            format!("{}.{}", target.catalog_database, target.table_name),
        ),
        PropertyRow::new("Location", &summary.load.location),
        PropertyRow::new("Object key", &summary.load.key),
        PropertyRow::new("Rows extracted", summary.rows_extracted),
    ];
    if let Some(existed) = summary.table_existed {
        rows.push(PropertyRow::new("Table existed", yes_no(existed)));
    }
    if let Some(duplicates) = &summary.duplicates {
        rows.push(PropertyRow::new(
            "Duplicate keys",
            format!(
                "{} duplicated, {} null, {} removed",
                duplicates.duplicated, duplicates.nulls, summary.duplicates_removed
            ),
        ));
    }
    if summary.repaired > 0 {
        rows.push(PropertyRow::new("Repaired geometries", summary.repaired));
    }
    rows.push(PropertyRow::new(
        "Validation",
        summary
            .validation
            .as_ref()
            .map_or_else(|| "skipped".to_string(), validation_outcome),
    ));
    rows.push(PropertyRow::new("Rows loaded", summary.rows_loaded));
    rows.push(PropertyRow::new("Bytes uploaded", summary.load.bytes));
    rows.push(PropertyRow::new("Table created", yes_no(summary.load.table_created)));
    rows.push(PropertyRow::new(
        "Verification",
        summary.verification.as_ref().map_or_else(
            || "skipped".to_string(),
            |v| format!("{} of {} rows visible", v.total_records, v.expected),
        ),
    ));
    let elapsed = summary.finished_at - summary.started_at;
    rows.push(PropertyRow::new(
        "Duration",
        format!("{:.1}s", elapsed.num_milliseconds() as f64 / 1000.0),
    ));
    rows
}

fn validation_outcome(report: &ValidationReport) -> String {
    format!(
        "{} ({} errors, {} warnings)",
        if report.is_valid { "passed" } else { "failed" },
        report.errors.len(),
        report.warnings.len()
    )
}

/// Findings of a validation report, errors first.
#[must_use]
pub fn finding_rows(report: &ValidationReport) -> Vec<FindingRow> {
    let errors = report.errors.iter().map(|m| ("error", m));
    let warnings = report.warnings.iter().map(|m| ("warning", m));
    errors
        .chain(warnings)
        .map(|(level, message)| FindingRow {
            level: level.to_string(),
            message: message.clone(),
        })
        .collect()
}

/// Rows of a verification report.
#[must_use]
pub fn verification_rows(report: &VerificationReport) -> Vec<PropertyRow> {
    vec![
        PropertyRow::new("Table", &report.table),
        PropertyRow::new("Expected rows", report.expected),
        PropertyRow::new("Visible rows", report.total_records),
        PropertyRow::new(
            "Unique keys",
            report
                .unique_keys
                .map_or_else(|| "N/A".to_string(), |n| n.to_string()),
        ),
        PropertyRow::new("Empty geometries", report.empty_geometries),
        PropertyRow::new("Counts match", yes_no(report.matches())),
    ]
}

/// Rows of the effective configuration. The password is never shown.
#[must_use]
pub fn config_rows(config: &Config) -> Vec<PropertyRow> {
    let source = &config.source;
    let sink = &config.sink;
    vec![
        PropertyRow::new("Source", source.display_url()),
        PropertyRow::new("Required SRID", source.required_srid),
        PropertyRow::new(
            "Geometry column",
            source.geometry_column.as_deref().unwrap_or("auto-detect"),
        ),
        PropertyRow::new("Region", &sink.region),
        PropertyRow::new("Bucket", &sink.bucket),
        PropertyRow::new("Key prefix", &sink.key_prefix),
        PropertyRow::new("Catalog database", &sink.catalog_database),
        PropertyRow::new("Catalog backend", sink.catalog_backend.as_str()),
        PropertyRow::new("Query output", sink.query_output_location()),
        PropertyRow::new("Query timeout", format!("{}s", sink.query_timeout.as_secs())),
        PropertyRow::new(
            "Poll interval",
            format!("{}ms", sink.poll_interval.as_millis()),
        ),
        PropertyRow::new("Empty geometry", config.geometry.sentinel()),
    ]
}

/// Display the outcome of a migration in a formatted table.
pub fn display_summary(summary: &MigrationSummary) {
    println!("\nMigration of {} completed", summary.source_table);
    println!("{}", Table::new(summary_rows(summary)));

    if !summary.schema.is_empty() {
        println!("\n=== Columns ===");
        let columns: Vec<ColumnRow> = summary
            .schema
            .columns()
            .map(|(name, column_type)| ColumnRow {
                name: name.to_string(),
                column_type: column_type.name().to_string(),
            })
            .collect();
        println!("{}", Table::new(columns));
    }
}

/// Display a validation report with its counters and findings.
pub fn display_validation(table: &str, report: &ValidationReport) {
    let details = &report.details;
    println!("\nValidation of {table}: {}", validation_outcome(report));

    let counters = vec![
        PropertyRow::new("Rows", details.total_rows),
        PropertyRow::new("Null geometries", details.null_geometries),
        PropertyRow::new("Invalid geometries", details.invalid_geometries),
        PropertyRow::new("SRID", details.srid),
    ];
    println!("{}", Table::new(counters));

    let findings = finding_rows(report);
    if !findings.is_empty() {
        println!("\n=== Findings ===");
        println!("{}", Table::new(findings));
    }
}

/// Display a verification report.
pub fn display_verification(report: &VerificationReport) {
    println!("\nVerification of {}", report.table);
    println!("{}", Table::new(verification_rows(report)));
}

/// Display the effective configuration.
pub fn display_config(config: &Config) {
    println!("\nEffective configuration:");
    println!("{}", Table::new(config_rows(config)));
}
