//! `geolake-core` is the core library for the `geolake` project, moving spatial tables from
//! PostGIS into an S3 data lake queryable through the Glue catalog and Athena.
//!
//! This crate includes:
//! - **Extraction**: reading a table with its geometry column as WKT ([`extractor`]).
//! - **Data quality**: geometry and SRID validation ([`validator`]), duplicate keys
//!   ([`quality`]) and opt-in geometry repair ([`geometry`]).
//! - **Transformation**: row sets to in-memory Parquet buffers ([`transformer`]).
//! - **Loading**: object upload and external table registration ([`loader`], [`catalog`]).
//! - **Verification**: row-count reconciliation through Athena ([`verify`], [`query`]).
//!
//! The [`operations`] module sequences these stages for one table per run.

pub mod catalog;
pub mod config;
pub mod error;
pub mod extractor;
pub mod geometry;
pub mod loader;
pub mod operations;
pub mod quality;
pub mod query;
pub mod transformer;
pub mod types;
pub mod utils;
pub mod validator;
pub mod verify;
