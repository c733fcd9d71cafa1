//! FMCSA Carrier Registry API Library
//!
//! This library provides the core functionality for the carrier registry
//! service: the partitioned carrier store, the registry feed ingestion
//! pipeline, filtered search and export, lead scoring, and statistics.
//!
//! # Modules
//!
//! - `config`: Configuration management.
//! - `db`: Database connection and pool management.
//! - `errors`: Error handling types.
//! - `export`: CSV/XLSX export engine and artifact registry.
//! - `feed`: Upstream registry feed client.
//! - `filters`: Search filter validation and SQL lowering.
//! - `handlers`: HTTP request handlers.
//! - `ingest`: Feed record normalization and the refresh pipeline.
//! - `insurance_cache`: Read-only insurance side-channel cache.
//! - `jobs`: Background job registry and schedules.
//! - `models`: Core data models.
//! - `scoring`: Insurance status classification and lead scoring.
//! - `stats`: Aggregate statistics snapshots.
//! - `store`: Carrier persistence over the partitioned table.

pub mod config;
pub mod db;
pub mod errors;
pub mod export;
pub mod feed;
pub mod filters;
pub mod handlers;
pub mod ingest;
pub mod insurance_cache;
pub mod jobs;
pub mod models;
pub mod scoring;
pub mod stats;
pub mod store;
