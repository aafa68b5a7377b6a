//! # CNPJ ETL - ingestion and export engine
//!
//! The core of the pipeline: converts the monthly CSV tree into a prefix-
//! partitioned parquet dataset, projects one canonical JSON document per
//! establishment through a fixed join plan, diffs content hashes against the
//! persistent catalog, and uploads only what changed. A sampled integrity
//! check cross-reads the remote rendering.
//!
//! ## Stages
//!
//! - [`loader`]: CSV family → partitioned columnar dataset
//! - [`engine`]: the single analytical session and its query shapes
//! - [`export`]: per-prefix export → diff → upload orchestration
//! - [`archive`]: consolidated zip and manifest
//! - [`integrity`]: local-vs-remote sampled audit

pub mod archive;
pub mod codes;
pub mod document;
pub mod engine;
pub mod export;
pub mod integrity;
pub mod loader;
pub mod tables;
pub mod transcode;

pub use engine::QueryEngine;
pub use export::ExportOrchestrator;
pub use loader::CsvLoader;
