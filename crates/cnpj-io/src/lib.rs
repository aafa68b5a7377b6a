//! # CNPJ IO - transfer, acquisition and catalog
//!
//! The I/O edges of the pipeline: the rclone-backed [`TransferAgent`]
//! implementation with bounded subprocess concurrency, the monthly archive
//! acquirer, and the persistent hash catalog that gates re-uploads.
//!
//! [`TransferAgent`]: cnpj_core::TransferAgent

pub mod catalog;
pub mod downloader;
pub mod rclone;

pub use catalog::{HashCatalog, ProcessedItem};
pub use downloader::WebDownloader;
pub use rclone::RclonePool;
