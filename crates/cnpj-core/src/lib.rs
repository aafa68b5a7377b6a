//! # CNPJ Core - shared types for the CNPJ ETL pipeline
//!
//! This crate provides the foundational pieces shared by every stage of the
//! ETL: the identifier codec, the canonical JSON form that content hashes are
//! computed over, the configuration record, the error taxonomy, and the
//! transfer-agent seam behind which the object store lives.
//!
//! ## Key Components
//!
//! - **Identifier codec**: parse, normalize and partition-key the 14-character
//!   alphanumeric CNPJ identifiers ([`cnpj`])
//! - **Canonical JSON**: whitespace-normalized, compact, key-order-preserving
//!   serialization used as the pre-image of content hashes ([`canonical`])
//! - **Configuration**: JSON-backed record with defaults for every knob
//!   ([`config`])
//! - **TransferAgent**: the trait the upload/download stages are written
//!   against, implemented by the rclone pool and by test stubs

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

pub mod canonical;
pub mod cnpj;
pub mod config;
pub mod error;

pub use config::AppConfig;
pub use error::EtlError;

/// Upload progress observations, as percentages in `0..=100`.
pub type ProgressTx = mpsc::UnboundedSender<u8>;

/// The object-store seam.
///
/// Remote paths are relative to the agent's configured remote root; an empty
/// remote path addresses the root itself. Implementations are expected to
/// carry their own retry policy; callers treat a returned error as final.
#[async_trait]
pub trait TransferAgent: Send + Sync {
    /// Recursively copy a local directory into the remote path, reporting
    /// percentage progress through `progress` when provided.
    async fn copy_dir(&self, local: &Path, remote: &str, progress: Option<ProgressTx>)
        -> Result<()>;

    /// Copy a single local file to the remote path.
    async fn copy_file(&self, local: &Path, remote: &str) -> Result<()>;

    /// Fetch a remote file to a local path. Succeeds only if the local file
    /// exists afterwards.
    async fn fetch_file(&self, remote: &str, local: &Path) -> Result<()>;

    /// Whether the remote path currently exists.
    async fn exists(&self, remote: &str) -> Result<bool>;
}
