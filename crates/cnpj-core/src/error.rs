//! Error taxonomy for the pipeline stages.
//!
//! Only the kinds the recovery policy distinguishes get a variant; everything
//! else travels as `anyhow::Error` through the transparent wrapper.

/// Errors surfaced by the ETL stages.
#[derive(Debug, thiserror::Error)]
pub enum EtlError {
    /// An identifier did not survive strip/parse.
    #[error("malformed CNPJ: {0}")]
    MalformedCnpj(String),

    /// An upstream archive could not be downloaded after all attempts.
    #[error("download failed for {url}: {reason}")]
    DownloadFailed { url: String, reason: String },

    /// A prefix partition rendered but its upload did not return success.
    /// The hash catalog is left untouched for that prefix.
    #[error("upload failed for prefix {0}")]
    PrefixUploadFailed(String),

    /// The hash catalog could not be opened.
    #[error("hash catalog unavailable: {0}")]
    CatalogUnavailable(String),

    /// The hash catalog file exists but does not carry the expected schema.
    #[error("hash catalog corrupt: {0}")]
    CatalogCorrupt(String),

    /// Generic error wrapper keeping context and backtraces.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
