//! Application configuration.
//!
//! A JSON record on disk, every field optional with a default. Section and
//! key names are accepted both in snake_case and in the legacy PascalCase
//! spelling. A missing or malformed file silently falls back to full
//! defaults. `RCLONE_REMOTE` in the environment overrides the configured
//! remote base.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    #[serde(alias = "DataDir")]
    pub data_dir: String,
    #[serde(alias = "ParquetDir")]
    pub parquet_dir: String,
    #[serde(alias = "OutputDir")]
    pub output_dir: String,
    #[serde(alias = "DownloadDir")]
    pub download_dir: String,
    #[serde(alias = "HashCacheDir")]
    pub hash_cache_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: "./extracted_data".into(),
            parquet_dir: "./parquet_data".into(),
            output_dir: "./cnpj_ndjson".into(),
            download_dir: "./downloads".into(),
            hash_cache_dir: "./hash_cache".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RcloneSettings {
    #[serde(alias = "RemoteBase")]
    pub remote_base: String,
    #[serde(alias = "Transfers")]
    pub transfers: usize,
    #[serde(alias = "MaxConcurrentUploads")]
    pub max_concurrent_uploads: usize,
}

impl Default for RcloneSettings {
    fn default() -> Self {
        Self {
            remote_base: String::new(),
            transfers: 100,
            max_concurrent_uploads: 4,
        }
    }
}

/// Analytical-engine tuning. The section keeps its historical `duckdb` name
/// in config files; `engine` is accepted as well.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Parsed for compatibility; the session is always in-memory.
    #[serde(alias = "UseInMemory")]
    pub use_in_memory: bool,
    #[serde(alias = "ThreadsPragma")]
    pub threads_pragma: usize,
    #[serde(alias = "MemoryLimit")]
    pub memory_limit: String,
    #[serde(alias = "EngineThreads")]
    pub engine_threads: usize,
    #[serde(alias = "PreserveInsertionOrder")]
    pub preserve_insertion_order: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            use_in_memory: true,
            threads_pragma: 2,
            memory_limit: "5GB".into(),
            engine_threads: 2,
            preserve_insertion_order: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NdjsonSettings {
    #[serde(alias = "BatchUploadSize")]
    pub batch_upload_size: usize,
    /// 0 means "use the CPU count".
    #[serde(alias = "MaxParallelProcessing")]
    pub max_parallel_processing: usize,
}

impl Default for NdjsonSettings {
    fn default() -> Self {
        Self {
            batch_upload_size: 10_000,
            max_parallel_processing: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderSettings {
    #[serde(alias = "ParallelDownloads")]
    pub parallel_downloads: usize,
}

impl Default for DownloaderSettings {
    fn default() -> Self {
        Self {
            parallel_downloads: 6,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(alias = "Paths")]
    pub paths: PathsConfig,
    #[serde(alias = "Rclone")]
    pub rclone: RcloneSettings,
    #[serde(alias = "DuckDb", alias = "engine", alias = "Engine")]
    pub duckdb: EngineSettings,
    #[serde(alias = "Ndjson")]
    pub ndjson: NdjsonSettings,
    #[serde(alias = "Downloader")]
    pub downloader: DownloaderSettings,
}

impl AppConfig {
    /// Load configuration from `path`, or `./config.json` when absent.
    /// Any read or parse failure yields the defaults.
    pub fn load(path: Option<&Path>) -> Self {
        let default_path = Path::new("config.json");
        let path = path.unwrap_or(default_path);

        let mut config = match std::fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str::<AppConfig>(&text) {
                Ok(config) => config,
                Err(err) => {
                    debug!(path = %path.display(), %err, "config did not parse, using defaults");
                    AppConfig::default()
                }
            },
            Err(_) => AppConfig::default(),
        };

        if let Ok(remote) = std::env::var("RCLONE_REMOTE") {
            if !remote.is_empty() {
                config.rclone.remote_base = remote;
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.paths.data_dir, "./extracted_data");
        assert_eq!(config.paths.parquet_dir, "./parquet_data");
        assert_eq!(config.paths.output_dir, "./cnpj_ndjson");
        assert_eq!(config.rclone.transfers, 100);
        assert_eq!(config.rclone.max_concurrent_uploads, 4);
        assert_eq!(config.duckdb.memory_limit, "5GB");
        assert!(!config.duckdb.preserve_insertion_order);
        assert_eq!(config.ndjson.batch_upload_size, 10_000);
        assert_eq!(config.ndjson.max_parallel_processing, 8);
        assert_eq!(config.downloader.parallel_downloads, 6);
    }

    #[test]
    fn parses_snake_case_sections() {
        let text = r#"{
            "paths": {"data_dir": "/srv/data"},
            "downloader": {"parallel_downloads": 12},
            "unknown_section": {"ignored": true}
        }"#;
        let config: AppConfig = serde_json::from_str(text).unwrap();
        assert_eq!(config.paths.data_dir, "/srv/data");
        assert_eq!(config.paths.parquet_dir, "./parquet_data");
        assert_eq!(config.downloader.parallel_downloads, 12);
    }

    #[test]
    fn parses_legacy_pascal_case() {
        let text = r#"{
            "Paths": {"DataDir": "/legacy"},
            "Rclone": {"MaxConcurrentUploads": 2},
            "DuckDb": {"MemoryLimit": "8GB"}
        }"#;
        let config: AppConfig = serde_json::from_str(text).unwrap();
        assert_eq!(config.paths.data_dir, "/legacy");
        assert_eq!(config.rclone.max_concurrent_uploads, 2);
        assert_eq!(config.duckdb.memory_limit, "8GB");
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = std::env::temp_dir();
        let path = dir.join("cnpj_config_malformed_test.json");
        std::fs::write(&path, "{ not json").unwrap();
        let config = AppConfig::load(Some(&path));
        assert_eq!(config.ndjson.batch_upload_size, 10_000);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = AppConfig::load(Some(Path::new("/nonexistent/config.json")));
        assert_eq!(config.downloader.parallel_downloads, 6);
    }
}
