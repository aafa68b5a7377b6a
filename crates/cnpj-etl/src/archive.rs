//! Consolidated archive and manifest.
//!
//! The archive packs every document as `<cnpj>.json`, streamed prefix by
//! prefix so only one partition is materialized at a time. The manifest
//! records the establishment count, archive size and an MD5 checksum in the
//! base64-of-raw-bytes form the downstream mirror expects.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use cnpj_core::{cnpj, TransferAgent};

use crate::engine::QueryEngine;

const ZIP_URL: &str = "https://file.opencnpj.org/cnpjs.zip";

#[derive(Debug, Serialize)]
struct Manifest {
    total: i64,
    last_updated: String,
    zip_size: u64,
    zip_url: &'static str,
    zip_md5checksum: String,
}

/// Build `cnpj_jsons_<timestamp>.zip` under `output_dir` from the full
/// dataset. Returns the archive path.
pub async fn build_consolidated_archive(
    engine: &QueryEngine,
    output_dir: &Path,
) -> Result<PathBuf> {
    std::fs::create_dir_all(output_dir)?;
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let zip_path = output_dir.join(format!("cnpj_jsons_{timestamp}.zip"));

    let file = std::fs::File::create(&zip_path)
        .with_context(|| format!("create {}", zip_path.display()))?;
    let mut zip = zip::ZipWriter::new(file);
    let options =
        zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let mut entries = 0usize;
    for prefix in cnpj::all_prefixes() {
        let rows = engine.project_prefix(&prefix).await?;
        for (cnpj, json) in rows {
            zip.start_file(format!("{cnpj}.json"), options)?;
            zip.write_all(json.as_bytes())?;
            entries += 1;
        }
    }
    zip.finish()?;

    let size = zip_path.metadata().map(|m| m.len()).unwrap_or(0);
    info!(path = %zip_path.display(), entries, size, "consolidated archive built");
    Ok(zip_path)
}

/// Upload `info.json` describing the finished run.
pub async fn publish_manifest(
    engine: &QueryEngine,
    agent: &dyn TransferAgent,
    zip_path: &Path,
) -> Result<()> {
    let total = engine.count_establishments().await?;
    let zip_size = zip_path.metadata().map(|m| m.len()).unwrap_or(0);

    let checksum_path = zip_path.to_path_buf();
    let zip_md5checksum =
        tokio::task::spawn_blocking(move || file_md5_base64(&checksum_path)).await??;

    let manifest = Manifest {
        total,
        last_updated: chrono::Utc::now().to_rfc3339(),
        zip_size,
        zip_url: ZIP_URL,
        zip_md5checksum,
    };

    let scratch = tempfile::tempdir().context("manifest scratch dir")?;
    let local = scratch.path().join("info.json");
    std::fs::write(&local, serde_json::to_string(&manifest)?)?;

    agent.copy_file(&local, "info.json").await?;
    info!(total, zip_size, "manifest uploaded");
    Ok(())
}

/// MD5 of a file, streamed in 64 KiB chunks, base64 over the raw digest.
fn file_md5_base64(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut context = md5::Context::new();
    let mut buf = [0u8; 65536];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        context.consume(&buf[..n]);
    }
    Ok(base64::encode(context.compute().0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_checksum_matches_known_vectors() {
        let dir = tempfile::tempdir().unwrap();

        // md5("") = d41d8cd98f00b204e9800998ecf8427e
        let empty = dir.path().join("empty");
        std::fs::write(&empty, b"").unwrap();
        assert_eq!(file_md5_base64(&empty).unwrap(), "1B2M2Y8AsgTpgAmY7PhCfg==");

        // md5("abc") = 900150983cd24fb0d6963f7d28e17f72
        let abc = dir.path().join("abc");
        std::fs::write(&abc, b"abc").unwrap();
        assert_eq!(file_md5_base64(&abc).unwrap(), "kAFQmDzST7DWlj99KOF/cg==");
    }

    #[test]
    fn manifest_serializes_expected_fields() {
        let manifest = Manifest {
            total: 42,
            last_updated: "2024-05-01T00:00:00+00:00".into(),
            zip_size: 1234,
            zip_url: ZIP_URL,
            zip_md5checksum: "abc=".into(),
        };
        let json = serde_json::to_string(&manifest).unwrap();
        assert!(json.contains("\"total\":42"));
        assert!(json.contains("\"zip_url\":\"https://file.opencnpj.org/cnpjs.zip\""));
        assert!(json.contains("\"zip_md5checksum\":\"abc=\""));
    }
}
