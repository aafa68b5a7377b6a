//! Per-partition export, diff and upload loop.
//!
//! For each of the hundred prefixes: emit the partition as NDJSON under the
//! engine mutex, parse and hash it off the async threads, diff against the
//! hash catalog, write the surviving documents into a scratch directory,
//! upload that directory, and only then record the hashes. An upload failure
//! leaves the catalog untouched so the next run re-computes the same diff.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use cnpj_core::{canonical, cnpj, EtlError, TransferAgent};
use cnpj_io::catalog::{HashCatalog, ProcessedItem};

use crate::engine::QueryEngine;

/// Hex rendering of the xxh3-64 content hash.
pub fn content_hash(text: &str) -> String {
    format!("{:016x}", xxh3_64(text.as_bytes()))
}

/// Parse one NDJSON line into a diffable item.
///
/// Accepts both the direct document shape and the legacy line shape that
/// wraps the document under a `json_output` key. Lines without a `cnpj`
/// field are dropped.
pub fn parse_ndjson_line(line: &str) -> Option<ProcessedItem> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    let mut document = match value {
        serde_json::Value::Object(mut map) if map.contains_key("json_output") => {
            map.remove("json_output")?
        }
        other => other,
    };

    let cnpj = document.get("cnpj")?.as_str()?.to_string();
    if cnpj.is_empty() {
        return None;
    }

    canonical::clean_value(&mut document);
    let json = serde_json::to_string(&document).ok()?;
    let hash = content_hash(&json);
    Some(ProcessedItem { cnpj, json, hash })
}

/// Drives the export → diff → upload loop across all prefixes.
pub struct ExportOrchestrator {
    engine: Arc<QueryEngine>,
    catalog: Arc<HashCatalog>,
    agent: Arc<dyn TransferAgent>,
    output_dir: PathBuf,
    max_parallel: usize,
}

impl ExportOrchestrator {
    /// `max_parallel` of 0 means "one task per CPU".
    pub fn new(
        engine: Arc<QueryEngine>,
        catalog: Arc<HashCatalog>,
        agent: Arc<dyn TransferAgent>,
        output_dir: impl Into<PathBuf>,
        max_parallel: usize,
    ) -> Self {
        let max_parallel = if max_parallel == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(8)
        } else {
            max_parallel
        };
        Self {
            engine,
            catalog,
            agent,
            output_dir: output_dir.into(),
            max_parallel,
        }
    }

    /// Process every prefix, then publish the catalog. Prefix failures are
    /// collected so every partition gets its chance before the run fails.
    pub async fn export_and_upload(&self, cancel: &CancellationToken) -> Result<()> {
        std::fs::create_dir_all(&self.output_dir)?;

        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut tasks = JoinSet::new();

        for prefix in cnpj::all_prefixes() {
            let engine = self.engine.clone();
            let catalog = self.catalog.clone();
            let agent = self.agent.clone();
            let output_dir = self.output_dir.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.child_token();

            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .context("export pool closed")?;
                if cancel.is_cancelled() {
                    return Ok(());
                }
                process_prefix(&engine, &catalog, agent.as_ref(), &output_dir, &prefix).await
            });
        }

        let mut first_error: Option<anyhow::Error> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(%err, "prefix export failed");
                    first_error.get_or_insert(err);
                }
                Err(err) => {
                    first_error.get_or_insert(err.into());
                }
            }
        }

        // Hashes recorded so far are valid regardless of later failures.
        self.catalog.publish(self.agent.as_ref()).await?;

        match first_error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

async fn process_prefix(
    engine: &QueryEngine,
    catalog: &HashCatalog,
    agent: &dyn TransferAgent,
    output_dir: &Path,
    prefix: &str,
) -> Result<()> {
    let ndjson = output_dir.join(format!("{prefix}.ndjson"));
    let rows = engine.export_prefix_ndjson(prefix, &ndjson).await?;
    if rows == 0 {
        let _ = std::fs::remove_file(&ndjson);
        debug!(prefix, "no establishments in partition");
        return Ok(());
    }

    let uploaded = process_ndjson_file(&ndjson, prefix, catalog, agent).await?;
    let _ = std::fs::remove_file(&ndjson);
    info!(prefix, rows, uploaded, "prefix complete");
    Ok(())
}

/// Diff and upload one NDJSON file. Returns the number of documents
/// uploaded; zero means the partition had no changes. Exposed for tests,
/// which drive it with a stub agent.
pub async fn process_ndjson_file(
    path: &Path,
    prefix: &str,
    catalog: &HashCatalog,
    agent: &dyn TransferAgent,
) -> Result<usize> {
    // Line parsing and hashing are CPU-bound; keep them off the async threads.
    let source = path.to_path_buf();
    let items = tokio::task::spawn_blocking(move || -> Result<Vec<ProcessedItem>> {
        let file = std::fs::File::open(&source)
            .with_context(|| format!("open {}", source.display()))?;
        let reader = std::io::BufReader::with_capacity(1 << 20, file);
        let mut items = Vec::new();
        for line in reader.lines() {
            if let Some(item) = parse_ndjson_line(&line?) {
                items.push(item);
            }
        }
        Ok(items)
    })
    .await??;

    if items.is_empty() {
        info!(prefix, "partition output carried no documents");
        return Ok(0);
    }

    let keep = catalog.diff(items).await?;
    if keep.is_empty() {
        info!(prefix, "no changes");
        return Ok(0);
    }

    let scratch = path.parent().unwrap_or(Path::new(".")).join(prefix);
    let scratch_dir = scratch.clone();
    let keep = tokio::task::spawn_blocking(move || -> Result<Vec<ProcessedItem>> {
        std::fs::create_dir_all(&scratch_dir)?;
        for item in &keep {
            std::fs::write(
                scratch_dir.join(format!("{}.json", item.cnpj)),
                item.json.as_bytes(),
            )?;
        }
        Ok(keep)
    })
    .await??;

    let (progress_tx, mut progress_rx) = tokio::sync::mpsc::unbounded_channel();
    let progress_prefix = prefix.to_string();
    let progress_task = tokio::spawn(async move {
        while let Some(pct) = progress_rx.recv().await {
            debug!(prefix = %progress_prefix, pct, "upload progress");
        }
    });

    let upload = agent.copy_dir(&scratch, "", Some(progress_tx)).await;
    let _ = progress_task.await;
    let _ = std::fs::remove_dir_all(&scratch);

    match upload {
        Ok(()) => {
            catalog.add_batch(&keep).await?;
            Ok(keep.len())
        }
        Err(err) => {
            warn!(prefix, %err, "upload failed, catalog untouched");
            Err(EtlError::PrefixUploadFailed(prefix.to_string()).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_sixteen_hex_digits() {
        let hash = content_hash("{\"cnpj\":\"12345678000190\"}");
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, content_hash("{\"cnpj\":\"12345678000190\"}"));
        assert_ne!(hash, content_hash("{\"cnpj\":\"12345678000191\"}"));
    }

    #[test]
    fn parses_direct_document_lines() {
        let item = parse_ndjson_line(r#"{"cnpj":"12345678000190","razao_social":"A   B"}"#)
            .expect("item");
        assert_eq!(item.cnpj, "12345678000190");
        assert_eq!(item.json, r#"{"cnpj":"12345678000190","razao_social":"A B"}"#);
        assert_eq!(item.hash, content_hash(&item.json));
    }

    #[test]
    fn parses_legacy_wrapped_lines() {
        let item = parse_ndjson_line(r#"{"json_output":{"cnpj":"12345678000190","uf":"SP"}}"#)
            .expect("item");
        assert_eq!(item.cnpj, "12345678000190");
        assert_eq!(item.json, r#"{"cnpj":"12345678000190","uf":"SP"}"#);
    }

    #[test]
    fn wrapped_and_direct_shapes_hash_identically() {
        let direct = parse_ndjson_line(r#"{"cnpj":"12345678000190","uf":"SP"}"#).unwrap();
        let wrapped =
            parse_ndjson_line(r#"{"json_output":{"cnpj":"12345678000190","uf":"SP"}}"#).unwrap();
        assert_eq!(direct.hash, wrapped.hash);
    }

    #[test]
    fn rejects_lines_without_identifier() {
        assert!(parse_ndjson_line("").is_none());
        assert!(parse_ndjson_line("   ").is_none());
        assert!(parse_ndjson_line("not json").is_none());
        assert!(parse_ndjson_line(r#"{"uf":"SP"}"#).is_none());
        assert!(parse_ndjson_line(r#"{"cnpj":""}"#).is_none());
    }
}
