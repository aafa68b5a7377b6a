//! Diff-gated upload flow driven through a recording in-memory agent:
//! unchanged partitions upload nothing, changed rows upload exactly once,
//! and a failed upload leaves the catalog untouched.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use cnpj_core::{ProgressTx, TransferAgent};
use cnpj_etl::export::{content_hash, process_ndjson_file};
use cnpj_io::HashCatalog;

/// Flat local-directory "remote" that counts directory uploads.
struct RecordingAgent {
    remote: PathBuf,
    copy_dir_calls: AtomicUsize,
    uploaded: Mutex<Vec<String>>,
    fail_uploads: AtomicBool,
}

impl RecordingAgent {
    fn new(remote: &Path) -> Self {
        std::fs::create_dir_all(remote).unwrap();
        Self {
            remote: remote.to_path_buf(),
            copy_dir_calls: AtomicUsize::new(0),
            uploaded: Mutex::new(Vec::new()),
            fail_uploads: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl TransferAgent for RecordingAgent {
    async fn copy_dir(&self, local: &Path, _remote: &str, _progress: Option<ProgressTx>) -> Result<()> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            anyhow::bail!("remote unavailable");
        }
        self.copy_dir_calls.fetch_add(1, Ordering::SeqCst);
        for entry in std::fs::read_dir(local)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            std::fs::copy(entry.path(), self.remote.join(&name))?;
            self.uploaded.lock().unwrap().push(name);
        }
        Ok(())
    }

    async fn copy_file(&self, local: &Path, remote: &str) -> Result<()> {
        std::fs::copy(local, self.remote.join(remote))?;
        Ok(())
    }

    async fn fetch_file(&self, remote: &str, local: &Path) -> Result<()> {
        let source = self.remote.join(remote);
        if !source.exists() {
            anyhow::bail!("{remote} not on remote");
        }
        std::fs::copy(source, local)?;
        Ok(())
    }

    async fn exists(&self, remote: &str) -> Result<bool> {
        Ok(self.remote.join(remote).exists())
    }
}

fn write_ndjson(path: &Path, names: &[(&str, &str)]) {
    let lines: Vec<String> = names
        .iter()
        .map(|(cnpj, name)| format!(r#"{{"cnpj":"{cnpj}","razao_social":"{name}","uf":"SP"}}"#))
        .collect();
    std::fs::write(path, lines.join("\n") + "\n").unwrap();
}

#[tokio::test]
async fn unchanged_runs_upload_nothing() {
    let work = TempDir::new().unwrap();
    let agent = RecordingAgent::new(&work.path().join("remote"));
    let catalog = HashCatalog::open(&work.path().join("hash_cache"), &agent)
        .await
        .unwrap();

    let ndjson = work.path().join("12.ndjson");
    write_ndjson(
        &ndjson,
        &[("12000000000101", "ALFA"), ("12000000000202", "BETA")],
    );

    // Clean run: both documents upload, both hashes land in the catalog.
    let uploaded = process_ndjson_file(&ndjson, "12", &catalog, &agent)
        .await
        .unwrap();
    assert_eq!(uploaded, 2);
    assert_eq!(agent.copy_dir_calls.load(Ordering::SeqCst), 1);
    assert_eq!(catalog.count().await.unwrap(), 2);
    assert!(work
        .path()
        .join("remote")
        .join("12000000000101.json")
        .exists());
    // The scratch directory is cleaned up either way.
    assert!(!work.path().join("12").exists());

    // Identical input: the diff is empty and no upload happens.
    let uploaded = process_ndjson_file(&ndjson, "12", &catalog, &agent)
        .await
        .unwrap();
    assert_eq!(uploaded, 0);
    assert_eq!(agent.copy_dir_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn touching_one_row_uploads_exactly_that_row() {
    let work = TempDir::new().unwrap();
    let agent = RecordingAgent::new(&work.path().join("remote"));
    let catalog = HashCatalog::open(&work.path().join("hash_cache"), &agent)
        .await
        .unwrap();

    let ndjson = work.path().join("34.ndjson");
    write_ndjson(
        &ndjson,
        &[("34000000000101", "ALFA"), ("34000000000202", "BETA")],
    );
    process_ndjson_file(&ndjson, "34", &catalog, &agent)
        .await
        .unwrap();
    agent.uploaded.lock().unwrap().clear();

    // One legal name changes; only that identifier travels again.
    write_ndjson(
        &ndjson,
        &[("34000000000101", "ALFA RENOMEADA"), ("34000000000202", "BETA")],
    );
    let uploaded = process_ndjson_file(&ndjson, "34", &catalog, &agent)
        .await
        .unwrap();
    assert_eq!(uploaded, 1);
    assert_eq!(
        *agent.uploaded.lock().unwrap(),
        vec!["34000000000101.json".to_string()]
    );
    assert_eq!(catalog.count().await.unwrap(), 2);

    // The catalog now holds the new hash: a re-run is quiet.
    let uploaded = process_ndjson_file(&ndjson, "34", &catalog, &agent)
        .await
        .unwrap();
    assert_eq!(uploaded, 0);

    // And the stored remote document hashes to the stored catalog hash.
    let remote_doc = std::fs::read_to_string(
        work.path().join("remote").join("34000000000101.json"),
    )
    .unwrap();
    assert_eq!(
        content_hash(&remote_doc),
        content_hash(&cnpj_core::canonical::canonicalize(&remote_doc)),
        "uploaded documents are already canonical"
    );
}

#[tokio::test]
async fn failed_upload_leaves_catalog_untouched() {
    let work = TempDir::new().unwrap();
    let agent = RecordingAgent::new(&work.path().join("remote"));
    let catalog = HashCatalog::open(&work.path().join("hash_cache"), &agent)
        .await
        .unwrap();

    let ndjson = work.path().join("56.ndjson");
    write_ndjson(&ndjson, &[("56000000000101", "GAMA")]);

    agent.fail_uploads.store(true, Ordering::SeqCst);
    let err = process_ndjson_file(&ndjson, "56", &catalog, &agent).await;
    assert!(err.is_err());
    assert_eq!(catalog.count().await.unwrap(), 0);

    // The next run recomputes the same diff and succeeds.
    agent.fail_uploads.store(false, Ordering::SeqCst);
    let uploaded = process_ndjson_file(&ndjson, "56", &catalog, &agent)
        .await
        .unwrap();
    assert_eq!(uploaded, 1);
    assert_eq!(catalog.count().await.unwrap(), 1);
}

#[tokio::test]
async fn legacy_wrapped_lines_diff_like_direct_ones() {
    let work = TempDir::new().unwrap();
    let agent = RecordingAgent::new(&work.path().join("remote"));
    let catalog = HashCatalog::open(&work.path().join("hash_cache"), &agent)
        .await
        .unwrap();

    let ndjson = work.path().join("78.ndjson");
    write_ndjson(&ndjson, &[("78000000000101", "DELTA")]);
    process_ndjson_file(&ndjson, "78", &catalog, &agent)
        .await
        .unwrap();

    // The same document arriving in the legacy envelope is not a change.
    std::fs::write(
        &ndjson,
        r#"{"json_output":{"cnpj":"78000000000101","razao_social":"DELTA","uf":"SP"}}"#.to_string()
            + "\n",
    )
    .unwrap();
    let uploaded = process_ndjson_file(&ndjson, "78", &catalog, &agent)
        .await
        .unwrap();
    assert_eq!(uploaded, 0);
    assert_eq!(agent.copy_dir_calls.load(Ordering::SeqCst), 1);
}
