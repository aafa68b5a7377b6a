//! Persistent content-hash catalog.
//!
//! A single-file SQLite table mapping each identifier to the xxh3 hash of its
//! canonical document. The catalog is pre-populated from the remote
//! `hashes.zip` when the local file is absent, probed in chunks during the
//! diff phase, written in batched transactions, and published back to the
//! remote root at the end of a run. All mutating access is serialized by one
//! catalog-wide mutex; the connection is the only writer.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use tokio::sync::Mutex;
use tracing::{info, warn};

use cnpj_core::{EtlError, TransferAgent};

const DB_FILE: &str = "hashes.db";
const REMOTE_ARCHIVE: &str = "hashes.zip";
const PROBE_CHUNK: usize = 500;
const COMMIT_BATCH: usize = 10_000;

/// One parsed document ready for diffing: identifier, canonical JSON, hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedItem {
    pub cnpj: String,
    pub json: String,
    pub hash: String,
}

/// The identifier → hash store.
pub struct HashCatalog {
    connection: Mutex<Option<Connection>>,
    db_path: PathBuf,
}

impl HashCatalog {
    /// Open the catalog under `dir`, fetching the remote copy when no local
    /// database exists yet.
    pub async fn open(dir: &Path, agent: &dyn TransferAgent) -> Result<Self, EtlError> {
        std::fs::create_dir_all(dir)
            .map_err(|e| EtlError::CatalogUnavailable(format!("create {}: {e}", dir.display())))?;
        let db_path = dir.join(DB_FILE);

        if !db_path.exists() {
            if let Err(err) = prefetch_remote(dir, agent).await {
                warn!(%err, "no remote hash catalog, starting empty");
            }
        }

        let connection = Connection::open(&db_path)
            .map_err(|e| EtlError::CatalogUnavailable(e.to_string()))?;

        connection
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS hashes (
                    cnpj TEXT PRIMARY KEY NOT NULL,
                    hash TEXT NOT NULL,
                    created_at DATETIME DEFAULT CURRENT_TIMESTAMP
                );
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA cache_size = -84000;
                PRAGMA temp_store = MEMORY;
                PRAGMA mmap_size = 30000000000;",
            )
            .map_err(|e| EtlError::CatalogUnavailable(e.to_string()))?;

        // An existing file with the wrong shape is corruption, not emptiness.
        connection
            .prepare("SELECT cnpj, hash, created_at FROM hashes LIMIT 1")
            .map_err(|e| EtlError::CatalogCorrupt(e.to_string()))?;

        info!(db = %db_path.display(), "hash catalog ready");
        Ok(Self {
            connection: Mutex::new(Some(connection)),
            db_path,
        })
    }

    /// Keep the items that are new or whose hash changed, in input order.
    pub async fn diff(&self, items: Vec<ProcessedItem>) -> Result<Vec<ProcessedItem>> {
        let guard = self.connection.lock().await;
        let connection = guard
            .as_ref()
            .ok_or_else(|| EtlError::CatalogUnavailable("catalog closed".into()))?;

        let mut kept = Vec::new();
        let mut new_count = 0usize;
        let mut update_count = 0usize;

        for chunk in items.chunks(PROBE_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!("SELECT cnpj, hash FROM hashes WHERE cnpj IN ({placeholders})");
            let mut stmt = connection.prepare(&sql)?;
            let existing: HashMap<String, String> = stmt
                .query_map(
                    rusqlite::params_from_iter(chunk.iter().map(|item| item.cnpj.as_str())),
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?
                .collect::<rusqlite::Result<_>>()?;

            for item in chunk {
                match existing.get(&item.cnpj) {
                    None => {
                        new_count += 1;
                        kept.push(item.clone());
                    }
                    Some(hash) if hash != &item.hash => {
                        update_count += 1;
                        kept.push(item.clone());
                    }
                    Some(_) => {}
                }
            }
        }

        if new_count > 0 || update_count > 0 {
            info!(new = new_count, updated = update_count, "catalog diff");
        }
        Ok(kept)
    }

    /// Upsert a batch, committing every [`COMMIT_BATCH`] rows.
    pub async fn add_batch(&self, items: &[ProcessedItem]) -> Result<()> {
        let mut guard = self.connection.lock().await;
        let connection = guard
            .as_mut()
            .ok_or_else(|| EtlError::CatalogUnavailable("catalog closed".into()))?;

        for chunk in items.chunks(COMMIT_BATCH) {
            let tx = connection.transaction()?;
            {
                let mut stmt = tx
                    .prepare_cached("INSERT OR REPLACE INTO hashes (cnpj, hash) VALUES (?1, ?2)")?;
                for item in chunk {
                    stmt.execute(params![item.cnpj, item.hash])?;
                }
            }
            tx.commit()?;
        }
        Ok(())
    }

    /// Number of rows currently in the catalog.
    pub async fn count(&self) -> Result<usize> {
        let guard = self.connection.lock().await;
        let connection = guard
            .as_ref()
            .ok_or_else(|| EtlError::CatalogUnavailable("catalog closed".into()))?;
        let count: i64 = connection.query_row("SELECT COUNT(*) FROM hashes", [], |r| r.get(0))?;
        Ok(count as usize)
    }

    /// Close the writer, package the database as `hashes.zip` and upload it
    /// to the remote root. Upload failure is a warning; the local database is
    /// authoritative for the next run either way.
    pub async fn publish(&self, agent: &dyn TransferAgent) -> Result<()> {
        let mut guard = self.connection.lock().await;
        // Closing checkpoints the WAL so the copied file is self-contained.
        match guard.take() {
            Some(connection) => {
                if let Err((_, err)) = connection.close() {
                    warn!(%err, "closing hash catalog");
                }
            }
            None => return Ok(()),
        }
        drop(guard);

        let scratch = tempfile::tempdir().context("catalog scratch dir")?;
        let zip_path = scratch.path().join(REMOTE_ARCHIVE);
        let db_path = self.db_path.clone();
        let zip_target = zip_path.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let db_copy = zip_target.with_file_name(DB_FILE);
            std::fs::copy(&db_path, &db_copy).context("copy database")?;

            let file = std::fs::File::create(&zip_target).context("create hashes.zip")?;
            let mut zip = zip::ZipWriter::new(file);
            let options = zip::write::FileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated);
            zip.start_file(DB_FILE, options)?;
            zip.write_all(&std::fs::read(&db_copy)?)?;
            zip.finish()?;
            Ok(())
        })
        .await??;

        info!("uploading hash catalog");
        if let Err(err) = agent.copy_file(&zip_path, REMOTE_ARCHIVE).await {
            warn!(%err, "hash catalog upload failed; next run resumes from local state");
        }
        Ok(())
    }
}

/// Fetch and unpack the remote catalog archive into `dir`.
async fn prefetch_remote(dir: &Path, agent: &dyn TransferAgent) -> Result<()> {
    if !agent.exists(REMOTE_ARCHIVE).await? {
        anyhow::bail!("remote {REMOTE_ARCHIVE} not found");
    }

    let scratch = tempfile::tempdir().context("catalog download dir")?;
    let zip_path = scratch.path().join(REMOTE_ARCHIVE);
    agent.fetch_file(REMOTE_ARCHIVE, &zip_path).await?;

    let target = dir.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = std::fs::File::open(&zip_path)?;
        let mut zip = zip::ZipArchive::new(file).context("read hashes.zip")?;
        zip.extract(&target).context("unpack hashes.zip")?;
        Ok(())
    })
    .await??;

    info!("hash catalog restored from remote");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cnpj_core::ProgressTx;

    /// Agent that has nothing and records nothing; the catalog starts empty.
    struct EmptyRemote;

    #[async_trait]
    impl TransferAgent for EmptyRemote {
        async fn copy_dir(&self, _: &Path, _: &str, _: Option<ProgressTx>) -> Result<()> {
            Ok(())
        }
        async fn copy_file(&self, _: &Path, _: &str) -> Result<()> {
            Ok(())
        }
        async fn fetch_file(&self, _: &str, _: &Path) -> Result<()> {
            anyhow::bail!("not found")
        }
        async fn exists(&self, _: &str) -> Result<bool> {
            Ok(false)
        }
    }

    fn item(cnpj: &str, hash: &str) -> ProcessedItem {
        ProcessedItem {
            cnpj: cnpj.into(),
            json: format!("{{\"cnpj\":\"{cnpj}\"}}"),
            hash: hash.into(),
        }
    }

    #[tokio::test]
    async fn diff_keeps_new_and_changed_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = HashCatalog::open(dir.path(), &EmptyRemote).await.unwrap();

        let first = vec![item("11111111000111", "h1"), item("22222222000122", "h2")];
        let kept = catalog.diff(first.clone()).await.unwrap();
        assert_eq!(kept, first);

        catalog.add_batch(&kept).await.unwrap();
        assert_eq!(catalog.count().await.unwrap(), 2);

        // Unchanged inputs diff to nothing.
        let kept = catalog.diff(first.clone()).await.unwrap();
        assert!(kept.is_empty());

        // A changed hash comes back, the untouched row does not.
        let second = vec![item("11111111000111", "h1-new"), item("22222222000122", "h2")];
        let kept = catalog.diff(second).await.unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].cnpj, "11111111000111");
        assert_eq!(kept[0].hash, "h1-new");
    }

    #[tokio::test]
    async fn add_batch_replaces_existing_rows() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = HashCatalog::open(dir.path(), &EmptyRemote).await.unwrap();

        catalog.add_batch(&[item("11111111000111", "h1")]).await.unwrap();
        catalog.add_batch(&[item("11111111000111", "h2")]).await.unwrap();

        assert_eq!(catalog.count().await.unwrap(), 1);
        let kept = catalog.diff(vec![item("11111111000111", "h2")]).await.unwrap();
        assert!(kept.is_empty());
    }

    #[tokio::test]
    async fn catalog_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let catalog = HashCatalog::open(dir.path(), &EmptyRemote).await.unwrap();
            catalog.add_batch(&[item("33333333000133", "h3")]).await.unwrap();
        }
        let reopened = HashCatalog::open(dir.path(), &EmptyRemote).await.unwrap();
        assert_eq!(reopened.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn diff_spans_probe_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = HashCatalog::open(dir.path(), &EmptyRemote).await.unwrap();

        let items: Vec<ProcessedItem> = (0..1200)
            .map(|i| item(&format!("{i:014}"), &format!("h{i}")))
            .collect();
        catalog.add_batch(&items).await.unwrap();

        // Change every third hash; diff must find exactly those, in order.
        let probe: Vec<ProcessedItem> = items
            .iter()
            .enumerate()
            .map(|(i, it)| {
                if i % 3 == 0 {
                    item(&it.cnpj, "changed")
                } else {
                    it.clone()
                }
            })
            .collect();
        let kept = catalog.diff(probe).await.unwrap();
        assert_eq!(kept.len(), 400);
        assert!(kept.iter().all(|it| it.hash == "changed"));
        let mut sorted = kept.clone();
        sorted.sort_by(|a, b| a.cnpj.cmp(&b.cnpj));
        assert_eq!(kept, sorted, "input order preserved");
    }
}
