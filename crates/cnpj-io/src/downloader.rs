//! Monthly archive acquisition.
//!
//! Scrapes the upstream index page for `*.zip` links, downloads them with
//! bounded parallelism and per-file retry, and extracts the CSV tree.
//! Both stages are resumable: a file already on disk is never re-downloaded,
//! and extraction is skipped entirely once any file of the CSV family exists.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cnpj_core::config::DownloaderSettings;
use cnpj_core::EtlError;

const BASE_URL: &str = "https://arquivos.receitafederal.gov.br/dados/cnpj/dados_abertos_cnpj/";
const USER_AGENT: &str = "OpenCNPJ/1.0";
const MAX_ATTEMPTS: usize = 3;

/// Downloads and extracts the monthly archive set.
pub struct WebDownloader {
    client: reqwest::Client,
    download_dir: PathBuf,
    extract_dir: PathBuf,
    parallel_downloads: usize,
}

impl WebDownloader {
    pub fn new(
        download_dir: impl Into<PathBuf>,
        extract_dir: impl Into<PathBuf>,
        settings: &DownloaderSettings,
    ) -> Result<Self> {
        let download_dir = download_dir.into();
        let extract_dir = extract_dir.into();
        std::fs::create_dir_all(&download_dir)?;
        std::fs::create_dir_all(&extract_dir)?;

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("build http client")?;

        Ok(Self {
            client,
            download_dir,
            extract_dir,
            parallel_downloads: settings.parallel_downloads.max(1),
        })
    }

    /// Download every archive listed for `year_month` (`YYYY-MM`) and extract
    /// the CSVs. `resume_globs` is the CSV glob family used to detect an
    /// already-extracted tree.
    pub async fn download_and_extract(
        &self,
        year_month: &str,
        resume_globs: &[String],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let page_url = format!("{BASE_URL}{}/", year_month.trim_matches('/'));
        info!(%page_url, "listing monthly archives");

        let urls = self.list_archive_urls(&page_url).await?;
        if urls.is_empty() {
            warn!("no zip archives found on the index page");
            return Ok(());
        }
        info!(count = urls.len(), "archives listed");

        let archives = self.download_all(&urls, cancel).await?;
        self.extract_all(&archives, resume_globs, cancel).await
    }

    /// Scrape `href="…zip"` targets, resolving relative links against the
    /// page URL and de-duplicating while preserving order.
    pub async fn list_archive_urls(&self, page_url: &str) -> Result<Vec<String>> {
        let html = self
            .client
            .get(page_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .context("fetch archive index")?
            .text()
            .await
            .context("read archive index")?;

        Ok(extract_zip_urls(&html, page_url))
    }

    async fn download_all(
        &self,
        urls: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>> {
        let mut pending = Vec::new();
        let mut done = Vec::new();

        for url in urls {
            let name = basename(url);
            let target = self.download_dir.join(&name);
            if target.exists() {
                info!(file = %name, "already downloaded, skipping");
                done.push(target);
            } else {
                pending.push((url.clone(), target));
            }
        }

        let fetched: Vec<PathBuf> = stream::iter(pending)
            .map(|(url, target)| async move {
                self.download_one(&url, &target, cancel).await?;
                Ok::<_, anyhow::Error>(target)
            })
            .buffer_unordered(self.parallel_downloads)
            .try_collect()
            .await?;

        done.extend(fetched);
        Ok(done)
    }

    /// Stream one archive to disk, retrying up to three times with linear
    /// back-off. The file lands under its final name only when complete.
    async fn download_one(
        &self,
        url: &str,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let partial = target.with_extension("zip.part");

        for attempt in 1..=MAX_ATTEMPTS {
            if cancel.is_cancelled() {
                anyhow::bail!("download cancelled");
            }
            match self.try_download(url, &partial).await {
                Ok(()) => {
                    tokio::fs::rename(&partial, target).await?;
                    info!(file = %target.display(), "downloaded");
                    return Ok(());
                }
                Err(err) => {
                    warn!(%url, attempt, %err, "download attempt failed");
                    let _ = tokio::fs::remove_file(&partial).await;
                    if attempt == MAX_ATTEMPTS {
                        return Err(EtlError::DownloadFailed {
                            url: url.to_string(),
                            reason: err.to_string(),
                        }
                        .into());
                    }
                    tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                }
            }
        }
        unreachable!("retry loop returns on success or final failure")
    }

    async fn try_download(&self, url: &str, target: &Path) -> Result<()> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())?;

        let mut file = tokio::fs::File::create(target).await?;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(())
    }

    /// Extract every archive into the data directory. Skipped entirely when
    /// any file matching the CSV glob family already exists.
    pub async fn extract_all(
        &self,
        archives: &[PathBuf],
        resume_globs: &[String],
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.has_extracted_files(resume_globs) {
            info!("extracted CSVs already present, skipping extraction");
            return Ok(());
        }

        for archive in archives {
            if cancel.is_cancelled() {
                anyhow::bail!("extraction cancelled");
            }
            let archive = archive.clone();
            let target = self.extract_dir.clone();
            let archive_for_blocking = archive.clone();
            let result = tokio::task::spawn_blocking(move || -> Result<()> {
                let archive = archive_for_blocking;
                let file = std::fs::File::open(&archive)
                    .with_context(|| format!("open {}", archive.display()))?;
                let mut zip = zip::ZipArchive::new(file)
                    .with_context(|| format!("read {}", archive.display()))?;
                zip.extract(&target)
                    .with_context(|| format!("extract {}", archive.display()))?;
                Ok(())
            })
            .await?;

            match result {
                Ok(()) => info!(archive = %archive.display(), "extracted"),
                Err(err) => warn!(archive = %archive.display(), %err, "extraction failed"),
            }
        }

        info!(dir = %self.extract_dir.display(), "extraction finished");
        Ok(())
    }

    fn has_extracted_files(&self, resume_globs: &[String]) -> bool {
        resume_globs.iter().any(|pattern| {
            let full = format!("{}/**/{}", self.extract_dir.display(), pattern);
            glob::glob(&full)
                .map(|mut paths| paths.next().is_some())
                .unwrap_or(false)
        })
    }
}

/// Pull `.zip` hrefs out of an index page, case-insensitively, resolving
/// relative links and de-duplicating in order.
fn extract_zip_urls(html: &str, page_url: &str) -> Vec<String> {
    let re = Regex::new(r#"(?i)href="([^"]+?\.zip)""#).expect("href regex");
    let mut seen = std::collections::HashSet::new();
    let mut urls = Vec::new();

    for caps in re.captures_iter(html) {
        let href = caps[1].trim();
        if href.is_empty() {
            continue;
        }
        let url = if href.to_lowercase().starts_with("http") {
            href.to_string()
        } else {
            format!("{}/{}", page_url.trim_end_matches('/'), href.trim_start_matches('/'))
        };
        if seen.insert(url.clone()) {
            urls.push(url);
        }
    }
    urls
}

fn basename(url: &str) -> String {
    let no_query = url.split('?').next().unwrap_or(url);
    no_query
        .rsplit('/')
        .next()
        .unwrap_or(no_query)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_and_dedupes_hrefs_in_order() {
        let html = r#"
            <a HREF="Empresas0.ZIP">e0</a>
            <a href="Empresas1.zip">e1</a>
            <a href="Empresas0.ZIP">dup</a>
            <a href="https://mirror.example/Socios0.zip">abs</a>
            <a href="notes.txt">not a zip</a>
        "#;
        let urls = extract_zip_urls(html, "https://host/dados/2024-05/");
        assert_eq!(
            urls,
            vec![
                "https://host/dados/2024-05/Empresas0.ZIP",
                "https://host/dados/2024-05/Empresas1.zip",
                "https://mirror.example/Socios0.zip",
            ]
        );
    }

    #[test]
    fn basename_strips_query_and_path() {
        assert_eq!(basename("https://h/a/b/Empresas0.zip?x=1"), "Empresas0.zip");
        assert_eq!(basename("Empresas0.zip"), "Empresas0.zip");
    }
}
