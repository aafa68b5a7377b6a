//! Sampled local-vs-remote integrity check.
//!
//! Renders a handful of identifiers from the local dataset, fetches their
//! remote counterparts, and compares canonical hashes. The sampler runs its
//! own engine session over the on-disk dataset; it shares nothing with the
//! export orchestrator.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use cnpj_core::{canonical, cnpj, AppConfig, TransferAgent};

use crate::engine::QueryEngine;
use crate::export::content_hash;

const DEFAULT_SAMPLE_SIZE: usize = 10;

#[derive(Debug)]
pub struct SampleResult {
    pub cnpj: String,
    pub local_hash: String,
    pub remote_hash: String,
    pub ok: bool,
    pub note: Option<String>,
}

#[derive(Debug)]
pub struct IntegrityReport {
    pub results: Vec<SampleResult>,
}

impl IntegrityReport {
    /// True when every sampled identifier matched.
    pub fn all_ok(&self) -> bool {
        self.results.iter().all(|r| r.ok)
    }
}

/// Run the sampled check with the default sample size.
pub async fn run_sample(config: &AppConfig, agent: &dyn TransferAgent) -> Result<IntegrityReport> {
    run_sample_sized(config, agent, DEFAULT_SAMPLE_SIZE).await
}

pub async fn run_sample_sized(
    config: &AppConfig,
    agent: &dyn TransferAgent,
    total: usize,
) -> Result<IntegrityReport> {
    let engine = QueryEngine::open(&config.duckdb, &config.paths.parquet_dir)?;
    engine.register_views().await?;

    let sample = engine.sample_cnpjs(total).await?;
    if sample.is_empty() {
        warn!("no establishments available to sample");
        return Ok(IntegrityReport { results: Vec::new() });
    }

    let scratch = tempfile::tempdir().context("sampler scratch dir")?;
    let mut results = Vec::new();
    for identifier in sample {
        let result = check_one(&engine, agent, scratch.path(), &identifier).await;
        match &result {
            r if r.ok => info!(cnpj = %r.cnpj, hash = %r.local_hash, "sample match"),
            r => warn!(cnpj = %r.cnpj, note = ?r.note, "sample mismatch"),
        }
        results.push(result);
    }

    let report = IntegrityReport { results };
    let passed = report.results.iter().filter(|r| r.ok).count();
    info!(passed, total = report.results.len(), "integrity sample finished");
    Ok(report)
}

/// A failure anywhere in the per-identifier flow is a per-item fail, never a
/// run fail.
async fn check_one(
    engine: &QueryEngine,
    agent: &dyn TransferAgent,
    scratch: &Path,
    identifier: &str,
) -> SampleResult {
    match compare_hashes(engine, agent, scratch, identifier).await {
        Ok(result) => result,
        Err(err) => SampleResult {
            cnpj: identifier.to_string(),
            local_hash: "-".into(),
            remote_hash: "-".into(),
            ok: false,
            note: Some(err.to_string()),
        },
    }
}

async fn compare_hashes(
    engine: &QueryEngine,
    agent: &dyn TransferAgent,
    scratch: &Path,
    identifier: &str,
) -> Result<SampleResult> {
    let parts = cnpj::parse(identifier)?;

    let local = engine
        .project_one(&parts)
        .await?
        .context("local document not found")?;
    let local_hash = content_hash(&canonical::canonicalize(&local));

    let remote_path = scratch.join(format!("{identifier}.json"));
    agent
        .fetch_file(&format!("{identifier}.json"), &remote_path)
        .await
        .context("remote fetch failed")?;
    let remote = std::fs::read_to_string(&remote_path)?;
    let remote_hash = content_hash(&canonical::canonicalize(&remote));

    let ok = local_hash.eq_ignore_ascii_case(&remote_hash);
    Ok(SampleResult {
        cnpj: identifier.to_string(),
        local_hash,
        remote_hash,
        ok,
        note: None,
    })
}
