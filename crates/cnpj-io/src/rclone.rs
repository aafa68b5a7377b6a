//! Bounded-concurrency wrapper around the rclone transfer agent.
//!
//! Every operation spawns `rclone` as a subprocess with stdout/stderr
//! captured line by line. The flag sets are pinned for many-small-file
//! throughput: no destination traversal, no size/checksum comparison, no
//! mod-time updates, fixed buffer, one checker, and rclone's own infinite
//! retry loop. The pool does not retry above the agent; only the exit code
//! decides success.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cnpj_core::config::RcloneSettings;
use cnpj_core::{ProgressTx, TransferAgent};

/// Rclone-backed [`TransferAgent`] with a process-wide subprocess bound.
pub struct RclonePool {
    remote_base: String,
    transfers: usize,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    progress_re: Regex,
}

impl RclonePool {
    pub fn new(settings: &RcloneSettings, cancel: CancellationToken) -> Self {
        Self {
            remote_base: settings.remote_base.trim_end_matches('/').to_string(),
            transfers: settings.transfers.max(1),
            semaphore: Arc::new(Semaphore::new(settings.max_concurrent_uploads.max(1))),
            cancel,
            progress_re: Regex::new(r"(?i)Transferred:\s+\d+\s*/\s*\d+,\s*(\d+)%")
                .expect("progress regex"),
        }
    }

    /// Join a relative remote path onto the configured base. An empty path
    /// addresses the remote root.
    fn remote_path(&self, relative: &str) -> String {
        let relative = relative.trim_start_matches('/');
        if relative.is_empty() {
            format!("{}/", self.remote_base)
        } else {
            format!("{}/{}", self.remote_base, relative)
        }
    }

    /// Run rclone to completion, streaming stdout through the progress parser
    /// and surfacing stderr ERROR lines. Success is the exit code alone.
    async fn run(&self, args: Vec<String>, progress: Option<ProgressTx>) -> Result<()> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .context("transfer pool closed")?;

        let mut child = Command::new("rclone")
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawn rclone")?;

        let stdout = child.stdout.take();
        let progress_re = self.progress_re.clone();
        let stdout_task = tokio::spawn(async move {
            let Some(stdout) = stdout else { return };
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(caps) = progress_re.captures(&line) {
                    if let Ok(pct) = caps[1].parse::<u8>() {
                        if let Some(tx) = &progress {
                            let _ = tx.send(pct);
                        }
                    }
                }
            }
        });

        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buffer = Vec::new();
            let Some(stderr) = stderr else { return buffer };
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.to_uppercase().contains("ERROR") {
                    error!(target: "rclone", "{line}");
                }
                buffer.push(line);
            }
            buffer
        });

        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = self.cancel.cancelled() => None,
        };
        let status = match exited {
            Some(status) => status.context("wait for rclone")?,
            None => {
                let _ = child.kill().await;
                let _ = child.wait().await;
                anyhow::bail!("rclone cancelled");
            }
        };

        let _ = stdout_task.await;
        let stderr_lines = stderr_task.await.unwrap_or_default();

        if status.success() {
            Ok(())
        } else {
            let tail = stderr_lines
                .iter()
                .rev()
                .take(5)
                .rev()
                .cloned()
                .collect::<Vec<_>>()
                .join("\n");
            anyhow::bail!("rclone exited with {status}: {tail}")
        }
    }
}

/// Flags for a recursive directory copy tuned for many small files.
fn copy_dir_args(local: &Path, remote: &str, transfers: usize) -> Vec<String> {
    vec![
        "copy".into(),
        local.display().to_string(),
        remote.into(),
        "--progress".into(),
        "--stats=1s".into(),
        format!("--transfers={transfers}"),
        "--no-traverse".into(),
        "--no-check-dest".into(),
        "--fast-list=false".into(),
        "--ignore-times".into(),
        "--ignore-size".into(),
        "--ignore-checksum".into(),
        "--no-update-modtime".into(),
        "--buffer-size=128M".into(),
        "--checkers=1".into(),
        "--bwlimit=off".into(),
        "--retries=-1".into(),
        "--retries-sleep=60s".into(),
        "--low-level-retries=10".into(),
    ]
}

fn copy_file_args(local: &Path, remote: &str) -> Vec<String> {
    vec![
        "copyto".into(),
        local.display().to_string(),
        remote.into(),
        "--retries=-1".into(),
        "--retries-sleep=60s".into(),
        "--low-level-retries=10".into(),
        "--bwlimit=off".into(),
        "--no-update-modtime".into(),
    ]
}

fn fetch_file_args(remote: &str, local: &Path) -> Vec<String> {
    vec![
        "copyto".into(),
        remote.into(),
        local.display().to_string(),
        "--retries=-1".into(),
        "--retries-sleep=60s".into(),
        "--low-level-retries=10".into(),
        "--bwlimit=off".into(),
    ]
}

#[async_trait]
impl TransferAgent for RclonePool {
    async fn copy_dir(
        &self,
        local: &Path,
        remote: &str,
        progress: Option<ProgressTx>,
    ) -> Result<()> {
        let remote = self.remote_path(remote);
        info!(local = %local.display(), %remote, "uploading directory");
        self.run(copy_dir_args(local, &remote, self.transfers), progress)
            .await
    }

    async fn copy_file(&self, local: &Path, remote: &str) -> Result<()> {
        let remote = self.remote_path(remote);
        self.run(copy_file_args(local, &remote), None).await
    }

    async fn fetch_file(&self, remote: &str, local: &Path) -> Result<()> {
        let remote = self.remote_path(remote);
        self.run(fetch_file_args(&remote, local), None).await?;
        if !local.exists() {
            anyhow::bail!("rclone reported success but {} is missing", local.display());
        }
        Ok(())
    }

    async fn exists(&self, remote: &str) -> Result<bool> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .context("transfer pool closed")?;

        let remote = self.remote_path(remote);
        let output = Command::new("rclone")
            .args(["lsf", &remote])
            .output()
            .await
            .context("spawn rclone lsf")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.to_uppercase().contains("ERROR") {
                warn!(target: "rclone", %remote, "lsf: {}", stderr.trim());
            }
            return Ok(false);
        }
        Ok(!output.stdout.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_dir_flags_pin_throughput_envelope() {
        let args = copy_dir_args(Path::new("/tmp/out"), "remote:bucket/", 100);
        assert_eq!(args[0], "copy");
        for flag in [
            "--no-traverse",
            "--no-check-dest",
            "--ignore-times",
            "--ignore-size",
            "--ignore-checksum",
            "--no-update-modtime",
            "--buffer-size=128M",
            "--checkers=1",
            "--retries=-1",
            "--retries-sleep=60s",
            "--low-level-retries=10",
            "--transfers=100",
        ] {
            assert!(args.iter().any(|a| a == flag), "missing {flag}");
        }
    }

    #[test]
    fn copyto_flag_sets_differ_on_modtime() {
        let up = copy_file_args(Path::new("a.json"), "remote:bucket/a.json");
        assert!(up.iter().any(|a| a == "--no-update-modtime"));
        let down = fetch_file_args("remote:bucket/a.json", Path::new("a.json"));
        assert!(!down.iter().any(|a| a == "--no-update-modtime"));
        assert_eq!(down[0], "copyto");
    }

    #[test]
    fn progress_line_parses_percentage() {
        let re = Regex::new(r"(?i)Transferred:\s+\d+\s*/\s*\d+,\s*(\d+)%").unwrap();
        let caps = re
            .captures("Transferred:   12 / 100, 12%, 4.5 MiB/s, ETA 1m")
            .unwrap();
        assert_eq!(&caps[1], "12");
        assert!(re.captures("Transferred: 1.2 GiB / 3 GiB").is_none());
    }

    #[test]
    fn remote_paths_join_against_base() {
        let settings = RcloneSettings {
            remote_base: "r2:opencnpj/".into(),
            transfers: 4,
            max_concurrent_uploads: 2,
        };
        let pool = RclonePool::new(&settings, CancellationToken::new());
        assert_eq!(pool.remote_path(""), "r2:opencnpj/");
        assert_eq!(pool.remote_path("info.json"), "r2:opencnpj/info.json");
        assert_eq!(pool.remote_path("/hashes.zip"), "r2:opencnpj/hashes.zip");
    }
}
