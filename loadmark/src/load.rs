//! Driving the external load generator.
//!
//! The load tool is a black box invoked once per configuration: it blocks for
//! the configured duration and emits a JSON summary on stdout. A nonzero
//! exit, malformed output, or a hard timeout degrade to a zero-throughput
//! result with a soft failure flag; the configuration's CPU data is still
//! worth keeping for diagnostics, so none of these abort the run.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStderr, ChildStdout, Command};
use tracing::{debug, info, warn};

/// Slack on top of the load duration before the tool is declared hung.
const HARD_TIMEOUT_GRACE: Duration = Duration::from_secs(30);

/// Raw parsed output of the load tool.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadResult {
    pub requests_per_sec: f64,
}

impl LoadResult {
    /// Placeholder used when the tool failed or its output was unusable.
    pub fn zero() -> Self {
        Self {
            requests_per_sec: 0.0,
        }
    }
}

/// A [`LoadResult`] plus whether the load step soft-failed on the way to it.
#[derive(Debug, Clone, Copy)]
pub struct LoadOutcome {
    pub result: LoadResult,
    pub failed: bool,
}

impl LoadOutcome {
    pub fn failed() -> Self {
        Self {
            result: LoadResult::zero(),
            failed: true,
        }
    }
}

/// Seam between the orchestrator and the load tool.
#[async_trait]
pub trait LoadGenerator: Send + Sync {
    /// Blocking load generation against the target. Never errors; failure is
    /// carried in the outcome.
    async fn run(&self, env: &BTreeMap<String, String>) -> LoadOutcome;
}

/// Invokes `oha --no-tui -c <n> -z <dur> --json <url>`.
pub struct OhaDriver {
    tool: PathBuf,
    url: String,
    concurrency: u32,
    duration: Duration,
    grace: Duration,
}

impl OhaDriver {
    pub fn new(tool: PathBuf, url: String, concurrency: u32, duration: Duration) -> Self {
        Self {
            tool,
            url,
            concurrency,
            duration,
            grace: HARD_TIMEOUT_GRACE,
        }
    }

    /// Slack on top of the load duration before the tool is declared hung.
    pub fn timeout_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

#[async_trait]
impl LoadGenerator for OhaDriver {
    async fn run(&self, env: &BTreeMap<String, String>) -> LoadOutcome {
        let duration_arg = humantime::format_duration(self.duration).to_string();
        info!(
            "running: {} --no-tui -c {} -z {} --json {}",
            self.tool.display(),
            self.concurrency,
            duration_arg,
            self.url
        );

        let mut child = match Command::new(&self.tool)
            .arg("--no-tui")
            .args(["-c", &self.concurrency.to_string()])
            .args(["-z", &duration_arg])
            .arg("--json")
            .arg(&self.url)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!("could not start load tool {}: {e}", self.tool.display());
                return LoadOutcome::failed();
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_task = tokio::spawn(slurp_stdout(stdout));
        let err_task = tokio::spawn(slurp_stderr(stderr));

        let hard_timeout = self.duration + self.grace;
        let status = match tokio::time::timeout(hard_timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                warn!("load tool wait failed: {e}");
                return LoadOutcome::failed();
            }
            Err(_) => {
                // A hung load tool must not hang the whole matrix.
                warn!("load tool exceeded {hard_timeout:?}; killing it");
                if let Err(e) = child.kill().await {
                    warn!("could not kill hung load tool: {e}");
                }
                return LoadOutcome::failed();
            }
        };

        let stdout = out_task.await.unwrap_or_default();
        // Diagnostics only; never parsed.
        if let Ok(stderr) = err_task.await {
            for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
                debug!("load tool stderr: {line}");
            }
        }

        if !status.success() {
            warn!("load tool exited with {status}");
            return LoadOutcome::failed();
        }

        match parse_summary(&stdout) {
            Some(result) => LoadOutcome {
                result,
                failed: false,
            },
            None => {
                warn!(
                    "could not parse load tool output: {}",
                    stdout.chars().take(200).collect::<String>()
                );
                LoadOutcome::failed()
            }
        }
    }
}

async fn slurp_stdout(stdout: Option<ChildStdout>) -> String {
    let mut buf = String::new();
    if let Some(mut stdout) = stdout {
        let _ = stdout.read_to_string(&mut buf).await;
    }
    buf
}

async fn slurp_stderr(stderr: Option<ChildStderr>) -> String {
    let mut buf = String::new();
    if let Some(mut stderr) = stderr {
        let _ = stderr.read_to_string(&mut buf).await;
    }
    buf
}

#[derive(Debug, Deserialize)]
struct OhaReport {
    summary: OhaSummary,
}

#[derive(Debug, Deserialize)]
struct OhaSummary {
    #[serde(rename = "requestsPerSec")]
    requests_per_sec: f64,
}

/// Parse the tool's JSON summary. `None` on malformed output.
pub fn parse_summary(stdout: &str) -> Option<LoadResult> {
    let report: OhaReport = serde_json::from_str(stdout).ok()?;
    Some(LoadResult {
        requests_per_sec: report.summary.requests_per_sec,
    })
}

/// Version string of the load tool, used both as a preflight check and as
/// run metadata. `None` when the tool cannot be executed.
pub async fn tool_version(tool: &Path) -> Option<String> {
    let out = Command::new(tool).arg("--version").output().await.ok()?;
    if !out.status.success() {
        return None;
    }
    let version = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if version.is_empty() {
        None
    } else {
        Some(version)
    }
}
