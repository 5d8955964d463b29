//! Passthrough system metadata attached once per run.
//!
//! Collection is best-effort: every field degrades to a recognizable
//! placeholder rather than failing the run, since this is diagnostics for the
//! result artifact and nothing else consumes it.

use crate::load;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::process::Command;

const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    pub timestamp: DateTime<Utc>,
    pub os: String,
    pub hostname: String,
    pub cpu_model: String,
    pub cpu_cores: usize,
    pub total_memory_gb: f64,
    pub free_memory_gb: f64,
    pub load_tool_version: String,
}

impl SystemInfo {
    /// Fixed values for tests that need a `SystemInfo` without touching the
    /// host.
    pub fn placeholder() -> Self {
        Self {
            timestamp: Utc::now(),
            os: UNKNOWN.into(),
            hostname: UNKNOWN.into(),
            cpu_model: UNKNOWN.into(),
            cpu_cores: 1,
            total_memory_gb: 0.0,
            free_memory_gb: 0.0,
            load_tool_version: UNKNOWN.into(),
        }
    }
}

pub async fn collect(load_tool: &Path) -> SystemInfo {
    let (total_memory_gb, free_memory_gb) = memory_gb().await;
    SystemInfo {
        timestamp: Utc::now(),
        os: os_pretty_name().await,
        hostname: hostname().await,
        cpu_model: cpu_model().await,
        cpu_cores: std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
        total_memory_gb,
        free_memory_gb,
        load_tool_version: load::tool_version(load_tool)
            .await
            .unwrap_or_else(|| UNKNOWN.into()),
    }
}

async fn os_pretty_name() -> String {
    if let Ok(release) = tokio::fs::read_to_string("/etc/os-release").await {
        for line in release.lines() {
            if let Some(value) = line.strip_prefix("PRETTY_NAME=") {
                return value.trim_matches('"').to_string();
            }
        }
    }
    if let Ok(out) = Command::new("sw_vers").arg("-productVersion").output().await {
        if out.status.success() {
            let version = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if !version.is_empty() {
                return format!("macOS {version}");
            }
        }
    }
    std::env::consts::OS.to_string()
}

async fn hostname() -> String {
    match Command::new("hostname").output().await {
        Ok(out) if out.status.success() => {
            let name = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if name.is_empty() {
                UNKNOWN.into()
            } else {
                name
            }
        }
        _ => UNKNOWN.into(),
    }
}

async fn cpu_model() -> String {
    if let Ok(cpuinfo) = tokio::fs::read_to_string("/proc/cpuinfo").await {
        for line in cpuinfo.lines() {
            if line.starts_with("model name") {
                if let Some((_, model)) = line.split_once(':') {
                    return model.trim().to_string();
                }
            }
        }
    }
    if let Ok(out) = Command::new("sysctl")
        .args(["-n", "machdep.cpu.brand_string"])
        .output()
        .await
    {
        if out.status.success() {
            let model = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if !model.is_empty() {
                return model;
            }
        }
    }
    UNKNOWN.into()
}

async fn memory_gb() -> (f64, f64) {
    let Ok(meminfo) = tokio::fs::read_to_string("/proc/meminfo").await else {
        return (0.0, 0.0);
    };
    let kb = |prefix: &str| -> Option<f64> {
        meminfo
            .lines()
            .find(|l| l.starts_with(prefix))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let to_gb = |kb: f64| (kb / (1024.0 * 1024.0) * 100.0).round() / 100.0;
    (
        kb("MemTotal:").map(to_gb).unwrap_or(0.0),
        kb("MemAvailable:").map(to_gb).unwrap_or(0.0),
    )
}
