//! Benchmark configurations and run settings.
//!
//! A [`BenchmarkConfig`] is one named combination of environment overrides
//! under test; the ordered sequence of them is the matrix. Configurations are
//! immutable once a run starts.

use crate::error::HarnessError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable the target server reads for its worker pool bound.
pub const ENV_MAX_WORKER_THREADS: &str = "LOADMARK_MAX_WORKER_THREADS";
/// Environment variable the target server reads for its spin-limit knob.
pub const ENV_SPIN_LIMIT: &str = "LOADMARK_SPIN_LIMIT";
/// Environment variable the load tool reads for its own thread count.
pub const ENV_LOAD_WORKER_THREADS: &str = "TOKIO_WORKER_THREADS";

/// One named configuration of the matrix.
///
/// `server_env` is merged verbatim into the spawned server's environment;
/// `load_env` into the load tool's invocation. Neither is interpreted by the
/// harness itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkConfig {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub server_env: BTreeMap<String, String>,
    #[serde(default)]
    pub load_env: BTreeMap<String, String>,
    /// Fallback %CPU used when no samples could be measured. Configurations
    /// without an explicit estimate fall back to
    /// [`crate::results::DEFAULT_CPU_ESTIMATE`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_estimate: Option<f64>,
}

impl BenchmarkConfig {
    /// File name the server's stdout/stderr is redirected to for this
    /// configuration, e.g. `server-base-case.log`.
    pub fn log_file_name(&self) -> String {
        let slug: String = self
            .name
            .to_lowercase()
            .chars()
            .map(|c| if c.is_whitespace() { '-' } else { c })
            .filter(|c| c.is_alphanumeric() || *c == '-')
            .collect();
        format!("server-{slug}.log")
    }
}

/// Knobs shared by every configuration of a run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub server_bin: PathBuf,
    pub load_tool: PathBuf,
    /// Sole target URL: liveness probe and load generation both hit it.
    pub url: String,
    pub port: u16,
    pub concurrency: u32,
    pub duration: Duration,
    /// Delay between configurations, letting the OS release the port.
    pub pause: Duration,
    pub output: PathBuf,
    pub log_dir: PathBuf,
}

impl RunSettings {
    pub fn target_url(port: u16) -> String {
        format!("http://127.0.0.1:{port}/user/1234")
    }
}

/// The built-in matrix: worker-pool and spin-limit combinations for the
/// server crossed with load-tool thread counts.
pub fn default_matrix() -> Vec<BenchmarkConfig> {
    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    vec![
        BenchmarkConfig {
            name: "Base Case".into(),
            description: "Default worker threads, default spin, 1 load thread".into(),
            server_env: env(&[]),
            load_env: env(&[(ENV_LOAD_WORKER_THREADS, "1")]),
            cpu_estimate: Some(650.0),
        },
        BenchmarkConfig {
            name: "No Spin".into(),
            description: "Default worker threads, no spin, 1 load thread".into(),
            server_env: env(&[(ENV_SPIN_LIMIT, "0")]),
            load_env: env(&[(ENV_LOAD_WORKER_THREADS, "1")]),
            cpu_estimate: Some(300.0),
        },
        BenchmarkConfig {
            name: "Spin 10".into(),
            description: "Default worker threads, spin limit 10, 1 load thread".into(),
            server_env: env(&[(ENV_SPIN_LIMIT, "10")]),
            load_env: env(&[(ENV_LOAD_WORKER_THREADS, "1")]),
            cpu_estimate: Some(300.0),
        },
        BenchmarkConfig {
            name: "1 Worker, 1 Load Thread".into(),
            description: "1 worker thread, no spin, 1 load thread".into(),
            server_env: env(&[(ENV_MAX_WORKER_THREADS, "1"), (ENV_SPIN_LIMIT, "0")]),
            load_env: env(&[(ENV_LOAD_WORKER_THREADS, "1")]),
            cpu_estimate: Some(120.0),
        },
        BenchmarkConfig {
            name: "1 Worker, 2 Load Threads".into(),
            description: "1 worker thread, no spin, 2 load threads".into(),
            server_env: env(&[(ENV_MAX_WORKER_THREADS, "1"), (ENV_SPIN_LIMIT, "0")]),
            load_env: env(&[(ENV_LOAD_WORKER_THREADS, "2")]),
            cpu_estimate: Some(330.0),
        },
        BenchmarkConfig {
            name: "2 Workers, 2 Load Threads".into(),
            description: "2 worker threads, no spin, 2 load threads".into(),
            server_env: env(&[(ENV_MAX_WORKER_THREADS, "2"), (ENV_SPIN_LIMIT, "0")]),
            load_env: env(&[(ENV_LOAD_WORKER_THREADS, "2")]),
            cpu_estimate: Some(300.0),
        },
    ]
}

/// Load a matrix from a JSON file: an array of [`BenchmarkConfig`] objects.
pub fn load_matrix(path: &Path) -> Result<Vec<BenchmarkConfig>, HarnessError> {
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|source| HarnessError::Matrix {
        path: path.to_path_buf(),
        source,
    })
}
