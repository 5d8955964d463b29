//! Aggregation of throughput and CPU measurements into the result artifact.
//!
//! [`combine`] is pure: it resolves the CPU figure (measured average or the
//! configuration's estimate), derives efficiency, and produces one immutable
//! [`BenchmarkResult`] row. [`ResultSet`] is the sole durable artifact of a
//! run; configurations that were skipped are simply absent from it.

use crate::config::BenchmarkConfig;
use crate::cpu::CpuStatistics;
use crate::load::LoadOutcome;
use crate::system::SystemInfo;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Fallback %CPU for configurations that carry no explicit estimate.
pub const DEFAULT_CPU_ESTIMATE: f64 = 300.0;

/// One row of the final output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkResult {
    pub config: BenchmarkConfig,
    /// Requests per second reported by the load tool.
    pub throughput: f64,
    /// Resolved %CPU, measured or estimated.
    pub cpu_usage: f64,
    pub cpu_measurement: CpuStatistics,
    /// Requests per second per CPU-core-equivalent.
    pub efficiency: f64,
    /// True when the load step soft-failed and `throughput` is a placeholder.
    pub load_failed: bool,
}

/// Merge one configuration's load outcome and CPU statistics.
pub fn combine(
    load: &LoadOutcome,
    cpu: &CpuStatistics,
    config: &BenchmarkConfig,
) -> BenchmarkResult {
    let cpu_usage = if cpu.measured {
        cpu.average
    } else {
        config.cpu_estimate.unwrap_or(DEFAULT_CPU_ESTIMATE)
    };
    let throughput = load.result.requests_per_sec;
    BenchmarkResult {
        config: config.clone(),
        throughput,
        cpu_usage,
        cpu_measurement: cpu.clone(),
        efficiency: efficiency(throughput, cpu_usage),
        load_failed: load.failed,
    }
}

/// `throughput / (cpu_usage / 100)`. Zero CPU yields zero efficiency rather
/// than a division error.
pub fn efficiency(throughput: f64, cpu_usage: f64) -> f64 {
    if cpu_usage == 0.0 {
        0.0
    } else {
        throughput / (cpu_usage / 100.0)
    }
}

/// The persisted run artifact: system metadata plus the ordered results.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSet {
    pub system_info: SystemInfo,
    pub benchmarks: Vec<BenchmarkResult>,
}

impl ResultSet {
    pub fn new(system_info: SystemInfo) -> Self {
        Self {
            system_info,
            benchmarks: Vec::new(),
        }
    }

    pub fn push(&mut self, result: BenchmarkResult) {
        self.benchmarks.push(result);
    }

    pub fn is_empty(&self) -> bool {
        self.benchmarks.is_empty()
    }

    pub fn persist(&self, path: &Path) -> Result<(), crate::error::HarnessError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
