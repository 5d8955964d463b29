//! Periodic CPU sampling of the target process tree.
//!
//! While a configuration is under load, a background task takes one reading
//! per interval of the server's %CPU, summed with its child processes.
//! Readings that cannot be obtained are dropped rather than recorded as zero,
//! which would bias the average low. Samples travel over a channel owned by
//! the handle; nothing is shared across configurations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// Default interval between readings.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// One %CPU reading and the point in time it was taken.
#[derive(Debug, Clone, Copy)]
pub struct CpuSample {
    pub percent: f64,
    pub taken_at: DateTime<Utc>,
}

/// Source of a single %CPU reading for a process tree.
///
/// The production probe shells out to `ps`; tests inject deterministic
/// readings.
#[async_trait]
pub trait CpuProbe: Send + Sync + 'static {
    /// One reading for `pid` plus its current children. `None` when the
    /// reading cannot be obtained (process vanished, tool error).
    async fn sample(&self, pid: u32) -> Option<f64>;
}

/// `ps`-based probe: `%cpu` of the pid itself plus every direct child.
/// Children matter because the load tool or server-spawned workers would
/// otherwise be undercounted.
pub struct PsProbe;

#[async_trait]
impl CpuProbe for PsProbe {
    async fn sample(&self, pid: u32) -> Option<f64> {
        let main = process_percent(pid).await?;
        let children = children_percent(pid).await.unwrap_or(0.0);
        Some(main + children)
    }
}

async fn process_percent(pid: u32) -> Option<f64> {
    let out = Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", "%cpu="])
        .output()
        .await
        .ok()?;
    if !out.status.success() {
        return None;
    }
    String::from_utf8_lossy(&out.stdout).trim().parse().ok()
}

async fn children_percent(pid: u32) -> Option<f64> {
    let out = Command::new("pgrep")
        .args(["-P", &pid.to_string()])
        .output()
        .await
        .ok()?;
    // pgrep exits nonzero when there are no children
    if !out.status.success() {
        return Some(0.0);
    }
    let pids: Vec<String> = String::from_utf8_lossy(&out.stdout)
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();
    if pids.is_empty() {
        return Some(0.0);
    }
    let out = Command::new("ps")
        .args(["-o", "%cpu=", "-p", &pids.join(",")])
        .output()
        .await
        .ok()?;
    let sum = String::from_utf8_lossy(&out.stdout)
        .lines()
        .filter_map(|l| l.trim().parse::<f64>().ok())
        .sum();
    Some(sum)
}

/// Starts and stops the background sampling task. One sampler is active at a
/// time across the whole matrix; each `start` produces a fresh channel so no
/// state leaks between configurations.
pub struct CpuSampler {
    probe: Arc<dyn CpuProbe>,
    interval: Duration,
}

impl CpuSampler {
    pub fn new() -> Self {
        Self::with_probe(Arc::new(PsProbe), SAMPLE_INTERVAL)
    }

    pub fn with_probe(probe: Arc<dyn CpuProbe>, interval: Duration) -> Self {
        Self { probe, interval }
    }

    /// Begin sampling `pid`. The first reading is taken immediately, then one
    /// per interval until [`SamplerHandle::stop`].
    pub fn start(&self, pid: u32) -> SamplerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let probe = Arc::clone(&self.probe);
        let interval = self.interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match probe.sample(pid).await {
                    Some(percent) if percent >= 0.0 => {
                        let _ = tx.send(CpuSample {
                            percent,
                            taken_at: Utc::now(),
                        });
                    }
                    _ => trace!("dropping unobtainable cpu reading for pid {pid}"),
                }
            }
        });
        SamplerHandle { task, rx }
    }
}

impl Default for CpuSampler {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SamplerHandle {
    task: JoinHandle<()>,
    rx: mpsc::UnboundedReceiver<CpuSample>,
}

impl SamplerHandle {
    /// Cancel the sampling task and return whatever was collected, possibly
    /// nothing.
    pub async fn stop(mut self) -> Vec<CpuSample> {
        self.task.abort();
        let _ = (&mut self.task).await;
        let mut samples = Vec::new();
        while let Ok(sample) = self.rx.try_recv() {
            samples.push(sample);
        }
        samples
    }
}

/// Summary statistics over one configuration's samples.
///
/// With more than two samples the first and last are treated as
/// startup/shutdown transients and excluded from min/max/average; with one or
/// two samples everything is used. `measured` is false only when no samples
/// were obtainable at all.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CpuStatistics {
    /// Raw sample count, before trimming.
    pub samples: usize,
    pub min: f64,
    pub max: f64,
    pub average: f64,
    pub measured: bool,
}

impl CpuStatistics {
    pub fn from_samples(samples: &[CpuSample]) -> Self {
        let window = if samples.len() > 2 {
            &samples[1..samples.len() - 1]
        } else {
            samples
        };
        if window.is_empty() {
            return Self::unmeasured();
        }
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        for sample in window {
            min = min.min(sample.percent);
            max = max.max(sample.percent);
            sum += sample.percent;
        }
        Self {
            samples: samples.len(),
            min,
            max,
            average: sum / window.len() as f64,
            measured: true,
        }
    }

    pub fn unmeasured() -> Self {
        Self {
            samples: 0,
            min: 0.0,
            max: 0.0,
            average: 0.0,
            measured: false,
        }
    }
}
