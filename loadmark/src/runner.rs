//! The orchestrator: sequences the configuration matrix.
//!
//! Configurations run strictly one after another; the only true concurrency
//! is the background CPU sampler overlapping the blocking load call. The
//! sampler is started before the load tool and stopped after it returns, so
//! the samples bracket the entire load period including warm-up and drain.
//! Failures are contained per configuration: they degrade or drop that
//! configuration's row, never the matrix. Teardown always runs once a spawn
//! succeeded, even when the health check never did.

use crate::config::BenchmarkConfig;
use crate::cpu::{CpuSampler, CpuStatistics};
use crate::error::HarnessError;
use crate::load::LoadGenerator;
use crate::process::ProcessControl;
use crate::results::{self, BenchmarkResult, ResultSet};
use crate::system::SystemInfo;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Per-configuration phases, in order. A configuration ends `Recorded` or
/// `Skipped` and the runner returns to idle before the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Spawning,
    HealthChecking,
    SamplingLoading,
    TearingDown,
}

/// Terminal state of one configuration.
#[derive(Debug)]
pub enum ConfigOutcome {
    Recorded(BenchmarkResult),
    Skipped(SkipReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    SpawnFailed(String),
    NeverHealthy,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::SpawnFailed(reason) => write!(f, "spawn failed: {reason}"),
            SkipReason::NeverHealthy => write!(f, "server never became healthy"),
        }
    }
}

/// Everything the caller needs after a run: the persisted-shape results plus
/// which configurations were skipped and why.
#[derive(Debug)]
pub struct RunReport {
    pub results: ResultSet,
    pub skipped: Vec<(String, SkipReason)>,
}

pub struct Runner<P, L> {
    process: P,
    load: L,
    sampler: CpuSampler,
    pause: Duration,
    log_dir: PathBuf,
}

impl<P, L> Runner<P, L>
where
    P: ProcessControl,
    L: LoadGenerator,
{
    pub fn new(process: P, load: L, sampler: CpuSampler) -> Self {
        Self {
            process,
            load,
            sampler,
            pause: Duration::from_secs(1),
            log_dir: PathBuf::from("."),
        }
    }

    /// Delay between configurations, letting the OS release the port.
    pub fn pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    pub fn log_dir(mut self, log_dir: PathBuf) -> Self {
        self.log_dir = log_dir;
        self
    }

    /// Run the whole matrix. Zero recorded results is a fatal run failure;
    /// nothing should be persisted in that case.
    pub async fn run(
        &self,
        matrix: &[BenchmarkConfig],
        system_info: SystemInfo,
    ) -> Result<RunReport, HarnessError> {
        let mut results = ResultSet::new(system_info);
        let mut skipped = Vec::new();

        for (idx, config) in matrix.iter().enumerate() {
            info!(
                "configuration `{}` ({}/{}): {}",
                config.name,
                idx + 1,
                matrix.len(),
                config.description
            );
            match self.run_configuration(config).await {
                ConfigOutcome::Recorded(result) => {
                    info!(
                        "`{}`: {:.0} req/sec, {:.1}% CPU{}, {:.0} req/sec/core",
                        config.name,
                        result.throughput,
                        result.cpu_usage,
                        if result.cpu_measurement.measured {
                            ""
                        } else {
                            " (estimated)"
                        },
                        result.efficiency,
                    );
                    results.push(result);
                }
                ConfigOutcome::Skipped(reason) => {
                    warn!("`{}` skipped: {reason}", config.name);
                    skipped.push((config.name.clone(), reason));
                }
            }
            // No pause needed once the matrix is done.
            if idx + 1 < matrix.len() {
                tokio::time::sleep(self.pause).await;
            }
        }

        if results.is_empty() {
            return Err(HarnessError::NoResults);
        }
        Ok(RunReport { results, skipped })
    }

    async fn run_configuration(&self, config: &BenchmarkConfig) -> ConfigOutcome {
        debug!("`{}`: {:?}", config.name, Phase::Spawning);
        let log_path = self.log_dir.join(config.log_file_name());
        let handle = match self.process.spawn(&config.server_env, &log_path).await {
            Ok(handle) => handle,
            Err(e) => return ConfigOutcome::Skipped(SkipReason::SpawnFailed(e.to_string())),
        };

        debug!("`{}`: {:?}", config.name, Phase::HealthChecking);
        if !self.process.health_check().await {
            // The process may be lingering and must still be killed.
            debug!("`{}`: {:?}", config.name, Phase::TearingDown);
            self.process.terminate(handle).await;
            return ConfigOutcome::Skipped(SkipReason::NeverHealthy);
        }

        debug!("`{}`: {:?}", config.name, Phase::SamplingLoading);
        let pid = self.process.pid(&handle);
        let sampling = self.sampler.start(pid);
        let load_outcome = self.load.run(&config.load_env).await;
        let samples = sampling.stop().await;

        debug!("`{}`: {:?}", config.name, Phase::TearingDown);
        self.process.terminate(handle).await;

        let stats = CpuStatistics::from_samples(&samples);
        if stats.measured {
            debug!(
                "`{}`: {} cpu samples, min {:.1}%, max {:.1}%, avg {:.1}%",
                config.name, stats.samples, stats.min, stats.max, stats.average
            );
        } else {
            warn!(
                "`{}`: no cpu samples collected, falling back to estimate",
                config.name
            );
        }
        if load_outcome.failed {
            warn!(
                "`{}`: load step failed, recording zero throughput",
                config.name
            );
        }

        ConfigOutcome::Recorded(results::combine(&load_outcome, &stats, config))
    }
}
