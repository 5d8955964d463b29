//! loadmark: an orchestration harness for repeatable server benchmarks.
//!
//! For each named configuration it spawns the target server with a distinct
//! environment, drives load against it with an external generator, samples
//! the server's process-tree CPU utilization in the background, and merges
//! everything into a single persisted result artifact.

pub mod config;
pub mod cpu;
pub mod error;
pub mod load;
pub mod process;
pub mod results;
pub mod runner;
pub mod system;

pub use config::{default_matrix, load_matrix, BenchmarkConfig, RunSettings};
pub use cpu::{CpuProbe, CpuSample, CpuSampler, CpuStatistics, PsProbe};
pub use error::HarnessError;
pub use load::{LoadGenerator, LoadOutcome, LoadResult, OhaDriver};
pub use process::{ensure_server_binary, ProcessControl, ServerHandle, ServerManager};
pub use results::{combine, efficiency, BenchmarkResult, ResultSet, DEFAULT_CPU_ESTIMATE};
pub use runner::{ConfigOutcome, RunReport, Runner, SkipReason};
pub use system::SystemInfo;
