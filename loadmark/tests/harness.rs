//! End-to-end orchestration scenarios, driven through fake collaborators at
//! the process/load/probe seams.

use async_trait::async_trait;
use loadmark::{
    BenchmarkConfig, CpuProbe, CpuSampler, HarnessError, LoadGenerator, LoadOutcome, LoadResult,
    ProcessControl, Runner, SkipReason, SystemInfo,
};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn matrix(names: &[&str]) -> Vec<BenchmarkConfig> {
    names
        .iter()
        .map(|name| BenchmarkConfig {
            name: name.to_string(),
            description: format!("{name} under test"),
            server_env: BTreeMap::new(),
            load_env: BTreeMap::new(),
            cpu_estimate: None,
        })
        .collect()
}

struct FakeProcess {
    spawn_ok: bool,
    health: Mutex<VecDeque<bool>>,
    terminations: Arc<AtomicUsize>,
}

impl FakeProcess {
    fn new(spawn_ok: bool, health: &[bool]) -> Self {
        Self {
            spawn_ok,
            health: Mutex::new(health.iter().copied().collect()),
            terminations: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn terminations(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.terminations)
    }
}

#[async_trait]
impl ProcessControl for FakeProcess {
    type Handle = ();

    async fn spawn(
        &self,
        _env: &BTreeMap<String, String>,
        _log_path: &Path,
    ) -> Result<(), HarnessError> {
        if self.spawn_ok {
            Ok(())
        } else {
            Err(HarnessError::Spawn {
                path: "/nonexistent/server".into(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
            })
        }
    }

    fn pid(&self, _handle: &()) -> u32 {
        4242
    }

    async fn health_check(&self) -> bool {
        // Exhausting the script means healthy; scenarios override per config.
        self.health.lock().unwrap().pop_front().unwrap_or(true)
    }

    async fn terminate(&self, _handle: ()) {
        self.terminations.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeLoad {
    rps: f64,
    failed: bool,
    hold: Duration,
}

#[async_trait]
impl LoadGenerator for FakeLoad {
    async fn run(&self, _env: &BTreeMap<String, String>) -> LoadOutcome {
        tokio::time::sleep(self.hold).await;
        LoadOutcome {
            result: LoadResult {
                requests_per_sec: self.rps,
            },
            failed: self.failed,
        }
    }
}

struct ScriptedProbe {
    readings: Mutex<VecDeque<f64>>,
}

impl ScriptedProbe {
    fn new(readings: &[f64]) -> Arc<Self> {
        Arc::new(Self {
            readings: Mutex::new(readings.iter().copied().collect()),
        })
    }
}

#[async_trait]
impl CpuProbe for ScriptedProbe {
    async fn sample(&self, _pid: u32) -> Option<f64> {
        self.readings.lock().unwrap().pop_front()
    }
}

fn sampler(readings: &[f64]) -> CpuSampler {
    CpuSampler::with_probe(ScriptedProbe::new(readings), Duration::from_millis(5))
}

fn runner<P: ProcessControl, L: LoadGenerator>(
    process: P,
    load: L,
    sampler: CpuSampler,
) -> Runner<P, L> {
    Runner::new(process, load, sampler)
        .pause(Duration::ZERO)
        .log_dir(std::env::temp_dir())
}

#[tokio::test]
async fn scenario_two_healthy_configs_record_trimmed_cpu_and_efficiency() {
    let process = FakeProcess::new(true, &[]);
    let load = FakeLoad {
        rps: 1000.0,
        failed: false,
        hold: Duration::from_millis(300),
    };
    let runner = runner(process, load, sampler(&[40.0, 50.0, 60.0, 55.0, 45.0]));

    let report = runner
        .run(&matrix(&["first", "second"]), SystemInfo::placeholder())
        .await
        .unwrap();

    assert_eq!(report.results.benchmarks.len(), 2);
    assert!(report.skipped.is_empty());

    // The probe readings all land in the first configuration's window; first
    // and last are trimmed, so avg(50, 60, 55) = 55.
    let first = &report.results.benchmarks[0];
    assert!(first.cpu_measurement.measured);
    assert_eq!(first.cpu_measurement.samples, 5);
    assert!((first.cpu_usage - 55.0).abs() < f64::EPSILON);
    assert!((first.efficiency - 1818.1818).abs() < 0.001);

    // The second configuration exhausts the probe and falls back to the
    // default estimate.
    let second = &report.results.benchmarks[1];
    assert!(!second.cpu_measurement.measured);
    assert_eq!(second.cpu_usage, loadmark::DEFAULT_CPU_ESTIMATE);
}

#[tokio::test]
async fn scenario_load_failure_still_records_a_flagged_row() {
    let process = FakeProcess::new(true, &[]);
    let load = FakeLoad {
        rps: 0.0,
        failed: true,
        hold: Duration::from_millis(50),
    };
    let runner = runner(process, load, sampler(&[50.0, 50.0, 50.0]));

    let report = runner
        .run(&matrix(&["first", "second"]), SystemInfo::placeholder())
        .await
        .unwrap();

    // Both rows present: a failed load step degrades, it does not drop.
    assert_eq!(report.results.benchmarks.len(), 2);
    for row in &report.results.benchmarks {
        assert!(row.load_failed);
        assert_eq!(row.throughput, 0.0);
        assert_eq!(row.efficiency, 0.0);
    }
}

#[tokio::test]
async fn scenario_all_unhealthy_is_fatal_but_still_tears_down() {
    let process = FakeProcess::new(true, &[false, false]);
    let terminations = process.terminations();
    let load = FakeLoad {
        rps: 1000.0,
        failed: false,
        hold: Duration::from_millis(10),
    };
    let runner = runner(process, load, sampler(&[]));

    let err = runner
        .run(&matrix(&["first", "second"]), SystemInfo::placeholder())
        .await
        .unwrap_err();

    assert!(matches!(err, HarnessError::NoResults));
    // Teardown ran for every skipped configuration even though nothing was
    // recorded.
    assert_eq!(terminations.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failed_spawn_skips_without_teardown() {
    let process = FakeProcess::new(false, &[]);
    let terminations = process.terminations();
    let load = FakeLoad {
        rps: 1000.0,
        failed: false,
        hold: Duration::from_millis(10),
    };
    let runner = runner(process, load, sampler(&[]));

    let err = runner
        .run(&matrix(&["only"]), SystemInfo::placeholder())
        .await
        .unwrap_err();

    assert!(matches!(err, HarnessError::NoResults));
    assert_eq!(terminations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn one_unhealthy_config_does_not_abort_the_matrix() {
    let process = FakeProcess::new(true, &[false, true]);
    let terminations = process.terminations();
    let load = FakeLoad {
        rps: 500.0,
        failed: false,
        hold: Duration::from_millis(50),
    };
    let runner = runner(process, load, sampler(&[50.0, 50.0]));

    let report = runner
        .run(&matrix(&["flaky", "steady"]), SystemInfo::placeholder())
        .await
        .unwrap();

    assert_eq!(report.results.benchmarks.len(), 1);
    assert_eq!(report.results.benchmarks[0].config.name, "steady");
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].0, "flaky");
    assert_eq!(report.skipped[0].1, SkipReason::NeverHealthy);
    // One teardown for the lingering unhealthy server, one for the recorded
    // configuration.
    assert_eq!(terminations.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn no_pause_after_the_final_configuration() {
    let process = FakeProcess::new(true, &[]);
    let load = FakeLoad {
        rps: 100.0,
        failed: false,
        hold: Duration::from_millis(10),
    };
    let runner = Runner::new(process, load, sampler(&[50.0]))
        .pause(Duration::from_millis(500))
        .log_dir(std::env::temp_dir());

    let started = std::time::Instant::now();
    let report = runner
        .run(&matrix(&["only"]), SystemInfo::placeholder())
        .await
        .unwrap();

    assert_eq!(report.results.benchmarks.len(), 1);
    // The pause only separates configurations; a single-entry matrix must
    // finish well inside one pause.
    assert!(started.elapsed() < Duration::from_millis(400));
}

#[cfg(unix)]
mod real_process {
    use loadmark::{ProcessControl, ServerManager};
    use std::collections::BTreeMap;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    fn sleeper_script() -> PathBuf {
        let path = std::env::temp_dir().join(format!("loadmark-e2e-sleeper-{}", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\nexec sleep 30").unwrap();
        let mut perms = file.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[tokio::test]
    async fn port_is_bindable_after_teardown() {
        // Pick a port nothing is using, then hand it to the manager.
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let bin = sleeper_script();
        let manager = ServerManager::new(bin.clone(), format!("http://127.0.0.1:{port}/"), port);
        let log = std::env::temp_dir().join("loadmark-e2e-sleeper.log");

        let handle = manager.spawn(&BTreeMap::new(), &log).await.unwrap();
        manager.terminate(handle).await;

        // The mandatory teardown must leave the port free for the next
        // configuration.
        assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
        let _ = std::fs::remove_file(bin);
        let _ = std::fs::remove_file(log);
    }
}
