//! Target server lifecycle: spawn, liveness probing, layered teardown.
//!
//! A single termination method is unreliable across platforms, and a
//! left-over process on the fixed listening port silently corrupts the next
//! configuration's results. Teardown therefore runs three idempotent steps in
//! order, each wrapped so its own failure never prevents the next from
//! running: a graceful signal to the tracked pid, a sweep of anything still
//! bound to the port, and a pattern kill as the last resort.

use crate::error::HarnessError;
use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

const HEALTH_RETRY_DELAY: Duration = Duration::from_millis(500);
const GRACEFUL_WAIT: Duration = Duration::from_secs(2);
const PORT_SWEEP_ATTEMPTS: u32 = 3;

/// A spawned target server.
#[derive(Debug)]
pub struct ServerHandle {
    child: Child,
    pid: u32,
}

impl ServerHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }
}

/// Seam between the orchestrator and the OS: spawning, probing and tearing
/// down the target server. Tests substitute fakes through this trait.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    type Handle: Send;

    /// Spawn the target server with the configuration's environment overlay,
    /// redirecting its output to `log_path`.
    async fn spawn(
        &self,
        env: &BTreeMap<String, String>,
        log_path: &Path,
    ) -> Result<Self::Handle, HarnessError>;

    fn pid(&self, handle: &Self::Handle) -> u32;

    /// Liveness probe with a retry budget. Returns false on any failure so
    /// the caller can skip the configuration rather than crash.
    async fn health_check(&self) -> bool;

    /// Best-effort layered teardown. Safe to call regardless of how far the
    /// configuration got.
    async fn terminate(&self, handle: Self::Handle);
}

/// Production [`ProcessControl`] for a server binary bound to a fixed port.
pub struct ServerManager {
    server_bin: PathBuf,
    health_url: String,
    port: u16,
    health_attempts: u32,
    health_timeout: Duration,
}

impl ServerManager {
    pub fn new(server_bin: PathBuf, health_url: String, port: u16) -> Self {
        Self {
            server_bin,
            health_url,
            port,
            health_attempts: 10,
            health_timeout: Duration::from_secs(2),
        }
    }

    pub fn health_budget(mut self, attempts: u32, timeout: Duration) -> Self {
        self.health_attempts = attempts;
        self.health_timeout = timeout;
        self
    }

    /// Kill anything still bound to the port. Returns true when the port was
    /// observed free. `lsof` exiting nonzero means nothing matched.
    async fn sweep_port(&self) -> bool {
        for attempt in 1..=PORT_SWEEP_ATTEMPTS {
            let holders = match port_holders(self.port).await {
                Ok(holders) => holders,
                Err(e) => {
                    let err = HarnessError::Teardown {
                        step: "port sweep",
                        source: e,
                    };
                    warn!("{err}");
                    return false;
                }
            };
            if holders.is_empty() {
                return true;
            }
            debug!(
                "port {} still held by {holders:?} (sweep attempt {attempt})",
                self.port
            );
            for pid in holders {
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                    debug!("SIGKILL to port holder {pid} failed: {e}");
                }
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        false
    }
}

#[async_trait]
impl ProcessControl for ServerManager {
    type Handle = ServerHandle;

    async fn spawn(
        &self,
        env: &BTreeMap<String, String>,
        log_path: &Path,
    ) -> Result<ServerHandle, HarnessError> {
        // Anything lingering on the port from outside the harness would
        // corrupt this run's measurements.
        if !self.sweep_port().await {
            warn!("port {} may still be in use before spawn", self.port);
        }

        let log = std::fs::File::create(log_path)?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(&self.server_bin);
        cmd.envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        let child = cmd.spawn().map_err(|source| HarnessError::Spawn {
            path: self.server_bin.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or_default();
        info!("server spawned: {} (pid {pid})", self.server_bin.display());
        Ok(ServerHandle { child, pid })
    }

    fn pid(&self, handle: &ServerHandle) -> u32 {
        handle.pid()
    }

    async fn health_check(&self) -> bool {
        let client = match reqwest::Client::builder()
            .timeout(self.health_timeout)
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                warn!("could not build health check client: {e}");
                return false;
            }
        };
        for attempt in 1..=self.health_attempts {
            match client.get(&self.health_url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!("health probe succeeded on attempt {attempt}");
                    return true;
                }
                Ok(resp) => debug!("health probe returned {}", resp.status()),
                Err(e) => debug!("health probe failed: {e}"),
            }
            tokio::time::sleep(HEALTH_RETRY_DELAY).await;
        }
        let err = HarnessError::HealthCheckTimeout {
            url: self.health_url.clone(),
            attempts: self.health_attempts,
        };
        warn!("{err}");
        false
    }

    async fn terminate(&self, mut handle: ServerHandle) {
        // Step 1: graceful signal to the tracked pid.
        if let Err(e) = kill(Pid::from_raw(handle.pid as i32), Signal::SIGTERM) {
            debug!("SIGTERM to pid {} failed: {e}", handle.pid);
        }
        match tokio::time::timeout(GRACEFUL_WAIT, handle.child.wait()).await {
            Ok(Ok(status)) => debug!("server exited: {status}"),
            Ok(Err(e)) => debug!("could not reap server: {e}"),
            Err(_) => debug!("server did not exit within {GRACEFUL_WAIT:?}"),
        }

        // Step 2: force-kill anything still bound to the listening port. The
        // port is not considered free until this observed nothing bound.
        if self.sweep_port().await {
            debug!("port {} confirmed free", self.port);
        } else {
            warn!("port {} not confirmed free after sweep", self.port);
        }

        // Step 3: pattern kill as the last resort. Anchored to the whole
        // command line: the server is spawned with no arguments, so only a
        // process whose argv is exactly the binary path matches. Unanchored,
        // any argv that merely mentions the path would match, including the
        // harness's own `--server-bin` invocation.
        let pattern = format!("^{}$", self.server_bin.to_string_lossy());
        match Command::new("pkill")
            .arg("-f")
            .arg(&pattern)
            .status()
            .await
        {
            // pkill exits 1 when no process matched, which is the usual case
            Ok(status) => debug!("pkill finished: {status}"),
            Err(e) => {
                let err = HarnessError::Teardown {
                    step: "pattern kill",
                    source: e,
                };
                warn!("{err}");
            }
        }
    }
}

/// Preflight for the target binary. A missing binary that looks like a
/// workspace build artifact triggers one best-effort `cargo build --release`
/// before giving up; anything else missing is an immediate error.
pub async fn ensure_server_binary(path: &Path) -> Result<(), HarnessError> {
    if path.exists() {
        return Ok(());
    }
    if path.is_relative() && path.starts_with("target") && Path::new("Cargo.toml").exists() {
        info!(
            "{} missing, attempting `cargo build --release`",
            path.display()
        );
        match Command::new("cargo")
            .args(["build", "--release"])
            .status()
            .await
        {
            Ok(status) if status.success() => {}
            Ok(status) => warn!("cargo build exited with {status}"),
            Err(e) => warn!("could not run cargo build: {e}"),
        }
    }
    if path.exists() {
        Ok(())
    } else {
        Err(HarnessError::MissingServerBin(path.to_path_buf()))
    }
}

/// Pids currently bound to `port` according to `lsof`.
async fn port_holders(port: u16) -> std::io::Result<Vec<u32>> {
    let out = Command::new("lsof")
        .args(["-t", &format!("-i:{port}")])
        .output()
        .await?;
    if !out.status.success() {
        return Ok(Vec::new());
    }
    Ok(String::from_utf8_lossy(&out.stdout)
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect())
}
