//! # Worker Supervisor
//!
//! ## Responsibility
//! Spawn the `inference-worker` binary, wait for its `LISTENING <addr>`
//! readiness line, watch the child for exit, and stop it with a bounded
//! grace period.
//!
//! ## Guarantees
//! - Bounded start-up: a worker that is not ready within `startup_timeout`
//!   is killed and reported as [`WorkerError::StartupTimeout`]
//! - Bounded shutdown: closing the worker's stdin asks it to drain; after
//!   `shutdown_grace` it is killed
//! - No orphans: the child is killed if the supervisor is dropped
//!
//! ## NOT Responsible For
//! - Restarting a dead worker
//! - Talking to the worker (see `dispatch::client`)

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::WorkerError;
use crate::config::WorkerSection;
use crate::dispatch::DispatchClient;
use crate::TraceId;

/// Prefix of the readiness line the worker prints on stdout.
pub const READY_PREFIX: &str = "LISTENING ";

/// Name of the worker executable.
pub const WORKER_BIN: &str = "inference-worker";

/// Extra time allowed for the process to be reaped after a kill.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// How to start the worker.
#[derive(Debug, Clone)]
pub struct WorkerLaunch {
    /// Path to the worker executable.
    pub binary: PathBuf,
    /// Configuration file handed to the worker, if any.
    pub config_path: Option<PathBuf>,
    /// Port to listen on; 0 lets the OS choose.
    pub port: u16,
    /// Bound on reaching readiness.
    pub startup_timeout: Duration,
    /// Bound on draining before a forced kill.
    pub shutdown_grace: Duration,
}

impl WorkerLaunch {
    /// Launch settings from the `[worker]` section.
    ///
    /// Without an explicit `binary`, looks for `inference-worker` next to
    /// the current executable.
    ///
    /// # Errors
    ///
    /// [`WorkerError::BinaryNotFound`] if no binary can be located.
    pub fn from_section(section: &WorkerSection, config_path: Option<&Path>) -> Result<Self, WorkerError> {
        let binary = match &section.binary {
            Some(path) => path.clone(),
            None => sibling_binary()?,
        };
        Ok(Self {
            binary,
            config_path: config_path.map(Path::to_path_buf),
            port: section.port,
            startup_timeout: section.startup_timeout(),
            shutdown_grace: section.shutdown_grace(),
        })
    }
}

fn sibling_binary() -> Result<PathBuf, WorkerError> {
    let exe = std::env::current_exe().map_err(|e| WorkerError::BinaryNotFound(e.to_string()))?;
    let dir = exe
        .parent()
        .ok_or_else(|| WorkerError::BinaryNotFound(format!("{} has no parent", exe.display())))?;
    let candidate = dir.join(format!("{WORKER_BIN}{}", std::env::consts::EXE_SUFFIX));
    if candidate.is_file() {
        Ok(candidate)
    } else {
        Err(WorkerError::BinaryNotFound(candidate.display().to_string()))
    }
}

#[derive(Debug, Clone, Copy)]
enum StopMode {
    Graceful(Duration),
    Kill,
}

/// Handle on a running worker process.
#[derive(Debug)]
pub struct WorkerProcess {
    addr: String,
    pid: Option<u32>,
    shutdown_grace: Duration,
    stop_tx: mpsc::Sender<StopMode>,
    exit_rx: watch::Receiver<Option<String>>,
}

impl WorkerProcess {
    /// Start the worker and wait until it is ready.
    ///
    /// # Errors
    ///
    /// `Spawn` if the process cannot start, `StartupTimeout` or `Handshake`
    /// if it never reports readiness.
    pub async fn spawn(launch: &WorkerLaunch) -> Result<Self, WorkerError> {
        let mut cmd = Command::new(&launch.binary);
        cmd.arg("--port")
            .arg(launch.port.to_string())
            .arg("--parent-stdin")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(path) = &launch.config_path {
            cmd.arg("--config").arg(path);
        }

        let mut child = cmd.spawn().map_err(|source| WorkerError::Spawn {
            binary: launch.binary.display().to_string(),
            source,
        })?;
        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Handshake("worker stdout not captured".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let ready = timeout(launch.startup_timeout, read_ready_line(&mut lines)).await;
        let addr = match ready {
            Ok(Ok(addr)) => addr,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(e);
            }
            Err(_) => {
                warn!(?pid, "worker not ready in time, killing");
                let _ = child.kill().await;
                return Err(WorkerError::StartupTimeout {
                    timeout_ms: u64::try_from(launch.startup_timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
        };
        info!(?pid, %addr, "worker ready");

        // Keep draining stdout so the worker never blocks on a full pipe.
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(%line, "worker stdout");
            }
        });

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(monitor(child, stdin, stop_rx, exit_tx, pid));

        Ok(Self {
            addr,
            pid,
            shutdown_grace: launch.shutdown_grace,
            stop_tx,
            exit_rx,
        })
    }

    /// Address the worker is listening on.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// OS process id, if still known.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the process has not exited yet.
    pub fn is_alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// Wait for the process to exit and return its exit status.
    pub async fn wait_exit(&self) -> String {
        let mut rx = self.exit_rx.clone();
        let status = match rx.wait_for(Option::is_some).await {
            Ok(status) => status.clone().unwrap_or_default(),
            Err(_) => "monitor stopped".to_string(),
        };
        status
    }

    /// Ask the worker to drain and exit, killing it after the grace period.
    ///
    /// # Errors
    ///
    /// [`WorkerError::Stuck`] if the process is still not reaped afterwards.
    pub async fn shutdown(self) -> Result<String, WorkerError> {
        info!(pid = ?self.pid, grace_ms = self.shutdown_grace.as_millis() as u64, "stopping worker");
        self.stop(StopMode::Graceful(self.shutdown_grace), self.shutdown_grace + REAP_TIMEOUT)
            .await
    }

    /// Kill the worker immediately.
    ///
    /// # Errors
    ///
    /// [`WorkerError::Stuck`] if the process is not reaped in time.
    pub async fn kill(&self) -> Result<String, WorkerError> {
        warn!(pid = ?self.pid, "killing worker");
        self.stop(StopMode::Kill, REAP_TIMEOUT).await
    }

    async fn stop(&self, mode: StopMode, bound: Duration) -> Result<String, WorkerError> {
        // An already-exited monitor has dropped its receiver; that is fine.
        let _ = self.stop_tx.send(mode).await;
        timeout(bound, self.wait_exit())
            .await
            .map_err(|_| WorkerError::Stuck(format!("pid {:?} still running after {bound:?}", self.pid)))
    }
}

async fn read_ready_line(lines: &mut Lines<BufReader<ChildStdout>>) -> Result<String, WorkerError> {
    loop {
        match lines.next_line().await? {
            Some(line) => match line.strip_prefix(READY_PREFIX) {
                Some(addr) if !addr.trim().is_empty() => return Ok(addr.trim().to_string()),
                Some(_) => return Err(WorkerError::Handshake("empty address in readiness line".to_string())),
                None => debug!(%line, "worker stdout before readiness"),
            },
            None => {
                return Err(WorkerError::Handshake(
                    "worker exited before becoming ready".to_string(),
                ))
            }
        }
    }
}

async fn monitor(
    mut child: Child,
    mut stdin: Option<ChildStdin>,
    mut stop_rx: mpsc::Receiver<StopMode>,
    exit_tx: watch::Sender<Option<String>>,
    pid: Option<u32>,
) {
    let status = tokio::select! {
        status = child.wait() => {
            warn!(?pid, ?status, "worker exited unexpectedly");
            status
        }
        mode = stop_rx.recv() => match mode {
            Some(StopMode::Graceful(grace)) => {
                // EOF on stdin is the worker's drain signal.
                drop(stdin.take());
                match timeout(grace, child.wait()).await {
                    Ok(status) => status,
                    Err(_) => {
                        warn!(?pid, "worker ignored drain signal, killing");
                        let _ = child.kill().await;
                        child.wait().await
                    }
                }
            }
            Some(StopMode::Kill) | None => {
                let _ = child.kill().await;
                child.wait().await
            }
        }
    };

    let description = match status {
        Ok(status) => status.to_string(),
        Err(e) => format!("wait failed: {e}"),
    };
    info!(?pid, status = %description, "worker process reaped");
    exit_tx.send_replace(Some(description));
}

/// Probe the worker's `Health` every `interval` and log when it stops or
/// resumes answering. Runs until the returned handle is aborted.
pub fn watch_liveness(client: DispatchClient, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut healthy = true;
        loop {
            ticker.tick().await;
            match client.health(&TraceId::new("liveness")).await {
                Ok(health) => {
                    if !healthy {
                        info!("worker answering liveness probes again");
                    }
                    healthy = true;
                    debug!(in_flight = health.in_flight, uptime_ms = health.uptime_ms, "worker alive");
                }
                Err(e) => {
                    if healthy {
                        warn!(error = %e, "worker liveness probe failed");
                    }
                    healthy = false;
                }
            }
        }
    })
}
