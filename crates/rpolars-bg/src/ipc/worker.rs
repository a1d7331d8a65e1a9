//! Worker process management for the pool.
//!
//! Provides `WorkerProcess` for spawning and talking to one `rpolars-worker`
//! process, and `ProcessLauncher`, the pool's production [`Launcher`].

use std::io::{BufReader, BufWriter};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use crate::config::PoolConfig;
use crate::error::{RPolarsErr, RResult, Rctx};
use crate::pool::{CallError, Launcher, WorkerConn};

use super::protocol::{Handshake, JobRequest, JobResponse, read_message, write_message};
use super::rendezvous::{OneShotListener, connect};

/// Name of the worker binary.
pub const WORKER_BIN: &str = if cfg!(windows) {
    "rpolars-worker.exe"
} else {
    "rpolars-worker"
};

/// How long a worker gets to exit after its job channel closes.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Handle to a worker process.
///
/// Owns the child and the pool side of its job channel. Dropping it closes
/// the channel, which ends the worker's serving loop.
pub struct WorkerProcess {
    child: Child,
    pid: u32,
    reader: BufReader<UnixStream>,
    writer: BufWriter<UnixStream>,
}

impl WorkerProcess {
    /// Spawn a worker and complete the rendezvous handshake.
    pub fn spawn(config: &PoolConfig) -> RResult<Self> {
        let worker_path = find_worker_binary(config.worker_path.as_deref())?;
        let rendezvous = OneShotListener::bind(&config.socket_dir, "rdv")?;

        let mut child = Command::new(&worker_path)
            .arg(rendezvous.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit()) // Let worker logs pass through
            .spawn()
            .map_err(|e| {
                RPolarsErr::lift(e).push(Rctx::Transport(format!(
                    "spawning worker process '{}'",
                    worker_path.display()
                )))
            })?;

        let (hello, stream) = match handshake(&rendezvous, &mut child, config.spawn_timeout()) {
            Ok(ok) => ok,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };
        drop(rendezvous);

        tracing::debug!(
            "Worker {} connected on {}",
            hello.pid,
            hello.job_channel
        );

        let writer = stream.try_clone()?;
        Ok(Self {
            pid: child.id(),
            child,
            reader: BufReader::new(stream),
            writer: BufWriter::new(writer),
        })
    }

    /// Get the process ID of the worker.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Send one request and wait for its response.
    ///
    /// A worker that already exited, or a write that fails, leaves the
    /// request undelivered.
    pub fn call(&mut self, request: &JobRequest) -> Result<JobResponse, CallError> {
        match self.child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => {
                return Err(CallError::Undelivered(RPolarsErr::transport(format!(
                    "worker process {} already exited ({status})",
                    self.pid
                ))));
            }
            Err(e) => return Err(CallError::Undelivered(e.into())),
        }
        write_message(&mut self.writer, request).map_err(CallError::Undelivered)?;
        read_message(&mut self.reader).map_err(CallError::Lost)
    }
}

fn handshake(
    rendezvous: &OneShotListener,
    child: &mut Child,
    timeout: Duration,
) -> RResult<(Handshake, UnixStream)> {
    let started = Instant::now();
    let mut rdv = rendezvous.accept_within(timeout, || match child.try_wait() {
        Ok(Some(status)) => Err(RPolarsErr::transport(format!(
            "worker exited during startup ({status})"
        ))),
        Ok(None) => Ok(()),
        Err(e) => Err(e.into()),
    })?;

    let remaining = timeout
        .saturating_sub(started.elapsed())
        .max(Duration::from_millis(1));
    rdv.set_read_timeout(Some(remaining))?;
    let hello: Handshake = read_message(&mut rdv)?;

    let stream = connect(Path::new(&hello.job_channel))?;
    Ok((hello, stream))
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if let Err(e) = self.writer.get_ref().shutdown(Shutdown::Both) {
            tracing::debug!("Worker {} channel already closed: {}", self.pid, e);
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                _ => break,
            }
        }

        // Force kill if still running
        if let Err(e) = self.child.kill() {
            tracing::warn!("Failed to kill worker {}: {}", self.pid, e);
        }
        // Wait to reap zombie
        let _ = self.child.wait();
    }
}

impl WorkerConn for WorkerProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn call(&mut self, request: &JobRequest) -> Result<JobResponse, CallError> {
        WorkerProcess::call(self, request)
    }
}

/// Launches real `rpolars-worker` processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    config: PoolConfig,
}

impl ProcessLauncher {
    pub fn new(config: PoolConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

impl Launcher for ProcessLauncher {
    type Conn = WorkerProcess;

    fn launch(&self) -> RResult<WorkerProcess> {
        WorkerProcess::spawn(&self.config)
    }
}

/// Find the rpolars-worker binary path.
///
/// Looks in the following order:
/// 1. `explicit` (from [`PoolConfig::worker_path`])
/// 2. `RPOLARS_WORKER_PATH` environment variable
/// 3. Same directory as the current executable, or its parent
///    (test binaries live in `target/<profile>/deps`)
/// 4. System PATH
pub fn find_worker_binary(explicit: Option<&Path>) -> RResult<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(RPolarsErr::new(Rctx::BadVal(path.display().to_string()))
            .push(Rctx::Misvalued("points to an existing rpolars-worker binary".into()))
            .push(Rctx::BadArgument("worker_path".into())));
    }

    if let Ok(path) = std::env::var("RPOLARS_WORKER_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
    }

    if let Ok(exe_path) = std::env::current_exe() {
        for dir in exe_path.ancestors().skip(1).take(2) {
            let candidate = dir.join(WORKER_BIN);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }

    if let Ok(path) = which::which(WORKER_BIN) {
        return Ok(path);
    }

    Err(RPolarsErr::transport(format!("could not find the {WORKER_BIN} binary"))
        .push(Rctx::Hint(
            "set RPOLARS_WORKER_PATH or ensure it's in PATH".to_string(),
        )))
}
