use crate::error::{VigilError, Result};
use crate::ipc::{AlarmChannel, CHANNEL_FD_ENV};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Environment variable carrying the service name into workers
pub const WORKER_NAME_ENV: &str = "VIGIL_WORKER_NAME";

/// Descriptor the worker end of the channel is installed on
const CHANNEL_FD: RawFd = 3;

/// A freshly spawned worker as seen by the master
#[derive(Debug)]
pub struct SpawnedWorker {
    /// Process ID assigned by the OS
    pub pid: u32,

    /// Master end of the worker's alarm channel
    pub channel: AlarmChannel,

    /// Resolves with the exit code once the process is gone
    pub exited: oneshot::Receiver<Option<i32>>,
}

/// The OS process primitive the supervisor drives
pub trait WorkerSpawner: Send {
    /// Start one worker process
    fn spawn(&mut self) -> Result<SpawnedWorker>;

    /// Kill a worker that did not exit on its own
    fn kill(&mut self, pid: u32) -> Result<()>;
}

/// Spawns workers by re-executing a program with the channel on fd 3
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
    name: String,
    cwd: Option<PathBuf>,
    env: HashMap<String, String>,
}

impl ProcessSpawner {
    pub fn new(program: PathBuf, args: Vec<String>, name: &str) -> Self {
        Self {
            program,
            args,
            name: name.to_string(),
            cwd: None,
            env: HashMap::new(),
        }
    }

    /// Re-execute the running binary with its own arguments
    pub fn current_exe(name: &str) -> Result<Self> {
        let program = std::env::current_exe().map_err(|e| {
            VigilError::SpawnError(format!("Failed to resolve current executable: {}", e))
        })?;
        let args = std::env::args().skip(1).collect();
        Ok(Self::new(program, args, name))
    }

    pub fn with_cwd(mut self, cwd: PathBuf) -> Self {
        self.cwd = Some(cwd);
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&mut self) -> Result<SpawnedWorker> {
        if !self.program.exists() {
            return Err(VigilError::SpawnError(format!(
                "Program does not exist: {}",
                self.program.display()
            )));
        }

        let (master_end, worker_end) = UnixStream::pair().map_err(|e| {
            VigilError::SpawnError(format!("Failed to create channel socket pair: {}", e))
        })?;

        let mut command = Command::new(&self.program);
        command.args(&self.args);

        if let Some(ref cwd) = self.cwd {
            command.current_dir(cwd);
        }

        for (key, value) in &self.env {
            command.env(key, value);
        }

        command.env(CHANNEL_FD_ENV, CHANNEL_FD.to_string());
        command.env(WORKER_NAME_ENV, &self.name);

        // Workers log to the master's stderr; stdin is not theirs to read
        command.stdin(Stdio::null());
        command.stdout(Stdio::inherit());
        command.stderr(Stdio::inherit());

        let worker_fd = worker_end.as_raw_fd();
        // SAFETY: only async-signal-safe libc calls run between fork and exec.
        unsafe {
            command.pre_exec(move || {
                use nix::libc;
                if worker_fd == CHANNEL_FD {
                    // dup2 onto itself keeps FD_CLOEXEC, clear it by hand
                    if libc::fcntl(worker_fd, libc::F_SETFD, 0) == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                } else if libc::dup2(worker_fd, CHANNEL_FD) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = command.spawn().map_err(|e| {
            VigilError::SpawnError(format!("Failed to spawn worker '{}': {}", self.name, e))
        })?;

        // The child holds its own copy now
        drop(worker_end);

        let pid = child.id().ok_or_else(|| {
            VigilError::SpawnError(format!("Failed to get PID for worker '{}'", self.name))
        })?;

        let channel = AlarmChannel::from_std(master_end)?;

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("Failed to wait for worker {}: {}", pid, e);
                    None
                }
            };
            let _ = exit_tx.send(code);
        });

        debug!("Spawned worker process {} ({})", pid, self.program.display());

        Ok(SpawnedWorker {
            pid,
            channel,
            exited: exit_rx,
        })
    }

    fn kill(&mut self, pid: u32) -> Result<()> {
        signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL).map_err(|e| {
            VigilError::SignalError(format!("Failed to send SIGKILL to worker {}: {}", pid, e))
        })
    }
}
