// Cluster entry point - one binary, master or worker role

use crate::config::ClusterConfig;
use crate::error::{Result, VigilError};
use crate::ipc::{AlarmChannel, CHANNEL_FD_ENV};
use crate::logging;
use crate::process::{ProcessSpawner, Supervisor, WORKER_NAME_ENV};
use crate::worker::{
    run_worker, AllocatorTrim, MemoryRelief, ProcessSampler, ReliefChain, ServiceContext,
    WorkerMonitor,
};
use std::future::Future;
use std::path::Path;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info};

/// A pool of worker processes running the same service
///
/// The master re-executes the current binary for every worker; the
/// inherited alarm channel tells the two roles apart.
pub struct Cluster {
    config: ClusterConfig,
    relief: ReliefChain,
}

impl Cluster {
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config,
            relief: ReliefChain::new().with(AllocatorTrim),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Ok(Self::new(ClusterConfig::from_file(path)?))
    }

    /// Add a relief hook run after the allocator trim
    pub fn with_relief(mut self, hook: impl MemoryRelief + 'static) -> Self {
        self.relief.push(Box::new(hook));
        self
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// True when this process was spawned as a worker
    pub fn is_worker() -> bool {
        std::env::var_os(CHANNEL_FD_ENV).is_some()
    }

    /// Run in whichever role this process has
    ///
    /// In the master this returns after the pool has been shut down. In a
    /// worker `start` is called with the service context and the process
    /// exits once the service has drained. An invalid configuration is
    /// rejected before either role starts.
    pub async fn run<Start, Fut>(self, start: Start) -> Result<()>
    where
        Start: FnOnce(ServiceContext) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.config.validate()?;
        let guard = logging::init(&self.config)?;

        match AlarmChannel::from_env()? {
            None => self.run_master().await,
            Some(channel) => {
                self.run_worker(channel, start).await?;
                drop(guard);
                std::process::exit(0)
            }
        }
    }

    async fn run_master(self) -> Result<()> {
        info!(
            "Starting master {} for service {}",
            std::process::id(),
            self.config.name
        );

        let spawner = ProcessSpawner::current_exe(&self.config.name)?;
        let mut supervisor = Supervisor::new(self.config, spawner);
        supervisor.run().await
    }

    async fn run_worker<Start, Fut>(mut self, channel: AlarmChannel, start: Start) -> Result<()>
    where
        Start: FnOnce(ServiceContext) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if let Ok(name) = std::env::var(WORKER_NAME_ENV) {
            self.config.name = name;
        }
        set_title(&self.config.name);

        let mut sigterm = signal(SignalKind::terminate()).map_err(|e| {
            VigilError::SignalError(format!("Failed to install SIGTERM handler: {}", e))
        })?;
        let mut sigint = signal(SignalKind::interrupt()).map_err(|e| {
            VigilError::SignalError(format!("Failed to install SIGINT handler: {}", e))
        })?;
        let stop = async move {
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = sigint.recv() => {}
            }
        };

        let monitor = WorkerMonitor::new(
            std::process::id(),
            self.config.thresholds.clone(),
            ProcessSampler::current(),
            self.relief,
        );

        let kind = run_worker(&self.config, monitor, channel, stop, start).await?;
        info!("Worker {} exiting after {:?} termination", std::process::id(), kind);
        Ok(())
    }
}

/// Name the calling thread after the service, so the worker shows up by
/// name in `ps` and `top`. Linux truncates it to 15 bytes.
#[cfg(target_os = "linux")]
fn set_title(name: &str) {
    let title = match std::ffi::CString::new(name) {
        Ok(title) => title,
        Err(e) => {
            debug!("Not setting process title '{}': {}", name, e);
            return;
        }
    };
    if let Err(e) = nix::sys::prctl::set_name(&title) {
        debug!("Failed to set process title '{}': {}", name, e);
    }
}

#[cfg(not(target_os = "linux"))]
fn set_title(name: &str) {
    debug!("Process titles are not supported here, keeping name for '{}'", name);
}
