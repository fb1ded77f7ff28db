use crate::config::ClusterConfig;
use crate::error::{Result, VigilError};
use crate::ipc::AlarmMessage;
use crate::process::restart::{RespawnPolicy, RespawnTracker};
use crate::process::spawner::{SpawnedWorker, WorkerSpawner};
use crate::process::types::{SupervisorEvent, WorkerHandle};
use crate::process::available_cpus;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Extra time on top of the drain grace period before stragglers are killed
const SHUTDOWN_MARGIN: Duration = Duration::from_secs(2);

/// Master-side supervisor owning the worker pool
///
/// All state is mutated from the dispatch loop only. Per-worker reader and
/// exit-watcher tasks forward what they observe as [`SupervisorEvent`]s.
pub struct Supervisor<S: WorkerSpawner> {
    config: ClusterConfig,
    spawner: S,
    /// Live workers keyed by OS process id
    workers: HashMap<u32, WorkerHandle>,
    events_tx: mpsc::UnboundedSender<SupervisorEvent>,
    events_rx: mpsc::UnboundedReceiver<SupervisorEvent>,
    policy: RespawnPolicy,
    tracker: RespawnTracker,
    /// Respawns scheduled but not yet due
    pending_respawns: usize,
    /// Generation handed to the next spawned worker
    next_generation: u64,
    shutting_down: bool,
    pool_size: usize,
}

impl<S: WorkerSpawner> Supervisor<S> {
    pub fn new(config: ClusterConfig, spawner: S) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let policy = RespawnPolicy::from_config(&config);

        Self {
            config,
            spawner,
            workers: HashMap::new(),
            events_tx,
            events_rx,
            policy,
            tracker: RespawnTracker::new(),
            pending_respawns: 0,
            next_generation: 1,
            shutting_down: false,
            pool_size: 0,
        }
    }

    /// Spawn the initial pool and return its size
    ///
    /// Fails only if the very first worker cannot be spawned; later
    /// failures are retried in the background.
    pub async fn start(&mut self) -> Result<usize> {
        self.config.validate()?;
        self.pool_size = self.config.resolve_pool_size(available_cpus());

        info!(
            "Spawning {} worker processes for service {}",
            self.pool_size, self.config.name
        );

        for index in 0..self.pool_size {
            match self.spawn_worker() {
                Ok(pid) => debug!("Worker {} of {} started as {}", index + 1, self.pool_size, pid),
                Err(e) if self.workers.is_empty() => return Err(e),
                Err(e) => {
                    error!("Failed to spawn worker {}: {}", index + 1, e);
                    let delay = self.policy.retry_delay(&self.tracker);
                    self.schedule_respawn(delay);
                }
            }
        }

        Ok(self.pool_size)
    }

    /// Run the pool until SIGINT or SIGTERM, then shut it down gracefully
    pub async fn run(&mut self) -> Result<()> {
        let mut sigterm = signal(SignalKind::terminate()).map_err(|e| {
            VigilError::SignalError(format!("Failed to install SIGTERM handler: {}", e))
        })?;
        let mut sigint = signal(SignalKind::interrupt()).map_err(|e| {
            VigilError::SignalError(format!("Failed to install SIGINT handler: {}", e))
        })?;

        self.run_until(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down pool"),
                _ = sigint.recv() => info!("Received SIGINT, shutting down pool"),
            }
        })
        .await
    }

    /// Run the pool until `shutdown` resolves, then shut it down gracefully
    ///
    /// Starts the pool first unless `start` was already called.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        if self.pool_size == 0 {
            self.start().await?;
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }

        self.shutdown().await
    }

    /// Wait for the next event and handle it
    ///
    /// Returns false once no more events can arrive.
    pub async fn step(&mut self) -> bool {
        match self.events_rx.recv().await {
            Some(event) => {
                self.handle_event(event).await;
                true
            }
            None => false,
        }
    }

    /// Stop respawning, ask every worker to drain and wait for them to exit
    ///
    /// Workers still alive after the grace period plus a margin are killed.
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.shutting_down {
            return Ok(());
        }
        self.shutting_down = true;

        info!("Terminating {} worker(s)", self.workers.len());
        for handle in self.workers.values_mut() {
            if let Err(e) = handle.terminate().await {
                warn!("Failed to send terminate to worker {}: {}", handle.pid, e);
            }
        }

        let deadline = self.config.thresholds.shutdown_grace() + SHUTDOWN_MARGIN;
        let drained = tokio::time::timeout(deadline, async {
            while !self.workers.is_empty() {
                match self.events_rx.recv().await {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                }
            }
        })
        .await;

        if drained.is_err() {
            let stragglers: Vec<u32> = self.workers.keys().copied().collect();
            for pid in stragglers {
                warn!("Worker {} did not exit within {:?}, killing it", pid, deadline);
                if let Err(e) = self.spawner.kill(pid) {
                    error!("{}", e);
                }
                self.workers.remove(&pid);
            }
        }

        info!("Worker pool for service {} stopped", self.config.name);
        Ok(())
    }

    /// Pids of the live workers, sorted
    pub fn live_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.workers.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub fn pending_respawns(&self) -> usize {
        self.pending_respawns
    }

    async fn handle_event(&mut self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Message {
                pid,
                generation,
                message,
            } => {
                if self.is_current(pid, generation) {
                    self.handle_message(pid, message).await;
                } else {
                    debug!("Dropping {} from a previous worker {}", message, pid);
                }
            }
            SupervisorEvent::Disconnected { pid, generation } => {
                self.retire(pid, generation, "disconnected")
            }
            SupervisorEvent::Exited {
                pid,
                generation,
                code,
            } => match code {
                Some(code) => self.retire(pid, generation, &format!("exited with code {}", code)),
                None => self.retire(pid, generation, "was killed by a signal"),
            },
            SupervisorEvent::RespawnDue => {
                self.pending_respawns = self.pending_respawns.saturating_sub(1);
                if !self.shutting_down {
                    self.respawn_now();
                }
            }
        }
    }

    async fn handle_message(&mut self, from: u32, message: AlarmMessage) {
        if !message.is_alarm() {
            warn!("Ignoring {} sent by worker {}", message, from);
            return;
        }

        if self.shutting_down {
            debug!("Ignoring {} during shutdown", message);
            return;
        }

        let target = message.process_id();
        match self.workers.get_mut(&target) {
            Some(handle) => {
                info!("Received {}, sending terminate", message);
                if let Err(e) = handle.terminate().await {
                    warn!("Failed to send terminate to worker {}: {}", target, e);
                }
            }
            None => debug!("Dropping {}: no live worker", message),
        }
    }

    /// True if `pid` is live and still the worker spawned as `generation`
    fn is_current(&self, pid: u32, generation: u64) -> bool {
        self.workers
            .get(&pid)
            .is_some_and(|handle| handle.generation == generation)
    }

    /// Remove a worker on the first of exit/disconnect and replace it
    fn retire(&mut self, pid: u32, generation: u64, reason: &str) {
        if !self.is_current(pid, generation) {
            debug!("Worker {} {} (already retired)", pid, reason);
            return;
        }
        let handle = match self.workers.remove(&pid) {
            Some(handle) => handle,
            None => return,
        };

        if self.shutting_down {
            info!("Worker {} {}", pid, reason);
            return;
        }

        warn!(
            "Worker {} {} after {}s, spawning replacement",
            pid,
            reason,
            handle.uptime_secs()
        );

        let delay = self.policy.delay(&self.tracker);
        if delay.is_zero() {
            self.respawn_now();
        } else {
            info!("Delaying respawn by {:?}", delay);
            self.schedule_respawn(delay);
        }
    }

    fn respawn_now(&mut self) {
        self.tracker.prune(self.policy.window);
        self.tracker.record();

        match self.spawn_worker() {
            Ok(pid) => info!("Spawned replacement worker {}", pid),
            Err(e) => {
                let delay = self.policy.retry_delay(&self.tracker);
                error!("Failed to spawn replacement worker, retrying in {:?}: {}", delay, e);
                self.schedule_respawn(delay);
            }
        }
    }

    fn schedule_respawn(&mut self, delay: Duration) {
        self.pending_respawns += 1;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(SupervisorEvent::RespawnDue);
        });
    }

    fn spawn_worker(&mut self) -> Result<u32> {
        let SpawnedWorker {
            pid,
            channel,
            exited,
        } = self.spawner.spawn()?;

        let generation = self.next_generation;
        self.next_generation += 1;

        if self.workers.contains_key(&pid) {
            warn!("Pid {} reused before its previous worker was retired", pid);
        }

        let (sender, mut receiver) = channel.into_split();

        let events = self.events_tx.clone();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(Some(message)) => {
                        if events
                            .send(SupervisorEvent::Message {
                                pid,
                                generation,
                                message,
                            })
                            .is_err() {
                            break;
                        }
                    }
                    Err(VigilError::ProtocolError(e)) => {
                        debug!("Dropping malformed message from worker {}: {}", pid, e);
                    }
                    Ok(None) => {
                        let _ = events.send(SupervisorEvent::Disconnected { pid, generation });
                        break;
                    }
                    Err(e) => {
                        debug!("Channel to worker {} failed: {}", pid, e);
                        let _ = events.send(SupervisorEvent::Disconnected { pid, generation });
                        break;
                    }
                }
            }
        });

        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let code = exited.await.ok().flatten();
            let _ = events.send(SupervisorEvent::Exited {
                pid,
                generation,
                code,
            });
        });

        self.workers.insert(pid, WorkerHandle::new(pid, generation, sender));
        Ok(pid)
    }
}
