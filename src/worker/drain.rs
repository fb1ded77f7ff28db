use crate::error::{Result, VigilError};
use crate::ipc::AlarmMessage;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// The part of the hosted service the drain controller drives
pub trait HostedService {
    /// Stop taking new connections or requests; in-flight work continues
    fn stop_accepting(&mut self);
}

/// How a drain ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationKind {
    /// The service confirmed it finished its in-flight work
    Clean,
    /// The grace period ran out first
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainPhase {
    Running,
    Draining,
    Terminated(TerminationKind),
}

impl fmt::Display for DrainPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrainPhase::Running => write!(f, "running"),
            DrainPhase::Draining => write!(f, "draining"),
            DrainPhase::Terminated(TerminationKind::Clean) => write!(f, "terminated (clean)"),
            DrainPhase::Terminated(TerminationKind::Forced) => write!(f, "terminated (forced)"),
        }
    }
}

/// Turns a terminate command into a bounded, one-shot graceful stop
pub struct DrainController<S: HostedService> {
    pid: u32,
    grace: Duration,
    service: S,
    phase: DrainPhase,
}

impl<S: HostedService> DrainController<S> {
    pub fn new(pid: u32, grace: Duration, service: S) -> Self {
        Self {
            pid,
            grace,
            service,
            phase: DrainPhase::Running,
        }
    }

    pub fn phase(&self) -> DrainPhase {
        self.phase
    }

    pub fn is_draining(&self) -> bool {
        self.phase != DrainPhase::Running
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    /// Handle a command from the master
    ///
    /// Returns true only when this command started the drain.
    pub fn on_command(&mut self, message: &AlarmMessage) -> bool {
        match message {
            AlarmMessage::Terminate { process_id } if *process_id == self.pid => {
                if self.is_draining() {
                    debug!("Worker {} already {}, ignoring terminate", self.pid, self.phase);
                    return false;
                }
                info!("Worker {} slated for termination", self.pid);
                self.enter_draining();
                true
            }
            AlarmMessage::Terminate { process_id } => {
                warn!(
                    "Worker {} ignoring terminate addressed to {}",
                    self.pid, process_id
                );
                false
            }
            AlarmMessage::MemoryAlarm { .. }
            | AlarmMessage::GcIneffectiveAlarm { .. }
            | AlarmMessage::ExceptionAlarm { .. } => {
                warn!("Worker {} ignoring unexpected {}", self.pid, message);
                false
            }
        }
    }

    /// Start draining for a local reason
    ///
    /// Returns false if a drain was already under way.
    pub fn begin(&mut self, reason: &str) -> bool {
        if self.is_draining() {
            debug!("Worker {} already {}: {}", self.pid, self.phase, reason);
            return false;
        }
        info!("Worker {} draining: {}", self.pid, reason);
        self.enter_draining();
        true
    }

    fn enter_draining(&mut self) {
        self.phase = DrainPhase::Draining;
        self.service.stop_accepting();
    }

    /// Wait for the service to drain or for the grace period, whichever is first
    pub async fn await_termination<F>(&mut self, drained: F) -> Result<TerminationKind>
    where
        F: Future<Output = ()>,
    {
        if self.phase != DrainPhase::Draining {
            return Err(VigilError::InvalidProcessState(
                self.pid,
                format!("cannot await termination while {}", self.phase),
            ));
        }

        let kind = tokio::select! {
            _ = drained => TerminationKind::Clean,
            _ = sleep(self.grace) => TerminationKind::Forced,
        };

        match kind {
            TerminationKind::Clean => info!("Worker {} closed", self.pid),
            TerminationKind::Forced => warn!(
                "Worker {} did not drain within {:?}, forcing termination",
                self.pid, self.grace
            ),
        }

        self.phase = DrainPhase::Terminated(kind);
        Ok(kind)
    }
}
