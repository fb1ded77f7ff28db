use crate::error::Result;
use crate::ipc::{AlarmMessage, AlarmSender};
use chrono::{DateTime, Utc};

/// Master-side record of one live worker
pub struct WorkerHandle {
    pub pid: u32,
    /// Spawn sequence number, tells apart workers that got the same pid
    pub generation: u64,
    pub spawned_at: DateTime<Utc>,
    sender: AlarmSender,
}

impl WorkerHandle {
    pub fn new(pid: u32, generation: u64, sender: AlarmSender) -> Self {
        Self {
            pid,
            generation,
            spawned_at: Utc::now(),
            sender,
        }
    }

    /// Seconds since the worker was spawned
    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.spawned_at).num_seconds()
    }

    /// Ask the worker to drain and exit
    pub async fn terminate(&mut self) -> Result<()> {
        self.sender
            .send(AlarmMessage::Terminate {
                process_id: self.pid,
            })
            .await
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("pid", &self.pid)
            .field("generation", &self.generation)
            .field("spawned_at", &self.spawned_at)
            .finish_non_exhaustive()
    }
}

/// Everything the supervisor's dispatch loop reacts to
///
/// Worker events carry the generation of the spawn that produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// A worker sent a message over its channel
    Message {
        pid: u32,
        generation: u64,
        message: AlarmMessage,
    },
    /// A worker's channel reached EOF or broke
    Disconnected { pid: u32, generation: u64 },
    /// A worker process exited
    Exited {
        pid: u32,
        generation: u64,
        code: Option<i32>,
    },
    /// A delayed respawn is due
    RespawnDue,
}
