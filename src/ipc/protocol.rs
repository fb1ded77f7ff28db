// Alarm/command messages exchanged between the master and its workers

use crate::error::{VigilError, Result};
use serde::{Deserialize, Serialize};

/// A one-shot message between the master and a worker.
///
/// The three alarm kinds travel worker → master and describe the health of
/// the worker identified by `process_id`; `Terminate` travels master → worker
/// and asks that worker to drain and exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlarmMessage {
    /// Resident memory crossed the hard ceiling
    MemoryAlarm { process_id: u32 },
    /// A forced relief attempt could not reclaim enough memory
    GcIneffectiveAlarm { process_id: u32 },
    /// The hosted service failed in a way it could not recover from
    ExceptionAlarm { process_id: u32 },
    /// Drain and exit
    Terminate { process_id: u32 },
}

impl AlarmMessage {
    /// OS process id of the worker the message concerns
    pub fn process_id(&self) -> u32 {
        match *self {
            AlarmMessage::MemoryAlarm { process_id }
            | AlarmMessage::GcIneffectiveAlarm { process_id }
            | AlarmMessage::ExceptionAlarm { process_id }
            | AlarmMessage::Terminate { process_id } => process_id,
        }
    }

    /// True for the worker → master health alarms
    pub fn is_alarm(&self) -> bool {
        !matches!(self, AlarmMessage::Terminate { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AlarmMessage::MemoryAlarm { .. } => "memory alarm",
            AlarmMessage::GcIneffectiveAlarm { .. } => "gc-ineffective alarm",
            AlarmMessage::ExceptionAlarm { .. } => "exception alarm",
            AlarmMessage::Terminate { .. } => "terminate",
        }
    }

    /// Encode as a single JSON line (without the trailing newline)
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            VigilError::ProtocolError(format!("Failed to serialize message: {}", e))
        })
    }

    /// Decode one JSON line
    pub fn decode(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim()).map_err(|e| {
            VigilError::ProtocolError(format!("Failed to deserialize message: {}", e))
        })
    }
}

impl std::fmt::Display for AlarmMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} for process {}", self.kind(), self.process_id())
    }
}
