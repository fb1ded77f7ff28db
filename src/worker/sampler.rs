use crate::error::{Result, VigilError};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// One memory reading of a process, in whole megabytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySample {
    /// Resident set size
    pub resident_mb: u64,
    /// Virtual memory size
    pub virtual_mb: u64,
}

impl MemorySample {
    pub fn from_bytes(resident: u64, virtual_: u64) -> Self {
        Self {
            resident_mb: bytes_to_mb(resident),
            virtual_mb: bytes_to_mb(virtual_),
        }
    }
}

/// Reads the memory usage of a process on demand
pub trait MemorySampler: Send {
    fn sample(&mut self) -> Result<MemorySample>;
}

/// Samples a process through `sysinfo`
pub struct ProcessSampler {
    system: System,
    pid: Pid,
}

impl ProcessSampler {
    pub fn new(pid: u32) -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(pid),
        }
    }

    /// Sampler for the calling process
    pub fn current() -> Self {
        Self::new(std::process::id())
    }
}

impl MemorySampler for ProcessSampler {
    fn sample(&mut self) -> Result<MemorySample> {
        // Only memory is needed, skip CPU and disk accounting
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );

        let process = self.system.process(self.pid).ok_or_else(|| {
            VigilError::SamplingError(format!("Process {} not found", self.pid))
        })?;

        Ok(MemorySample::from_bytes(
            process.memory(),
            process.virtual_memory(),
        ))
    }
}

/// Round a byte count to the nearest megabyte
fn bytes_to_mb(bytes: u64) -> u64 {
    (bytes + BYTES_PER_MB / 2) / BYTES_PER_MB
}
