use crate::config::ThresholdConfig;
use crate::ipc::AlarmMessage;
use crate::worker::relief::MemoryRelief;
use crate::worker::sampler::MemorySampler;
use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{error, info};

/// Shortest period the ticker runs at
const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(1);

/// Result of one memory check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Below the soft ceiling
    Idle { resident_mb: u64 },
    /// A relief attempt is still being measured
    Skipped,
    /// Above the hard ceiling
    MemoryAlarm { resident_mb: u64 },
    /// Relief reclaimed enough memory
    Relieved { before_mb: u64, after_mb: u64 },
    /// Relief ran but reclaimed too little
    GcIneffective { before_mb: u64, after_mb: u64 },
    /// Sampling or relief failed
    Failed { reason: String },
}

impl TickOutcome {
    /// The alarm this outcome raises for worker `pid`, if any
    pub fn alarm(&self, pid: u32) -> Option<AlarmMessage> {
        match self {
            TickOutcome::MemoryAlarm { .. } => Some(AlarmMessage::MemoryAlarm { process_id: pid }),
            TickOutcome::GcIneffective { .. } => {
                Some(AlarmMessage::GcIneffectiveAlarm { process_id: pid })
            }
            TickOutcome::Failed { .. } => Some(AlarmMessage::ExceptionAlarm { process_id: pid }),
            TickOutcome::Idle { .. } | TickOutcome::Skipped | TickOutcome::Relieved { .. } => None,
        }
    }
}

/// Periodic self-check of a worker's resident memory
pub struct WorkerMonitor {
    pid: u32,
    thresholds: ThresholdConfig,
    sampler: Box<dyn MemorySampler>,
    relief: Box<dyn MemoryRelief>,
    gc_in_flight: bool,
}

impl WorkerMonitor {
    pub fn new(
        pid: u32,
        thresholds: ThresholdConfig,
        sampler: impl MemorySampler + 'static,
        relief: impl MemoryRelief + 'static,
    ) -> Self {
        Self {
            pid,
            thresholds,
            sampler: Box::new(sampler),
            relief: Box::new(relief),
            gc_in_flight: false,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn thresholds(&self) -> &ThresholdConfig {
        &self.thresholds
    }

    pub fn gc_in_flight(&self) -> bool {
        self.gc_in_flight
    }

    /// Interval driving `check`; late ticks are skipped, never bunched
    pub fn ticker(&self) -> Interval {
        let mut ticker = interval(self.thresholds.check_interval().max(MIN_CHECK_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    }

    /// Run one check. The hard ceiling wins over relief.
    pub fn check(&mut self) -> TickOutcome {
        if self.gc_in_flight {
            return TickOutcome::Skipped;
        }

        let resident_mb = match self.sampler.sample() {
            Ok(sample) => sample.resident_mb,
            Err(e) => {
                error!("Worker {} failed to sample memory: {}", self.pid, e);
                return TickOutcome::Failed {
                    reason: e.to_string(),
                };
            }
        };

        let max_mb = self.thresholds.max_resident_mb;
        if resident_mb > max_mb {
            info!(
                "Worker {} resident memory {}MB exceeds limit of {}MB",
                self.pid, resident_mb, max_mb
            );
            return TickOutcome::MemoryAlarm { resident_mb };
        }

        let trigger_mb = self.thresholds.gc_trigger_mb();
        if (resident_mb as f64) > trigger_mb {
            info!(
                "Worker {} resident memory {}MB exceeds relief trigger of {:.0}MB, reclaiming",
                self.pid, resident_mb, trigger_mb
            );
            return self.relieve(resident_mb);
        }

        TickOutcome::Idle { resident_mb }
    }

    fn relieve(&mut self, before_mb: u64) -> TickOutcome {
        self.gc_in_flight = true;
        let result = self
            .relief
            .reclaim()
            .and_then(|_| self.sampler.sample());
        self.gc_in_flight = false;

        let after_mb = match result {
            Ok(sample) => sample.resident_mb,
            Err(e) => {
                error!("Worker {} memory relief failed: {}", self.pid, e);
                return TickOutcome::Failed {
                    reason: e.to_string(),
                };
            }
        };

        let freed_mb = before_mb.saturating_sub(after_mb);
        let required_mb = self.thresholds.min_recovery_mb();
        if (freed_mb as f64) < required_mb {
            info!(
                "Worker {} relief freed {}MB, less than the required {:.0}MB",
                self.pid, freed_mb, required_mb
            );
            TickOutcome::GcIneffective {
                before_mb,
                after_mb,
            }
        } else {
            info!(
                "Worker {} relief freed {}MB ({}MB -> {}MB)",
                self.pid, freed_mb, before_mb, after_mb
            );
            TickOutcome::Relieved {
                before_mb,
                after_mb,
            }
        }
    }
}
