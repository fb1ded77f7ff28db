use crate::config::ClusterConfig;
use std::time::Duration;
use tokio::time::Instant;

/// Lower bound on the delay before retrying a failed spawn
const MIN_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Respawn backoff policy for dead workers
#[derive(Debug, Clone)]
pub struct RespawnPolicy {
    /// Delay before the first respawn in a quiet window
    pub initial_delay: Duration,
    /// Upper bound of the exponential backoff
    pub max_delay: Duration,
    /// Respawns older than this no longer count towards the backoff
    pub window: Duration,
}

impl RespawnPolicy {
    pub fn from_config(config: &ClusterConfig) -> Self {
        Self {
            initial_delay: config.respawn_delay(),
            max_delay: config.respawn_max_delay(),
            window: config.respawn_window(),
        }
    }

    /// Delay before the next respawn: initial * 2^recent, capped
    pub fn delay(&self, tracker: &RespawnTracker) -> Duration {
        let recent = tracker.count_recent(self.window) as u32;
        let factor = 2_u32.saturating_pow(recent);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// Delay before retrying after a spawn failure
    pub fn retry_delay(&self, tracker: &RespawnTracker) -> Duration {
        self.delay(tracker).max(MIN_RETRY_DELAY)
    }
}

impl Default for RespawnPolicy {
    fn default() -> Self {
        Self::from_config(&ClusterConfig::default())
    }
}

/// Tracks respawn history of the pool
#[derive(Debug, Clone, Default)]
pub struct RespawnTracker {
    respawn_times: Vec<Instant>,
}

impl RespawnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a respawn attempt
    pub fn record(&mut self) {
        self.respawn_times.push(Instant::now());
    }

    /// Get the total number of recorded respawns
    pub fn count(&self) -> usize {
        self.respawn_times.len()
    }

    /// Count respawns within the window
    pub fn count_recent(&self, window: Duration) -> usize {
        let now = Instant::now();
        self.respawn_times
            .iter()
            .filter(|&&time| now.duration_since(time) < window)
            .count()
    }

    /// Drop records older than the window
    pub fn prune(&mut self, window: Duration) {
        let now = Instant::now();
        self.respawn_times
            .retain(|&time| now.duration_since(time) < window);
    }
}
