// Process module - worker pool supervision on the master side

pub mod restart;
pub mod spawner;
pub mod supervisor;
pub mod types;

pub use restart::{RespawnPolicy, RespawnTracker};
pub use spawner::{ProcessSpawner, SpawnedWorker, WorkerSpawner, WORKER_NAME_ENV};
pub use supervisor::Supervisor;
pub use types::{SupervisorEvent, WorkerHandle};

/// Number of CPUs available to this process, at least one
pub fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
