// Worker module - memory self-monitoring and graceful drain inside each worker

pub mod drain;
pub mod monitor;
pub mod relief;
pub mod runtime;
pub mod sampler;

pub use drain::{DrainController, DrainPhase, HostedService, TerminationKind};
pub use monitor::{TickOutcome, WorkerMonitor};
pub use relief::{AllocatorTrim, MemoryRelief, ReliefChain, ReliefFn};
pub use runtime::{run_worker, ExceptionReporter, ServiceContext, ShutdownSignal};
pub use sampler::{MemorySample, MemorySampler, ProcessSampler};
