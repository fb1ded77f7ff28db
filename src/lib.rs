// Library exports for the vigil worker supervisor

pub mod cluster;
pub mod config;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod process;
pub mod worker;

pub use cluster::Cluster;
pub use config::{ClusterConfig, ThresholdConfig};
pub use error::{Result, VigilError};
