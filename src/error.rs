use thiserror::Error;

/// Main error type for the vigil worker supervisor
#[derive(Debug, Error)]
pub enum VigilError {
    // Worker process errors
    #[error("Failed to spawn worker: {0}")]
    SpawnError(String),

    #[error("Worker {0} is in invalid state for this operation: {1}")]
    InvalidProcessState(u32, String),

    #[error("Signal error: {0}")]
    SignalError(String),

    // IPC-related errors
    #[error("IPC error: {0}")]
    IpcError(String),

    #[error("IPC protocol error: {0}")]
    ProtocolError(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid configuration file: {0}")]
    InvalidConfig(String),

    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // Memory monitoring errors
    #[error("Memory sampling failed: {0}")]
    SamplingError(String),

    #[error("Memory relief failed: {0}")]
    ReliefError(String),

    // Hosted service errors
    #[error("Service error: {0}")]
    ServiceError(String),

    #[error("Log error: {0}")]
    LogError(String),

    // IO errors (automatically converted from std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for vigil operations
pub type Result<T> = std::result::Result<T, VigilError>;
