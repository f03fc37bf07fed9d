use thiserror::Error;

#[derive(Debug, Error)]
pub enum BenchError {
    /// Handle export/import or per-edge resource creation failed.
    #[error("Setup error: {0}")]
    Setup(String),

    /// The control channel or a transfer primitive reported an error.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The caller violated a documented precondition.
    #[error("Usage error: {0}")]
    Usage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BenchError>;
