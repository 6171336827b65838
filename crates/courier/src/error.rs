use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Backend error: {0}")]
    BackendError(String),

    /// Channel or connection level failure of a network transport.
    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Worker error: {0}")]
    WorkerError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Pipeline `{0}` has already been registered")]
    DuplicatePipeline(String),

    #[error("Undefined pipeline: {0}")]
    UndefinedPipeline(String),

    #[error("Broker is not serving")]
    NotServing,
}

impl JobError {
    /// Shorthand for handler failures.
    pub fn worker(message: impl Into<String>) -> Self {
        JobError::WorkerError(message.into())
    }
}

pub type Result<T> = std::result::Result<T, JobError>;
