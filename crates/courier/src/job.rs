use crate::error::{JobError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Retry and scheduling policy carried by every job
///
/// Network backends carry the durations in whole milliseconds, rounding any
/// sub-millisecond remainder up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    /// Maximum number of executions, `0` retries forever
    pub attempts: u32,
    /// Execution time budget advertised to the handler
    pub timeout: Duration,
    /// Delay before the first delivery
    pub delay: Duration,
    /// Flat delay between a failure and the next delivery
    pub retry_delay: Duration,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(mut self, n: u32) -> Self {
        self.attempts = n;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Whether another execution is allowed once `attempt` executions have
    /// already happened.
    pub fn can_retry(&self, attempt: u32) -> bool {
        self.attempts == 0 || attempt < self.attempts
    }

    /// Delay applied to a retried delivery. No backoff growth.
    pub fn retry_duration(&self) -> Duration {
        self.retry_delay
    }

    pub fn delay_duration(&self) -> Duration {
        self.delay
    }
}

/// Unit of work pushed into a pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub name: String,
    pub payload: Bytes,
    pub options: Options,
}

impl Job {
    pub fn new(name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            payload: payload.into(),
            options: Options::default(),
        }
    }

    /// Build a job with a JSON encoded payload
    pub fn json<T: Serialize>(name: impl Into<String>, data: &T) -> Result<Self> {
        let payload = serde_json::to_vec(data)?;
        Ok(Self::new(name, payload))
    }

    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    pub fn body(&self) -> &[u8] {
        &self.payload
    }

    /// Decode a JSON payload
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload).map_err(JobError::from)
    }
}

/// Executes one job. Implementations must tolerate concurrent calls.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, id: &str, job: &Job) -> Result<()>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(String, Job) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, id: &str, job: &Job) -> Result<()> {
        (self)(id.to_string(), job.clone()).await
    }
}

/// Receives every handler failure before the retry policy is applied.
/// Must return quickly.
pub type ErrorHandler = Arc<dyn Fn(&str, &Job, &JobError) + Send + Sync>;
