//! Contract between a pipeline engine and the backend moving its jobs

use crate::error::Result;
use crate::job::Job;
use crate::stat::Stat;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;

/// Settles a delivery at the transport
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// The delivery is permanently consumed.
    async fn ack(&self) -> Result<()>;

    /// The delivery is rejected, optionally put back for redelivery.
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// One attempt of a job in flight
pub struct Delivery {
    pub id: String,
    /// Number of executions that already happened for this job
    pub attempt: u32,
    pub job: Job,
    acker: Box<dyn Acknowledger>,
    // released when the delivery is settled and dropped
    _claim: Option<OwnedSemaphorePermit>,
}

impl Delivery {
    pub fn new(
        id: impl Into<String>,
        attempt: u32,
        job: Job,
        acker: impl Acknowledger + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            attempt,
            job,
            acker: Box::new(acker),
            _claim: None,
        }
    }

    /// Hold a claim on transport capacity until this delivery is dropped
    pub fn with_claim(mut self, claim: Option<OwnedSemaphorePermit>) -> Self {
        self._claim = claim;
        self
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("id", &self.id)
            .field("attempt", &self.attempt)
            .field("job", &self.job.name)
            .finish()
    }
}

/// Deliveries of one subscription. The stream ends when the subscription is
/// cancelled or its channel fails.
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// Backend specific mechanics of a single pipeline
#[async_trait]
pub trait Transport: Send + Sync {
    /// Name reported in [`Stat::internal_name`]
    fn internal_name(&self) -> &str;

    /// Resolves once the transport can be subscribed to. An error is fatal
    /// for the pipeline.
    async fn connected(&self) -> Result<()> {
        Ok(())
    }

    /// Start yielding deliveries.
    async fn subscribe(&self) -> Result<DeliveryStream>;

    /// Submit a job, visible to consumers once `delay` has elapsed.
    async fn publish(&self, id: &str, attempt: u32, job: &Job, delay: Duration) -> Result<()>;

    /// Stop yielding new deliveries. Deliveries already handed out remain
    /// valid and can still be settled.
    async fn cancel(&self) -> Result<()>;

    /// Queue and delay counters. `active` is tracked by the engine.
    async fn stat(&self) -> Result<Stat>;
}
