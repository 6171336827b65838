use super::Backend;
use crate::error::{JobError, Result};
use crate::event::EventSink;
use crate::job::Job;
use crate::pipeline::Pipeline;
use crate::stat::{Stat, StatCounters};
use crate::transport::{Acknowledger, Delivery, DeliveryStream, Transport};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};

const INTERNAL_NAME: &str = ":memory:";

/// In-process backend (not persistent, jobs are lost on exit)
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryBackend;

impl MemoryBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "ephemeral"
    }

    fn open(&self, pipeline: &Pipeline, _events: &EventSink) -> Result<Arc<dyn Transport>> {
        let concurrency = pipeline.integer("concurrency", 0);
        let concurrency = usize::try_from(concurrency).map_err(|_| {
            JobError::ConfigError(format!(
                "invalid `concurrency` {} on pipeline `{}`",
                concurrency,
                pipeline.name()
            ))
        })?;

        Ok(Arc::new(MemoryQueue::new(concurrency)))
    }
}

#[derive(Debug, Clone)]
struct Entry {
    id: String,
    attempt: u32,
    job: Job,
}

/// FIFO queue living in process memory.
///
/// `concurrency` caps how many deliveries may be claimed at once, on top of
/// the engine's handler pool. `0` leaves claims unbounded.
#[derive(Clone)]
pub struct MemoryQueue {
    shared: Arc<Shared>,
}

struct Shared {
    tx: mpsc::UnboundedSender<Entry>,
    rx: Mutex<mpsc::UnboundedReceiver<Entry>>,
    claims: Option<Arc<Semaphore>>,
    done: watch::Sender<bool>,
    stats: StatCounters,
}

impl MemoryQueue {
    pub fn new(concurrency: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (done, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                tx,
                rx: Mutex::new(rx),
                claims: (concurrency > 0).then(|| Arc::new(Semaphore::new(concurrency))),
                done,
                stats: StatCounters::new(),
            }),
        }
    }
}

impl Shared {
    fn enqueue(&self, entry: Entry) -> Result<()> {
        self.tx
            .send(entry)
            .map_err(|_| JobError::BackendError("memory queue closed".to_string()))
    }

    /// Claim capacity and take the next entry, or `None` once cancelled.
    async fn next(self: &Arc<Self>) -> Option<Delivery> {
        let mut done = self.done.subscribe();

        let claim = match &self.claims {
            Some(claims) => tokio::select! {
                biased;
                _ = cancelled(&mut done) => return None,
                claim = Arc::clone(claims).acquire_owned() => Some(claim.ok()?),
            },
            None => None,
        };

        let mut rx = self.rx.lock().await;
        let entry = tokio::select! {
            biased;
            _ = cancelled(&mut done) => return None,
            entry = rx.recv() => entry?,
        };
        drop(rx);

        let acker = MemoryAck {
            shared: Arc::clone(self),
            entry: entry.clone(),
        };
        Some(Delivery::new(entry.id, entry.attempt, entry.job, acker).with_claim(claim))
    }
}

async fn cancelled(done: &mut watch::Receiver<bool>) {
    let _ = done.wait_for(|done| *done).await;
}

#[async_trait]
impl Transport for MemoryQueue {
    fn internal_name(&self) -> &str {
        INTERNAL_NAME
    }

    async fn subscribe(&self) -> Result<DeliveryStream> {
        // a fresh subscription reopens a queue cancelled by a previous stop
        self.shared.done.send_replace(false);

        let stream = futures_util::stream::unfold(Arc::clone(&self.shared), |shared| async move {
            let delivery = shared.next().await?;
            Some((delivery, shared))
        });
        Ok(stream.boxed())
    }

    async fn publish(&self, id: &str, attempt: u32, job: &Job, delay: Duration) -> Result<()> {
        let entry = Entry {
            id: id.to_string(),
            attempt,
            job: job.clone(),
        };

        if delay.is_zero() {
            self.shared.stats.queued();
            return self.shared.enqueue(entry);
        }

        self.shared.stats.delayed();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shared.stats.undelayed();
            shared.stats.queued();
            if let Err(err) = shared.enqueue(entry) {
                tracing::error!(error = %err, "dropping delayed job");
            }
        });
        Ok(())
    }

    async fn cancel(&self) -> Result<()> {
        self.shared.done.send_replace(true);
        Ok(())
    }

    async fn stat(&self) -> Result<Stat> {
        Ok(self.shared.stats.snapshot(INTERNAL_NAME))
    }
}

struct MemoryAck {
    shared: Arc<Shared>,
    entry: Entry,
}

#[async_trait]
impl Acknowledger for MemoryAck {
    async fn ack(&self) -> Result<()> {
        self.shared.stats.dequeued();
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        if requeue {
            // still counted as queued
            return self.shared.enqueue(self.entry.clone());
        }
        self.shared.stats.dequeued();
        Ok(())
    }
}
