//! Per pipeline queue engine
//!
//! The engine pulls deliveries from its [`Transport`], leases a handler for
//! each one, runs it on its own task and settles the outcome:
//!
//! - success acknowledges the delivery
//! - failure reports to the error handler, then either rejects the delivery
//!   (attempts exhausted) or publishes a copy with `attempt + 1` after the
//!   retry delay and acknowledges the original
//! - a failed retry submission puts the original back with a requeue so the
//!   job is never dropped
//!
//! [`Engine::stop`] halts intake immediately and waits for every leased
//! handler to finish.

use crate::error::{JobError, Result};
use crate::event::{Event, EventSink};
use crate::job::{ErrorHandler, Job};
use crate::pipeline::Pipeline;
use crate::pool::HandlerPool;
use crate::stat::{Stat, StatCounters};
use crate::transport::{Delivery, Transport};
use futures_util::{FutureExt, StreamExt};
use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Pause between failed subscription attempts
const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Clone, Default)]
struct Binding {
    pool: Option<HandlerPool>,
    on_error: Option<ErrorHandler>,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    pipeline: Pipeline,
    transport: Arc<dyn Transport>,
    events: EventSink,
    active: AtomicBool,
    stop: watch::Sender<bool>,
    binding: watch::Sender<Binding>,
    inflight: Arc<InFlight>,
    counters: StatCounters,
}

impl Engine {
    pub fn new(pipeline: Pipeline, transport: Arc<dyn Transport>, events: EventSink) -> Self {
        let (stop, _) = watch::channel(false);
        let (binding, _) = watch::channel(Binding::default());

        Self {
            inner: Arc::new(Inner {
                pipeline,
                transport,
                events,
                active: AtomicBool::new(false),
                stop,
                binding,
                inflight: Arc::new(InFlight::default()),
                counters: StatCounters::new(),
            }),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    /// Bind the handler pool and error handler. Valid before or after the
    /// engine starts; deliveries wait until a pool is bound.
    pub fn configure(&self, pool: Option<HandlerPool>, on_error: Option<ErrorHandler>) {
        self.inner.binding.send_replace(Binding { pool, on_error });
    }

    /// Mark the engine active and spawn its serve loop.
    pub fn start(&self) -> Result<JoinHandle<Result<()>>> {
        if self.inner.active.swap(true, Ordering::SeqCst) {
            return Err(JobError::ConfigError(format!(
                "pipeline `{}` is already serving",
                self.inner.pipeline.name()
            )));
        }
        self.inner.stop.send_replace(false);

        let inner = Arc::clone(&self.inner);
        Ok(tokio::spawn(inner.run()))
    }

    /// Serve until stopped or the transport fails fatally.
    pub async fn serve(&self) -> Result<()> {
        self.start()?
            .await
            .map_err(|e| JobError::BackendError(format!("pipeline task failed: {}", e)))?
    }

    pub async fn push(&self, job: Job) -> Result<String> {
        if !self.is_active() {
            return Err(JobError::NotServing);
        }

        let id = Uuid::new_v4().to_string();
        let delay = job.options.delay_duration();
        self.inner.transport.publish(&id, 0, &job, delay).await?;

        debug!(
            pipeline = %self.inner.pipeline.name(),
            job_id = %id,
            job = %job.name,
            delay_ms = delay.as_millis() as u64,
            "job pushed"
        );
        Ok(id)
    }

    pub async fn stat(&self) -> Result<Stat> {
        let mut stat = self.inner.transport.stat().await?;
        stat.active = self.inner.counters.active();
        Ok(stat)
    }

    /// Stop intake and wait for in-flight handlers. No-op unless active.
    pub async fn stop(&self) {
        if !self.inner.active.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.stop.send_replace(true);

        if let Err(err) = self.inner.transport.cancel().await {
            self.inner.report(err);
        }

        self.inner.inflight.wait_idle().await;
        info!(pipeline = %self.inner.pipeline.name(), "pipeline drained");
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("pipeline", &self.inner.pipeline.name())
            .field("active", &self.is_active())
            .finish()
    }
}

impl Inner {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn report(&self, err: JobError) {
        self.events.pipeline_error(self.pipeline.name(), err);
    }

    async fn run(self: Arc<Self>) -> Result<()> {
        let name = self.pipeline.name().to_string();
        let mut stop = self.stop.subscribe();

        info!(pipeline = %name, backend = %self.transport.internal_name(), "pipeline started");
        self.events.emit(Event::PipelineActive {
            pipeline: name.clone(),
        });

        let result = loop {
            tokio::select! {
                res = self.transport.connected() => {
                    if let Err(err) = res {
                        break Err(err);
                    }
                }
                _ = stopped(&mut stop) => break Ok(()),
            }

            if !self.is_active() {
                break Ok(());
            }

            let mut deliveries = match self.transport.subscribe().await {
                Ok(deliveries) => deliveries.fuse(),
                Err(err) => {
                    self.report(err);
                    tokio::select! {
                        _ = tokio::time::sleep(RESUBSCRIBE_BACKOFF) => continue,
                        _ = stopped(&mut stop) => break Ok(()),
                    }
                }
            };
            debug!(pipeline = %name, "subscribed");

            loop {
                let next = tokio::select! {
                    next = deliveries.next() => next,
                    _ = stopped(&mut stop) => None,
                };

                let Some(delivery) = next else {
                    break;
                };

                if self.dispatch(delivery, &mut stop).await.is_break() {
                    break;
                }
            }

            if !self.is_active() {
                // hand back anything the transport already buffered
                while let Some(Some(delivery)) = deliveries.next().now_or_never() {
                    self.requeue(delivery).await;
                }
                break Ok(());
            }

            warn!(pipeline = %name, "subscription closed, resubscribing");
        };

        if let Err(err) = &result {
            warn!(pipeline = %name, error = %err, "pipeline stopped on transport failure");
            // no stop() will follow to drain this engine
            self.active.store(false, Ordering::SeqCst);
            self.inflight.wait_idle().await;
        }
        self.events.emit(Event::PipelineStopped { pipeline: name });
        result
    }

    async fn dispatch(
        self: &Arc<Self>,
        delivery: Delivery,
        stop: &mut watch::Receiver<bool>,
    ) -> ControlFlow<()> {
        // counted before leasing so stop() cannot slip past this delivery
        let guard = self.inflight.enter();
        if !self.is_active() {
            self.requeue(delivery).await;
            return ControlFlow::Break(());
        }

        let mut binding = self.binding.subscribe();
        let bound = tokio::select! {
            bound = bound(&mut binding) => bound,
            _ = stopped(stop) => None,
        };
        let Some(Binding {
            pool: Some(pool),
            on_error,
        }) = bound
        else {
            self.requeue(delivery).await;
            return ControlFlow::Break(());
        };

        let lease = tokio::select! {
            lease = pool.lease() => lease,
            _ = stopped(stop) => {
                self.requeue(delivery).await;
                return ControlFlow::Break(());
            }
        };

        let lease = match lease {
            Ok(lease) => lease,
            Err(err) => {
                self.report(err);
                self.requeue(delivery).await;
                return ControlFlow::Continue(());
            }
        };

        if !self.is_active() {
            drop(lease);
            self.requeue(delivery).await;
            return ControlFlow::Break(());
        }

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.counters.started();
            let result = AssertUnwindSafe(lease.handle(&delivery.id, &delivery.job))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(JobError::worker("handler panicked")));
            drop(lease);
            engine.counters.finished();

            engine.settle(delivery, result, on_error).await;
            drop(guard);
        });

        ControlFlow::Continue(())
    }

    async fn settle(&self, delivery: Delivery, result: Result<()>, on_error: Option<ErrorHandler>) {
        let err = match result {
            Ok(()) => {
                if let Err(err) = delivery.ack().await {
                    self.report(err);
                }
                return;
            }
            Err(err) => err,
        };

        if let Some(on_error) = &on_error {
            on_error(&delivery.id, &delivery.job, &err);
        }

        let executed = delivery.attempt.saturating_add(1);
        if !delivery.job.options.can_retry(executed) {
            warn!(
                pipeline = %self.pipeline.name(),
                job_id = %delivery.id,
                attempts = executed,
                error = %err,
                "job failed permanently"
            );
            if let Err(err) = delivery.nack(false).await {
                self.report(err);
            }
            return;
        }

        let delay = delivery.job.options.retry_duration();
        debug!(
            pipeline = %self.pipeline.name(),
            job_id = %delivery.id,
            attempt = executed,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "job failed, scheduling retry"
        );

        match self
            .transport
            .publish(&delivery.id, executed, &delivery.job, delay)
            .await
        {
            Ok(()) => {
                if let Err(err) = delivery.ack().await {
                    self.report(err);
                }
            }
            Err(err) => {
                self.report(err);
                if let Err(err) = delivery.nack(true).await {
                    self.report(err);
                }
            }
        }
    }

    async fn requeue(&self, delivery: Delivery) {
        debug!(
            pipeline = %self.pipeline.name(),
            job_id = %delivery.id,
            "returning unprocessed delivery"
        );
        if let Err(err) = delivery.nack(true).await {
            self.report(err);
        }
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

async fn bound(binding: &mut watch::Receiver<Binding>) -> Option<Binding> {
    binding
        .wait_for(|binding| binding.pool.is_some())
        .await
        .ok()
        .map(|binding| binding.clone())
}

/// Count of deliveries between intake and settlement
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(Arc::clone(self))
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}
