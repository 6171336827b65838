//! AMQP backend
//!
//! Each pipeline maps onto one durable queue bound to a direct exchange.
//! Delayed publishing needs no timer in this process: the message goes to a
//! helper queue whose message TTL equals the delay and whose dead-letter
//! target is the real queue, so the broker moves it over once the TTL
//! expires. Helper queues expire on their own after twice the TTL.

use super::Backend;
use crate::error::{JobError, Result};
use crate::event::EventSink;
use crate::job::Job;
use crate::pipeline::Pipeline;
use crate::stat::Stat;
use crate::transport::{Acknowledger, Delivery, DeliveryStream, Transport};
use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, OnceCell};
use tracing::{debug, warn};

pub mod channel;
pub mod headers;

pub use channel::{
    AmqpDelivery, AmqpValue, Channel, ChannelPool, FieldTable, Publishing, QueueInfo,
};

const DEFAULT_EXCHANGE: &str = "amqp.direct";
const DEFAULT_PREFETCH: i64 = 4;
const STAT_CHANNEL: &str = "stat";
const CONTENT_TYPE: &str = "application/octet-stream";

/// Backend publishing and consuming through channel pools. Consuming gets
/// its own pool so long lived consumers never starve publishers.
#[derive(Clone)]
pub struct AmqpBackend {
    publish: Arc<dyn ChannelPool>,
    consume: Arc<dyn ChannelPool>,
}

impl AmqpBackend {
    pub fn new(publish: Arc<dyn ChannelPool>, consume: Arc<dyn ChannelPool>) -> Self {
        Self { publish, consume }
    }

    /// One pool for every operation
    pub fn with_pool(pool: Arc<dyn ChannelPool>) -> Self {
        Self::new(pool.clone(), pool)
    }
}

impl Backend for AmqpBackend {
    fn name(&self) -> &'static str {
        "amqp"
    }

    fn open(&self, pipeline: &Pipeline, events: &EventSink) -> Result<Arc<dyn Transport>> {
        let queue = AmqpQueue::new(
            pipeline,
            self.publish.clone(),
            self.consume.clone(),
            events.clone(),
        )?;
        Ok(Arc::new(queue))
    }
}

pub struct AmqpQueue {
    pipeline: String,
    exchange: String,
    queue: String,
    consumer: String,
    prefetch: u16,
    publish: Arc<dyn ChannelPool>,
    consume: Arc<dyn ChannelPool>,
    events: EventSink,
    declared: OnceCell<()>,
    subscriptions: AtomicU64,
    current: Arc<Mutex<Option<Subscription>>>,
}

/// Consume channel of the live subscription, used to cancel it
struct Subscription {
    id: u64,
    channel: Arc<dyn Channel>,
}

/// Empty `slot` if it still holds subscription `id`.
fn vacate(slot: &Mutex<Option<Subscription>>, id: u64) -> bool {
    let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.as_ref().is_some_and(|current| current.id == id) {
        *slot = None;
        return true;
    }
    false
}

impl AmqpQueue {
    pub fn new(
        pipeline: &Pipeline,
        publish: Arc<dyn ChannelPool>,
        consume: Arc<dyn ChannelPool>,
        events: EventSink,
    ) -> Result<Self> {
        let queue = pipeline.string("queue", "");
        if queue.is_empty() {
            return Err(JobError::ConfigError(format!(
                "missing `queue` parameter on amqp pipeline `{}`",
                pipeline.name()
            )));
        }

        let prefetch = pipeline.integer("prefetch", DEFAULT_PREFETCH);
        let prefetch = u16::try_from(prefetch).map_err(|_| {
            JobError::ConfigError(format!(
                "invalid `prefetch` {} on amqp pipeline `{}`",
                prefetch,
                pipeline.name()
            ))
        })?;

        let default_consumer = format!("courier:{}-{}", pipeline.name(), std::process::id());

        Ok(Self {
            pipeline: pipeline.name().to_string(),
            exchange: pipeline.string("exchange", DEFAULT_EXCHANGE),
            queue,
            consumer: pipeline.string("consumer", &default_consumer),
            prefetch,
            publish,
            consume,
            events,
            declared: OnceCell::new(),
            subscriptions: AtomicU64::new(0),
            current: Arc::new(Mutex::new(None)),
        })
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Helper queue holding messages delayed by `ttl_ms`. Unique per delay,
    /// exchange and target queue.
    pub fn delayed_queue_name(&self, ttl_ms: i64) -> String {
        format!("delayed-{}.{}.{}", ttl_ms, self.exchange, self.queue)
    }

    /// Declare the exchange and `queue`, then bind them with `routing_key`.
    async fn declare(&self, queue: &str, routing_key: &str, args: FieldTable) -> Result<()> {
        let channel = self.publish.acquire(&self.queue).await?;

        let res = async {
            channel.exchange_declare(&self.exchange, "direct", true).await?;
            channel.queue_declare(queue, true, args).await?;
            channel.queue_bind(queue, routing_key, &self.exchange).await
        }
        .await;

        self.publish.release(channel, res.as_ref().err()).await;
        res
    }

    async fn ensure_declared(&self) -> Result<()> {
        self.declared
            .get_or_try_init(|| self.declare(&self.queue, &self.queue, FieldTable::new()))
            .await
            .map(|_| ())
    }

    /// Release the consume channel once the subscription is dropped, or as
    /// failed when it faults first. A subscription dropped while its consumer
    /// is still registered gets the consumer cancelled here.
    fn watch(&self, id: u64, channel: Arc<dyn Channel>, subscription: oneshot::Receiver<()>) {
        let pool = self.consume.clone();
        let events = self.events.clone();
        let pipeline = self.pipeline.clone();
        let consumer = self.consumer.clone();
        let current = Arc::clone(&self.current);

        tokio::spawn(async move {
            let fault = tokio::select! {
                biased;
                err = channel.closed() => Some(err),
                _ = subscription => None,
            };

            match fault {
                Some(err) => {
                    vacate(&current, id);
                    warn!(pipeline = %pipeline, error = %err, "consume channel failed");
                    pool.release(channel, Some(&err)).await;
                    events.pipeline_error(&pipeline, err);
                }
                None if vacate(&current, id) => {
                    debug!(pipeline = %pipeline, consumer = %consumer, "cancelling abandoned consumer");
                    let res = channel.cancel(&consumer).await;
                    pool.release(channel, res.as_ref().err()).await;
                    if let Err(err) = res {
                        events.pipeline_error(&pipeline, err);
                    }
                }
                None => pool.release(channel, None).await,
            }
        });
    }
}

fn ttl_millis(delay: Duration) -> i64 {
    i64::try_from(delay.as_nanos().div_ceil(1_000_000))
        .unwrap_or(i64::MAX)
        .max(1)
}

#[async_trait]
impl Transport for AmqpQueue {
    fn internal_name(&self) -> &str {
        &self.queue
    }

    async fn connected(&self) -> Result<()> {
        self.consume.connected().await
    }

    async fn subscribe(&self) -> Result<DeliveryStream> {
        self.ensure_declared().await?;

        let channel = self.consume.acquire(&self.queue).await?;
        if let Err(err) = channel.qos(self.prefetch).await {
            self.consume.release(channel, Some(&err)).await;
            return Err(err);
        }

        let id = self.subscriptions.fetch_add(1, Ordering::SeqCst);
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(Subscription {
            id,
            channel: channel.clone(),
        });

        let mut raw = match channel.consume(&self.queue, &self.consumer).await {
            Ok(raw) => raw,
            Err(err) => {
                vacate(&self.current, id);
                self.consume.release(channel, Some(&err)).await;
                return Err(err);
            }
        };

        let cancelled = !self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|current| current.id == id);
        if cancelled {
            // cancel() ran while the consumer was being registered
            let mut res = channel.cancel(&self.consumer).await;
            while let Some(Some(message)) = raw.next().now_or_never() {
                if res.is_ok() {
                    res = channel.nack(message.delivery_tag, true).await;
                }
            }
            self.consume.release(channel, res.as_ref().err()).await;
            res?;
            debug!(pipeline = %self.pipeline, "subscription cancelled while starting");
            return Ok(futures_util::stream::empty().boxed());
        }

        let (subscribed, dropped) = oneshot::channel::<()>();
        self.watch(id, channel.clone(), dropped);

        debug!(
            pipeline = %self.pipeline,
            queue = %self.queue,
            consumer = %self.consumer,
            prefetch = self.prefetch,
            "consuming"
        );

        let deliveries = raw.map(move |message| {
            let _subscribed = &subscribed;
            let (id, attempt, job) = headers::unpack(&message.headers, message.body);
            Delivery::new(
                id,
                attempt,
                job,
                AmqpAck {
                    channel: channel.clone(),
                    delivery_tag: message.delivery_tag,
                },
            )
        });
        Ok(deliveries.boxed())
    }

    async fn publish(&self, id: &str, attempt: u32, job: &Job, delay: Duration) -> Result<()> {
        self.ensure_declared().await?;

        let routing_key = if delay.is_zero() {
            self.queue.clone()
        } else {
            let ttl = ttl_millis(delay);
            let delayed = self.delayed_queue_name(ttl);
            let args = FieldTable::from([
                (
                    "x-dead-letter-exchange".to_string(),
                    AmqpValue::from(self.exchange.as_str()),
                ),
                (
                    "x-dead-letter-routing-key".to_string(),
                    AmqpValue::from(self.queue.as_str()),
                ),
                ("x-message-ttl".to_string(), AmqpValue::Long(ttl)),
                (
                    "x-expires".to_string(),
                    AmqpValue::Long(ttl.saturating_mul(2)),
                ),
            ]);
            self.declare(&delayed, &delayed, args).await?;
            debug!(pipeline = %self.pipeline, job_id = %id, queue = %delayed, "publishing delayed");
            delayed
        };

        let message = Publishing {
            content_type: CONTENT_TYPE.to_string(),
            persistent: true,
            headers: headers::pack(id, attempt, job),
            body: job.payload.clone(),
        };

        let channel = self.publish.acquire(&self.queue).await?;
        let res = channel.publish(&self.exchange, &routing_key, message).await;
        self.publish.release(channel, res.as_ref().err()).await;
        res
    }

    async fn cancel(&self) -> Result<()> {
        let current = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match current {
            Some(current) => current.channel.cancel(&self.consumer).await,
            None => Ok(()),
        }
    }

    async fn stat(&self) -> Result<Stat> {
        let channel = self.publish.acquire(STAT_CHANNEL).await?;
        let res = channel.inspect(&self.queue).await;
        self.publish.release(channel, res.as_ref().err()).await;

        let info = res?;
        Ok(Stat {
            internal_name: self.queue.clone(),
            queue: info.messages.into(),
            active: 0,
            delayed: 0,
        })
    }
}

struct AmqpAck {
    channel: Arc<dyn Channel>,
    delivery_tag: u64,
}

#[async_trait]
impl Acknowledger for AmqpAck {
    async fn ack(&self) -> Result<()> {
        self.channel.ack(self.delivery_tag).await
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.channel.nack(self.delivery_tag, requeue).await
    }
}
