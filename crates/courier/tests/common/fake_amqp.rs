//! In-process stand-in for an AMQP server
//!
//! Models just enough of AMQP 0-9-1 for the backend: direct exchanges,
//! durable queues with argument checks, per consumer prefetch, message TTL
//! with dead-lettering, and channel faults that requeue unacked messages.

use async_trait::async_trait;
use bytes::Bytes;
use courier::backend::amqp::{
    AmqpDelivery, AmqpValue, Channel, ChannelPool, FieldTable, Publishing, QueueInfo,
};
use courier::{JobError, Result};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

#[derive(Clone)]
struct Message {
    headers: FieldTable,
    body: Bytes,
}

impl Message {
    fn label(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

struct Consumer {
    tag: String,
    channel: u64,
    prefetch: u16,
    outstanding: usize,
    tx: mpsc::UnboundedSender<AmqpDelivery>,
}

#[derive(Default)]
struct Queue {
    args: FieldTable,
    ready: VecDeque<Message>,
    consumer: Option<Consumer>,
}

struct Unacked {
    queue: String,
    channel: u64,
    message: Message,
}

#[derive(Default)]
struct State {
    exchanges: HashSet<String>,
    queues: HashMap<String, Queue>,
    bindings: Vec<(String, String, String)>,
    unacked: HashMap<u64, Unacked>,
    next_tag: u64,
    declared: Vec<(String, FieldTable)>,
    published: Vec<(String, String, Publishing)>,
    settled: Vec<String>,
    qos: Vec<u16>,
}

/// Shared server state behind every fake channel
#[derive(Clone, Default)]
pub struct FakeServer {
    state: Arc<Mutex<State>>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.lock().exchanges.contains(exchange)
    }

    /// Arguments a queue was declared with
    pub fn queue_args(&self, queue: &str) -> Option<FieldTable> {
        self.lock().queues.get(queue).map(|q| q.args.clone())
    }

    pub fn ready(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub fn consumer(&self, queue: &str) -> Option<String> {
        self.lock()
            .queues
            .get(queue)
            .and_then(|q| q.consumer.as_ref().map(|c| c.tag.clone()))
    }

    pub fn declared(&self) -> Vec<String> {
        self.lock().declared.iter().map(|(q, _)| q.clone()).collect()
    }

    /// `(exchange, routing key, message)` in publish order
    pub fn published(&self) -> Vec<(String, String, Publishing)> {
        self.lock().published.clone()
    }

    /// Settlements as `ack:<body>`, `reject:<body>` or `requeue:<body>`
    pub fn settled(&self) -> Vec<String> {
        self.lock().settled.clone()
    }

    pub fn qos(&self) -> Vec<u16> {
        self.lock().qos.clone()
    }

    fn route(&self, state: &mut State, exchange: &str, routing_key: &str, message: Message) {
        let targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|(e, k, _)| e == exchange && k == routing_key)
            .map(|(_, _, q)| q.clone())
            .collect();

        for queue in targets {
            self.enqueue(state, &queue, message.clone());
        }
    }

    fn enqueue(&self, state: &mut State, queue: &str, message: Message) {
        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };
        q.ready.push_back(message);

        if let Some(AmqpValue::Long(ttl)) = q.args.get("x-message-ttl") {
            let ttl = Duration::from_millis(u64::try_from(*ttl).unwrap_or(0));
            let server = self.clone();
            let queue = queue.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                server.expire(&queue);
            });
            return;
        }

        self.pump(state, queue);
    }

    fn expire(&self, queue: &str) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };
        let Some(message) = q.ready.pop_front() else {
            return;
        };

        let exchange = text(&q.args, "x-dead-letter-exchange");
        let routing_key = text(&q.args, "x-dead-letter-routing-key");
        self.route(state, &exchange, &routing_key, message);
    }

    fn pump(&self, state: &mut State, queue: &str) {
        loop {
            let Some(q) = state.queues.get_mut(queue) else {
                return;
            };
            let Some(consumer) = q.consumer.as_mut() else {
                return;
            };
            if consumer.prefetch > 0 && consumer.outstanding >= usize::from(consumer.prefetch) {
                return;
            }
            let Some(message) = q.ready.pop_front() else {
                return;
            };

            state.next_tag += 1;
            let tag = state.next_tag;
            let delivery = AmqpDelivery {
                delivery_tag: tag,
                headers: message.headers.clone(),
                body: message.body.clone(),
            };

            if consumer.tx.send(delivery).is_err() {
                q.ready.push_front(message);
                q.consumer = None;
                return;
            }
            consumer.outstanding += 1;
            let channel = consumer.channel;
            state.unacked.insert(
                tag,
                Unacked {
                    queue: queue.to_string(),
                    channel,
                    message,
                },
            );
        }
    }

    fn settle(&self, tag: u64, outcome: &str, requeue: bool) -> Result<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let unacked = state
            .unacked
            .remove(&tag)
            .ok_or_else(|| JobError::TransportError(format!("unknown delivery tag {}", tag)))?;

        state
            .settled
            .push(format!("{}:{}", outcome, unacked.message.label()));
        if let Some(q) = state.queues.get_mut(&unacked.queue) {
            if let Some(consumer) = q.consumer.as_mut() {
                if consumer.channel == unacked.channel {
                    consumer.outstanding = consumer.outstanding.saturating_sub(1);
                }
            }
            if requeue {
                q.ready.push_front(unacked.message);
            }
        }

        self.pump(state, &unacked.queue);
        Ok(())
    }

    /// Close every consumer of `channel` and requeue its unacked messages.
    fn drop_channel(&self, channel: u64) {
        let mut guard = self.lock();
        let state = &mut *guard;

        for q in state.queues.values_mut() {
            if q.consumer.as_ref().is_some_and(|c| c.channel == channel) {
                q.consumer = None;
            }
        }

        let mut tags: Vec<u64> = state
            .unacked
            .iter()
            .filter(|(_, u)| u.channel == channel)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));

        let mut touched = HashSet::new();
        for tag in tags {
            if let Some(unacked) = state.unacked.remove(&tag) {
                if let Some(q) = state.queues.get_mut(&unacked.queue) {
                    q.ready.push_front(unacked.message);
                }
                touched.insert(unacked.queue);
            }
        }

        for queue in touched {
            self.pump(state, &queue);
        }
    }
}

fn text(args: &FieldTable, key: &str) -> String {
    match args.get(key) {
        Some(AmqpValue::Str(s)) => s.clone(),
        _ => String::new(),
    }
}

/// Artificial latency of channel calls
#[derive(Clone, Copy, Default)]
struct Stall {
    qos: Duration,
    consume: Duration,
}

pub struct FakeChannel {
    id: u64,
    server: FakeServer,
    prefetch: Mutex<u16>,
    fault: watch::Sender<Option<String>>,
    stall: Arc<Mutex<Stall>>,
}

impl FakeChannel {
    fn new(id: u64, server: FakeServer, stall: Arc<Mutex<Stall>>) -> Self {
        let (fault, _) = watch::channel(None);
        Self {
            id,
            server,
            prefetch: Mutex::new(0),
            fault,
            stall,
        }
    }

    async fn pause(&self, pick: impl Fn(&Stall) -> Duration) {
        let delay = pick(&*self.stall.lock().unwrap());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn is_faulted(&self) -> bool {
        self.fault.borrow().is_some()
    }

    fn check(&self) -> Result<()> {
        match self.fault.borrow().as_ref() {
            Some(reason) => Err(JobError::TransportError(format!(
                "channel closed: {}",
                reason
            ))),
            None => Ok(()),
        }
    }

    fn fail(&self, reason: &str) {
        self.fault.send_replace(Some(reason.to_string()));
        self.server.drop_channel(self.id);
    }
}

#[async_trait]
impl Channel for FakeChannel {
    async fn qos(&self, prefetch: u16) -> Result<()> {
        self.pause(|stall| stall.qos).await;
        self.check()?;
        *self.prefetch.lock().unwrap() = prefetch;
        self.server.lock().qos.push(prefetch);
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer: &str) -> Result<BoxStream<'static, AmqpDelivery>> {
        self.pause(|stall| stall.consume).await;
        self.check()?;
        let prefetch = *self.prefetch.lock().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut guard = self.server.lock();
        let state = &mut *guard;
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| JobError::TransportError(format!("no queue `{}`", queue)))?;
        q.consumer = Some(Consumer {
            tag: consumer.to_string(),
            channel: self.id,
            prefetch,
            outstanding: 0,
            tx,
        });
        self.server.pump(state, queue);

        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        })
        .boxed())
    }

    async fn cancel(&self, consumer: &str) -> Result<()> {
        self.check()?;
        for q in self.server.lock().queues.values_mut() {
            if q.consumer.as_ref().is_some_and(|c| c.tag == consumer) {
                q.consumer = None;
            }
        }
        Ok(())
    }

    async fn exchange_declare(&self, exchange: &str, kind: &str, _durable: bool) -> Result<()> {
        self.check()?;
        assert_eq!(kind, "direct");
        self.server.lock().exchanges.insert(exchange.to_string());
        Ok(())
    }

    async fn queue_declare(&self, queue: &str, _durable: bool, args: FieldTable) -> Result<()> {
        self.check()?;
        let mut state = self.server.lock();
        if let Some(existing) = state.queues.get(queue) {
            if existing.args != args {
                return Err(JobError::TransportError(format!(
                    "PRECONDITION_FAILED: inequivalent args for queue `{}`",
                    queue
                )));
            }
            return Ok(());
        }

        state.declared.push((queue.to_string(), args.clone()));
        state.queues.insert(
            queue.to_string(),
            Queue {
                args,
                ..Queue::default()
            },
        );
        Ok(())
    }

    async fn queue_bind(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<()> {
        self.check()?;
        let mut state = self.server.lock();
        let binding = (
            exchange.to_string(),
            routing_key.to_string(),
            queue.to_string(),
        );
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, message: Publishing) -> Result<()> {
        self.check()?;
        let mut guard = self.server.lock();
        let state = &mut *guard;
        if !state.exchanges.contains(exchange) {
            return Err(JobError::TransportError(format!(
                "NOT_FOUND: no exchange `{}`",
                exchange
            )));
        }

        state.published.push((
            exchange.to_string(),
            routing_key.to_string(),
            message.clone(),
        ));
        let stored = Message {
            headers: message.headers,
            body: message.body,
        };
        self.server.route(state, exchange, routing_key, stored);
        Ok(())
    }

    async fn inspect(&self, queue: &str) -> Result<QueueInfo> {
        self.check()?;
        let state = self.server.lock();
        let q = state
            .queues
            .get(queue)
            .ok_or_else(|| JobError::TransportError(format!("no queue `{}`", queue)))?;

        Ok(QueueInfo {
            name: queue.to_string(),
            messages: u32::try_from(q.ready.len()).unwrap_or(u32::MAX),
            consumers: u32::from(q.consumer.is_some()),
        })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.check()?;
        self.server.settle(delivery_tag, "ack", false)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.check()?;
        let outcome = if requeue { "requeue" } else { "reject" };
        self.server.settle(delivery_tag, outcome, requeue)
    }

    async fn closed(&self) -> JobError {
        let mut fault = self.fault.subscribe();
        let reason = match fault.wait_for(|fault| fault.is_some()).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "channel dropped".to_string(),
        };
        JobError::TransportError(reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Up,
    Down,
    Failed,
}

/// Channel pool keyed by purpose. Channels released with an error are
/// discarded and recorded.
#[derive(Clone)]
pub struct FakePool {
    server: FakeServer,
    channels: Arc<Mutex<HashMap<String, Arc<FakeChannel>>>>,
    issued: Arc<Mutex<Vec<(String, Arc<FakeChannel>)>>>,
    failed: Arc<Mutex<Vec<String>>>,
    next_id: Arc<AtomicU64>,
    link: watch::Sender<Link>,
    stall: Arc<Mutex<Stall>>,
}

impl FakePool {
    pub fn new(server: &FakeServer) -> Self {
        let (link, _) = watch::channel(Link::Up);
        Self {
            server: server.clone(),
            channels: Arc::new(Mutex::new(HashMap::new())),
            issued: Arc::new(Mutex::new(Vec::new())),
            failed: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            link,
            stall: Arc::default(),
        }
    }

    /// Delay every `qos` call by `delay`.
    pub fn slow_qos(&self, delay: Duration) {
        self.stall.lock().unwrap().qos = delay;
    }

    /// Delay every `consume` call by `delay`, before the consumer registers.
    pub fn slow_consume(&self, delay: Duration) {
        self.stall.lock().unwrap().consume = delay;
    }

    pub fn set_link(&self, link: Link) {
        self.link.send_replace(link);
    }

    /// Fault the live channel used for `purpose`.
    pub fn fault(&self, purpose: &str, reason: &str) {
        let channel = self.channels.lock().unwrap().get(purpose).cloned();
        if let Some(channel) = channel {
            channel.fail(reason);
        }
    }

    /// Purposes of the channels released as failed
    pub fn failed(&self) -> Vec<String> {
        self.failed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelPool for FakePool {
    async fn acquire(&self, purpose: &str) -> Result<Arc<dyn Channel>> {
        if *self.link.borrow() != Link::Up {
            return Err(JobError::TransportError("not connected".to_string()));
        }

        let mut channels = self.channels.lock().unwrap();
        if let Some(channel) = channels.get(purpose).filter(|c| !c.is_faulted()) {
            return Ok(channel.clone());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let channel = Arc::new(FakeChannel::new(id, self.server.clone(), self.stall.clone()));
        channels.insert(purpose.to_string(), channel.clone());
        self.issued
            .lock()
            .unwrap()
            .push((purpose.to_string(), channel.clone()));
        Ok(channel)
    }

    async fn release(&self, channel: Arc<dyn Channel>, error: Option<&JobError>) {
        if error.is_none() {
            return;
        }

        let released = Arc::as_ptr(&channel) as *const u8;
        let purpose = self
            .issued
            .lock()
            .unwrap()
            .iter()
            .find(|(_, c)| Arc::as_ptr(c) as *const u8 == released)
            .map(|(purpose, _)| purpose.clone());
        let Some(purpose) = purpose else {
            return;
        };

        let mut channels = self.channels.lock().unwrap();
        if channels
            .get(&purpose)
            .is_some_and(|c| Arc::as_ptr(c) as *const u8 == released)
        {
            channels.remove(&purpose);
        }
        self.failed.lock().unwrap().push(purpose);
    }

    async fn connected(&self) -> Result<()> {
        let mut link = self.link.subscribe();
        let state = match link.wait_for(|link| *link != Link::Down).await {
            Ok(state) => *state,
            Err(_) => Link::Failed,
        };

        match state {
            Link::Failed => Err(JobError::TransportError(
                "connection refused".to_string(),
            )),
            _ => Ok(()),
        }
    }
}
