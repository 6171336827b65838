//! Channel level contract of an AMQP 0-9-1 client
//!
//! The backend never talks to a socket directly. It borrows channels from a
//! [`ChannelPool`] keyed by purpose, so unrelated operations are not
//! serialized on one channel. The pool owns connection recovery; a channel
//! released with an error is discarded and never handed out again.

use crate::error::{JobError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Header and argument values used by the backend
#[derive(Debug, Clone, PartialEq)]
pub enum AmqpValue {
    Bool(bool),
    Int(i32),
    Long(i64),
    Str(String),
}

impl From<i64> for AmqpValue {
    fn from(v: i64) -> Self {
        AmqpValue::Long(v)
    }
}

impl From<&str> for AmqpValue {
    fn from(v: &str) -> Self {
        AmqpValue::Str(v.to_string())
    }
}

impl From<String> for AmqpValue {
    fn from(v: String) -> Self {
        AmqpValue::Str(v)
    }
}

pub type FieldTable = BTreeMap<String, AmqpValue>;

#[derive(Debug, Clone, PartialEq)]
pub struct Publishing {
    pub content_type: String,
    pub persistent: bool,
    pub headers: FieldTable,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AmqpDelivery {
    pub delivery_tag: u64,
    pub headers: FieldTable,
    pub body: Bytes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub messages: u32,
    pub consumers: u32,
}

#[async_trait]
pub trait Channel: Send + Sync {
    async fn qos(&self, prefetch: u16) -> Result<()>;

    /// Start a consumer. The stream ends once the consumer is cancelled or
    /// the channel fails.
    async fn consume(&self, queue: &str, consumer: &str) -> Result<BoxStream<'static, AmqpDelivery>>;

    async fn cancel(&self, consumer: &str) -> Result<()>;

    async fn exchange_declare(&self, exchange: &str, kind: &str, durable: bool) -> Result<()>;

    async fn queue_declare(&self, queue: &str, durable: bool, args: FieldTable) -> Result<()>;

    async fn queue_bind(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<()>;

    async fn publish(&self, exchange: &str, routing_key: &str, message: Publishing) -> Result<()>;

    async fn inspect(&self, queue: &str) -> Result<QueueInfo>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    /// Resolves with the cause once the channel faults.
    async fn closed(&self) -> JobError;
}

#[async_trait]
pub trait ChannelPool: Send + Sync {
    /// Borrow a channel for `purpose`.
    async fn acquire(&self, purpose: &str) -> Result<Arc<dyn Channel>>;

    /// Return a channel. With an error the channel is discarded.
    async fn release(&self, channel: Arc<dyn Channel>, error: Option<&JobError>);

    /// Resolves once the underlying connection is up.
    async fn connected(&self) -> Result<()>;
}
