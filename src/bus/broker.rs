//! Broker seam: the operations the bus needs from a message broker channel.
//!
//! `AmqpChannel` implements these over lapin; `InMemoryBroker` implements them
//! in-process for tests and local runs. Everything above this module talks to
//! `dyn BrokerChannel` only.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::topology::{Binding, ExchangeSpec, QueueSpec};
use super::Result;

/// Content type of every task event body.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Message properties carried alongside the body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    /// AMQP `type` property.
    pub kind: Option<String>,
    /// Unix seconds.
    pub timestamp: Option<u64>,
    /// Delivery mode 2: the broker writes the message to disk.
    pub persistent: bool,
    pub headers: BTreeMap<String, String>,
}

impl MessageProperties {
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<()>;

    /// Negative acknowledgement. With `requeue` false the broker discards the
    /// message (or routes it to a broker-side dead-letter exchange).
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// A message handed to a consumer. Must be settled through `ack` or `nack`;
/// until then the broker counts it against the consumer's prefetch.
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        redelivered: bool,
        properties: MessageProperties,
        body: Vec<u8>,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            delivery_tag,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            redelivered,
            properties,
            body,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Stream of deliveries for one consumer. An `Err` item or the end of the
/// stream means the channel is gone and the consumer must reconnect.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// An open broker channel (and the connection it lives on).
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()>;

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()>;

    async fn bind_queue(&self, binding: &Binding) -> Result<()>;

    /// Publish and wait for the broker to confirm it accepted the message.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<()>;

    /// Start a consumer. `prefetch` bounds unacknowledged deliveries (0 = unbounded).
    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16)
        -> Result<DeliveryStream>;

    fn is_open(&self) -> bool;

    /// Close the channel, then its connection. Best-effort: failures are logged.
    async fn close(&self);
}

impl fmt::Debug for dyn BrokerChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerChannel")
            .field("is_open", &self.is_open())
            .finish()
    }
}

/// Opens broker channels.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Human-readable target for logs. Must not contain credentials.
    fn describe(&self) -> String;

    /// Open a new connection with a single channel on it.
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>>;
}
