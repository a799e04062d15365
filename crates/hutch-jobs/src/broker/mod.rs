//! Broker transport seam.
//!
//! The work queue talks to the broker only through [`Connector`] and
//! [`BrokerConnection`]. Two implementations ship with the crate:
//!
//! - [`MemoryBroker`]: an in-process broker with exchanges, per-queue
//!   dead-letter routing and message TTL. Used by the test suite and
//!   for running components without infrastructure.
//! - `AmqpConnector` (feature `amqp`): a RabbitMQ client built on lapin.

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
pub use memory::MemoryBroker;

use crate::error::JobResult;
use async_trait::async_trait;
use futures::stream::BoxStream;
use hutch_config::BrokerUrl;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Name of the default exchange, which routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";

/// A message header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    String(String),
    Int(i64),
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::String(s) => f.write_str(s),
            HeaderValue::Int(i) => write!(f, "{i}"),
        }
    }
}

/// Message headers, ordered by name.
pub type HeaderTable = BTreeMap<String, HeaderValue>;

/// Basic properties carried with every message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub headers: HeaderTable,
    /// Per-message TTL in milliseconds, as a decimal string.
    pub expiration: Option<String>,
    pub priority: Option<u8>,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub persistent: bool,
}

/// A message as published or as stored by a broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

impl Message {
    /// Returns the message with the given expiration.
    pub fn with_expiration(mut self, ttl_ms: u64) -> Self {
        self.properties.expiration = Some(ttl_ms.to_string());
        self
    }

    /// Returns the expiration as milliseconds, if set and numeric.
    pub fn expiration_ms(&self) -> Option<u64> {
        self.properties.expiration.as_deref().and_then(|e| e.parse().ok())
    }
}

/// Settles a single delivery.
#[async_trait]
pub trait AckHandle: Send + Sync {
    /// Positive acknowledgement; the broker forgets the message.
    async fn ack(&self) -> JobResult<()>;

    /// Negative acknowledgement. With `requeue` the broker redelivers the
    /// message, otherwise it is dead-lettered or dropped.
    async fn nack(&self, requeue: bool) -> JobResult<()>;
}

/// A message handed to a consumer, not yet settled.
pub struct Delivery {
    pub message: Message,
    pub redelivered: bool,
    acker: Box<dyn AckHandle>,
}

impl Delivery {
    /// Creates a delivery settled through `acker`.
    pub fn new(message: Message, redelivered: bool, acker: Box<dyn AckHandle>) -> Self {
        Self {
            message,
            redelivered,
            acker,
        }
    }

    /// Acknowledges the delivery.
    pub async fn ack(&self) -> JobResult<()> {
        self.acker.ack().await
    }

    /// Rejects the delivery.
    pub async fn nack(&self, requeue: bool) -> JobResult<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries from a consumer. Ends when the consumer is
/// cancelled or the connection closes.
pub type DeliveryStream = BoxStream<'static, JobResult<Delivery>>;

/// Exchange types used by the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Direct,
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
        }
    }
}

/// Queue declaration arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    /// `x-dead-letter-exchange`
    pub dead_letter_exchange: Option<String>,
    /// `x-dead-letter-routing-key`
    pub dead_letter_routing_key: Option<String>,
    /// `x-max-priority`
    pub max_priority: Option<u8>,
}

impl QueueSpec {
    /// A durable queue with no arguments.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
            max_priority: None,
        }
    }

    /// Routes expired and rejected messages to `exchange`, optionally
    /// rewriting the routing key.
    pub fn dead_letter_to(mut self, exchange: impl Into<String>, routing_key: Option<&str>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self.dead_letter_routing_key = routing_key.map(str::to_string);
        self
    }

    /// Enables priority ordering up to `max`.
    pub fn max_priority(mut self, max: u8) -> Self {
        self.max_priority = Some(max);
        self
    }
}

/// An open connection (and channel) to a broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Returns true while the connection can publish.
    fn is_connected(&self) -> bool;

    /// Declares an exchange. Redeclaring with the same kind is a no-op.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> JobResult<()>;

    /// Declares a queue. Redeclaring with the same arguments is a no-op.
    async fn declare_queue(&self, spec: &QueueSpec) -> JobResult<()>;

    /// Binds a queue to an exchange.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> JobResult<()>;

    /// Publishes a message; resolves once the broker has accepted it.
    async fn publish(&self, exchange: &str, routing_key: &str, message: Message) -> JobResult<()>;

    /// Starts a consumer with at most `prefetch` unacknowledged deliveries.
    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16) -> JobResult<DeliveryStream>;

    /// Closes the connection. Unacknowledged deliveries return to their queues.
    async fn close(&self) -> JobResult<()>;
}

/// Opens broker connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Transport name used in error messages, e.g. `amqp`.
    fn transport(&self) -> &'static str;

    /// Connects and authenticates against the URL's virtual host.
    async fn connect(&self, url: &BrokerUrl) -> JobResult<Arc<dyn BrokerConnection>>;
}
