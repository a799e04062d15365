//! RabbitMQ transport built on lapin.

use super::{
    AckHandle, BrokerConnection, Connector, Delivery, DeliveryStream, ExchangeKind, HeaderTable, HeaderValue,
    Message, MessageProperties, QueueSpec,
};
use crate::error::{JobError, JobResult};
use async_trait::async_trait;
use futures::StreamExt;
use hutch_config::{BrokerScheme, BrokerUrl};
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tracing::{debug, info};

const TRANSPORT: &str = "amqp";
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Connects to RabbitMQ (or any AMQP 0-9-1 broker) with publisher
/// confirms enabled.
#[derive(Clone, Default)]
pub struct AmqpConnector {
    properties: ConnectionProperties,
}

impl std::fmt::Debug for AmqpConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpConnector").finish_non_exhaustive()
    }
}

impl AmqpConnector {
    /// Creates a connector with default connection properties.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a connector with custom connection properties.
    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    fn transport(&self) -> &'static str {
        TRANSPORT
    }

    async fn connect(&self, url: &BrokerUrl) -> JobResult<Arc<dyn BrokerConnection>> {
        if url.scheme() == BrokerScheme::Memory {
            return Err(JobError::InvalidConfiguration(format!(
                "{url} is an in-process broker URL; use MemoryBroker"
            )));
        }

        info!(broker = %url, "Connecting to AMQP broker...");
        let connection = Connection::connect(url.as_str(), self.properties.clone()).await?;
        let channel = connection.create_channel().await?;
        channel.confirm_select(ConfirmSelectOptions::default()).await?;
        info!(broker = %url, "AMQP connection established");

        Ok(Arc::new(AmqpConnection { connection, channel }))
    }
}

struct AmqpConnection {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn is_connected(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> JobResult<()> {
        let kind = match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        };
        let options = ExchangeDeclareOptions {
            durable: true,
            ..ExchangeDeclareOptions::default()
        };
        self.channel
            .exchange_declare(name, kind, options, FieldTable::default())
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> JobResult<()> {
        let mut arguments = FieldTable::default();
        if let Some(exchange) = &spec.dead_letter_exchange {
            arguments.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(exchange.as_str().into()),
            );
        }
        if let Some(routing_key) = &spec.dead_letter_routing_key {
            arguments.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(routing_key.as_str().into()),
            );
        }
        if let Some(max) = spec.max_priority {
            arguments.insert("x-max-priority".into(), AMQPValue::ShortShortUInt(max));
        }

        let options = QueueDeclareOptions {
            durable: spec.durable,
            ..QueueDeclareOptions::default()
        };
        self.channel.queue_declare(&spec.name, options, arguments).await?;
        debug!(queue = %spec.name, "Queue declared");
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> JobResult<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, message: Message) -> JobResult<()> {
        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                to_basic_properties(&message.properties),
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(JobError::Transport(format!(
                "broker rejected message published to '{exchange}' with routing key '{routing_key}'"
            )));
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16) -> JobResult<DeliveryStream> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let stream = consumer.map(|result| {
            result.map_err(JobError::from).map(|delivery| {
                Delivery::new(
                    Message {
                        properties: from_basic_properties(&delivery.properties),
                        body: delivery.data,
                    },
                    delivery.redelivered,
                    Box::new(AmqpAcker(delivery.acker)),
                )
            })
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> JobResult<()> {
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection.close(200, "OK").await?;
        info!("AMQP connection closed");
        Ok(())
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl AckHandle for AmqpAcker {
    async fn ack(&self) -> JobResult<()> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> JobResult<()> {
        let options = BasicNackOptions {
            requeue,
            ..BasicNackOptions::default()
        };
        self.0.nack(options).await?;
        Ok(())
    }
}

fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut headers = FieldTable::default();
    for (name, value) in &properties.headers {
        let value = match value {
            HeaderValue::String(s) => AMQPValue::LongString(LongString::from(s.as_str())),
            HeaderValue::Int(i) => AMQPValue::LongLongInt(*i),
        };
        headers.insert(ShortString::from(name.as_str()), value);
    }

    let mut basic = BasicProperties::default().with_headers(headers);
    if let Some(expiration) = &properties.expiration {
        basic = basic.with_expiration(expiration.as_str().into());
    }
    if let Some(priority) = properties.priority {
        basic = basic.with_priority(priority);
    }
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(content_type.as_str().into());
    }
    if let Some(message_id) = &properties.message_id {
        basic = basic.with_message_id(message_id.as_str().into());
    }
    if properties.persistent {
        basic = basic.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }
    basic
}

fn from_basic_properties(basic: &BasicProperties) -> MessageProperties {
    let mut headers = HeaderTable::new();
    if let Some(table) = basic.headers() {
        for (name, value) in table.inner() {
            if let Some(value) = from_amqp_value(value) {
                headers.insert(name.as_str().to_string(), value);
            }
        }
    }

    MessageProperties {
        headers,
        expiration: basic.expiration().as_ref().map(|e| e.as_str().to_string()),
        priority: *basic.priority(),
        content_type: basic.content_type().as_ref().map(|c| c.as_str().to_string()),
        message_id: basic.message_id().as_ref().map(|m| m.as_str().to_string()),
        persistent: *basic.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
    }
}

/// Converts header values the work queue understands; tables, arrays and
/// floats (such as RabbitMQ's `x-death`) are skipped.
fn from_amqp_value(value: &AMQPValue) -> Option<HeaderValue> {
    let int = match value {
        AMQPValue::ShortString(s) => return Some(HeaderValue::String(s.as_str().to_string())),
        AMQPValue::LongString(s) => {
            return Some(HeaderValue::String(
                String::from_utf8_lossy(s.as_bytes()).into_owned(),
            ))
        }
        AMQPValue::Boolean(b) => i64::from(*b),
        AMQPValue::ShortShortInt(i) => i64::from(*i),
        AMQPValue::ShortShortUInt(i) => i64::from(*i),
        AMQPValue::ShortInt(i) => i64::from(*i),
        AMQPValue::ShortUInt(i) => i64::from(*i),
        AMQPValue::LongInt(i) => i64::from(*i),
        AMQPValue::LongUInt(i) => i64::from(*i),
        AMQPValue::LongLongInt(i) => *i,
        AMQPValue::Timestamp(t) => i64::try_from(*t).ok()?,
        _ => return None,
    };
    Some(HeaderValue::Int(int))
}
