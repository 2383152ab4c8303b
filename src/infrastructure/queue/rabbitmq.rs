use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
    acker::Acker,
    message::Delivery,
    options::*,
    types::{AMQPValue, FieldTable, LongString, ShortString},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    Acknowledger, BusError, BusMessage, BusResult, EventPublisher, MessageHandler,
    subject_matches, to_binding_key,
};

const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// A stream is a durable topic exchange; these are the subject patterns it
/// was provisioned with.
#[derive(Clone, Debug)]
struct StreamRoute {
    exchange: String,
    patterns: Vec<String>,
}

/// AMQP-backed event bus.
///
/// Consumer groups are durable quorum queues named after the group. Every
/// process subscribing with the same group name consumes from the same queue,
/// so each message goes to one member at a time.
#[derive(Clone)]
pub struct RabbitMqService {
    url: String,
    conn: Arc<Mutex<Connection>>,
    channel: Arc<Mutex<Channel>>,
    streams: Arc<RwLock<Vec<StreamRoute>>>,
    ack_wait: Duration,
}

impl RabbitMqService {
    async fn connect(url: &str) -> BusResult<(Connection, Channel)> {
        info!("Connecting to RabbitMQ at {}", url);
        let conn = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| BusError::Connection(format!("failed to connect: {}", e)))?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("failed to create channel: {}", e)))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BusError::Connection(format!("failed to enable confirms: {}", e)))?;

        info!("Connected to RabbitMQ");
        Ok((conn, channel))
    }

    /// `ack_wait` is how long a member may hold a message unacknowledged
    /// before the broker reclaims it for another member.
    pub async fn new(url: &str, ack_wait: Duration) -> BusResult<Self> {
        let (conn, channel) = Self::connect(url).await?;

        Ok(Self {
            url: url.to_string(),
            conn: Arc::new(Mutex::new(conn)),
            channel: Arc::new(Mutex::new(channel)),
            streams: Arc::new(RwLock::new(Vec::new())),
            ack_wait,
        })
    }

    async fn reconnect(&self) -> BusResult<()> {
        warn!("RabbitMQ connection dropped, reconnecting...");
        let (conn, channel) = Self::connect(&self.url).await?;
        *self.conn.lock().await = conn;
        *self.channel.lock().await = channel;
        Ok(())
    }

    /// Passive declare on a throwaway channel: the broker closes a channel
    /// whose passive declare fails, so the shared one is never used for it.
    async fn exchange_exists(&self, name: &str) -> bool {
        let probe = match self.conn.lock().await.create_channel().await {
            Ok(channel) => channel,
            Err(_) => return false,
        };

        let exists = probe
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    passive: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .is_ok();

        if exists {
            let _ = probe.close(200, "probe done").await;
        }
        exists
    }

    /// Idempotent: checks for the stream first and declares it only when
    /// absent. Safe to call from every process at startup.
    pub async fn ensure_stream(&self, name: &str, patterns: &[&str]) -> BusResult<()> {
        if self.exchange_exists(name).await {
            debug!(stream = name, "Stream already exists");
        } else {
            info!("Creating stream {} with subjects {:?}", name, patterns);
            self.channel
                .lock()
                .await
                .exchange_declare(
                    name,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..ExchangeDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BusError::Provision(format!("stream {}: {}", name, e)))?;
        }

        let route = StreamRoute {
            exchange: name.to_string(),
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
        };
        let mut streams = self.streams.write().await;
        streams.retain(|s| s.exchange != name);
        streams.push(route);
        Ok(())
    }

    async fn exchange_for(&self, subject: &str) -> BusResult<String> {
        self.streams
            .read()
            .await
            .iter()
            .find(|s| s.patterns.iter().any(|p| subject_matches(p, subject)))
            .map(|s| s.exchange.clone())
            .ok_or_else(|| BusError::NoStream(subject.to_string()))
    }

    async fn publish_internal(&self, exchange: &str, subject: &str, payload: &[u8]) -> BusResult<()> {
        let channel = self.channel.lock().await;
        let failed = |reason: String| BusError::Publish {
            subject: subject.to_string(),
            reason,
        };

        let confirmation = channel
            .basic_publish(
                exchange,
                subject,
                BasicPublishOptions {
                    mandatory: true,
                    ..BasicPublishOptions::default()
                },
                payload,
                BasicProperties::default()
                    .with_delivery_mode(2) // Persistent
                    .with_content_type(ShortString::from("application/json")),
            )
            .await
            .map_err(|e| failed(e.to_string()))?
            .await
            .map_err(|e| failed(e.to_string()))?;

        if confirmation.is_nack() {
            return Err(failed("broker refused the message".to_string()));
        }
        if confirmation.take_message().is_some() {
            return Err(failed("no consumer group is bound to this subject".to_string()));
        }

        Ok(())
    }

    async fn channel_connected(&self) -> bool {
        self.channel.lock().await.status().connected()
    }

    /// Declares the durable group queue for `subject` without consuming
    /// from it, so messages published before the first member attaches are
    /// retained.
    pub async fn ensure_group(&self, subject: &str, group: &str) -> BusResult<()> {
        let channel = self
            .conn
            .lock()
            .await
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("failed to create channel: {}", e)))?;

        self.declare_group(&channel, subject, group).await?;
        let _ = channel.close(200, "group provisioned").await;
        Ok(())
    }

    async fn declare_group(&self, channel: &Channel, subject: &str, group: &str) -> BusResult<()> {
        let exchange = self.exchange_for(subject).await?;

        let mut args = FieldTable::default();
        args.insert(
            ShortString::from("x-queue-type"),
            AMQPValue::LongString(LongString::from("quorum")),
        );
        args.insert(
            ShortString::from("x-consumer-timeout"),
            AMQPValue::LongLongInt(self.ack_wait.as_millis() as i64),
        );

        channel
            .queue_declare(
                group,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                args,
            )
            .await
            .map_err(|e| BusError::Provision(format!("group {}: {}", group, e)))?;

        channel
            .queue_bind(
                group,
                &exchange,
                &to_binding_key(subject),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Provision(format!("binding {} -> {}: {}", subject, group, e)))?;

        Ok(())
    }

    /// Attaches `handler` to the durable group `group` for `subject`,
    /// creating the group on first use. Messages are handed over one at a
    /// time; the returned task ends when the broker cancels the consumer.
    pub async fn subscribe<H>(&self, subject: &str, group: &str, handler: H) -> BusResult<JoinHandle<()>>
    where
        H: MessageHandler + 'static,
    {
        let channel = self
            .conn
            .lock()
            .await
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("failed to create channel: {}", e)))?;

        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::Provision(format!("qos for {}: {}", group, e)))?;

        self.declare_group(&channel, subject, group).await?;
        let handle = consume(channel, group, handler).await?;
        info!(subject, group, "Subscribed to durable group");
        Ok(handle)
    }

    /// Attaches `handler` to a private queue for `subject` that lives only
    /// as long as this connection, so every process sees every message.
    /// Nothing published while the process is down is kept for it.
    pub async fn subscribe_exclusive<H>(&self, subject: &str, handler: H) -> BusResult<JoinHandle<()>>
    where
        H: MessageHandler + 'static,
    {
        let exchange = self.exchange_for(subject).await?;
        let channel = self
            .conn
            .lock()
            .await
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("failed to create channel: {}", e)))?;

        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Provision(format!("exclusive queue for {}: {}", subject, e)))?;
        let name = queue.name().as_str().to_string();

        channel
            .queue_bind(
                &name,
                &exchange,
                &to_binding_key(subject),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Provision(format!("binding {} -> {}: {}", subject, name, e)))?;

        let handle = consume(channel, &name, handler).await?;
        info!(subject, queue = %name, "Subscribed with exclusive queue");
        Ok(handle)
    }
}

/// Consumes `queue` on `channel` until the broker cancels the consumer.
async fn consume<H>(channel: Channel, queue: &str, handler: H) -> BusResult<JoinHandle<()>>
where
    H: MessageHandler + 'static,
{
    let consumer_tag = format!("{}-{}", queue, uuid::Uuid::new_v4().simple());
    let mut consumer = channel
        .basic_consume(
            queue,
            &consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| BusError::Provision(format!("consumer for {}: {}", queue, e)))?;

    let queue = queue.to_string();
    Ok(tokio::spawn(async move {
        // Keeps the consumer channel open for the life of the task.
        let _channel = channel;
        while let Some(delivery) = consumer.next().await {
            match delivery {
                Ok(delivery) => handler.handle(into_message(delivery)).await,
                Err(e) => {
                    error!(queue = %queue, "Consumer stream failed: {}", e);
                    break;
                }
            }
        }
        warn!(queue = %queue, "Consumer stopped");
    }))
}

#[async_trait]
impl EventPublisher for RabbitMqService {
    async fn publish(&self, subject: &str, payload: &[u8]) -> BusResult<()> {
        let exchange = self.exchange_for(subject).await?;

        if let Err(e) = self.publish_internal(&exchange, subject, payload).await {
            if self.channel_connected().await {
                return Err(e);
            }
            warn!("RabbitMQ publish failed: {}. Retrying after reconnect.", e);
            self.reconnect().await?;
            self.publish_internal(&exchange, subject, payload).await?;
        }

        Ok(())
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> BusResult<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| BusError::Settle(e.to_string()))
    }

    async fn nak(&self) -> BusResult<()> {
        self.0
            .nack(BasicNackOptions {
                requeue: true,
                ..BasicNackOptions::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| BusError::Settle(e.to_string()))
    }
}

fn into_message(delivery: Delivery) -> BusMessage {
    let attempt = delivery_attempt(&delivery.properties, delivery.redelivered);
    BusMessage::new(
        delivery.routing_key.as_str().to_string(),
        delivery.data,
        attempt,
        Box::new(AmqpAcker(delivery.acker)),
    )
}

/// Quorum queues count failed deliveries in `x-delivery-count`; the header
/// is absent on the first delivery.
fn delivery_attempt(properties: &BasicProperties, redelivered: bool) -> u32 {
    let previous = properties.headers().as_ref().and_then(|headers| {
        headers
            .inner()
            .iter()
            .find(|(name, _)| name.as_str() == DELIVERY_COUNT_HEADER)
            .and_then(|(_, value)| amqp_count(value))
    });

    match previous {
        Some(count) => count.saturating_add(1),
        None if redelivered => 2,
        None => 1,
    }
}

fn amqp_count(value: &AMQPValue) -> Option<u32> {
    let n: i64 = match value {
        AMQPValue::ShortShortInt(v) => (*v).into(),
        AMQPValue::ShortShortUInt(v) => (*v).into(),
        AMQPValue::ShortInt(v) => (*v).into(),
        AMQPValue::ShortUInt(v) => (*v).into(),
        AMQPValue::LongInt(v) => (*v).into(),
        AMQPValue::LongUInt(v) => (*v).into(),
        AMQPValue::LongLongInt(v) => *v,
        _ => return None,
    };
    u32::try_from(n).ok()
}
