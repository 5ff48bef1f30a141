//! Message broker transport.
//!
//! This module contains:
//! - `Broker` trait: the exchange/queue/publish/consume surface the RPC layer needs
//! - `Delivery` and `DeliveryAcker`: an inbound message and its acknowledgement handle
//! - Implementations: AMQP (RabbitMQ), in-process channel broker

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::info;

use crate::config::{MessagingConfig, MessagingType};

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod channel;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use channel::ChannelBroker;

/// Name of the AMQP default exchange, which routes directly to a queue by name.
pub const DEFAULT_EXCHANGE: &str = "";

/// Content type of every payload on the wire.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur during broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Declare failed: {0}")]
    Declare(String),

    #[error("Bind failed: {0}")]
    Bind(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Acknowledgement failed: {0}")]
    Ack(String),
}

/// Transport-level metadata carried next to the JSON body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// Correlation id echoed on replies.
    pub correlation_id: Option<String>,
    /// Queue a reply should be published to.
    pub reply_to: Option<String>,
    /// Per-message time-to-live.
    pub expiration: Option<Duration>,
    /// String headers (deadline, retry attempt, dead-letter details).
    pub headers: BTreeMap<String, String>,
}

impl MessageProperties {
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    pub fn with_expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// A message about to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

impl OutboundMessage {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            properties: MessageProperties::default(),
        }
    }

    pub fn with_properties(mut self, properties: MessageProperties) -> Self {
        self.properties = properties;
        self
    }
}

/// Acknowledgement handle for a single delivery.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    /// Positively acknowledge; the broker forgets the message.
    async fn ack(&self) -> Result<()>;

    /// Negatively acknowledge, optionally putting the message back on its queue.
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// Acker for deliveries consumed without acknowledgements (reply queues).
pub struct NoAck;

#[async_trait]
impl DeliveryAcker for NoAck {
    async fn ack(&self) -> Result<()> {
        Ok(())
    }

    async fn nack(&self, _requeue: bool) -> Result<()> {
        Ok(())
    }
}

/// A message received from a queue.
pub struct Delivery {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    /// True when the broker has delivered this message before.
    pub redelivered: bool,
    pub acker: Box<dyn DeliveryAcker>,
}

impl Delivery {
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
            .field("routing_key", &self.routing_key)
            .field("body_len", &self.body.len())
            .field("properties", &self.properties)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Stream of deliveries from one consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Queue declaration flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// Queue name. Empty asks the broker to generate one.
    pub name: String,
    /// Survives broker restarts.
    pub durable: bool,
    /// Owned by the declaring connection.
    pub exclusive: bool,
    /// Deleted once its last consumer goes away.
    pub auto_delete: bool,
}

impl QueueSpec {
    /// Durable queue owned by one service operation.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// Non-durable named queue.
    pub fn transient(name: impl Into<String>) -> Self {
        Self {
            durable: false,
            ..Self::durable(name)
        }
    }

    /// Private, broker-named, auto-deleting reply queue.
    pub fn reply() -> Self {
        Self {
            name: String::new(),
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// Broker surface used by the RPC client and server.
///
/// Implementations:
/// - `AmqpBroker`: RabbitMQ via AMQP
/// - `ChannelBroker`: in-process broker for tests and standalone mode
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare a durable topic exchange. Idempotent.
    async fn declare_exchange(&self, exchange: &str) -> Result<()>;

    /// Declare a queue and return its (possibly broker-generated) name. Idempotent.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String>;

    /// Bind a queue to an exchange under an exact routing key. Idempotent.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Publish a message; returns once the broker has accepted it for routing.
    ///
    /// `DEFAULT_EXCHANGE` addresses the queue named by `routing_key` directly.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<()>;

    /// Start consuming a queue with at most `prefetch` unacknowledged deliveries.
    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream>;

    /// Declare a private reply queue and consume it without acknowledgements.
    ///
    /// Declaration and consumption share one channel so exclusive queues work.
    async fn open_reply_queue(&self) -> Result<(String, DeliveryStream)>;
}

/// Initialize the broker selected by configuration.
///
/// Requires the corresponding feature to be enabled:
/// - AMQP: `--features amqp`
/// - Channel: always available
pub async fn init_broker(config: &MessagingConfig) -> Result<Arc<dyn Broker>> {
    match config.messaging_type {
        MessagingType::Amqp => {
            #[cfg(feature = "amqp")]
            {
                let broker = AmqpBroker::connect(&config.amqp).await?;
                info!(messaging_type = "amqp", "Broker initialized");
                Ok(Arc::new(broker))
            }

            #[cfg(not(feature = "amqp"))]
            {
                Err(BrokerError::Connection(
                    "AMQP support requires the 'amqp' feature. Rebuild with --features amqp"
                        .to_string(),
                ))
            }
        }
        MessagingType::Channel => {
            info!(messaging_type = "channel", "Broker initialized");
            Ok(Arc::new(ChannelBroker::new()))
        }
    }
}
