//! Exchange and queue topology.
//!
//! One topic exchange is shared by every service. Each operation is an exact
//! routing key, consumed from a durable queue named `<queue-prefix>.<routing-key>`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::{info, warn};

use crate::broker::{Broker, BrokerError, QueueSpec};
use crate::config::TopologyConfig;

/// Errors building or applying topology.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("Invalid routing key '{key}': {reason}")]
    InvalidRoutingKey { key: String, reason: &'static str },

    #[error("Failed to declare exchange '{exchange}': {source}")]
    Declare {
        exchange: String,
        #[source]
        source: BrokerError,
    },

    #[error("Failed to bind '{queue}' after {attempts} attempts: {source}")]
    Bind {
        queue: String,
        attempts: usize,
        #[source]
        source: BrokerError,
    },
}

/// Name of one logical operation on the shared exchange, e.g. `create-task`.
///
/// Routing is exact-match only, so topic wildcards are rejected. Dots are
/// reserved as the separator between queue prefix and routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutingKey(String);

impl RoutingKey {
    pub fn new(key: impl Into<String>) -> Result<Self, TopologyError> {
        let key = key.into();
        let reason = if key.is_empty() {
            Some("must not be empty")
        } else if key.chars().any(char::is_whitespace) {
            Some("must not contain whitespace")
        } else if key.contains(['*', '#']) {
            Some("wildcards are not allowed")
        } else if key.contains('.') {
            Some("dots are reserved for queue names")
        } else if key.len() > 255 {
            Some("longer than 255 bytes")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(TopologyError::InvalidRoutingKey { key, reason }),
            None => Ok(Self(key)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RoutingKey {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<&str> for RoutingKey {
    type Error = TopologyError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<String> for RoutingKey {
    type Error = TopologyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl AsRef<str> for RoutingKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Queue owning one operation: `<queue-prefix>.<routing-key>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueName(String);

impl QueueName {
    pub fn new(prefix: &str, routing_key: &RoutingKey) -> Self {
        Self(format!("{}.{}", prefix, routing_key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Backoff for bind retries while the broker is unreachable.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Jitter enabled
pub fn bind_backoff(max_attempts: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(max_attempts.saturating_sub(1))
        .with_jitter()
}

/// Shared exchange plus queue naming rule.
#[derive(Debug, Clone)]
pub struct Topology {
    exchange: String,
    queue_prefix: String,
    durable: bool,
    bind_attempts: usize,
}

impl Topology {
    pub fn new(config: &TopologyConfig) -> Self {
        Self {
            exchange: config.exchange.clone(),
            queue_prefix: config.queue_prefix.clone(),
            durable: config.durable,
            bind_attempts: config.bind_attempts.max(1),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn queue_prefix(&self) -> &str {
        &self.queue_prefix
    }

    /// Queue that owns `routing_key`.
    pub fn queue_name(&self, routing_key: &RoutingKey) -> QueueName {
        QueueName::new(&self.queue_prefix, routing_key)
    }

    /// Declare the shared exchange. Must happen before any publish or bind.
    pub async fn declare(&self, broker: &dyn Broker) -> Result<(), TopologyError> {
        broker
            .declare_exchange(&self.exchange)
            .await
            .map_err(|source| TopologyError::Declare {
                exchange: self.exchange.clone(),
                source,
            })
    }

    /// Declare the exchange and operation queue, and bind the queue under
    /// `routing_key`, once.
    pub async fn bind_once(
        &self,
        broker: &dyn Broker,
        routing_key: &RoutingKey,
    ) -> Result<QueueName, BrokerError> {
        let queue = self.queue_name(routing_key);
        let spec = if self.durable {
            QueueSpec::durable(queue.as_str())
        } else {
            QueueSpec::transient(queue.as_str())
        };

        broker.declare_exchange(&self.exchange).await?;
        broker.declare_queue(&spec).await?;
        broker
            .bind_queue(queue.as_str(), &self.exchange, routing_key.as_str())
            .await?;
        Ok(queue)
    }

    /// Declare the operation queue and bind it under `routing_key`.
    ///
    /// Retries with backoff while the broker is unreachable; once the attempts
    /// are spent the error is returned so the process can exit and be restarted.
    pub async fn bind(
        &self,
        broker: &dyn Broker,
        routing_key: &RoutingKey,
    ) -> Result<QueueName, TopologyError> {
        let queue = (move || self.bind_once(broker, routing_key))
            .retry(bind_backoff(self.bind_attempts))
            .notify(|err: &BrokerError, dur: Duration| {
                warn!(routing_key = %routing_key, error = %err, delay = ?dur, "Bind failed, retrying");
            })
            .await
            .map_err(|source| TopologyError::Bind {
                queue: self.queue_name(routing_key).to_string(),
                attempts: self.bind_attempts,
                source,
            })?;

        info!(queue = %queue, routing_key = %routing_key, "Operation bound");
        Ok(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ChannelBroker;

    fn topology(bind_attempts: usize) -> Topology {
        Topology::new(&TopologyConfig {
            exchange: "test.rpc".to_string(),
            queue_prefix: "tasks".to_string(),
            durable: true,
            bind_attempts,
        })
    }

    #[test]
    fn test_routing_key_validation() {
        assert!(RoutingKey::new("create-task").is_ok());
        assert!(RoutingKey::new("get-task-by-id").is_ok());
        assert!(RoutingKey::new("").is_err());
        assert!(RoutingKey::new("create task").is_err());
        assert!(RoutingKey::new("tasks.*").is_err());
        assert!(RoutingKey::new("#").is_err());
        assert!(RoutingKey::new("tasks.create").is_err());
        assert!(RoutingKey::new("x".repeat(256)).is_err());
    }

    #[test]
    fn test_queue_name_convention() {
        let key = RoutingKey::new("create-task").unwrap();
        assert_eq!(topology(1).queue_name(&key).as_str(), "tasks.create-task");
    }

    #[tokio::test]
    async fn test_bind_declares_and_binds() {
        let broker = ChannelBroker::new();
        let key = RoutingKey::new("create-task").unwrap();

        let queue = topology(1).bind(&broker, &key).await.unwrap();

        assert!(broker.queue_exists(queue.as_str()));
        assert_eq!(
            broker.bound_queues("test.rpc", "create-task"),
            vec!["tasks.create-task".to_string()]
        );
    }

    #[tokio::test]
    async fn test_bind_retries_until_broker_answers() {
        let broker = ChannelBroker::new();
        broker.fail_next_binds(2);
        let key = RoutingKey::new("create-task").unwrap();

        let queue = topology(5).bind(&broker, &key).await.unwrap();
        assert_eq!(queue.as_str(), "tasks.create-task");
    }

    #[tokio::test]
    async fn test_bind_gives_up() {
        let broker = ChannelBroker::new();
        broker.fail_next_binds(10);
        let key = RoutingKey::new("create-task").unwrap();

        let result = topology(2).bind(&broker, &key).await;
        assert!(matches!(
            result,
            Err(TopologyError::Bind { attempts: 2, .. })
        ));
    }
}
