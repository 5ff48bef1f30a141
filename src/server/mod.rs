//! RPC server: handler registration and per-queue consumer loops.
//!
//! `register` binds the operation's queue and attaches a consumer before it
//! returns, so a request published afterwards is never lost. Each queue runs
//! its own loop with at most `prefetch` handler invocations in flight.

mod dispatch;

pub use dispatch::{
    DispatchOutcome, Dispatcher, ATTEMPT_HEADER, FAILURE_REASON_HEADER,
    ORIGINAL_ROUTING_KEY_HEADER,
};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use futures::StreamExt;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::broker::{Broker, BrokerError, DeliveryStream};
use crate::config::{FailurePolicyConfig, ServerConfig};
use crate::handler::RpcHandler;
use crate::topology::{QueueName, RoutingKey, Topology, TopologyError};

/// Errors raised while registering or running handlers.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Routing key '{0}' is already registered")]
    DuplicateRoutingKey(String),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Consumer for '{queue}' gave up after {attempts} reconnect attempts: {source}")]
    ConsumerExhausted {
        queue: String,
        attempts: usize,
        #[source]
        source: BrokerError,
    },
}

/// What happens to a fire-and-forget message whose handler failed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Negative-acknowledge without requeue.
    #[default]
    Drop,
    /// Republish up to `max_attempts` deliveries in total, then publish to
    /// the dead-letter key if one is set, or drop.
    Retry {
        max_attempts: u32,
        dead_letter: Option<RoutingKey>,
    },
}

impl FailurePolicy {
    pub fn from_config(config: &FailurePolicyConfig) -> Result<Self, TopologyError> {
        Ok(match config {
            FailurePolicyConfig::Drop => Self::Drop,
            FailurePolicyConfig::Retry {
                max_attempts,
                dead_letter_key,
            } => Self::Retry {
                max_attempts: (*max_attempts).max(1),
                dead_letter: dead_letter_key
                    .as_deref()
                    .map(RoutingKey::new)
                    .transpose()?,
            },
        })
    }
}

/// One operation served by this process. Never mutated after registration.
pub struct HandlerRegistration {
    pub routing_key: RoutingKey,
    pub queue: QueueName,
    pub handler: Arc<dyn RpcHandler>,
    pub policy: FailurePolicy,
    pub prefetch: u16,
}

impl fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("routing_key", &self.routing_key)
            .field("queue", &self.queue)
            .field("policy", &self.policy)
            .field("prefetch", &self.prefetch)
            .finish()
    }
}

/// Backoff for consumer reconnects after the delivery stream ends.
///
/// `max_attempts` counts every reconnect attempt, the first one included.
///
/// - Min delay: 100ms
/// - Max delay: 30s
/// - Jitter enabled
pub fn reconnect_backoff(max_attempts: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(30))
        .with_max_times(max_attempts.saturating_sub(1))
        .with_jitter()
}

/// Serves registered operations from their queues.
pub struct RpcServer {
    broker: Arc<dyn Broker>,
    topology: Topology,
    config: ServerConfig,
    service: String,
    registrations: Mutex<HashMap<RoutingKey, Arc<HandlerRegistration>>>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
    fatal_tx: mpsc::UnboundedSender<ServerError>,
    fatal_rx: Mutex<mpsc::UnboundedReceiver<ServerError>>,
    shutdown: watch::Sender<bool>,
}

impl RpcServer {
    pub fn new(
        broker: Arc<dyn Broker>,
        topology: Topology,
        config: ServerConfig,
        service: impl Into<String>,
    ) -> Self {
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        Self {
            broker,
            topology,
            config,
            service: service.into(),
            registrations: Mutex::new(HashMap::new()),
            consumers: Mutex::new(Vec::new()),
            fatal_tx,
            fatal_rx: Mutex::new(fatal_rx),
            shutdown,
        }
    }

    /// Register `handler` for `routing_key` with the configured failure policy.
    pub async fn register<H>(&self, routing_key: &str, handler: H) -> Result<(), ServerError>
    where
        H: RpcHandler,
    {
        let policy = FailurePolicy::from_config(&self.config.failure_policy)?;
        self.register_with_policy(routing_key, handler, policy)
            .await
    }

    /// Register `handler` for `routing_key` with an explicit failure policy.
    pub async fn register_with_policy<H>(
        &self,
        routing_key: &str,
        handler: H,
        policy: FailurePolicy,
    ) -> Result<(), ServerError>
    where
        H: RpcHandler,
    {
        let routing_key = RoutingKey::new(routing_key)?;

        // Held across bind so concurrent registrations of one key cannot both win
        let mut registrations = self.registrations.lock().await;
        if registrations.contains_key(&routing_key) {
            return Err(ServerError::DuplicateRoutingKey(routing_key.to_string()));
        }

        let queue = self.topology.bind(self.broker.as_ref(), &routing_key).await?;
        let prefetch = self.config.prefetch.max(1);
        let stream = self.broker.consume(queue.as_str(), prefetch).await?;

        let registration = Arc::new(HandlerRegistration {
            routing_key: routing_key.clone(),
            queue,
            handler: Arc::new(handler),
            policy,
            prefetch,
        });
        registrations.insert(routing_key, Arc::clone(&registration));
        drop(registrations);

        info!(
            service = %self.service,
            routing_key = %registration.routing_key,
            queue = %registration.queue,
            prefetch,
            "Handler registered"
        );

        let consumer = ConsumerLoop {
            broker: Arc::clone(&self.broker),
            topology: self.topology.clone(),
            dispatcher: Arc::new(Dispatcher::new(
                Arc::clone(&self.broker),
                self.topology.exchange(),
                self.service.clone(),
                Arc::clone(&registration),
            )),
            registration,
            reconnect_attempts: self.config.reconnect_attempts,
        };
        let fatal_tx = self.fatal_tx.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = consumer.run(stream).await {
                error!(error = %e, "Consumer stopped");
                let _ = fatal_tx.send(e);
            }
        });
        self.consumers.lock().await.push(handle);

        Ok(())
    }

    /// Routing keys served by this process.
    pub async fn routing_keys(&self) -> Vec<RoutingKey> {
        let mut keys: Vec<_> = self.registrations.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Wait until a consumer fails for good, or until `shutdown` is called.
    ///
    /// An error means the service can no longer answer one of its operations
    /// and should exit so it can be restarted.
    pub async fn run(&self) -> Result<(), ServerError> {
        let mut shutdown = self.shutdown.subscribe();
        let mut fatal = self.fatal_rx.lock().await;

        if *shutdown.borrow() {
            return Ok(());
        }

        tokio::select! {
            Some(e) = fatal.recv() => Err(e),
            _ = shutdown.changed() => Ok(()),
        }
    }

    /// Stop all consumers. In-flight invocations finish on their own.
    pub async fn shutdown(&self) {
        let mut consumers = self.consumers.lock().await;
        for handle in consumers.drain(..) {
            handle.abort();
        }
        self.shutdown.send_replace(true);
        info!(service = %self.service, "Server shut down");
    }
}

/// Consumer loop of one operation queue.
struct ConsumerLoop {
    broker: Arc<dyn Broker>,
    topology: Topology,
    dispatcher: Arc<Dispatcher>,
    registration: Arc<HandlerRegistration>,
    reconnect_attempts: usize,
}

impl ConsumerLoop {
    async fn run(self, mut stream: DeliveryStream) -> Result<(), ServerError> {
        let semaphore = Arc::new(Semaphore::new(usize::from(self.registration.prefetch)));

        loop {
            loop {
                // Wait for a free slot before taking the next delivery
                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                    return Ok(());
                };
                let delivery = match stream.next().await {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => {
                        error!(queue = %self.registration.queue, error = %e, "Consumer delivery error, will reconnect");
                        break;
                    }
                    None => {
                        info!(queue = %self.registration.queue, "Consumer stream ended, reconnecting...");
                        break;
                    }
                };

                let dispatcher = Arc::clone(&self.dispatcher);
                tokio::spawn(async move {
                    dispatcher.dispatch(delivery).await;
                    drop(permit);
                });
            }

            // Release the queue before subscribing again
            drop(stream);
            stream = self.reconnect().await?;
        }
    }

    /// Rebind and resubscribe with exponential backoff with jitter.
    async fn reconnect(&self) -> Result<DeliveryStream, ServerError> {
        let broker = self.broker.as_ref();
        let topology = &self.topology;
        let registration = self.registration.as_ref();

        let attempt = move || async move {
            topology
                .bind_once(broker, &registration.routing_key)
                .await?;
            broker
                .consume(registration.queue.as_str(), registration.prefetch)
                .await
        };

        let stream = attempt
            .retry(reconnect_backoff(self.reconnect_attempts))
            .notify(|err: &BrokerError, dur: Duration| {
                warn!(
                    queue = %registration.queue,
                    error = %err,
                    backoff_ms = %dur.as_millis(),
                    "Failed to set up consumer, retrying after backoff"
                );
            })
            .await
            .map_err(|source| ServerError::ConsumerExhausted {
                queue: registration.queue.to_string(),
                attempts: self.reconnect_attempts,
                source,
            })?;

        info!(queue = %registration.queue, "Consumer reconnected");
        Ok(stream)
    }
}

#[cfg(test)]
mod tests;
