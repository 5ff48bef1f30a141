//! RPC client: correlated requests with a timeout, and fire-and-forget publishes.
//!
//! ```text
//! request ──publish(key, reply_to, correlation_id)──> [exchange] ──> handler queue
//!    ^                                                                   │
//!    └──── pending[correlation_id] <── reply listener <── reply queue <──┘
//! ```
//!
//! Every client owns one private reply queue and a listener task that matches
//! replies to pending calls purely by correlation id, so any number of calls
//! can be outstanding at once and replies may arrive in any order.

mod pending;

pub use pending::{CorrelationId, ParseCorrelationIdError, PendingCalls};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument};

use crate::broker::{Broker, Delivery, DeliveryStream, MessageProperties, OutboundMessage};
use crate::config::ClientConfig;
use crate::envelope::Envelope;
use crate::error::{Result, RpcError};
use crate::handler::{Request, DEADLINE_HEADER};
use crate::topology::{RoutingKey, Topology};
use pending::PendingGuard;

type TokenSource = Box<dyn Fn() -> String + Send + Sync>;

/// Cheaply cloneable RPC client. Clones share the reply queue and pending calls.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

struct Inner {
    broker: Arc<dyn Broker>,
    topology: Topology,
    config: ClientConfig,
    pending: Arc<PendingCalls>,
    reply: Mutex<Option<ReplyRoute>>,
    sequence: AtomicU64,
    token_source: TokenSource,
}

/// The private reply queue and the task draining it.
struct ReplyRoute {
    queue: String,
    listener: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(route) = self.reply.get_mut().take() {
            route.listener.abort();
        }
    }
}

impl RpcClient {
    pub fn new(broker: Arc<dyn Broker>, topology: Topology, config: ClientConfig) -> Self {
        Self::with_token_source(broker, topology, config, || {
            uuid::Uuid::new_v4().simple().to_string()
        })
    }

    /// Build a client whose correlation tokens come from `token_source`.
    pub fn with_token_source<F>(
        broker: Arc<dyn Broker>,
        topology: Topology,
        config: ClientConfig,
        token_source: F,
    ) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                broker,
                topology,
                config,
                pending: Arc::new(PendingCalls::new()),
                reply: Mutex::new(None),
                sequence: AtomicU64::new(0),
                token_source: Box::new(token_source),
            }),
        }
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Timeout applied to `routing_key` when none is given.
    pub fn timeout_for(&self, routing_key: &str) -> Duration {
        self.inner.config.timeout_for(routing_key)
    }

    /// Call an operation and wait for its reply, using the configured timeout.
    pub async fn request<Req, Resp>(&self, routing_key: &str, payload: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let timeout = self.timeout_for(routing_key);
        self.request_with_timeout(routing_key, payload, timeout)
            .await
    }

    /// Call an operation and wait at most `timeout` for its reply.
    pub async fn request_with_timeout<Req, Resp>(
        &self,
        routing_key: &str,
        payload: &Req,
        timeout: Duration,
    ) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let key = RoutingKey::new(routing_key)?;
        let body = serde_json::to_vec(payload)?;
        let value = self.call(&key, body, timeout).await?;
        serde_json::from_value(value).map_err(|e| {
            RpcError::Codec(format!("Unexpected reply shape for '{}': {}", key, e))
        })
    }

    /// Call an operation on behalf of an inbound request, never waiting past
    /// the inbound caller's deadline.
    pub async fn request_within<Req, Resp>(
        &self,
        parent: &Request,
        routing_key: &str,
        payload: &Req,
    ) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let configured = self.timeout_for(routing_key);
        let timeout = match parent.remaining() {
            Some(remaining) => configured.min(remaining),
            None => configured,
        };

        if timeout.is_zero() {
            return Err(RpcError::Timeout {
                routing_key: routing_key.to_string(),
                timeout,
            });
        }

        self.request_with_timeout(routing_key, payload, timeout)
            .await
    }

    /// Publish without waiting for any handler.
    ///
    /// Returns once the broker has accepted the message for routing. Handler
    /// outcomes are never reported back.
    pub async fn publish<T>(&self, routing_key: &str, payload: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let key = RoutingKey::new(routing_key)?;
        let body = serde_json::to_vec(payload)?;

        let span = tracing::debug_span!("rpc.publish", routing_key = %key);
        async {
            self.inner
                .broker
                .publish(
                    self.inner.topology.exchange(),
                    key.as_str(),
                    OutboundMessage::new(body),
                )
                .await?;
            debug!("Published event");
            Ok::<_, RpcError>(())
        }
        .instrument(span)
        .await
    }

    fn next_correlation_id(&self) -> CorrelationId {
        let sequence = self.inner.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        CorrelationId::new((self.inner.token_source)(), sequence)
    }

    async fn call(&self, key: &RoutingKey, body: Vec<u8>, timeout: Duration) -> Result<Value> {
        let reply_to = self.reply_queue().await?;
        let id = self.next_correlation_id();

        let span = tracing::debug_span!(
            "rpc.request",
            routing_key = %key,
            correlation_id = %id,
            timeout_ms = timeout.as_millis() as u64,
        );

        async {
            let issued_at = tokio::time::Instant::now();
            let receiver = self.inner.pending.register(id.clone(), timeout);
            let _guard = PendingGuard::new(Arc::clone(&self.inner.pending), id.clone());

            let deadline_ms = Utc::now()
                .timestamp_millis()
                .saturating_add(i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX));
            let properties = MessageProperties::default()
                .with_correlation_id(id.to_string())
                .with_reply_to(reply_to)
                .with_expiration(timeout)
                .with_header(DEADLINE_HEADER, deadline_ms.to_string());
            let message = OutboundMessage::new(body).with_properties(properties);

            let exchange = self.inner.topology.exchange();
            let broker = &self.inner.broker;
            let exchange_and_wait = async {
                broker.publish(exchange, key.as_str(), message).await?;
                let reply = receiver.await.map_err(|_| RpcError::ReplyChannelClosed)?;
                Ok::<_, RpcError>(reply)
            };

            let reply = match tokio::time::timeout_at(issued_at + timeout, exchange_and_wait).await
            {
                Ok(reply) => reply?,
                Err(_) => {
                    debug!("Request timed out");
                    return Err(RpcError::Timeout {
                        routing_key: key.to_string(),
                        timeout,
                    });
                }
            };

            let value = Envelope::decode(&reply)?
                .into_result()
                .map_err(RpcError::Remote)?;
            debug!("Reply received");
            Ok::<_, RpcError>(value)
        }
        .instrument(span)
        .await
    }

    /// Name of the reply queue, opening it (again) if needed.
    async fn reply_queue(&self) -> Result<String> {
        let mut route = self.inner.reply.lock().await;
        if let Some(existing) = route.as_ref() {
            if !existing.listener.is_finished() {
                return Ok(existing.queue.clone());
            }
            warn!(queue = %existing.queue, "Reply listener stopped, reopening reply queue");
        }

        let (queue, stream) = self.inner.broker.open_reply_queue().await?;
        let listener = tokio::spawn(listen_for_replies(
            stream,
            Arc::downgrade(&self.inner.pending),
            queue.clone(),
        ));
        debug!(queue = %queue, "Reply listener started");

        *route = Some(ReplyRoute {
            queue: queue.clone(),
            listener,
        });
        Ok(queue)
    }
}

/// Drain the reply queue, resolving pending calls by correlation id.
async fn listen_for_replies(mut stream: DeliveryStream, pending: Weak<PendingCalls>, queue: String) {
    while let Some(delivery) = stream.next().await {
        let Some(pending) = pending.upgrade() else {
            return;
        };
        match delivery {
            Ok(delivery) => route_reply(&pending, delivery),
            Err(e) => {
                warn!(queue = %queue, error = %e, "Reply stream failed");
                break;
            }
        }
    }

    // Replies for outstanding calls went to this queue; nobody will read them now.
    if let Some(pending) = pending.upgrade() {
        let abandoned = pending.close_all();
        if abandoned > 0 {
            warn!(queue = %queue, abandoned, "Reply listener stopped with calls outstanding");
        }
    }
}

fn route_reply(pending: &PendingCalls, delivery: Delivery) {
    let Some(raw_id) = delivery.properties.correlation_id.as_deref() else {
        warn!("Reply without correlation id discarded");
        return;
    };

    let id = match raw_id.parse::<CorrelationId>() {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "Reply discarded");
            return;
        }
    };

    if !pending.resolve(&id, delivery.body) {
        debug!(correlation_id = %id, "Late or unknown reply discarded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ChannelBroker;
    use crate::config::TopologyConfig;
    use crate::envelope::Failure;
    use crate::handler::HandlerError;
    use serde_json::json;

    fn client(broker: &ChannelBroker) -> RpcClient {
        RpcClient::new(
            Arc::new(broker.clone()),
            Topology::new(&TopologyConfig::default()),
            ClientConfig {
                default_timeout_ms: 200,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_request_times_out_without_handler() {
        let broker = ChannelBroker::new();
        broker.declare_exchange("switchboard.rpc").await.unwrap();
        let client = client(&broker);

        let err = client
            .request::<_, Value>("missing-op", &json!({}))
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_routing_key_rejected_locally() {
        let broker = ChannelBroker::new();
        let client = client(&broker);

        let err = client
            .publish("tasks.*", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Topology(_)));
    }

    #[tokio::test]
    async fn test_request_within_expired_parent() {
        let broker = ChannelBroker::new();
        let client = client(&broker);
        let parent = Request::new("create-task", json!({}))
            .with_deadline(Utc::now() - chrono::Duration::seconds(1));

        let err = client
            .request_within::<_, Value>(&parent, "check-project-exists", &json!({}))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_reply_resolves_by_correlation_id() {
        let broker = ChannelBroker::new();
        broker.declare_exchange("switchboard.rpc").await.unwrap();
        broker
            .declare_queue(&crate::broker::QueueSpec::durable("switchboard.echo"))
            .await
            .unwrap();
        broker
            .bind_queue("switchboard.echo", "switchboard.rpc", "echo")
            .await
            .unwrap();
        let mut requests = broker.consume("switchboard.echo", 1).await.unwrap();
        let client = client(&broker);

        // Answer by hand: reply with a failure envelope
        let responder = {
            let broker = broker.clone();
            tokio::spawn(async move {
                let delivery = requests.next().await.unwrap().unwrap();
                let reply_to = delivery.properties.reply_to.clone().unwrap();
                let correlation_id = delivery.properties.correlation_id.clone().unwrap();
                assert!(delivery.properties.header(DEADLINE_HEADER).is_some());
                assert_eq!(delivery.properties.expiration, Some(Duration::from_millis(200)));

                let failure = HandlerError::not_found("not found").into_failure();
                let reply = OutboundMessage::new(Envelope::Failure(failure).encode().unwrap())
                    .with_properties(
                        MessageProperties::default().with_correlation_id(correlation_id),
                    );
                broker
                    .publish(crate::broker::DEFAULT_EXCHANGE, &reply_to, reply)
                    .await
                    .unwrap();
                delivery.ack().await.unwrap();
            })
        };

        let err = client
            .request::<_, Value>("echo", &json!({"value": 21}))
            .await
            .unwrap_err();
        responder.await.unwrap();

        assert_eq!(err.failure(), Some(&Failure::new(404, "not found")));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_reply_queue_loss_fails_outstanding_calls_then_reopens() {
        let broker = ChannelBroker::new();
        let topology = Topology::new(&TopologyConfig::default());
        let server = crate::server::RpcServer::new(
            Arc::new(broker.clone()),
            topology.clone(),
            crate::config::ServerConfig::default(),
            "echo",
        );
        server
            .register("echo", |request: Request| async move {
                Ok::<_, HandlerError>(request.into_payload())
            })
            .await
            .unwrap();

        let client = RpcClient::new(
            Arc::new(broker.clone()),
            topology,
            ClientConfig {
                default_timeout_ms: 2_000,
                ..Default::default()
            },
        );

        // Nobody answers this one
        let waiting = {
            let client = client.clone();
            tokio::spawn(async move { client.request::<_, Value>("unanswered", &json!({})).await })
        };
        while client.pending_calls() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let reply_queues: Vec<String> = broker
            .queue_names()
            .into_iter()
            .filter(|q| q.starts_with("amq.gen-"))
            .collect();
        assert_eq!(reply_queues.len(), 1);
        assert!(broker.close_consumer(&reply_queues[0]));

        let err = waiting.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::ReplyChannelClosed));
        assert!(err.is_transport());
        assert_eq!(client.pending_calls(), 0);
        assert!(!broker.queue_exists(&reply_queues[0]));

        let reply: Value = client.request("echo", &json!({"n": 1})).await.unwrap();
        assert_eq!(reply, json!({"n": 1}));
        let reopened: Vec<String> = broker
            .queue_names()
            .into_iter()
            .filter(|q| q.starts_with("amq.gen-"))
            .collect();
        assert_eq!(reopened.len(), 1);
        assert_ne!(reopened, reply_queues);
    }

    #[tokio::test]
    async fn test_correlation_ids_are_unique_per_client() {
        let broker = ChannelBroker::new();
        let client = RpcClient::with_token_source(
            Arc::new(broker),
            Topology::new(&TopologyConfig::default()),
            ClientConfig::default(),
            || "fixed".to_string(),
        );

        let first = client.next_correlation_id();
        let second = client.clone().next_correlation_id();
        assert_eq!(first.token(), "fixed");
        assert_ne!(first, second);
    }
}
