//! In-memory channel-based broker for standalone mode.
//!
//! Uses tokio mpsc channels as queues within a single process. Exchanges route
//! by exact routing key, the empty exchange routes straight to a queue by name,
//! and unroutable messages are dropped, mirroring how RabbitMQ behaves for the
//! subset of AMQP the RPC layer relies on.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Instant;

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::{
    Broker, BrokerError, Delivery, DeliveryAcker, DeliveryStream, MessageProperties, NoAck,
    OutboundMessage, QueueSpec, Result, DEFAULT_EXCHANGE,
};

/// A message sitting in a queue.
#[derive(Debug, Clone)]
struct StoredMessage {
    routing_key: String,
    body: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
    expires_at: Option<Instant>,
}

impl StoredMessage {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

struct QueueState {
    sender: mpsc::UnboundedSender<StoredMessage>,
    /// Taken while a consumer is attached.
    receiver: Option<mpsc::UnboundedReceiver<StoredMessage>>,
    /// Ends the attached consumer's stream.
    close: Option<oneshot::Sender<()>>,
    auto_delete: bool,
}

#[derive(Default)]
struct State {
    exchanges: HashSet<String>,
    /// exchange -> routing key -> queues
    bindings: HashMap<String, HashMap<String, Vec<String>>>,
    queues: HashMap<String, QueueState>,
}

impl State {
    fn remove_queue(&mut self, queue: &str) {
        self.queues.remove(queue);
        for keys in self.bindings.values_mut() {
            for queues in keys.values_mut() {
                queues.retain(|q| q != queue);
            }
        }
    }
}

/// In-memory broker using tokio channels.
///
/// Each queue allows a single consumer at a time. Dropping a consumer returns
/// undelivered messages to the queue, or deletes the queue if it auto-deletes.
#[derive(Clone, Default)]
pub struct ChannelBroker {
    state: Arc<Mutex<State>>,
    /// Number of upcoming `bind_queue` calls that fail.
    bind_failures: Arc<AtomicUsize>,
    /// Number of upcoming `consume` calls that fail.
    consume_failures: Arc<AtomicUsize>,
    /// Every `consume` call made, failed ones included.
    consume_calls: Arc<AtomicUsize>,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ChannelBroker {
    /// Create a new, empty broker.
    pub fn new() -> Self {
        info!("Channel broker initialized");
        Self::default()
    }

    /// Make the next `count` bind calls fail, simulating an unreachable broker.
    pub fn fail_next_binds(&self, count: usize) {
        self.bind_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` consume calls fail.
    pub fn fail_next_consumes(&self, count: usize) {
        self.consume_failures.store(count, Ordering::SeqCst);
    }

    /// Number of `consume` calls so far.
    pub fn consume_calls(&self) -> usize {
        self.consume_calls.load(Ordering::SeqCst)
    }

    /// End the stream of the consumer attached to `queue`, as a broker does
    /// when it cancels a consumer. Returns false if nobody was consuming.
    ///
    /// Undelivered messages stay on the queue once the stream is dropped.
    pub fn close_consumer(&self, queue: &str) -> bool {
        let close = lock(&self.state)
            .queues
            .get_mut(queue)
            .and_then(|entry| entry.close.take());
        match close {
            Some(close) => close.send(()).is_ok(),
            None => false,
        }
    }

    /// Names of all declared queues, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<_> = lock(&self.state).queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether a queue with this name currently exists.
    pub fn queue_exists(&self, queue: &str) -> bool {
        lock(&self.state).queues.contains_key(queue)
    }

    /// Queues bound to `exchange` under `routing_key`.
    pub fn bound_queues(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        lock(&self.state)
            .bindings
            .get(exchange)
            .and_then(|keys| keys.get(routing_key))
            .cloned()
            .unwrap_or_default()
    }

    fn declare(&self, spec: &QueueSpec) -> String {
        let name = if spec.name.is_empty() {
            format!("amq.gen-{}", uuid::Uuid::new_v4().simple())
        } else {
            spec.name.clone()
        };

        let mut state = lock(&self.state);
        state.queues.entry(name.clone()).or_insert_with(|| {
            let (sender, receiver) = mpsc::unbounded_channel();
            QueueState {
                sender,
                receiver: Some(receiver),
                close: None,
                auto_delete: spec.auto_delete,
            }
        });
        name
    }

    fn attach(&self, queue: &str, manual_ack: bool) -> Result<ChannelConsumer> {
        let mut state = lock(&self.state);
        let entry = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::Subscribe(format!("Queue '{}' not declared", queue)))?;

        let receiver = entry.receiver.take().ok_or_else(|| {
            BrokerError::Subscribe(format!("Queue '{}' already has a consumer", queue))
        })?;

        let (close, closed) = oneshot::channel();
        entry.close = Some(close);

        Ok(ChannelConsumer {
            queue: queue.to_string(),
            receiver: Some(receiver),
            closed: Some(closed),
            requeue: entry.sender.clone(),
            auto_delete: entry.auto_delete,
            manual_ack,
            state: Arc::downgrade(&self.state),
        })
    }
}

#[async_trait]
impl Broker for ChannelBroker {
    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        lock(&self.state).exchanges.insert(exchange.to_string());
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String> {
        Ok(self.declare(spec))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let injected = self
            .bind_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BrokerError::Bind("Broker unreachable".to_string()));
        }

        let mut state = lock(&self.state);
        if !state.exchanges.contains(exchange) {
            return Err(BrokerError::Bind(format!(
                "Exchange '{}' not declared",
                exchange
            )));
        }
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::Bind(format!("Queue '{}' not declared", queue)));
        }

        let queues = state
            .bindings
            .entry(exchange.to_string())
            .or_default()
            .entry(routing_key.to_string())
            .or_default();
        if !queues.iter().any(|q| q == queue) {
            queues.push(queue.to_string());
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<()> {
        let stored = StoredMessage {
            routing_key: routing_key.to_string(),
            expires_at: message.properties.expiration.map(|ttl| Instant::now() + ttl),
            body: message.body,
            properties: message.properties,
            redelivered: false,
        };

        let state = lock(&self.state);
        let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
            vec![routing_key.to_string()]
        } else {
            if !state.exchanges.contains(exchange) {
                return Err(BrokerError::Publish(format!(
                    "Exchange '{}' not declared",
                    exchange
                )));
            }
            state
                .bindings
                .get(exchange)
                .and_then(|keys| keys.get(routing_key))
                .cloned()
                .unwrap_or_default()
        };

        let mut routed = 0;
        for queue in &targets {
            if let Some(entry) = state.queues.get(queue) {
                if entry.sender.send(stored.clone()).is_ok() {
                    routed += 1;
                }
            }
        }

        if routed == 0 {
            debug!(exchange = %exchange, routing_key = %routing_key, "Message unroutable, dropped");
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, _prefetch: u16) -> Result<DeliveryStream> {
        self.consume_calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .consume_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BrokerError::Subscribe("Broker unreachable".to_string()));
        }

        let consumer = self.attach(queue, true)?;
        Ok(Box::pin(consumer))
    }

    async fn open_reply_queue(&self) -> Result<(String, DeliveryStream)> {
        let name = self.declare(&QueueSpec::reply());
        let consumer = self.attach(&name, false)?;
        Ok((name, Box::pin(consumer)))
    }
}

/// Consumer end of an in-memory queue.
struct ChannelConsumer {
    queue: String,
    receiver: Option<mpsc::UnboundedReceiver<StoredMessage>>,
    /// Fires when the broker cancels this consumer.
    closed: Option<oneshot::Receiver<()>>,
    requeue: mpsc::UnboundedSender<StoredMessage>,
    auto_delete: bool,
    manual_ack: bool,
    state: Weak<Mutex<State>>,
}

impl ChannelConsumer {
    fn delivery(&self, message: StoredMessage) -> Delivery {
        let acker: Box<dyn DeliveryAcker> = if self.manual_ack {
            Box::new(ChannelAcker {
                message: Mutex::new(Some(message.clone())),
                requeue: self.requeue.clone(),
            })
        } else {
            Box::new(NoAck)
        };

        Delivery {
            routing_key: message.routing_key,
            body: message.body,
            properties: message.properties,
            redelivered: message.redelivered,
            acker,
        }
    }
}

impl Stream for ChannelConsumer {
    type Item = Result<Delivery>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(closed) = this.closed.as_mut() {
            // A dropped sender means the queue or the broker is gone
            if Pin::new(closed).poll(cx).is_ready() {
                this.closed = None;
                debug!(queue = %this.queue, "Consumer cancelled");
                return Poll::Ready(None);
            }
        } else {
            return Poll::Ready(None);
        }

        loop {
            let Some(receiver) = this.receiver.as_mut() else {
                return Poll::Ready(None);
            };
            match receiver.poll_recv(cx) {
                Poll::Ready(Some(message)) if message.is_expired() => {
                    debug!(queue = %this.queue, "Message expired before delivery, dropped");
                }
                Poll::Ready(Some(message)) => {
                    return Poll::Ready(Some(Ok(this.delivery(message))));
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for ChannelConsumer {
    fn drop(&mut self) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let mut state = lock(&state);
        if self.auto_delete {
            state.remove_queue(&self.queue);
        } else if let Some(entry) = state.queues.get_mut(&self.queue) {
            entry.receiver = self.receiver.take();
            entry.close = None;
        }
    }
}

/// Acker that can put a message back on its queue.
struct ChannelAcker {
    message: Mutex<Option<StoredMessage>>,
    requeue: mpsc::UnboundedSender<StoredMessage>,
}

impl ChannelAcker {
    fn take(&self) -> Result<StoredMessage> {
        self.message
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| BrokerError::Ack("Delivery already acknowledged".to_string()))
    }
}

#[async_trait]
impl DeliveryAcker for ChannelAcker {
    async fn ack(&self) -> Result<()> {
        self.take().map(drop)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        let mut message = self.take()?;
        if requeue {
            message.redelivered = true;
            self.requeue
                .send(message)
                .map_err(|_| BrokerError::Ack("Queue deleted".to_string()))?;
        }
        Ok(())
    }
}
