//! Handler dispatch.
//!
//! Turns one delivery into one handler invocation, then settles it:
//! 1. Decode the JSON payload
//! 2. Invoke the handler (panics become 500 failures)
//! 3. Requests: reply with the envelope on the caller's reply queue
//! 4. Events: apply the failure policy
//! 5. Acknowledge or negatively acknowledge

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, warn, Instrument};

use super::{FailurePolicy, HandlerRegistration};
use crate::broker::{Broker, Delivery, MessageProperties, OutboundMessage, DEFAULT_EXCHANGE};
use crate::envelope::{Envelope, Failure};
use crate::handler::{parse_deadline, HandlerError, HandlerResult, Request, DEADLINE_HEADER};

/// Header counting delivery attempts of a retried event, starting at 1.
pub const ATTEMPT_HEADER: &str = "x-attempt";
/// Routing key an event had before it was dead-lettered.
pub const ORIGINAL_ROUTING_KEY_HEADER: &str = "x-original-routing-key";
/// Failure message that sent an event to the dead-letter key.
pub const FAILURE_REASON_HEADER: &str = "x-failure-reason";

/// What happened to a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Request answered with a success or failure envelope.
    Replied { success: bool },
    /// Event handled successfully.
    Handled,
    /// Event failed and was republished for another attempt.
    Retried { attempt: u32 },
    /// Event failed for the last time and went to the dead-letter key.
    DeadLettered,
    /// Event failed and was dropped.
    Dropped,
    /// Request arrived after its caller stopped waiting; not executed.
    Expired,
}

impl DispatchOutcome {
    /// Returns true if the handler ran and succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Handled | Self::Replied { success: true })
    }
}

/// Dispatches deliveries of one queue to its handler.
pub struct Dispatcher {
    broker: Arc<dyn Broker>,
    exchange: String,
    service: String,
    registration: Arc<HandlerRegistration>,
}

impl Dispatcher {
    pub fn new(
        broker: Arc<dyn Broker>,
        exchange: impl Into<String>,
        service: impl Into<String>,
        registration: Arc<HandlerRegistration>,
    ) -> Self {
        Self {
            broker,
            exchange: exchange.into(),
            service: service.into(),
            registration,
        }
    }

    /// Process one delivery end to end.
    pub async fn dispatch(&self, delivery: Delivery) -> DispatchOutcome {
        let span = tracing::info_span!(
            "rpc.dispatch",
            service = %self.service,
            routing_key = %self.registration.routing_key,
            correlation_id = delivery.properties.correlation_id.as_deref().unwrap_or(""),
        );
        self.dispatch_inner(delivery).instrument(span).await
    }

    async fn dispatch_inner(&self, delivery: Delivery) -> DispatchOutcome {
        let is_request = delivery.properties.reply_to.is_some();
        let request = decode_request(self.registration.routing_key.as_str(), &delivery);

        if is_request {
            if let Ok(request) = &request {
                if request.is_expired() {
                    debug!("Request expired before dispatch, dropped");
                    self.settle(&delivery, false).await;
                    return DispatchOutcome::Expired;
                }
            }
        }

        let result = match request {
            Ok(request) => self.invoke(request).await,
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            log_failure(e, is_request);
        }

        if is_request {
            self.reply(&delivery, &result).await;
            self.settle(&delivery, result.is_ok()).await;
            return DispatchOutcome::Replied {
                success: result.is_ok(),
            };
        }

        match result {
            Ok(_) => {
                self.settle(&delivery, true).await;
                DispatchOutcome::Handled
            }
            Err(e) => self.apply_failure_policy(&delivery, &e).await,
        }
    }

    /// Run the handler in its own task so a panic is contained.
    async fn invoke(&self, request: Request) -> HandlerResult {
        let invocation = self.registration.handler.handle(request);
        match tokio::spawn(invocation).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(HandlerError::internal("Handler panicked")),
            Err(e) => Err(HandlerError::internal(format!("Handler aborted: {}", e))),
        }
    }

    async fn reply(&self, delivery: &Delivery, result: &HandlerResult) {
        let Some(reply_to) = delivery.properties.reply_to.as_deref() else {
            return;
        };

        let envelope: Envelope = match result {
            Ok(value) => Envelope::Success(value.clone()),
            Err(e) => Envelope::Failure(e.clone().into_failure()),
        };

        let body = match envelope.encode() {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "Failed to encode reply, answering with a server fault");
                match Envelope::Failure(Failure::internal("Failed to encode reply")).encode() {
                    Ok(body) => body,
                    Err(e) => {
                        error!(error = %e, "Failed to encode fallback reply, caller will time out");
                        return;
                    }
                }
            }
        };

        let mut properties = MessageProperties::default();
        properties.correlation_id = delivery.properties.correlation_id.clone();
        let message = OutboundMessage::new(body).with_properties(properties);

        if let Err(e) = self
            .broker
            .publish(DEFAULT_EXCHANGE, reply_to, message)
            .await
        {
            error!(reply_to = %reply_to, error = %e, "Failed to publish reply");
        }
    }

    /// Ack on success; otherwise nack without requeue.
    async fn settle(&self, delivery: &Delivery, success: bool) {
        let settled = if success {
            delivery.ack().await
        } else {
            delivery.nack(false).await
        };
        if let Err(e) = settled {
            error!(error = %e, "Failed to settle delivery");
        }
    }

    async fn apply_failure_policy(
        &self,
        delivery: &Delivery,
        failure: &HandlerError,
    ) -> DispatchOutcome {
        let FailurePolicy::Retry {
            max_attempts,
            dead_letter,
        } = &self.registration.policy
        else {
            self.settle(delivery, false).await;
            return DispatchOutcome::Dropped;
        };

        let attempt = attempt_of(delivery);

        if attempt < *max_attempts {
            let next = attempt + 1;
            let message = OutboundMessage::new(delivery.body.clone()).with_properties(
                delivery
                    .properties
                    .clone()
                    .with_header(ATTEMPT_HEADER, next.to_string()),
            );
            return match self
                .broker
                .publish(&self.exchange, &delivery.routing_key, message)
                .await
            {
                Ok(()) => {
                    debug!(attempt = next, max_attempts, "Event scheduled for another attempt");
                    self.settle(delivery, true).await;
                    DispatchOutcome::Retried { attempt: next }
                }
                Err(e) => self.requeue_once(delivery, &e.to_string()).await,
            };
        }

        let Some(dead_letter) = dead_letter else {
            warn!(attempt, "Event failed on its last attempt, dropped");
            self.settle(delivery, false).await;
            return DispatchOutcome::Dropped;
        };

        let message = OutboundMessage::new(delivery.body.clone()).with_properties(
            delivery
                .properties
                .clone()
                .with_header(ATTEMPT_HEADER, attempt.to_string())
                .with_header(ORIGINAL_ROUTING_KEY_HEADER, delivery.routing_key.clone())
                .with_header(FAILURE_REASON_HEADER, failure.to_string()),
        );
        match self
            .broker
            .publish(&self.exchange, dead_letter.as_str(), message)
            .await
        {
            Ok(()) => {
                warn!(dead_letter = %dead_letter, attempt, "Event dead-lettered");
                self.settle(delivery, true).await;
                DispatchOutcome::DeadLettered
            }
            Err(e) => self.requeue_once(delivery, &e.to_string()).await,
        }
    }

    /// The broker refused a republish: hand the message back to the broker at
    /// most once, then give up on it.
    async fn requeue_once(&self, delivery: &Delivery, reason: &str) -> DispatchOutcome {
        let requeue = !delivery.redelivered;
        error!(error = %reason, requeue, "Failed to republish failed event");
        if let Err(e) = delivery.nack(requeue).await {
            error!(error = %e, "Failed to settle delivery");
        }
        DispatchOutcome::Dropped
    }
}

fn decode_request(routing_key: &str, delivery: &Delivery) -> Result<Request, HandlerError> {
    let payload: Value = serde_json::from_slice(&delivery.body)
        .map_err(|e| HandlerError::internal(format!("Malformed payload: {}", e)))?;

    let mut request = Request::new(routing_key, payload).with_attempt(attempt_of(delivery));
    if let Some(id) = &delivery.properties.correlation_id {
        request = request.with_correlation_id(id.clone());
    }
    if let Some(deadline) = delivery
        .properties
        .header(DEADLINE_HEADER)
        .and_then(parse_deadline)
    {
        request = request.with_deadline(deadline);
    }
    Ok(request)
}

fn attempt_of(delivery: &Delivery) -> u32 {
    delivery
        .properties
        .header(ATTEMPT_HEADER)
        .and_then(|v| v.parse().ok())
        .unwrap_or(1)
}

fn log_failure(e: &HandlerError, is_request: bool) {
    if e.is_server_fault() {
        error!(status = e.status, error = %e.message, is_request, "Handler failed");
    } else {
        warn!(status = e.status, error = %e.message, is_request, "Handler rejected message");
    }
}
