//! Handler contract.
//!
//! A handler receives a `Request` and returns a plain value or a
//! `HandlerError`. It never builds an envelope itself: the dispatcher is the
//! single place where outcomes are turned into wire replies.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::envelope::{Failure, STATUS_INTERNAL};
use crate::error::RpcError;

/// Header carrying the caller's deadline in epoch milliseconds.
pub const DEADLINE_HEADER: &str = "x-deadline-ms";

/// Result of a handler invocation.
pub type HandlerResult = Result<Value, HandlerError>;

/// Application error raised by a handler.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{status} {message}")]
pub struct HandlerError {
    pub status: u16,
    pub message: String,
    pub detail: Option<Value>,
}

impl HandlerError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(409, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(STATUS_INTERNAL, message)
    }

    /// Whether this is a server fault rather than a caller mistake.
    pub fn is_server_fault(&self) -> bool {
        self.status >= 500
    }

    pub fn into_failure(self) -> Failure {
        Failure {
            status: self.status,
            message: self.message,
            detail: self.detail,
        }
    }
}

impl From<Failure> for HandlerError {
    fn from(failure: Failure) -> Self {
        Self {
            status: failure.status,
            message: failure.message,
            detail: failure.detail,
        }
    }
}

/// Downstream failures keep their status and message; a downstream call that
/// never got an answer becomes a generic server fault.
impl From<RpcError> for HandlerError {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::Remote(failure) => failure.into(),
            other => HandlerError::internal(other.to_string()),
        }
    }
}

/// An inbound request or event as seen by a handler.
#[derive(Debug, Clone)]
pub struct Request {
    routing_key: String,
    payload: Value,
    correlation_id: Option<String>,
    deadline: Option<DateTime<Utc>>,
    attempt: u32,
}

impl Request {
    pub fn new(routing_key: impl Into<String>, payload: Value) -> Self {
        Self {
            routing_key: routing_key.into(),
            payload,
            correlation_id: None,
            deadline: None,
            attempt: 1,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn into_payload(self) -> Value {
        self.payload
    }

    /// Correlation id of a request; `None` for fire-and-forget events.
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn is_fire_and_forget(&self) -> bool {
        self.correlation_id.is_none()
    }

    /// Delivery attempt, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    /// Time left before the caller stops waiting.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|deadline| {
            (deadline - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
        })
    }

    pub fn is_expired(&self) -> bool {
        self.remaining() == Some(Duration::ZERO)
    }

    /// Deserialize the payload into the operation's request shape.
    ///
    /// A payload of the wrong shape is a protocol error (500).
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            HandlerError::internal(format!(
                "Malformed payload for '{}': {}",
                self.routing_key, e
            ))
        })
    }
}

/// Parse the deadline header value.
pub(crate) fn parse_deadline(value: &str) -> Option<DateTime<Utc>> {
    let millis = value.parse::<i64>().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

/// Handler for one routing key.
pub trait RpcHandler: Send + Sync + 'static {
    fn handle(&self, request: Request) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> RpcHandler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, request: Request) -> BoxFuture<'static, HandlerResult> {
        Box::pin(self(request))
    }
}

/// Adapt a handler working on typed request and response shapes.
pub fn typed<Req, Resp, F, Fut>(f: F) -> impl RpcHandler
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
{
    let f = Arc::new(f);
    move |request: Request| {
        let f = Arc::clone(&f);
        async move {
            let input: Req = request.parse()?;
            let output = (*f)(input).await?;
            serde_json::to_value(output)
                .map_err(|e| HandlerError::internal(format!("Failed to encode response: {}", e)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Echo {
        value: i64,
    }

    #[derive(Serialize)]
    struct Doubled {
        value: i64,
    }

    #[tokio::test]
    async fn test_closure_is_a_handler() {
        let handler = |request: Request| async move { Ok::<_, HandlerError>(request.into_payload()) };
        let result = handler.handle(Request::new("echo", json!({"a": 1}))).await;
        assert_eq!(result, Ok(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_typed_handler() {
        let handler = typed(|req: Echo| async move { Ok::<_, HandlerError>(Doubled { value: req.value * 2 }) });
        let result = handler.handle(Request::new("echo", json!({"value": 21}))).await;
        assert_eq!(result, Ok(json!({"value": 42})));
    }

    #[tokio::test]
    async fn test_typed_handler_bad_payload_is_server_fault() {
        let handler = typed(|req: Echo| async move { Ok::<_, HandlerError>(Doubled { value: req.value }) });
        let err = handler
            .handle(Request::new("echo", json!({"value": "nope"})))
            .await
            .unwrap_err();
        assert_eq!(err.status, 500);
        assert!(err.message.contains("echo"));
    }

    #[test]
    fn test_downstream_failure_is_propagated() {
        let err: HandlerError = RpcError::Remote(Failure::new(404, "project not found")).into();
        assert_eq!(err, HandlerError::not_found("project not found"));
    }

    #[test]
    fn test_downstream_timeout_is_server_fault() {
        let err: HandlerError = RpcError::Timeout {
            routing_key: "check-project-exists".to_string(),
            timeout: Duration::from_secs(3),
        }
        .into();
        assert_eq!(err.status, 500);
        assert!(err.is_server_fault());
    }

    #[test]
    fn test_remaining_deadline() {
        let request = Request::new("echo", json!({}));
        assert_eq!(request.remaining(), None);
        assert!(!request.is_expired());

        let past = Request::new("echo", json!({}))
            .with_deadline(Utc::now() - chrono::Duration::seconds(1));
        assert_eq!(past.remaining(), Some(Duration::ZERO));
        assert!(past.is_expired());

        let future = Request::new("echo", json!({}))
            .with_deadline(Utc::now() + chrono::Duration::seconds(10));
        assert!(future.remaining().unwrap() > Duration::from_secs(9));
    }

    #[test]
    fn test_parse_deadline_header() {
        let deadline = parse_deadline("1700000000000").unwrap();
        assert_eq!(deadline.timestamp_millis(), 1_700_000_000_000);
        assert!(parse_deadline("soon").is_none());
    }
}
