//! Result envelope: the wire form of every RPC response.
//!
//! A response is either a success value or a structured failure. Failures are
//! marked by the reserved top-level key `$rpc_error`, which no business payload
//! may claim: a success value that happens to use a reserved key is escaped as
//! `{"$rpc_ok": value}` on the way out, so decoding can never mistake it for a
//! failure.
//!
//! ```text
//! success  {"id": 7, "title": "..."}            -> Success({"id": 7, ...})
//! escaped  {"$rpc_ok": {"$rpc_error": "x"}}     -> Success({"$rpc_error": "x"})
//! failure  {"$rpc_error": {"status": 404, "message": "not found"}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved key marking a failure envelope.
pub const ERROR_KEY: &str = "$rpc_error";
/// Reserved key wrapping a success value that collides with a reserved key.
pub const OK_KEY: &str = "$rpc_ok";

/// Generic server-fault status for unexpected and protocol errors.
pub const STATUS_INTERNAL: u16 = 500;

/// Structured failure carried across the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    /// HTTP-style status (404 not found, 400 invalid, 500 server fault).
    pub status: u16,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl Failure {
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

    /// Generic server fault.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(STATUS_INTERNAL, message)
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.status, self.message)
    }
}

/// Errors decoding an envelope.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Response is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Malformed failure envelope: {0}")]
    MalformedFailure(String),
}

/// Success value or structured failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Success(Value),
    Failure(Failure),
}

impl Envelope {
    /// Serialize for the wire.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        let value = match self {
            Envelope::Success(value) if collides(value) => {
                let mut wrapper = Map::new();
                wrapper.insert(OK_KEY.to_string(), value.clone());
                Value::Object(wrapper)
            }
            Envelope::Success(value) => value.clone(),
            Envelope::Failure(failure) => {
                let mut wrapper = Map::new();
                wrapper.insert(ERROR_KEY.to_string(), failure_value(failure));
                Value::Object(wrapper)
            }
        };
        serde_json::to_vec(&value)
    }

    /// Parse a response body.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_slice(bytes)?;

        let Value::Object(mut map) = value else {
            return Ok(Envelope::Success(value));
        };

        if let Some(error) = map.remove(ERROR_KEY) {
            let failure: Failure = serde_json::from_value(error)
                .map_err(|e| EnvelopeError::MalformedFailure(e.to_string()))?;
            return Ok(Envelope::Failure(failure));
        }

        if map.len() == 1 {
            if let Some(inner) = map.remove(OK_KEY) {
                return Ok(Envelope::Success(inner));
            }
        }

        Ok(Envelope::Success(Value::Object(map)))
    }

    /// Return the success value, or the failure as an error.
    pub fn into_result(self) -> Result<Value, Failure> {
        match self {
            Envelope::Success(value) => Ok(value),
            Envelope::Failure(failure) => Err(failure),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Envelope::Failure(_))
    }
}

impl From<Result<Value, Failure>> for Envelope {
    fn from(result: Result<Value, Failure>) -> Self {
        match result {
            Ok(value) => Envelope::Success(value),
            Err(failure) => Envelope::Failure(failure),
        }
    }
}

fn collides(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|map| map.contains_key(ERROR_KEY) || map.contains_key(OK_KEY))
}

fn failure_value(failure: &Failure) -> Value {
    let mut map = Map::new();
    map.insert("status".to_string(), Value::from(failure.status));
    map.insert("message".to_string(), Value::from(failure.message.clone()));
    if let Some(detail) = &failure.detail {
        map.insert("detail".to_string(), detail.clone());
    }
    Value::Object(map)
}
