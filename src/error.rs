//! Errors surfaced to code that issues RPC calls.
//!
//! Two families are kept apart so callers can tell "the call never got an
//! answer" (transport) from "the call got an answer that was a failure"
//! (application). Neither is retried automatically.

use std::time::Duration;

use crate::broker::BrokerError;
use crate::envelope::{EnvelopeError, Failure, STATUS_INTERNAL};
use crate::topology::TopologyError;

/// Result type for RPC calls.
pub type Result<T> = std::result::Result<T, RpcError>;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// No reply arrived within the timeout.
    #[error("Request '{routing_key}' timed out after {timeout:?}")]
    Timeout {
        routing_key: String,
        timeout: Duration,
    },

    /// The broker could not be reached or refused the publish.
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// The reply listener stopped before the reply arrived.
    #[error("Reply channel closed before a reply arrived")]
    ReplyChannelClosed,

    /// Request could not be encoded, or the reply value has the wrong shape.
    #[error("Codec error: {0}")]
    Codec(String),

    /// The routing key is not a valid operation name.
    #[error(transparent)]
    Topology(#[from] TopologyError),

    /// The remote handler answered with a failure.
    #[error("Remote failure {}: {}", .0.status, .0.message)]
    Remote(Failure),
}

impl RpcError {
    /// True when the call never got an answer.
    pub fn is_transport(&self) -> bool {
        !matches!(self, RpcError::Remote(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }

    /// Application status of a remote failure.
    pub fn status(&self) -> Option<u16> {
        match self {
            RpcError::Remote(failure) => Some(failure.status),
            _ => None,
        }
    }

    /// Status to report at an outer boundary: the remote status, or a generic
    /// server fault for transport errors.
    pub fn status_or_internal(&self) -> u16 {
        self.status().unwrap_or(STATUS_INTERNAL)
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            RpcError::Remote(failure) => Some(failure),
            _ => None,
        }
    }
}

/// A reply that cannot be read is a protocol fault on the responding side.
impl From<EnvelopeError> for RpcError {
    fn from(e: EnvelopeError) -> Self {
        RpcError::Remote(Failure::internal(e.to_string()))
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        RpcError::Codec(e.to_string())
    }
}
