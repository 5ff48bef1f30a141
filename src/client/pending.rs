//! Caller-side bookkeeping for outstanding requests.
//!
//! Each request registers a single-resolution slot under its correlation id.
//! A slot is resolved at most once, by the first reply carrying its id, and
//! removed when the reply arrives, the call times out, or the caller gives up.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

/// Correlation id: `<token>.<sequence>`.
///
/// The sequence increases monotonically per client, so even a reused token
/// never matches an earlier, abandoned call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId {
    token: String,
    sequence: u64,
}

impl CorrelationId {
    pub fn new(token: impl Into<String>, sequence: u64) -> Self {
        Self {
            token: token.into(),
            sequence,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.token, self.sequence)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Malformed correlation id '{0}'")]
pub struct ParseCorrelationIdError(String);

impl FromStr for CorrelationId {
    type Err = ParseCorrelationIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (token, sequence) = s
            .rsplit_once('.')
            .ok_or_else(|| ParseCorrelationIdError(s.to_string()))?;
        let sequence = sequence
            .parse()
            .map_err(|_| ParseCorrelationIdError(s.to_string()))?;
        Ok(Self::new(token, sequence))
    }
}

/// One outstanding request.
#[derive(Debug)]
struct PendingCall {
    issued_at: Instant,
    timeout: Duration,
    reply: oneshot::Sender<Vec<u8>>,
}

/// Outstanding requests of one client, keyed by correlation id.
#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: Mutex<HashMap<CorrelationId, PendingCall>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn calls(&self) -> MutexGuard<'_, HashMap<CorrelationId, PendingCall>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a call; the receiver yields the raw reply body.
    pub fn register(&self, id: CorrelationId, timeout: Duration) -> oneshot::Receiver<Vec<u8>> {
        let (reply, receiver) = oneshot::channel();
        self.calls().insert(
            id,
            PendingCall {
                issued_at: Instant::now(),
                timeout,
                reply,
            },
        );
        receiver
    }

    /// Resolve a call with its reply. Returns false when no call is waiting
    /// under this id (late reply after a timeout, or a duplicate).
    pub fn resolve(&self, id: &CorrelationId, body: Vec<u8>) -> bool {
        let Some(call) = self.calls().remove(id) else {
            return false;
        };
        tracing::trace!(
            correlation_id = %id,
            elapsed_ms = call.issued_at.elapsed().as_millis() as u64,
            timeout_ms = call.timeout.as_millis() as u64,
            "Reply matched"
        );
        // The caller may have just given up; that is not an error.
        call.reply.send(body).is_ok()
    }

    /// Forget a call. Returns false if it was already resolved or removed.
    pub fn remove(&self, id: &CorrelationId) -> bool {
        self.calls().remove(id).is_some()
    }

    /// Drop every outstanding call; their callers see the reply channel close.
    pub fn close_all(&self) -> usize {
        let mut calls = self.calls();
        let count = calls.len();
        calls.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.calls().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes a pending call when the request future finishes or is dropped.
pub(crate) struct PendingGuard {
    pending: Arc<PendingCalls>,
    id: CorrelationId,
}

impl PendingGuard {
    pub(crate) fn new(pending: Arc<PendingCalls>, id: CorrelationId) -> Self {
        Self { pending, id }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(token: &str, sequence: u64) -> CorrelationId {
        CorrelationId::new(token, sequence)
    }

    #[test]
    fn test_correlation_id_round_trips_through_string() {
        let original = id("5f0c9a", 17);
        assert_eq!(original.to_string(), "5f0c9a.17");
        assert_eq!("5f0c9a.17".parse::<CorrelationId>().unwrap(), original);
        assert!("no-sequence".parse::<CorrelationId>().is_err());
        assert!("tok.abc".parse::<CorrelationId>().is_err());
    }

    #[tokio::test]
    async fn test_resolve_once() {
        let pending = PendingCalls::new();
        let receiver = pending.register(id("a", 1), Duration::from_secs(1));

        assert!(pending.resolve(&id("a", 1), b"first".to_vec()));
        assert!(!pending.resolve(&id("a", 1), b"second".to_vec()));
        assert_eq!(receiver.await.unwrap(), b"first");
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_reply_is_discarded() {
        let pending = PendingCalls::new();
        let _receiver = pending.register(id("a", 1), Duration::from_secs(1));

        assert!(!pending.resolve(&id("b", 1), b"stray".to_vec()));
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_late_reply_after_token_reuse() {
        let pending = PendingCalls::new();

        // First call with token "dup" times out and is removed
        let _abandoned = pending.register(id("dup", 1), Duration::from_millis(10));
        assert!(pending.remove(&id("dup", 1)));

        // A new call happens to reuse the token
        let mut current = pending.register(id("dup", 2), Duration::from_secs(1));

        // The late reply for the first call must not resolve the second
        assert!(!pending.resolve(&id("dup", 1), b"late".to_vec()));
        assert!(current.try_recv().is_err());

        assert!(pending.resolve(&id("dup", 2), b"mine".to_vec()));
        assert_eq!(current.await.unwrap(), b"mine");
    }

    #[tokio::test]
    async fn test_guard_removes_on_drop() {
        let pending = Arc::new(PendingCalls::new());
        let _receiver = pending.register(id("a", 1), Duration::from_secs(1));

        drop(PendingGuard::new(Arc::clone(&pending), id("a", 1)));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_close_all_wakes_callers() {
        let pending = PendingCalls::new();
        let receiver = pending.register(id("a", 1), Duration::from_secs(1));

        assert_eq!(pending.close_all(), 1);
        assert!(receiver.await.is_err());
    }
}
