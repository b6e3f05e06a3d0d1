//! Error taxonomy for delivery processing.
//!
//! The queue harness recovers differently per kind: `Endpoint` and
//! `RateLimited` carry their own re-enqueue delay, `Repository` is
//! redelivered for at-least-once semantics, `NonRetryable` is dropped.

use std::time::Duration;

use thiserror::Error;

/// Failure surfaced by a repository facade.
#[derive(Debug, Clone, Error)]
pub enum RepoError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("storage error: {0}")]
    Storage(String),
}

impl RepoError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        RepoError::NotFound {
            entity,
            id: id.into(),
        }
    }
}

/// Failure of one delivery-worker invocation.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The attempt executed and failed; one attempt record was written.
    /// The queue must redeliver after `delay`.
    #[error("delivery attempt failed: {reason}")]
    Endpoint { reason: String, delay: Duration },

    /// The endpoint's rate-limit window is exhausted. No attempt was
    /// recorded; the queue must redeliver after `reset`.
    #[error("rate limited, retry after {reset:?}")]
    RateLimited { reset: Duration },

    /// The delivery can never succeed (orphaned references, malformed
    /// task payload). Logged and dropped.
    #[error("non-retryable: {0}")]
    NonRetryable(String),

    /// Infrastructure failure on the read or write path. Redelivered
    /// so visible effects stay at-least-once.
    #[error("repository error: {0}")]
    Repository(#[from] RepoError),
}

/// Failure raised by the streaming hub or a client session.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Repository(#[from] RepoError),

    #[error("hub is closed")]
    HubClosed,
}

