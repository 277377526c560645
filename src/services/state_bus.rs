//! Change-notification plumbing shared by all state caches.
//!
//! One broadcast channel carries field-level diffs for every entity kind; a
//! single router task demultiplexes by kind to the owning cache's receive
//! hook. Envelopes carry no ordering guarantee relative to local writes:
//! receivers treat them as independent field overwrites, never snapshots.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::models::StateKind;

/// One state-change notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEnvelope {
    /// Entity kind the diff applies to.
    pub kind: StateKind,
    /// AU key (or account name) of the changed record.
    pub key: String,
    /// Changed fields only, field name to new value.
    pub diff: Map<String, Value>,
    /// Echo-suppression token set by the writer that caused the change.
    pub cookie: Option<String>,
}

/// Receive hook implemented by each caching engine instance.
#[async_trait]
pub trait StateDiffSink: Send + Sync {
    /// Entity kind this sink owns.
    fn kind(&self) -> StateKind;

    /// Apply an inbound diff to any cached copy of the key.
    async fn apply_remote(&self, envelope: StateEnvelope);
}

/// Broadcast-based notification channel for state diffs.
///
/// If a subscriber falls behind it receives `RecvError::Lagged`; the dropped
/// diffs are reconciled lazily on the receiver's next miss-triggered load.
pub struct StateBus {
    tx: broadcast::Sender<StateEnvelope>,
}

impl StateBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish a diff. With no subscribers the envelope is dropped silently.
    pub fn publish(&self, envelope: StateEnvelope) {
        let _ = self.tx.send(envelope);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEnvelope> {
        self.tx.subscribe()
    }
}

/// Spawn the inbound router: one receive loop dispatching each envelope to
/// the sink owning its kind. Envelopes for kinds without a registered sink
/// (sibling services' entities) are dropped at debug level.
pub fn spawn_state_router(
    bus: &StateBus,
    sinks: Vec<Arc<dyn StateDiffSink>>,
) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    match sinks.iter().find(|s| s.kind() == envelope.kind) {
                        Some(sink) => sink.apply_remote(envelope).await,
                        None => {
                            tracing::debug!(kind = ?envelope.kind, key = %envelope.key,
                                "No sink registered for state diff");
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(missed = n, "State router lagged; diffs dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
