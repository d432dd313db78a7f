//! Event fan-out to interested listeners.
//!
//! The hub is the boundary between the core (session, dispatcher) and the
//! UI/transport layers. Delivery is synchronous and in subscription order; a
//! failing or panicking observer is logged and skipped.

use crate::types::{BroadcastSummary, DeliveryStatus, JobId, Recipient, SessionSnapshot};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum HubEvent {
    StateChanged {
        state: SessionSnapshot,
    },
    BroadcastProgress {
        job_id: JobId,
        sequence_index: usize,
        recipient: Recipient,
        status: DeliveryStatus,
        detail: String,
    },
    BroadcastComplete {
        summary: BroadcastSummary,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ObserverError {
    #[error("Observer failed: {0}")]
    Failed(String),

    #[error("Observer channel closed")]
    Closed,
}

pub trait Observer: Send + Sync {
    fn on_event(&self, event: &HubEvent) -> Result<(), ObserverError>;
}

impl<F> Observer for F
where
    F: Fn(&HubEvent) -> Result<(), ObserverError> + Send + Sync,
{
    fn on_event(&self, event: &HubEvent) -> Result<(), ObserverError> {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct HubInner {
    next_id: AtomicU64,
    observers: Mutex<Vec<(SubscriptionId, Arc<dyn Observer>)>>,
}

/// Cloneable handle; clones share the same subscriber list
#[derive(Clone)]
pub struct ObserverHub {
    inner: Arc<HubInner>,
}

impl ObserverHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                next_id: AtomicU64::new(1),
                observers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn Observer>) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers().push((id, observer));
        id
    }

    /// Returns false if the subscription was already gone
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers();
        let before = observers.len();
        observers.retain(|(sid, _)| *sid != id);
        observers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.observers().len()
    }

    pub fn publish(&self, event: HubEvent) {
        // Snapshot so observers may (un)subscribe from inside a callback
        let observers: Vec<_> = self.observers().iter().cloned().collect();

        for (id, observer) in observers {
            match catch_unwind(AssertUnwindSafe(|| observer.on_event(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!("Observer {:?} failed: {}", id, e);
                }
                Err(_) => {
                    tracing::error!("Observer {:?} panicked while handling event", id);
                }
            }
        }
    }

    fn observers(&self) -> std::sync::MutexGuard<'_, Vec<(SubscriptionId, Arc<dyn Observer>)>> {
        self.inner
            .observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for ObserverHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Forwards hub events into a tokio broadcast channel (one receiver per
/// WebSocket client). No receivers connected is fine.
pub struct ChannelBridge {
    tx: broadcast::Sender<HubEvent>,
}

impl ChannelBridge {
    pub fn new(tx: broadcast::Sender<HubEvent>) -> Self {
        Self { tx }
    }
}

impl Observer for ChannelBridge {
    fn on_event(&self, event: &HubEvent) -> Result<(), ObserverError> {
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}
