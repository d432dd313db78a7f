use crate::types::{
    BroadcastSummary, DeliveryOutcome, DeliveryStatus, JobId, Payload, Recipient,
};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

/// One broadcast run. Recipients and payload are fixed at creation; outcomes
/// only grow. The cursor is the number of recorded outcomes.
pub struct BroadcastJob {
    pub(super) id: JobId,
    pub(super) recipients: Vec<Recipient>,
    pub(super) payload: Payload,
    pub(super) delay: Duration,
    started_at: String,
    outcomes: Mutex<Vec<DeliveryOutcome>>,
    cancel: watch::Sender<bool>,
    done: watch::Sender<Option<BroadcastSummary>>,
}

/// Live view of a job for the API layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub total: usize,
    pub cursor: usize,
    pub delay_seconds: u64,
    pub cancel_requested: bool,
    pub started_at: String,
    pub outcomes: Vec<DeliveryOutcome>,
}

impl BroadcastJob {
    pub(super) fn new(recipients: Vec<Recipient>, payload: Payload, delay: Duration) -> Self {
        let (cancel, _) = watch::channel(false);
        let (done, _) = watch::channel(None);
        Self {
            id: ulid::Ulid::new().to_string(),
            recipients,
            payload,
            delay,
            started_at: chrono::Utc::now().to_rfc3339(),
            outcomes: Mutex::new(Vec::new()),
            cancel,
            done,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn total(&self) -> usize {
        self.recipients.len()
    }

    /// Sticky: once requested, cancellation is never withdrawn
    pub fn cancel(&self) {
        self.cancel.send_if_modified(|requested| {
            let changed = !*requested;
            *requested = true;
            changed
        });
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once cancellation has been requested
    pub(super) async fn cancelled(&self) {
        let mut rx = self.cancel.subscribe();
        let _ = rx.wait_for(|requested| *requested).await;
    }

    pub fn cursor(&self) -> usize {
        self.lock_outcomes().len()
    }

    pub(super) fn record(
        &self,
        recipient: Recipient,
        status: DeliveryStatus,
        detail: String,
    ) -> DeliveryOutcome {
        let mut outcomes = self.lock_outcomes();
        let outcome = DeliveryOutcome {
            sequence_index: outcomes.len(),
            recipient,
            status,
            detail,
            at: chrono::Utc::now().to_rfc3339(),
        };
        outcomes.push(outcome.clone());
        outcome
    }

    pub fn summary(&self) -> BroadcastSummary {
        let outcomes = self.lock_outcomes();
        let sent = outcomes.iter().filter(|o| o.status.is_delivered()).count();
        BroadcastSummary {
            job_id: self.id.clone(),
            sent,
            failed: outcomes.len() - sent,
            total: self.recipients.len(),
            cancelled: self.is_cancelled(),
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let outcomes = self.lock_outcomes().clone();
        JobSnapshot {
            job_id: self.id.clone(),
            total: self.recipients.len(),
            cursor: outcomes.len(),
            delay_seconds: self.delay.as_secs(),
            cancel_requested: self.is_cancelled(),
            started_at: self.started_at.clone(),
            outcomes,
        }
    }

    pub(super) fn complete(&self, summary: BroadcastSummary) {
        self.done.send_replace(Some(summary));
    }

    /// Wait for the terminal summary
    pub async fn finished(&self) -> BroadcastSummary {
        let mut rx = self.done.subscribe();
        let summary = match rx.wait_for(Option::is_some).await {
            Ok(summary) => summary.clone(),
            Err(_) => None,
        };
        summary.unwrap_or_else(|| self.summary())
    }

    fn lock_outcomes(&self) -> std::sync::MutexGuard<'_, Vec<DeliveryOutcome>> {
        self.outcomes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipients::RecipientValidator;

    fn job(n: usize) -> BroadcastJob {
        let raw: Vec<String> = (0..n).map(|i| format!("551199999000{}", i)).collect();
        BroadcastJob::new(
            RecipientValidator::default().validate(&raw),
            Payload::text("hi"),
            Duration::ZERO,
        )
    }

    #[test]
    fn test_cursor_tracks_outcomes() {
        let job = job(3);
        assert_eq!(job.cursor(), 0);

        let first = job.recipients[0].clone();
        let outcome = job.record(first, DeliveryStatus::Delivered, "id-1".into());
        assert_eq!(outcome.sequence_index, 0);
        let second = job.recipients[1].clone();
        job.record(second, DeliveryStatus::Rejected, "nope".into());

        let snapshot = job.snapshot();
        assert_eq!(snapshot.cursor, 2);
        assert_eq!(snapshot.outcomes.len(), snapshot.cursor);
        assert_eq!(
            job.summary(),
            BroadcastSummary {
                job_id: job.id().to_string(),
                sent: 1,
                failed: 1,
                total: 3,
                cancelled: false,
            }
        );
    }

    #[test]
    fn test_cancel_is_idempotent_and_sticky() {
        let job = job(1);
        job.cancel();
        job.cancel();
        job.cancel();
        assert!(job.is_cancelled());
        assert!(job.summary().cancelled);
    }

    #[tokio::test]
    async fn test_cancelled_resolves_after_cancel() {
        let job = std::sync::Arc::new(job(1));
        let waiter = {
            let job = job.clone();
            tokio::spawn(async move { job.cancelled().await })
        };
        tokio::task::yield_now().await;
        job.cancel();
        waiter.await.unwrap();
    }
}
