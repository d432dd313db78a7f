//! Sequential broadcast dispatcher.
//!
//! Delivers one payload to an ordered recipient list, strictly one send at a
//! time with a pause between sends. The network penalizes bursts of automated
//! messages, so the pacing is mandatory. At most one job runs per dispatcher.

mod job;

pub use job::{BroadcastJob, JobSnapshot};

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::channel::SendError;
use crate::config::{env_flag, env_parse};
use crate::observer::{HubEvent, Observer, ObserverError, ObserverHub};
use crate::recipients::ValidationError;
use crate::scheduler::Scheduler;
use crate::session::MessagingSession;
use crate::types::{BroadcastSummary, DeliveryStatus, JobId, Payload, Recipient};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BroadcastError {
    #[error("A broadcast is already running (job {job_id})")]
    AlreadyRunning { job_id: JobId },

    #[error("Session is not ready (currently {state})")]
    NotReady { state: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl BroadcastError {
    /// Stable code for API clients
    pub fn code(&self) -> &'static str {
        match self {
            BroadcastError::AlreadyRunning { .. } => "ALREADY_RUNNING",
            BroadcastError::NotReady { .. } => "SESSION_NOT_READY",
            BroadcastError::Validation(_) => "VALIDATION_FAILED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Whether a payload with neither text nor media may be sent
    pub allow_empty_payload: bool,
    pub max_recipients: usize,
    pub max_delay: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            allow_empty_payload: false,
            max_recipients: 5000,
            max_delay: Duration::from_secs(300),
        }
    }
}

impl DispatcherConfig {
    /// Load config from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            allow_empty_payload: env_flag("ALLOW_EMPTY_MESSAGE", defaults.allow_empty_payload),
            max_recipients: env_parse("BROADCAST_MAX_RECIPIENTS", defaults.max_recipients),
            max_delay: Duration::from_secs(env_parse(
                "BROADCAST_MAX_DELAY_SECONDS",
                defaults.max_delay.as_secs(),
            )),
        }
    }
}

/// Active-job slot shared between the dispatcher, its delivery loop and the
/// session guard
#[derive(Default)]
struct JobSlot {
    active: Mutex<Option<Arc<BroadcastJob>>>,
    last_summary: Mutex<Option<BroadcastSummary>>,
}

impl JobSlot {
    fn active(&self) -> std::sync::MutexGuard<'_, Option<Arc<BroadcastJob>>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn last_summary(&self) -> std::sync::MutexGuard<'_, Option<BroadcastSummary>> {
        self.last_summary
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn finish(&self, job: &BroadcastJob, summary: &BroadcastSummary) {
        let mut active = self.active();
        if active.as_ref().map(|j| j.id() == job.id()).unwrap_or(false) {
            *active = None;
        }
        *self.last_summary() = Some(summary.clone());
    }
}

/// Cancels the active job as soon as the session leaves `Ready`
struct SessionGuard {
    slot: Weak<JobSlot>,
}

impl Observer for SessionGuard {
    fn on_event(&self, event: &HubEvent) -> Result<(), ObserverError> {
        let HubEvent::StateChanged { state } = event else {
            return Ok(());
        };
        if state.state.is_ready() {
            return Ok(());
        }
        let Some(slot) = self.slot.upgrade() else {
            return Err(ObserverError::Closed);
        };
        if let Some(job) = slot.active().as_ref() {
            if !job.is_cancelled() {
                tracing::warn!(
                    "Session is {}, cancelling broadcast {}",
                    state.state.name(),
                    job.id()
                );
                job.cancel();
            }
        }
        Ok(())
    }
}

/// Handle to a started broadcast
#[derive(Clone)]
pub struct BroadcastHandle {
    job: Arc<BroadcastJob>,
}

impl BroadcastHandle {
    pub fn id(&self) -> &str {
        self.job.id()
    }

    pub fn total(&self) -> usize {
        self.job.total()
    }

    /// Stop after the in-flight send; idempotent
    pub fn cancel(&self) {
        self.job.cancel();
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.job.snapshot()
    }

    pub async fn wait(&self) -> BroadcastSummary {
        self.job.finished().await
    }
}

pub struct BroadcastDispatcher {
    session: Arc<dyn MessagingSession>,
    hub: ObserverHub,
    scheduler: Arc<dyn Scheduler>,
    config: DispatcherConfig,
    slot: Arc<JobSlot>,
}

impl BroadcastDispatcher {
    pub fn new(
        session: Arc<dyn MessagingSession>,
        hub: ObserverHub,
        scheduler: Arc<dyn Scheduler>,
        config: DispatcherConfig,
    ) -> Self {
        let slot = Arc::new(JobSlot::default());
        hub.subscribe(Arc::new(SessionGuard {
            slot: Arc::downgrade(&slot),
        }));

        Self {
            session,
            hub,
            scheduler,
            config,
            slot,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Start delivering `payload` to `recipients`, pausing `delay` between
    /// sends. Fails fast if a job is active or the session is not ready.
    pub fn start_broadcast(
        &self,
        recipients: Vec<Recipient>,
        payload: Payload,
        delay: Duration,
    ) -> Result<BroadcastHandle, BroadcastError> {
        if !self.config.allow_empty_payload && payload.is_empty() {
            return Err(ValidationError::EmptyPayload.into());
        }
        if recipients.len() > self.config.max_recipients {
            return Err(ValidationError::TooManyRecipients {
                count: recipients.len(),
                max: self.config.max_recipients,
            }
            .into());
        }
        if delay > self.config.max_delay {
            return Err(ValidationError::DelayTooLong {
                requested: delay.as_secs(),
                max: self.config.max_delay.as_secs(),
            }
            .into());
        }

        let job = {
            let mut active = self.slot.active();
            if let Some(job) = active.as_ref() {
                return Err(BroadcastError::AlreadyRunning {
                    job_id: job.id().to_string(),
                });
            }
            let state = self.session.state();
            if !state.is_ready() {
                return Err(BroadcastError::NotReady {
                    state: state.name().to_string(),
                });
            }

            let job = Arc::new(BroadcastJob::new(recipients, payload, delay));
            *active = Some(job.clone());
            job
        };

        tracing::info!(
            "Broadcast {} started: {} recipient(s), {:?} between sends",
            job.id(),
            job.total(),
            delay
        );

        tokio::spawn(run_job(
            job.clone(),
            self.session.clone(),
            self.hub.clone(),
            self.scheduler.clone(),
            self.slot.clone(),
        ));

        Ok(BroadcastHandle { job })
    }

    /// Request cancellation of the active job. Returns false if none is running.
    pub fn cancel_broadcast(&self) -> bool {
        match self.slot.active().as_ref() {
            Some(job) => {
                tracing::info!("Cancellation requested for broadcast {}", job.id());
                job.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.slot.active().is_some()
    }

    pub fn active_job(&self) -> Option<JobSnapshot> {
        let job = self.slot.active().clone();
        job.map(|job| job.snapshot())
    }

    pub fn last_summary(&self) -> Option<BroadcastSummary> {
        self.slot.last_summary().clone()
    }
}

fn classify(result: Result<String, SendError>) -> (DeliveryStatus, String) {
    match result {
        Ok(message_id) => (DeliveryStatus::Delivered, message_id),
        Err(SendError::Rejected(detail)) => (DeliveryStatus::Rejected, detail),
        Err(e @ (SendError::Transport(_) | SendError::NotReady)) => {
            (DeliveryStatus::TransportError, e.to_string())
        }
    }
}

/// The delivery loop. Cancellation and session readiness are checked at the
/// top of every iteration and again before each pause.
async fn run_job(
    job: Arc<BroadcastJob>,
    session: Arc<dyn MessagingSession>,
    hub: ObserverHub,
    scheduler: Arc<dyn Scheduler>,
    slot: Arc<JobSlot>,
) {
    let total = job.total();

    for (index, recipient) in job.recipients.iter().enumerate() {
        if job.is_cancelled() {
            break;
        }
        if !session.is_ready() {
            tracing::warn!("Session left READY during broadcast {}", job.id());
            job.cancel();
            break;
        }

        let (status, detail) = classify(session.send(recipient, &job.payload).await);
        let outcome = job.record(recipient.clone(), status, detail);
        tracing::debug!(
            "Broadcast {} [{}/{}] {} -> {:?}",
            job.id(),
            index + 1,
            total,
            recipient,
            outcome.status
        );
        hub.publish(HubEvent::BroadcastProgress {
            job_id: job.id.clone(),
            sequence_index: outcome.sequence_index,
            recipient: outcome.recipient,
            status: outcome.status,
            detail: outcome.detail,
        });

        if index + 1 == total || job.is_cancelled() {
            break;
        }
        if !job.delay.is_zero() {
            tokio::select! {
                _ = scheduler.after(job.delay) => {}
                _ = job.cancelled() => {}
            }
        }
    }

    let summary = job.summary();
    slot.finish(&job, &summary);
    job.complete(summary.clone());

    tracing::info!(
        "Broadcast {} finished: {} sent, {} failed, {} total{}",
        summary.job_id,
        summary.sent,
        summary.failed,
        summary.total,
        if summary.cancelled { " (cancelled)" } else { "" }
    );
    hub.publish(HubEvent::BroadcastComplete { summary });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipients::RecipientValidator;
    use crate::scheduler::ManualScheduler;
    use crate::types::{SessionIdentity, SessionSnapshot, SessionState};
    use async_trait::async_trait;
    use serial_test::serial;
    use std::collections::HashMap;
    use tokio::sync::Semaphore;

    /// Session double: ready unless told otherwise, with scripted failures
    /// and an optional gate that holds every send until a permit is added
    struct FakeSession {
        ready: Mutex<bool>,
        failures: HashMap<String, SendError>,
        sent: Mutex<Vec<String>>,
        gate: Option<Semaphore>,
    }

    impl FakeSession {
        fn ready() -> Self {
            Self {
                ready: Mutex::new(true),
                failures: HashMap::new(),
                sent: Mutex::new(Vec::new()),
                gate: None,
            }
        }

        fn gated() -> Self {
            Self {
                gate: Some(Semaphore::new(0)),
                ..Self::ready()
            }
        }

        fn set_ready(&self, ready: bool) {
            *self.ready.lock().unwrap() = ready;
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessagingSession for FakeSession {
        fn state(&self) -> SessionState {
            if *self.ready.lock().unwrap() {
                SessionState::Ready {
                    identity: SessionIdentity("me".to_string()),
                }
            } else {
                SessionState::AwaitingPairing { challenge: None }
            }
        }

        async fn send(&self, recipient: &Recipient, _: &Payload) -> Result<String, SendError> {
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            self.sent.lock().unwrap().push(recipient.to_string());
            match self.failures.get(recipient.as_str()) {
                Some(err) => Err(err.clone()),
                None => Ok(format!("msg-{}", recipient)),
            }
        }
    }

    fn recipients(raw: &[&str]) -> Vec<Recipient> {
        RecipientValidator::default().validate(raw)
    }

    fn numbers(n: usize) -> Vec<Recipient> {
        let raw: Vec<String> = (0..n).map(|i| format!("551199999000{}", i)).collect();
        RecipientValidator::default().validate(&raw)
    }

    fn collect_events(hub: &ObserverHub) -> Arc<Mutex<Vec<HubEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        hub.subscribe(Arc::new(move |event: &HubEvent| -> Result<(), ObserverError> {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        }));
        events
    }

    fn dispatcher(
        session: Arc<FakeSession>,
        scheduler: Arc<ManualScheduler>,
    ) -> (BroadcastDispatcher, ObserverHub) {
        let hub = ObserverHub::new();
        let dispatcher =
            BroadcastDispatcher::new(session, hub.clone(), scheduler, DispatcherConfig::default());
        (dispatcher, hub)
    }

    #[tokio::test]
    async fn test_two_recipients_delivered_in_order() {
        let session = Arc::new(FakeSession::ready());
        let (dispatcher, hub) = dispatcher(session.clone(), Arc::new(ManualScheduler::immediate()));
        let events = collect_events(&hub);

        let handle = dispatcher
            .start_broadcast(
                recipients(&["5511999990000", "5511999990001"]),
                Payload::text("Olá"),
                Duration::ZERO,
            )
            .unwrap();
        let summary = handle.wait().await;

        assert_eq!(summary.sent, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.total, 2);
        assert!(!summary.cancelled);
        assert_eq!(session.sent(), vec!["5511999990000", "5511999990001"]);

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.cursor, 2);
        let indices: Vec<_> = snapshot.outcomes.iter().map(|o| o.sequence_index).collect();
        assert_eq!(indices, vec![0, 1]);

        // progress, progress, complete
        let events = events.lock().unwrap().clone();
        assert_eq!(events.len(), 3);
        assert!(matches!(
            &events[0],
            HubEvent::BroadcastProgress { sequence_index: 0, recipient, .. }
                if recipient.as_str() == "5511999990000"
        ));
        assert!(matches!(
            &events[2],
            HubEvent::BroadcastComplete { summary: s } if *s == summary
        ));
        assert!(!dispatcher.is_active());
        assert_eq!(dispatcher.last_summary(), Some(summary));
    }

    #[tokio::test]
    async fn test_delay_between_sends_but_not_after_last() {
        let session = Arc::new(FakeSession::ready());
        let scheduler = Arc::new(ManualScheduler::immediate());
        let (dispatcher, _hub) = dispatcher(session, scheduler.clone());

        let handle = dispatcher
            .start_broadcast(numbers(3), Payload::text("hi"), Duration::from_secs(4))
            .unwrap();
        handle.wait().await;

        assert_eq!(scheduler.requested(), vec![Duration::from_secs(4); 2]);
    }

    #[tokio::test]
    async fn test_failures_are_recorded_and_loop_continues() {
        let mut session = FakeSession::ready();
        session.failures.insert(
            "5511999990000".to_string(),
            SendError::Rejected("not on network".to_string()),
        );
        session.failures.insert(
            "5511999990001".to_string(),
            SendError::Transport("timeout".to_string()),
        );
        let session = Arc::new(session);
        let (dispatcher, _hub) = dispatcher(session.clone(), Arc::new(ManualScheduler::immediate()));

        let handle = dispatcher
            .start_broadcast(numbers(3), Payload::text("hi"), Duration::ZERO)
            .unwrap();
        let summary = handle.wait().await;

        assert_eq!((summary.sent, summary.failed, summary.total), (1, 2, 3));
        let statuses: Vec<_> = handle.snapshot().outcomes.iter().map(|o| o.status).collect();
        assert_eq!(
            statuses,
            vec![
                DeliveryStatus::Rejected,
                DeliveryStatus::TransportError,
                DeliveryStatus::Delivered
            ]
        );
    }

    #[tokio::test]
    async fn test_second_start_fails_while_running() {
        let session = Arc::new(FakeSession::gated());
        let (dispatcher, _hub) = dispatcher(session.clone(), Arc::new(ManualScheduler::immediate()));

        let first = dispatcher
            .start_broadcast(numbers(2), Payload::text("one"), Duration::ZERO)
            .unwrap();
        let second = dispatcher.start_broadcast(numbers(1), Payload::text("two"), Duration::ZERO);
        assert_eq!(
            second.err(),
            Some(BroadcastError::AlreadyRunning {
                job_id: first.id().to_string()
            })
        );

        session.gate.as_ref().unwrap().add_permits(2);
        let summary = first.wait().await;
        assert_eq!((summary.sent, summary.total), (2, 2));
        assert_eq!(session.sent().len(), 2);

        // Slot is free again
        assert!(dispatcher
            .start_broadcast(numbers(1), Payload::text("three"), Duration::ZERO)
            .is_ok());
    }

    #[tokio::test]
    async fn test_not_ready_creates_no_job() {
        let session = Arc::new(FakeSession::ready());
        session.set_ready(false);
        let (dispatcher, _hub) = dispatcher(session, Arc::new(ManualScheduler::immediate()));

        let result = dispatcher.start_broadcast(numbers(1), Payload::text("hi"), Duration::ZERO);
        assert_eq!(
            result.err(),
            Some(BroadcastError::NotReady {
                state: "AWAITING_PAIRING".to_string()
            })
        );
        assert!(!dispatcher.is_active());
        assert!(dispatcher.active_job().is_none());
    }

    #[tokio::test]
    async fn test_cancel_after_second_outcome() {
        let session = Arc::new(FakeSession::ready());
        let (dispatcher, hub) = dispatcher(session.clone(), Arc::new(ManualScheduler::immediate()));

        let handle = dispatcher
            .start_broadcast(numbers(5), Payload::text("hi"), Duration::from_secs(1))
            .unwrap();
        {
            let handle = handle.clone();
            hub.subscribe(Arc::new(move |event: &HubEvent| -> Result<(), ObserverError> {
                if let HubEvent::BroadcastProgress { sequence_index: 1, .. } = event {
                    handle.cancel();
                    handle.cancel();
                }
                Ok(())
            }));
        }

        let summary = handle.wait().await;
        assert_eq!(summary.total, 5);
        assert_eq!(summary.sent + summary.failed, 2);
        assert!(summary.cancelled);
        assert_eq!(session.sent().len(), 2);
        assert_eq!(handle.snapshot().cursor, 2);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_pending_delay() {
        let session = Arc::new(FakeSession::ready());
        let scheduler = Arc::new(ManualScheduler::new());
        let (dispatcher, _hub) = dispatcher(session.clone(), scheduler.clone());

        let handle = dispatcher
            .start_broadcast(numbers(3), Payload::text("hi"), Duration::from_secs(60))
            .unwrap();
        while scheduler.parked() == 0 {
            tokio::task::yield_now().await;
        }

        assert!(dispatcher.cancel_broadcast());
        let summary = handle.wait().await;
        assert!(summary.cancelled);
        assert_eq!(summary.sent, 1);
        assert_eq!(session.sent().len(), 1);
        assert!(!dispatcher.cancel_broadcast());
    }

    #[tokio::test]
    async fn test_session_leaving_ready_cancels_job() {
        let session = Arc::new(FakeSession::ready());
        let scheduler = Arc::new(ManualScheduler::new());
        let (dispatcher, hub) = dispatcher(session.clone(), scheduler.clone());

        let handle = dispatcher
            .start_broadcast(numbers(4), Payload::text("hi"), Duration::from_secs(5))
            .unwrap();
        while scheduler.parked() == 0 {
            tokio::task::yield_now().await;
        }

        session.set_ready(false);
        hub.publish(HubEvent::StateChanged {
            state: SessionSnapshot {
                state: SessionState::Disconnected {
                    reason: "phone offline".to_string(),
                },
                reconnect_attempt: 0,
            },
        });

        let summary = handle.wait().await;
        assert!(summary.cancelled);
        assert!(summary.sent + summary.failed <= summary.total);
        assert_eq!(summary.sent, 1);
    }

    #[tokio::test]
    async fn test_empty_recipient_list_completes_immediately() {
        let session = Arc::new(FakeSession::ready());
        let (dispatcher, _hub) = dispatcher(session, Arc::new(ManualScheduler::immediate()));

        let handle = dispatcher
            .start_broadcast(Vec::new(), Payload::text("hi"), Duration::from_secs(3))
            .unwrap();
        let summary = handle.wait().await;
        assert_eq!((summary.sent, summary.failed, summary.total), (0, 0, 0));
        assert!(!summary.cancelled);
    }

    #[tokio::test]
    async fn test_duplicates_are_sent_each_time() {
        let session = Arc::new(FakeSession::ready());
        let (dispatcher, _hub) = dispatcher(session.clone(), Arc::new(ManualScheduler::immediate()));

        let handle = dispatcher
            .start_broadcast(
                recipients(&["5511999990000", "5511999990000"]),
                Payload::text("hi"),
                Duration::ZERO,
            )
            .unwrap();
        let summary = handle.wait().await;
        assert_eq!(summary.sent, 2);
        assert_eq!(session.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_payload_and_limits_validation() {
        let session = Arc::new(FakeSession::ready());
        let hub = ObserverHub::new();
        let dispatcher = BroadcastDispatcher::new(
            session,
            hub,
            Arc::new(ManualScheduler::immediate()),
            DispatcherConfig {
                allow_empty_payload: false,
                max_recipients: 2,
                max_delay: Duration::from_secs(10),
            },
        );

        assert_eq!(
            dispatcher
                .start_broadcast(numbers(1), Payload::text("  "), Duration::ZERO)
                .err(),
            Some(BroadcastError::Validation(ValidationError::EmptyPayload))
        );
        assert!(matches!(
            dispatcher
                .start_broadcast(numbers(3), Payload::text("hi"), Duration::ZERO)
                .err(),
            Some(BroadcastError::Validation(ValidationError::TooManyRecipients { count: 3, max: 2 }))
        ));
        assert!(matches!(
            dispatcher
                .start_broadcast(numbers(1), Payload::text("hi"), Duration::from_secs(11))
                .err(),
            Some(BroadcastError::Validation(ValidationError::DelayTooLong { .. }))
        ));
    }

    #[tokio::test]
    async fn test_empty_payload_allowed_when_configured() {
        let session = Arc::new(FakeSession::ready());
        let dispatcher = BroadcastDispatcher::new(
            session,
            ObserverHub::new(),
            Arc::new(ManualScheduler::immediate()),
            DispatcherConfig {
                allow_empty_payload: true,
                ..DispatcherConfig::default()
            },
        );
        let handle = dispatcher
            .start_broadcast(numbers(1), Payload::default(), Duration::ZERO)
            .unwrap();
        assert_eq!(handle.wait().await.sent, 1);
    }

    #[test]
    #[serial]
    fn test_config_from_env() {
        let keys = [
            "ALLOW_EMPTY_MESSAGE",
            "BROADCAST_MAX_RECIPIENTS",
            "BROADCAST_MAX_DELAY_SECONDS",
        ];
        for key in keys {
            std::env::remove_var(key);
        }
        let defaults = DispatcherConfig::from_env();
        assert!(!defaults.allow_empty_payload);
        assert_eq!(defaults.max_recipients, 5000);
        assert_eq!(defaults.max_delay, Duration::from_secs(300));

        std::env::set_var("ALLOW_EMPTY_MESSAGE", "true");
        std::env::set_var("BROADCAST_MAX_RECIPIENTS", "50");
        std::env::set_var("BROADCAST_MAX_DELAY_SECONDS", "soon");
        let config = DispatcherConfig::from_env();
        assert!(config.allow_empty_payload);
        assert_eq!(config.max_recipients, 50);
        assert_eq!(config.max_delay, Duration::from_secs(300));

        for key in keys {
            std::env::remove_var(key);
        }
    }
}
