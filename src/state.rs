use crate::broadcast::{BroadcastDispatcher, BroadcastError, DispatcherConfig, JobSnapshot};
use crate::channel::PairingChannel;
use crate::config::ServerConfig;
use crate::credentials::CredentialStore;
use crate::observer::{ChannelBridge, HubEvent, ObserverHub};
use crate::protocol::BroadcastRequest;
use crate::recipients::{parse_contact_list, RecipientPolicy, RecipientValidator, ValidationError};
use crate::scheduler::Scheduler;
use crate::session::{BackoffPolicy, SessionMachine};
use crate::types::{BroadcastSummary, JobId, SessionSnapshot};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Capacity of the WebSocket fan-out channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Tunables for the session, the validator and the dispatcher
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub recipients: RecipientPolicy,
    pub backoff: BackoffPolicy,
    pub dispatcher: DispatcherConfig,
    /// Pause between sends when a request does not specify one
    pub default_delay: Duration,
}

impl Settings {
    pub fn from_env(server: &ServerConfig) -> Self {
        Self {
            recipients: RecipientPolicy::from_env(),
            backoff: BackoffPolicy::from_env(),
            dispatcher: DispatcherConfig::from_env(),
            default_delay: Duration::from_secs(server.default_delay_seconds),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BroadcastAccepted {
    pub job_id: JobId,
    pub total: usize,
    pub dropped: usize,
}

/// Live job if one is running, plus the last finished job's summary
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastStatus {
    pub active_job: Option<JobSnapshot>,
    pub last_summary: Option<BroadcastSummary>,
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub session: Arc<SessionMachine>,
    pub dispatcher: Arc<BroadcastDispatcher>,
    pub hub: ObserverHub,
    /// Hub events fanned out to WebSocket clients
    pub events: broadcast::Sender<HubEvent>,
    pub validator: RecipientValidator,
    pub default_delay: Duration,
}

impl AppState {
    pub fn new(
        channel: Arc<dyn PairingChannel>,
        credentials: Arc<dyn CredentialStore>,
        scheduler: Arc<dyn Scheduler>,
        settings: Settings,
    ) -> Self {
        let hub = ObserverHub::new();
        let (events, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        hub.subscribe(Arc::new(ChannelBridge::new(events.clone())));

        let session = SessionMachine::builder(channel, hub.clone())
            .credentials(credentials)
            .scheduler(scheduler.clone())
            .backoff(settings.backoff)
            .build();
        let dispatcher = BroadcastDispatcher::new(
            session.clone(),
            hub.clone(),
            scheduler,
            settings.dispatcher,
        );

        Self {
            session,
            dispatcher: Arc::new(dispatcher),
            hub,
            events,
            validator: RecipientValidator::new(settings.recipients),
            default_delay: settings.default_delay,
        }
    }

    pub fn session_state(&self) -> SessionSnapshot {
        self.session.current_state()
    }

    pub async fn connect(&self) -> SessionSnapshot {
        self.session.request_connect().await
    }

    pub async fn disconnect(&self) -> SessionSnapshot {
        self.session.request_disconnect().await
    }

    /// Normalize the request's recipients and start a broadcast
    pub fn start_broadcast(
        &self,
        request: &BroadcastRequest,
    ) -> Result<BroadcastAccepted, BroadcastError> {
        let mut raw = request.recipients.clone();
        if let Some(text) = &request.contacts_text {
            raw.extend(parse_contact_list(text));
        }

        let report = self.validator.validate_report(&raw);
        if report.recipients.is_empty() {
            return Err(ValidationError::NoRecipients.into());
        }

        let delay = request
            .delay_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.default_delay);
        let handle = self
            .dispatcher
            .start_broadcast(report.recipients, request.payload(), delay)?;

        Ok(BroadcastAccepted {
            job_id: handle.id().to_string(),
            total: handle.total(),
            dropped: report.dropped,
        })
    }

    pub fn cancel_broadcast(&self) -> bool {
        self.dispatcher.cancel_broadcast()
    }

    pub fn broadcast_status(&self) -> BroadcastStatus {
        BroadcastStatus {
            active_job: self.dispatcher.active_job(),
            last_summary: self.dispatcher.last_summary(),
        }
    }
}
