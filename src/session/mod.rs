//! Session lifecycle state machine.
//!
//! Owns the single connection state of one messaging identity, consumes the
//! pairing channel's events and drives reconnects:
//!
//! ```text
//! Idle -> AwaitingPairing -> Authenticating -> Ready
//!              ^                  |              |
//!              |                  v              v
//!         Reconnecting <----- Disconnected <-----+
//! ```
//!
//! Every transition is published to the [`ObserverHub`]. Leaving `Ready`
//! is what cancels an active broadcast (the dispatcher listens on the hub).

mod backoff;
mod transitions;

pub use backoff::{BackoffPolicy, BackoffStrategy};
pub use transitions::{next_state, SessionEvent};

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::channel::{PairingChannel, PairingEvent, PairingEvents, SendError};
use crate::credentials::{CredentialStore, MemoryCredentialStore};
use crate::observer::{HubEvent, ObserverHub};
use crate::scheduler::{Scheduler, TokioScheduler};
use crate::types::{Payload, Recipient, SessionSnapshot, SessionState};

/// The send capability the broadcast dispatcher needs from a session.
/// Kept narrow so the dispatcher can be tested against a fake.
#[async_trait]
pub trait MessagingSession: Send + Sync {
    fn state(&self) -> SessionState;

    fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    async fn send(&self, recipient: &Recipient, payload: &Payload) -> Result<String, SendError>;
}

struct Inner {
    session: SessionSnapshot,
    /// Bumped whenever a channel attempt or retry timer is superseded;
    /// events and timers carrying an older epoch are ignored
    epoch: u64,
    pump: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

pub struct SessionMachine {
    me: Weak<SessionMachine>,
    channel: Arc<dyn PairingChannel>,
    credentials: Arc<dyn CredentialStore>,
    scheduler: Arc<dyn Scheduler>,
    hub: ObserverHub,
    backoff: BackoffPolicy,
    inner: Mutex<Inner>,
    snapshot: watch::Sender<SessionSnapshot>,
}

pub struct SessionMachineBuilder {
    channel: Arc<dyn PairingChannel>,
    hub: ObserverHub,
    credentials: Arc<dyn CredentialStore>,
    scheduler: Arc<dyn Scheduler>,
    backoff: BackoffPolicy,
}

impl SessionMachineBuilder {
    pub fn credentials(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credentials = store;
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn backoff(mut self, policy: BackoffPolicy) -> Self {
        self.backoff = policy;
        self
    }

    pub fn build(self) -> Arc<SessionMachine> {
        let (snapshot, _rx) = watch::channel(SessionSnapshot::default());
        Arc::new_cyclic(|me| SessionMachine {
            me: me.clone(),
            channel: self.channel,
            credentials: self.credentials,
            scheduler: self.scheduler,
            hub: self.hub,
            backoff: self.backoff,
            inner: Mutex::new(Inner {
                session: SessionSnapshot::default(),
                epoch: 0,
                pump: None,
                timer: None,
            }),
            snapshot,
        })
    }
}

impl SessionMachine {
    pub fn builder(channel: Arc<dyn PairingChannel>, hub: ObserverHub) -> SessionMachineBuilder {
        SessionMachineBuilder {
            channel,
            hub,
            credentials: Arc::new(MemoryCredentialStore::new()),
            scheduler: Arc::new(TokioScheduler),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn current_state(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that always holds the latest snapshot
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Start pairing. From `Disconnected`/`Reconnecting` this skips the
    /// pending retry; in any connected state it is a no-op.
    pub async fn request_connect(&self) -> SessionSnapshot {
        let mut inner = self.inner.lock().await;

        match inner.session.state {
            SessionState::Idle
            | SessionState::Disconnected { .. }
            | SessionState::Reconnecting { .. } => {}
            _ => {
                tracing::debug!(
                    "Connect requested while {}, nothing to do",
                    inner.session.state.name()
                );
                return inner.session.clone();
            }
        }

        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        self.apply(&mut inner, SessionEvent::ConnectRequested);
        self.open_channel(&mut inner).await;
        inner.session.clone()
    }

    /// Force `Idle`: stop retries, tear down the channel. An active broadcast
    /// is cancelled through the published state change.
    pub async fn request_disconnect(&self) -> SessionSnapshot {
        let mut inner = self.inner.lock().await;

        inner.epoch += 1;
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        if let Some(pump) = inner.pump.take() {
            pump.abort();
        }
        if let Err(e) = self.channel.close().await {
            tracing::warn!("Failed to close {} channel: {}", self.channel.name(), e);
        }

        inner.session.reconnect_attempt = 0;
        if !self.apply(&mut inner, SessionEvent::DisconnectRequested) {
            // Already idle; still publish the reset attempt counter
            self.publish(&inner.session);
        }
        inner.session.clone()
    }

    /// Apply an event to the state, publishing the new snapshot.
    /// Returns false (and changes nothing) if the event is not valid here.
    fn apply(&self, inner: &mut Inner, event: SessionEvent) -> bool {
        let Some(next) = next_state(&inner.session.state, &event) else {
            tracing::debug!(
                "Ignoring {:?} while {}",
                event,
                inner.session.state.name()
            );
            return false;
        };

        tracing::info!(
            "Session {} -> {}",
            inner.session.state.name(),
            next.name()
        );
        if next.is_ready() {
            inner.session.reconnect_attempt = 0;
        }
        inner.session.state = next;
        self.publish(&inner.session);
        true
    }

    fn publish(&self, session: &SessionSnapshot) {
        self.snapshot.send_replace(session.clone());
        self.hub.publish(HubEvent::StateChanged {
            state: session.clone(),
        });
    }

    async fn open_channel(&self, inner: &mut Inner) {
        inner.epoch += 1;
        let epoch = inner.epoch;

        let credentials = match self.credentials.load().await {
            Ok(credentials) => credentials,
            Err(e) => {
                tracing::warn!("Could not load stored credentials: {}", e);
                None
            }
        };
        if credentials.is_some() {
            tracing::info!("Offering stored credentials to {} channel", self.channel.name());
        }

        match self.channel.open(credentials).await {
            Ok(events) => {
                inner.pump = Some(self.spawn_pump(epoch, events));
            }
            Err(e) => {
                tracing::error!("Failed to open {} channel: {}", self.channel.name(), e);
                self.apply(inner, SessionEvent::ChannelClosed(e.to_string()));
                self.schedule_reconnect(inner);
            }
        }
    }

    fn spawn_pump(&self, epoch: u64, mut events: PairingEvents) -> JoinHandle<()> {
        let me = self.me.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(machine) = me.upgrade() else {
                    return;
                };
                machine.handle_channel_event(epoch, event).await;
            }
            if let Some(machine) = me.upgrade() {
                machine
                    .handle_channel_event(
                        epoch,
                        PairingEvent::ChannelClosed("event stream ended".to_string()),
                    )
                    .await;
            }
        })
    }

    async fn handle_channel_event(&self, epoch: u64, event: PairingEvent) {
        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch {
            tracing::debug!("Dropping stale channel event {:?}", event);
            return;
        }

        match event {
            PairingEvent::ChallengeIssued(challenge) => {
                tracing::info!("Pairing challenge issued, scan to pair: {}", challenge);
                self.apply(&mut inner, SessionEvent::ChallengeIssued(challenge));
            }
            PairingEvent::Authenticated {
                identity,
                credentials,
            } => {
                if self.apply(&mut inner, SessionEvent::Authenticated(identity)) {
                    if let Some(blob) = credentials {
                        if let Err(e) = self.credentials.save(&blob).await {
                            tracing::warn!("Could not store credentials: {}", e);
                        }
                    }
                }
            }
            PairingEvent::Ready => {
                self.apply(&mut inner, SessionEvent::Ready);
            }
            PairingEvent::AuthFailed(reason) => {
                if self.apply(&mut inner, SessionEvent::AuthFailed(reason)) {
                    // Stored credentials were refused; the next attempt pairs fresh
                    if let Err(e) = self.credentials.clear().await {
                        tracing::warn!("Could not clear credentials: {}", e);
                    }
                    self.teardown_after_failure(&mut inner).await;
                }
            }
            PairingEvent::ChannelClosed(reason) => {
                if self.apply(&mut inner, SessionEvent::ChannelClosed(reason)) {
                    self.teardown_after_failure(&mut inner).await;
                }
            }
        }
    }

    async fn teardown_after_failure(&self, inner: &mut Inner) {
        // Called from inside the pump task, so detach rather than abort it
        inner.pump = None;
        if let Err(e) = self.channel.close().await {
            tracing::warn!("Failed to close {} channel: {}", self.channel.name(), e);
        }
        self.schedule_reconnect(inner);
    }

    /// `Disconnected -> Reconnecting`, arming the retry timer
    fn schedule_reconnect(&self, inner: &mut Inner) {
        let attempt = inner.session.reconnect_attempt;
        let delay = self.backoff.delay(attempt);
        let next_attempt = attempt.saturating_add(1);
        inner.session.reconnect_attempt = next_attempt;
        inner.epoch += 1;
        let epoch = inner.epoch;

        let scheduled = self.apply(
            inner,
            SessionEvent::RetryScheduled {
                attempt: next_attempt,
                retry_in: delay,
            },
        );
        if !scheduled {
            return;
        }
        tracing::info!("Reconnect attempt {} in {:?}", next_attempt, delay);

        let me = self.me.clone();
        let scheduler = self.scheduler.clone();
        inner.timer = Some(tokio::spawn(async move {
            scheduler.after(delay).await;
            if let Some(machine) = me.upgrade() {
                machine.reconnect_due(epoch).await;
            }
        }));
    }

    async fn reconnect_due(&self, epoch: u64) {
        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch {
            return;
        }
        inner.timer = None;
        if self.apply(&mut inner, SessionEvent::TimerFired) {
            self.open_channel(&mut inner).await;
        }
    }
}

#[async_trait]
impl MessagingSession for SessionMachine {
    fn state(&self) -> SessionState {
        self.snapshot.borrow().state.clone()
    }

    async fn send(&self, recipient: &Recipient, payload: &Payload) -> Result<String, SendError> {
        if !self.is_ready() {
            return Err(SendError::NotReady);
        }
        self.channel.send(recipient, payload).await
    }
}
