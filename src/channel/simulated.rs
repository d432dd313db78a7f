use super::*;
use crate::config::{env_parse, env_string};
use crate::recipients::{parse_contact_list, RecipientValidator};
use crate::scheduler::Scheduler;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Behaviour of the in-process channel
#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    /// Pair automatically this long after the challenge is issued.
    /// `None` leaves pairing to injected events.
    pub auto_pair_after: Option<Duration>,
    pub identity: String,
    /// Recipients (canonical digits) the network refuses
    pub reject: HashSet<String>,
    /// Recipients whose sends fail at the transport level
    pub fail: HashSet<String>,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            auto_pair_after: Some(Duration::from_secs(5)),
            identity: "5500000000000".to_string(),
            reject: HashSet::new(),
            fail: HashSet::new(),
        }
    }
}

impl SimulatedConfig {
    /// Pairing is driven entirely by [`SimulatedChannel::emit`]
    pub fn manual() -> Self {
        Self {
            auto_pair_after: None,
            ..Self::default()
        }
    }

    /// Load from environment variables. Scripted reject and fail lists are
    /// normalized the same way broadcast recipients are.
    pub fn from_env(validator: &RecipientValidator) -> Self {
        let defaults = Self::default();
        let pair_seconds: u64 = env_parse("SIMULATED_PAIR_SECONDS", 5);
        let numbers = |key: &str| -> HashSet<String> {
            let raw = env_string(key).map(|raw| parse_contact_list(&raw)).unwrap_or_default();
            let report = validator.validate_report(&raw);
            if report.dropped > 0 {
                tracing::warn!("Ignoring {} invalid number(s) in {}", report.dropped, key);
            }
            report
                .recipients
                .iter()
                .map(|r| r.as_str().to_string())
                .collect()
        };

        Self {
            auto_pair_after: Some(Duration::from_secs(pair_seconds)),
            identity: env_string("SIMULATED_IDENTITY").unwrap_or(defaults.identity),
            reject: numbers("SIMULATED_REJECT"),
            fail: numbers("SIMULATED_FAIL"),
        }
    }
}

/// In-process stand-in for a real transport.
///
/// Issues a fresh challenge on every `open`, or restores the session straight
/// away when credentials are offered. Sends are recorded instead of delivered.
pub struct SimulatedChannel {
    config: SimulatedConfig,
    scheduler: Arc<dyn Scheduler>,
    current: Mutex<Option<mpsc::Sender<PairingEvent>>>,
    opens: AtomicUsize,
    sent: Mutex<Vec<(Recipient, Payload)>>,
}

impl SimulatedChannel {
    pub fn new(config: SimulatedConfig, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            config,
            scheduler,
            current: Mutex::new(None),
            opens: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Push an event into the current attempt's stream.
    /// Returns false if no attempt is open.
    pub async fn emit(&self, event: PairingEvent) -> bool {
        let sender = self.lock_current().clone();
        match sender {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Number of connection attempts opened so far
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.lock_current().is_some()
    }

    /// Recipients that received a payload, in send order
    pub fn sent(&self) -> Vec<(Recipient, Payload)> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn lock_current(&self) -> std::sync::MutexGuard<'_, Option<mpsc::Sender<PairingEvent>>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn authenticated(&self) -> PairingEvent {
        PairingEvent::Authenticated {
            identity: SessionIdentity(self.config.identity.clone()),
            credentials: Some(self.config.identity.as_bytes().to_vec()),
        }
    }
}

#[async_trait]
impl PairingChannel for SimulatedChannel {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn open(&self, credentials: Option<Vec<u8>>) -> Result<PairingEvents, ChannelError> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        self.opens.fetch_add(1, Ordering::SeqCst);
        *self.lock_current() = Some(tx.clone());

        if credentials.is_some() {
            tracing::debug!("Simulated channel restoring stored session");
            let _ = tx.send(self.authenticated()).await;
            let _ = tx.send(PairingEvent::Ready).await;
            return Ok(rx);
        }

        let challenge = format!("sim-pair-{}", ulid::Ulid::new());
        let _ = tx.send(PairingEvent::ChallengeIssued(challenge)).await;

        if let Some(delay) = self.config.auto_pair_after {
            let scheduler = self.scheduler.clone();
            let authenticated = self.authenticated();
            tokio::spawn(async move {
                scheduler.after(delay).await;
                if tx.send(authenticated).await.is_ok() {
                    let _ = tx.send(PairingEvent::Ready).await;
                }
            });
        }

        Ok(rx)
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.lock_current().take();
        Ok(())
    }

    async fn send(&self, recipient: &Recipient, payload: &Payload) -> Result<String, SendError> {
        if !self.is_open() {
            return Err(SendError::Transport("channel is closed".to_string()));
        }
        if self.config.reject.contains(recipient.as_str()) {
            return Err(SendError::Rejected(format!(
                "{} is not registered on the network",
                recipient
            )));
        }
        if self.config.fail.contains(recipient.as_str()) {
            return Err(SendError::Transport("simulated network failure".to_string()));
        }

        let mut sent = self
            .sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sent.push((recipient.clone(), payload.clone()));
        Ok(format!("sim-msg-{}", sent.len()))
    }
}
