use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque ID types for type safety
pub type JobId = String;

/// A canonical recipient address: digits only, country prefix included.
///
/// Only [`crate::recipients::RecipientValidator`] produces these, so any
/// `Recipient` in the system has already passed normalization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Recipient(String);

impl Recipient {
    pub(crate) fn from_digits(digits: String) -> Self {
        Self(digits)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Chat address in the form the messaging gateway expects
    pub fn chat_id(&self) -> String {
        format!("{}@c.us", self.0)
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a media attachment. The transport resolves the URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRef {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

/// What gets delivered to every recipient of a broadcast.
/// When media is present the text is sent as its caption.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaRef>,
}

impl Payload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            media: None,
        }
    }

    /// True if there is neither media nor non-whitespace text
    pub fn is_empty(&self) -> bool {
        self.media.is_none()
            && self
                .text
                .as_deref()
                .map(|t| t.trim().is_empty())
                .unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Delivered,
    Rejected,
    TransportError,
}

impl DeliveryStatus {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryStatus::Delivered)
    }
}

/// Recorded result of one delivery attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub sequence_index: usize,
    pub recipient: Recipient,
    pub status: DeliveryStatus,
    pub detail: String,
    /// RFC 3339 timestamp of when the outcome was recorded
    pub at: String,
}

/// Terminal report of a broadcast run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastSummary {
    pub job_id: JobId,
    pub sent: usize,
    pub failed: usize,
    pub total: usize,
    pub cancelled: bool,
}

/// Opaque identity of the paired account (e.g. the account's own address)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionIdentity(pub String);

/// Connection lifecycle state.
///
/// Data that only exists in some states lives inside those variants: the
/// pairing challenge only while awaiting pairing, the identity only once
/// authenticated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Idle,
    AwaitingPairing {
        challenge: Option<String>,
    },
    Authenticating {
        identity: SessionIdentity,
    },
    Ready {
        identity: SessionIdentity,
    },
    Disconnected {
        reason: String,
    },
    Reconnecting {
        attempt: u32,
        retry_in_ms: u64,
    },
}

impl SessionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, SessionState::Ready { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "IDLE",
            SessionState::AwaitingPairing { .. } => "AWAITING_PAIRING",
            SessionState::Authenticating { .. } => "AUTHENTICATING",
            SessionState::Ready { .. } => "READY",
            SessionState::Disconnected { .. } => "DISCONNECTED",
            SessionState::Reconnecting { .. } => "RECONNECTING",
        }
    }

    pub fn identity(&self) -> Option<&SessionIdentity> {
        match self {
            SessionState::Authenticating { identity } | SessionState::Ready { identity } => {
                Some(identity)
            }
            _ => None,
        }
    }

    pub fn pairing_challenge(&self) -> Option<&str> {
        match self {
            SessionState::AwaitingPairing { challenge } => challenge.as_deref(),
            _ => None,
        }
    }
}

/// Point-in-time view of the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub reconnect_attempt: u32,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            reconnect_attempt: 0,
        }
    }
}
