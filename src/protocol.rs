use crate::broadcast::JobSnapshot;
use crate::types::*;
use serde::{Deserialize, Serialize};

/// Version announced in the welcome message
pub const PROTOCOL_VERSION: &str = "1.0";

/// Broadcast request as accepted over REST and WebSocket.
///
/// Recipients come from `recipients`, `contacts_text` (a pasted or uploaded
/// contact list), or both. `delay_seconds` falls back to the server default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BroadcastRequest {
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default)]
    pub contacts_text: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub media: Option<MediaRef>,
    #[serde(default)]
    pub delay_seconds: Option<u64>,
}

impl BroadcastRequest {
    pub fn payload(&self) -> Payload {
        Payload {
            text: self.message.clone(),
            media: self.media.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ClientMessage {
    ConnectSession,
    DisconnectSession,
    GetState,
    StartBroadcast(BroadcastRequest),
    CancelBroadcast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        protocol: String,
        state: SessionSnapshot,
        active_job: Option<JobSnapshot>,
        server_now: String,
    },
    SessionState {
        state: SessionSnapshot,
    },
    BroadcastStarted {
        job_id: JobId,
        total: usize,
        /// Candidates discarded by normalization
        dropped: usize,
    },
    BroadcastCancelled {
        /// False when no broadcast was running
        cancelled: bool,
    },
    Error {
        code: String,
        msg: String,
    },
}
