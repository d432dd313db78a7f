//! Pairing channel: the capability the session machine uses to reach the
//! messaging network.
//!
//! One implementation per transport. The session never branches on which one
//! it holds; it only consumes [`PairingEvent`]s and calls `send` while ready.

mod gateway;
mod simulated;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::types::{Payload, Recipient, SessionIdentity};

pub use gateway::GatewayChannel;
pub use simulated::{SimulatedChannel, SimulatedConfig};

/// Buffer size of the per-attempt event stream
pub const EVENT_BUFFER: usize = 32;

/// Events reported by the remote identity provider for one connection attempt
#[derive(Debug, Clone, PartialEq)]
pub enum PairingEvent {
    /// A new pairing challenge (QR payload) to be scanned
    ChallengeIssued(String),
    /// The remote identity confirmed the pairing. `credentials` is an opaque
    /// blob that lets a later attempt skip the challenge.
    Authenticated {
        identity: SessionIdentity,
        credentials: Option<Vec<u8>>,
    },
    /// The account is fully loaded and can send
    Ready,
    AuthFailed(String),
    ChannelClosed(String),
}

/// Receiving end of one connection attempt's events. The stream ending
/// without a `ChannelClosed` event is treated as a closed channel.
pub type PairingEvents = mpsc::Receiver<PairingEvent>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChannelError {
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Transport protocol error: {0}")]
    Protocol(String),
}

/// Failure of a single send. Rejections are final for that recipient;
/// transport errors are not the recipient's fault.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SendError {
    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Session is not ready")]
    NotReady,
}

#[async_trait]
pub trait PairingChannel: Send + Sync {
    /// Transport name for logging
    fn name(&self) -> &str;

    /// Start a connection attempt. Stored credentials, if any, are offered so
    /// the remote side can skip the challenge.
    async fn open(&self, credentials: Option<Vec<u8>>) -> Result<PairingEvents, ChannelError>;

    /// Tear down the current attempt. Closing an already closed channel is fine.
    async fn close(&self) -> Result<(), ChannelError>;

    /// Deliver one payload; returns a transport message id or note on success
    async fn send(&self, recipient: &Recipient, payload: &Payload) -> Result<String, SendError>;
}
