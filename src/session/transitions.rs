use crate::types::{SessionIdentity, SessionState};
use std::time::Duration;

/// Inputs to the session state machine
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ConnectRequested,
    ChallengeIssued(String),
    Authenticated(SessionIdentity),
    Ready,
    AuthFailed(String),
    ChannelClosed(String),
    RetryScheduled { attempt: u32, retry_in: Duration },
    TimerFired,
    DisconnectRequested,
}

/// Compute the state that `event` leads to from `from`, or `None` if the
/// event is not valid there
pub fn next_state(from: &SessionState, event: &SessionEvent) -> Option<SessionState> {
    use SessionEvent as E;
    use SessionState::*;

    match (from, event) {
        // Explicit connect: first start, or skipping a pending retry
        (Idle | Disconnected { .. } | Reconnecting { .. }, E::ConnectRequested) => {
            Some(AwaitingPairing { challenge: None })
        }

        // A refreshed challenge replaces the previous one
        (AwaitingPairing { .. }, E::ChallengeIssued(challenge)) => Some(AwaitingPairing {
            challenge: Some(challenge.clone()),
        }),

        (AwaitingPairing { .. }, E::Authenticated(identity)) => Some(Authenticating {
            identity: identity.clone(),
        }),

        (Authenticating { identity }, E::Ready) => Some(Ready {
            identity: identity.clone(),
        }),

        (AwaitingPairing { .. } | Authenticating { .. }, E::AuthFailed(reason)) => {
            Some(Disconnected {
                reason: format!("authentication failed: {}", reason),
            })
        }

        (AwaitingPairing { .. } | Authenticating { .. } | Ready { .. }, E::ChannelClosed(reason)) => {
            Some(Disconnected {
                reason: reason.clone(),
            })
        }

        (Disconnected { .. }, E::RetryScheduled { attempt, retry_in }) => Some(Reconnecting {
            attempt: *attempt,
            retry_in_ms: retry_in.as_millis() as u64,
        }),

        (Reconnecting { .. }, E::TimerFired) => Some(AwaitingPairing { challenge: None }),

        // Teardown is valid from everywhere except where we already are
        (Idle, E::DisconnectRequested) => None,
        (_, E::DisconnectRequested) => Some(Idle),

        _ => None,
    }
}
