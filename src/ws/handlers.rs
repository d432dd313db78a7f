//! WebSocket message dispatch

use crate::broadcast::BroadcastError;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::AppState;
use std::sync::Arc;

impl From<&BroadcastError> for ServerMessage {
    fn from(e: &BroadcastError) -> Self {
        ServerMessage::Error {
            code: e.code().to_string(),
            msg: e.to_string(),
        }
    }
}

/// Handle client messages and return optional response
pub async fn handle_message(msg: ClientMessage, state: &Arc<AppState>) -> Option<ServerMessage> {
    match msg {
        ClientMessage::ConnectSession => Some(ServerMessage::SessionState {
            state: state.connect().await,
        }),

        ClientMessage::DisconnectSession => Some(ServerMessage::SessionState {
            state: state.disconnect().await,
        }),

        ClientMessage::GetState => Some(ServerMessage::SessionState {
            state: state.session_state(),
        }),

        ClientMessage::StartBroadcast(request) => match state.start_broadcast(&request) {
            Ok(accepted) => Some(ServerMessage::BroadcastStarted {
                job_id: accepted.job_id,
                total: accepted.total,
                dropped: accepted.dropped,
            }),
            Err(e) => {
                tracing::warn!("Broadcast request rejected: {}", e);
                Some(ServerMessage::from(&e))
            }
        },

        ClientMessage::CancelBroadcast => Some(ServerMessage::BroadcastCancelled {
            cancelled: state.cancel_broadcast(),
        }),
    }
}
