use super::*;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Seconds the gateway may hold an events request open
const LONG_POLL_SECONDS: u64 = 25;

/// Channel backed by a messaging gateway sidecar.
///
/// The gateway speaks the chat network's protocol and exposes one session
/// over HTTP:
/// - `POST {base}/sessions/{name}/start` with optional stored credentials
/// - `GET  {base}/sessions/{name}/events?cursor=N` long-poll
/// - `POST {base}/sessions/{name}/messages`
/// - `POST {base}/sessions/{name}/stop`
pub struct GatewayChannel {
    base_url: String,
    session: String,
    client: reqwest::Client,
    poller: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Serialize)]
struct StartRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    credentials: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventsResponse {
    events: Vec<GatewayEvent>,
    cursor: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum GatewayEvent {
    Qr {
        qr: String,
    },
    Authenticated {
        identity: String,
        #[serde(default)]
        credentials: Option<String>,
    },
    Ready,
    AuthFailure {
        message: String,
    },
    Disconnected {
        reason: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    chat_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    media: Option<&'a crate::types::MediaRef>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    id: Option<String>,
}

impl GatewayEvent {
    fn into_pairing_event(self) -> Option<PairingEvent> {
        match self {
            GatewayEvent::Qr { qr } => Some(PairingEvent::ChallengeIssued(qr)),
            GatewayEvent::Authenticated {
                identity,
                credentials,
            } => {
                let credentials = credentials.and_then(|encoded| match STANDARD.decode(encoded) {
                    Ok(blob) => Some(blob),
                    Err(e) => {
                        tracing::warn!("Gateway sent undecodable credentials: {}", e);
                        None
                    }
                });
                Some(PairingEvent::Authenticated {
                    identity: SessionIdentity(identity),
                    credentials,
                })
            }
            GatewayEvent::Ready => Some(PairingEvent::Ready),
            GatewayEvent::AuthFailure { message } => Some(PairingEvent::AuthFailed(message)),
            GatewayEvent::Disconnected { reason } => Some(PairingEvent::ChannelClosed(reason)),
            GatewayEvent::Unknown => None,
        }
    }
}

/// 4xx means the network or gateway refused this recipient; anything else is
/// a transport problem.
fn classify_failure(status: StatusCode, body: String) -> SendError {
    let detail = if body.trim().is_empty() {
        status.to_string()
    } else {
        body
    };
    if status.is_client_error() {
        SendError::Rejected(detail)
    } else {
        SendError::Transport(detail)
    }
}

impl GatewayChannel {
    pub fn new(base_url: impl Into<String>, session: impl Into<String>) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(LONG_POLL_SECONDS + 10))
            .build()
            .map_err(|e| ChannelError::Unavailable(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session: session.into(),
            client,
            poller: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/sessions/{}/{}", self.base_url, self.session, path)
    }

    fn replace_poller(&self, poller: Option<JoinHandle<()>>) {
        let mut slot = self
            .poller
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(old) = slot.take() {
            old.abort();
        }
        *slot = poller;
    }

    fn spawn_poller(&self, tx: mpsc::Sender<PairingEvent>) -> JoinHandle<()> {
        let client = self.client.clone();
        let url = self.url("events");

        tokio::spawn(async move {
            let mut cursor = 0u64;
            loop {
                let response = client
                    .get(&url)
                    .query(&[("cursor", cursor), ("timeout", LONG_POLL_SECONDS)])
                    .send()
                    .await
                    .and_then(|r| r.error_for_status());

                let batch = match response {
                    Ok(r) => r.json::<EventsResponse>().await,
                    Err(e) => Err(e),
                };

                match batch {
                    Ok(batch) => {
                        cursor = batch.cursor;
                        for event in batch.events {
                            let Some(event) = event.into_pairing_event() else {
                                continue;
                            };
                            let closed = matches!(event, PairingEvent::ChannelClosed(_));
                            if tx.send(event).await.is_err() || closed {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Gateway event poll failed: {}", e);
                        let _ = tx
                            .send(PairingEvent::ChannelClosed(format!("gateway unreachable: {}", e)))
                            .await;
                        return;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl PairingChannel for GatewayChannel {
    fn name(&self) -> &str {
        "gateway"
    }

    async fn open(&self, credentials: Option<Vec<u8>>) -> Result<PairingEvents, ChannelError> {
        let request = StartRequest {
            credentials: credentials.map(|blob| STANDARD.encode(blob)),
        };

        let response = self
            .client
            .post(self.url("start"))
            .json(&request)
            .send()
            .await
            .map_err(|e| ChannelError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ChannelError::Protocol(format!(
                "start returned {}",
                response.status()
            )));
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        self.replace_poller(Some(self.spawn_poller(tx)));
        tracing::info!("Gateway session {} started", self.session);
        Ok(rx)
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.replace_poller(None);

        let response = self
            .client
            .post(self.url("stop"))
            .send()
            .await
            .map_err(|e| ChannelError::Unavailable(e.to_string()))?;

        match response.status() {
            s if s.is_success() || s == StatusCode::NOT_FOUND => Ok(()),
            s => Err(ChannelError::Protocol(format!("stop returned {}", s))),
        }
    }

    async fn send(&self, recipient: &Recipient, payload: &Payload) -> Result<String, SendError> {
        let request = SendRequest {
            chat_id: recipient.chat_id(),
            text: payload.text.as_deref(),
            media: payload.media.as_ref(),
        };

        let response = self
            .client
            .post(self.url("messages"))
            .json(&request)
            .send()
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(status, body));
        }

        let body: SendResponse = response
            .json()
            .await
            .map_err(|e| SendError::Transport(format!("Invalid gateway response: {}", e)))?;
        Ok(body.id.unwrap_or_else(|| "sent".to_string()))
    }
}
