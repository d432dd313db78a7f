use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use zapcast::{
    api,
    auth::OperatorAuth,
    channel::{GatewayChannel, PairingChannel, SimulatedChannel, SimulatedConfig},
    config::{ServerConfig, TransportKind},
    credentials::DirCredentialStore,
    recipients::RecipientValidator,
    scheduler::{Scheduler, TokioScheduler},
    state::{AppState, Settings},
};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Load .env file if present (before any env var reads)
    if let Err(e) = dotenvy::dotenv() {
        // Not an error if .env doesn't exist, only log if it's a different issue
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "zapcast=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting zapcast...");

    let config = ServerConfig::from_env();
    let settings = Settings::from_env(&config);
    let operator_auth = Arc::new(OperatorAuth::from_env());
    let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler);

    let channel: Arc<dyn PairingChannel> = match &config.transport {
        TransportKind::Simulated => {
            tracing::warn!("Using the simulated transport, messages are not delivered");
            Arc::new(SimulatedChannel::new(
                SimulatedConfig::from_env(&RecipientValidator::new(settings.recipients.clone())),
                scheduler.clone(),
            ))
        }
        TransportKind::Gateway { base_url, session } => {
            tracing::info!("Using messaging gateway at {} (session {})", base_url, session);
            let gateway = GatewayChannel::new(base_url.as_str(), session.as_str())
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            Arc::new(gateway)
        }
    };
    let credentials = Arc::new(DirCredentialStore::new(&config.credentials_dir));

    let state = Arc::new(AppState::new(channel, credentials, scheduler, settings));

    if config.auto_connect {
        let snapshot = state.connect().await;
        tracing::info!("Auto-connect: session is {}", snapshot.state.name());
    }

    let app = api::router(state.clone(), operator_auth);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if state.cancel_broadcast() {
        tracing::info!("Cancelled running broadcast on shutdown");
    }
    state.disconnect().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
