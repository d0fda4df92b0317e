//! Deribit Gateway Binary
//!
//! Starts the session manager, command endpoint, market data feed, and
//! subscriber fan-out server.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin deribit-gateway
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `DERIBIT_CLIENT_ID`: API client id
//! - `DERIBIT_CLIENT_SECRET`: API client secret
//!
//! ## Optional
//! - `DERIBIT_ENV`: TEST | LIVE (default: TEST)
//! - `DERIBIT_REST_URL` / `DERIBIT_WS_URL`: Override exchange endpoints
//! - `GATEWAY_WS_PORT`: Subscriber WebSocket port (default: 9002)
//! - `GATEWAY_ADMIN_PORT`: Health, metrics, and command HTTP port (default: 8082)
//! - `GATEWAY_QUEUE_CAPACITY`: Per-connection update queue (default: 1024)
//! - `GATEWAY_FEED_CHANNELS`: Comma-separated upstream channels
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `RUST_LOG`: Log filter (default: deribit_gateway=info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use deribit_gateway::infrastructure::admin::{AdminServer, AdminState};
use deribit_gateway::infrastructure::deribit::{
    FeedClient, FeedClientConfig, HttpAuthenticator, HttpTransport, build_http_client,
};
use deribit_gateway::infrastructure::hub::{self, FanOutHub, HubConfig};
use deribit_gateway::infrastructure::telemetry;
use deribit_gateway::{
    CommandExecutor, GatewayConfig, SessionManager, UpdateSink, init_metrics,
};
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("rustls crypto provider already installed");
    }

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Deribit gateway");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = GatewayConfig::from_env().context("invalid gateway configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Exchange adapters
    let http_timeout = config.session.request_timeout.max(config.session.auth_timeout);
    let http_client = build_http_client(http_timeout).context("failed to build HTTP client")?;
    let authenticator = Arc::new(HttpAuthenticator::new(
        http_client.clone(),
        &config.rest_base_url,
    ));
    let transport = Arc::new(HttpTransport::new(http_client, &config.rest_base_url));

    // Session and command execution
    let sessions = Arc::new(SessionManager::new(
        authenticator,
        config.credentials.clone(),
        config.session.session_config(),
    ));
    let executor = Arc::new(CommandExecutor::new(
        Arc::clone(&sessions),
        transport,
        config.session.request_timeout,
    ));

    // Fan-out hub and market data feed
    let fan_out = Arc::new(FanOutHub::new(HubConfig::from(&config.hub)));
    let feed = Arc::new(FeedClient::new(
        FeedClientConfig::from_settings(config.ws_url.clone(), &config.feed),
        Arc::clone(&fan_out) as Arc<dyn UpdateSink>,
        shutdown_token.clone(),
    ));

    let listener = hub::bind(config.server.ws_port).await?;

    // Obtain the first token up front so readiness reflects a usable session.
    let warmup_sessions = Arc::clone(&sessions);
    tokio::spawn(async move {
        match warmup_sessions.ensure_valid().await {
            Ok(session) => {
                tracing::info!(generation = session.generation(), "Initial session established");
            }
            Err(e) => tracing::warn!(error = %e, "Initial session refresh failed"),
        }
    });

    let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

    // Spawn feed client
    let feed_client = Arc::clone(&feed);
    tasks.push((
        "feed",
        tokio::spawn(async move {
            if let Err(e) = feed_client.run().await {
                tracing::error!(error = %e, "Feed client error");
            }
        }),
    ));

    // Spawn subscriber server
    let server_hub = Arc::clone(&fan_out);
    let server_shutdown = shutdown_token.clone();
    tasks.push((
        "hub",
        tokio::spawn(hub::serve(listener, server_hub, server_shutdown)),
    ));

    // Spawn admin server
    let admin_state = Arc::new(AdminState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        executor,
        Arc::clone(&fan_out),
        feed,
    ));
    let admin_server = AdminServer::new(
        config.server.admin_port,
        admin_state,
        shutdown_token.clone(),
    );
    tasks.push((
        "admin",
        tokio::spawn(async move {
            if let Err(e) = admin_server.run().await {
                tracing::error!(error = %e, "Admin server error");
            }
        }),
    ));

    tracing::info!("Deribit gateway ready");

    await_shutdown(shutdown_token).await;

    for (name, task) in tasks {
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(task = name, error = %e, "Task panicked"),
            Err(_) => tracing::warn!(task = name, "Task did not stop before shutdown timeout"),
        }
    }

    tracing::info!("Deribit gateway stopped");

    Ok(())
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &GatewayConfig) {
    tracing::info!(
        environment = config.environment.as_str(),
        ws_port = config.server.ws_port,
        admin_port = config.server.admin_port,
        queue_capacity = config.hub.queue_capacity,
        channels = config.feed.channels.len(),
        "Configuration loaded"
    );
    tracing::debug!(
        rest_base_url = %config.rest_base_url,
        ws_url = %config.ws_url,
        client_id = config.credentials.client_id(),
        "Exchange endpoints"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
