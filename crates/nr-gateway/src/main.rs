//! notify-relay: main binary
//!
//! Pairs the messaging session, serves the HTTP relay, and shuts both down
//! cleanly on Ctrl+C / SIGTERM.
//!
//! Usage:
//!   notify-relay           - Start the relay
//!   notify-relay --help    - Show help
//!   notify-relay --version - Show version

mod operator;

use std::sync::Arc;
use std::time::Duration;

use nr_api::RelayServer;
use nr_core::{BridgeTransport, Config, SessionEvent, SessionManager};
use tokio::sync::{broadcast, oneshot};
use tracing_subscriber::EnvFilter;

const CONSOLE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Run mode
enum RunMode {
    /// Relay mode
    Server,
    /// Show help
    Help,
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match parse_args() {
        RunMode::Help => {
            print_help();
            return Ok(());
        }
        RunMode::Version => {
            println!("notify-relay {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        RunMode::Server => {}
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load .env file
    dotenvy::dotenv().ok();

    let config = Config::load().map_err(|e| anyhow::anyhow!("Config error: {}", e))?;

    tracing::info!("Starting notify-relay...");
    tracing::info!("Session bridge: {}", config.session.bridge_url);

    run_relay(config).await
}

/// Parse command line arguments
fn parse_args() -> RunMode {
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => return RunMode::Help,
            "--version" | "-v" => return RunMode::Version,
            _ => {}
        }
    }

    RunMode::Server
}

/// Print help message
fn print_help() {
    println!("notify-relay - HTTP to messaging-session notification relay");
    println!();
    println!("Usage:");
    println!("  notify-relay            Start the relay");
    println!("  notify-relay --help     Show this help message");
    println!("  notify-relay --version  Show version");
    println!();
    println!("Endpoint:");
    println!("  POST /send  {{\"number\": \"15551234567\", \"message\": \"text\"}}");
    println!();
    println!("Environment Variables:");
    println!("  NOTIFY_RELAY_CONFIG    Path to TOML config (default: ./notify-relay.toml)");
    println!("  API_HOST               Bind address (default: 127.0.0.1)");
    println!("  API_PORT               HTTP port (default: 3000)");
    println!("  API_KEY                Bearer key required on /send (optional)");
    println!("  BRIDGE_URL             Session bridge URL (default: http://127.0.0.1:3100)");
    println!("  BRIDGE_TOKEN           Session bridge token (optional)");
    println!("  RECIPIENT_SUFFIX       Recipient domain suffix (default: @c.us)");
    println!("  SEND_TIMEOUT_SECS      Per-send timeout (default: 30)");
    println!("  INIT_ATTEMPTS          Handshake start attempts (default: 3)");
    println!("  INIT_RETRY_DELAY_SECS  Delay between attempts (default: 5)");
    println!("  EXIT_ON_INIT_FAILURE   Exit when every attempt fails (default: true)");
    println!("  ALLOWED_RECIPIENTS     Comma-separated allow-list (optional)");
}

/// Run the relay until a shutdown signal or a fatal session failure
async fn run_relay(config: Config) -> anyhow::Result<()> {
    let (transport, events) = BridgeTransport::new(
        &config.session.bridge_url,
        config.session.bridge_token.clone(),
        config.session.send_timeout(),
    )?;

    let session_manager = Arc::new(SessionManager::new(
        Arc::new(transport),
        events,
        config.session.clone(),
    ));

    let console = operator::spawn_console(session_manager.subscribe());
    let init_events = session_manager.subscribe();

    // Pairing runs in the background; the relay answers 503 until ready
    session_manager.initialize();

    let server = RelayServer::from_config(&config, Arc::clone(&session_manager))?;
    tracing::info!("HTTP relay starting on {}", server.addr());

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let mut server_task = tokio::spawn(server.start(async move {
        let _ = stop_rx.await;
    }));

    tracing::info!("Press Ctrl+C to exit");

    let mut server_finished = false;
    let mut init_failure = None;

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Shutting down...");
        }
        failure = wait_for_init_failure(init_events), if config.session.exit_on_init_failure => {
            tracing::error!(
                "Session could not be initialized after {} attempts, exiting",
                failure.0
            );
            init_failure = Some(failure);
        }
        result = &mut server_task => {
            server_finished = true;
            match result {
                Ok(Ok(())) => tracing::warn!("HTTP relay stopped unexpectedly"),
                Ok(Err(e)) => tracing::error!("HTTP relay error: {}", e),
                Err(e) => tracing::error!("HTTP relay task failed: {}", e),
            }
        }
    }

    // Stop accepting requests before closing the session
    let _ = stop_tx.send(());
    if !server_finished {
        match server_task.await {
            Ok(Err(e)) => tracing::warn!("HTTP relay error during shutdown: {}", e),
            Err(e) => tracing::warn!("HTTP relay task failed during shutdown: {}", e),
            Ok(Ok(())) => {}
        }
    }

    session_manager.shutdown().await;

    // Let the console print the final transitions before exiting
    if tokio::time::timeout(CONSOLE_DRAIN_TIMEOUT, console).await.is_err() {
        tracing::debug!("Operator console did not finish in time");
    }

    if let Some((attempts, error)) = init_failure {
        anyhow::bail!(
            "session initialization failed after {} attempts: {}",
            attempts,
            error
        );
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Resolve once the manager reports that every initialization attempt failed
async fn wait_for_init_failure(mut events: broadcast::Receiver<SessionEvent>) -> (u32, String) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::InitializationFailed { attempts, error }) => return (attempts, error),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => std::future::pending().await,
        }
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
