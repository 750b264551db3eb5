//! Relay HTTP server
//!
//! Starts and manages the axum-based relay server.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use nr_core::{normalize_recipient, Config, SessionManager};

use crate::error::{ApiError, Result};
use crate::routes::routes;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// The process's one session; read-only from the relay's side
    pub session_manager: Arc<SessionManager>,
    /// Domain suffix of the canonical recipient form
    pub recipient_suffix: String,
    /// Normalized allow-list; empty means unrestricted
    pub allowed_recipients: Arc<Vec<String>>,
    /// Bearer key required on dispatch routes
    pub api_key: Option<String>,
}

impl AppState {
    pub fn new(session_manager: Arc<SessionManager>, config: &Config) -> Self {
        let suffix = config.session.recipient_suffix.clone();
        let allowed = config
            .recipients
            .allowed
            .iter()
            .map(|r| normalize_recipient(r, &suffix))
            .collect();

        Self {
            session_manager,
            recipient_suffix: suffix,
            allowed_recipients: Arc::new(allowed),
            api_key: config.api.key.clone(),
        }
    }

    /// Whether the allow-list (if any) admits a normalized recipient
    pub fn is_allowed(&self, recipient_normalized: &str) -> bool {
        self.allowed_recipients.is_empty()
            || self
                .allowed_recipients
                .iter()
                .any(|r| r == recipient_normalized)
    }
}

/// Build the relay application with tracing attached
pub fn create_app(state: AppState) -> Router {
    routes(state).layer(TraceLayer::new_for_http())
}

/// Relay server
pub struct RelayServer {
    addr: SocketAddr,
    state: AppState,
}

impl RelayServer {
    /// Create a new relay server
    pub fn new(addr: SocketAddr, state: AppState) -> Self {
        Self { addr, state }
    }

    /// Create a relay server bound to the configured host and port
    pub fn from_config(config: &Config, session_manager: Arc<SessionManager>) -> Result<Self> {
        let addr = socket_addr(&config.api.host, config.api.port)?;
        Ok(Self::new(addr, AppState::new(session_manager, config)))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serve until `shutdown` resolves
    pub async fn start<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = create_app(self.state);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        info!("Relay listening on {}", self.addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ApiError::Http(e.to_string()))?;

        info!("Relay server stopped");
        Ok(())
    }
}

/// Get the socket address for a host/port pair
pub fn socket_addr(host: &str, port: u16) -> Result<SocketAddr> {
    format!("{}:{}", host, port)
        .parse()
        .map_err(|e| ApiError::InvalidAddress(format!("{}:{} ({})", host, port, e)))
}
