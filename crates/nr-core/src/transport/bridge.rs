//! Session bridge client
//!
//! Talks to a local bridge daemon that owns the messaging protocol: control
//! calls over HTTP, session events over a WebSocket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use super::{EventStream, Transport, TransportError, TransportEvent};
use crate::error::{Error, Result};

const EVENT_BUFFER: usize = 32;
const RECONNECT_DELAY_MIN: Duration = Duration::from_millis(500);
const RECONNECT_DELAY_MAX: Duration = Duration::from_secs(30);

type EventSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Frames pushed by the bridge on its event socket
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeFrame {
    Qr {
        data: String,
    },
    Ready,
    AuthFailure {
        #[serde(default)]
        message: String,
    },
    Disconnected {
        #[serde(default)]
        reason: String,
    },
    #[serde(other)]
    Unknown,
}

/// Error body returned by the bridge
#[derive(Debug, Deserialize)]
struct BridgeErrorBody {
    error: String,
}

/// HTTP and WebSocket access to the bridge, shared with the event reader
#[derive(Clone)]
struct BridgeClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl BridgeClient {
    fn events_url(&self) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.base_url.clone()
        };
        format!("{}/events", ws_base)
    }

    /// Open the event socket
    async fn connect_events(&self) -> std::result::Result<EventSocket, TransportError> {
        let url = self.events_url();
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Internal(format!("invalid events url {}: {}", url, e)))?;

        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| TransportError::Internal(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        info!("Connected to bridge event stream at {}", url);
        Ok(ws_stream)
    }

    async fn post(
        &self,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> std::result::Result<(), TransportError> {
        let url = format!("{}{}", self.base_url, path);

        let mut request = self.client.post(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        Err(classify_failure(status, &text))
    }
}

/// Transport backed by a session bridge daemon
pub struct BridgeTransport {
    bridge: BridgeClient,
    events_tx: mpsc::Sender<TransportEvent>,
    reader: Mutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
}

impl BridgeTransport {
    /// Create a bridge client and the event stream it feeds.
    ///
    /// `request_timeout` bounds every HTTP call to the bridge.
    pub fn new(
        base_url: &str,
        token: Option<String>,
        request_timeout: Duration,
    ) -> Result<(Self, EventStream)> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(Error::Http)?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);

        let transport = Self {
            bridge: BridgeClient {
                client,
                base_url: base_url.trim_end_matches('/').to_string(),
                token,
            },
            events_tx,
            reader: Mutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
        };

        Ok((transport, events_rx))
    }

    fn events_url(&self) -> String {
        self.bridge.events_url()
    }

    fn reader_running(&self) -> bool {
        self.reader
            .lock()
            .map(|guard| guard.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    /// Connect the event socket and spawn the task that forwards its frames
    async fn connect_events(&self) -> std::result::Result<(), TransportError> {
        let socket = self.bridge.connect_events().await?;
        self.closed.store(false, Ordering::SeqCst);

        let handle = tokio::spawn(run_event_reader(
            self.bridge.clone(),
            socket,
            self.events_tx.clone(),
            Arc::clone(&self.closed),
        ));

        if let Ok(mut guard) = self.reader.lock() {
            *guard = Some(handle);
        }

        Ok(())
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    async fn initialize(&self) -> std::result::Result<(), TransportError> {
        if !self.reader_running() {
            self.connect_events().await?;
        }

        info!("Requesting session start from bridge");
        self.bridge.post("/session/start", None).await
    }

    async fn send_message(&self, recipient: &str, body: &str) -> std::result::Result<(), TransportError> {
        debug!("Sending message to {} via bridge", recipient);

        let payload = serde_json::json!({
            "chatId": recipient,
            "text": body,
        });

        self.bridge.post("/messages", Some(payload)).await
    }

    async fn close(&self) -> std::result::Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        let result = self.bridge.post("/session/close", None).await;

        if let Ok(mut guard) = self.reader.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }

        result
    }
}

/// How one event socket connection ended
enum SocketEnd {
    /// The bridge closed the socket or it failed
    Lost,
    /// Nobody is listening for events any more
    ReceiverGone,
}

/// Forward frames from the event socket, reconnecting whenever it drops,
/// until the transport is closed
async fn run_event_reader(
    bridge: BridgeClient,
    mut socket: EventSocket,
    tx: mpsc::Sender<TransportEvent>,
    closed: Arc<AtomicBool>,
) {
    loop {
        if let SocketEnd::ReceiverGone = pump_events(socket, &tx).await {
            debug!("Event receiver dropped, stopping bridge reader");
            return;
        }
        if closed.load(Ordering::SeqCst) {
            return;
        }
        if tx
            .send(TransportEvent::Error("bridge event stream closed".to_string()))
            .await
            .is_err()
        {
            return;
        }

        let mut delay = RECONNECT_DELAY_MIN;
        socket = loop {
            tokio::time::sleep(delay).await;
            if closed.load(Ordering::SeqCst) {
                return;
            }

            match bridge.connect_events().await {
                Ok(socket) => break socket,
                Err(e) => {
                    warn!(
                        "Bridge event stream reconnect failed, retrying in {:?}: {}",
                        delay, e
                    );
                    delay = (delay * 2).min(RECONNECT_DELAY_MAX);
                }
            }
        };

        // The bridge may have restarted; ask it to resume the session
        if let Err(e) = bridge.post("/session/start", None).await {
            warn!("Session restart request after reconnect failed: {}", e);
        }
    }
}

async fn pump_events(socket: EventSocket, tx: &mpsc::Sender<TransportEvent>) -> SocketEnd {
    let (mut write, mut read) = socket.split();

    while let Some(message) = read.next().await {
        match message {
            Ok(WsMessage::Text(text)) => {
                let Some(event) = parse_frame(text.as_str()) else {
                    continue;
                };
                if tx.send(event).await.is_err() {
                    return SocketEnd::ReceiverGone;
                }
            }
            Ok(WsMessage::Ping(data)) => {
                if let Err(e) = write.send(WsMessage::Pong(data)).await {
                    warn!("Failed to answer bridge ping: {}", e);
                }
            }
            Ok(WsMessage::Close(_)) => {
                info!("Bridge event stream closed");
                break;
            }
            Err(e) => {
                error!("Bridge event stream error: {}", e);
                break;
            }
            _ => {}
        }
    }

    SocketEnd::Lost
}

/// Map an event frame to a transport event; unknown frames are skipped
fn parse_frame(text: &str) -> Option<TransportEvent> {
    let frame: BridgeFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Ignoring malformed bridge frame: {}", e);
            return None;
        }
    };

    match frame {
        BridgeFrame::Qr { data } => Some(TransportEvent::PairingCode(data)),
        BridgeFrame::Ready => Some(TransportEvent::Ready),
        BridgeFrame::AuthFailure { message } => {
            Some(TransportEvent::Error(format!("authentication failed: {}", message)))
        }
        BridgeFrame::Disconnected { reason } => {
            Some(TransportEvent::Error(format!("disconnected: {}", reason)))
        }
        BridgeFrame::Unknown => {
            debug!("Ignoring unknown bridge frame");
            None
        }
    }
}

/// Turn a non-success bridge response into a transport error
fn classify_failure(status: StatusCode, body: &str) -> TransportError {
    let detail = serde_json::from_str::<BridgeErrorBody>(body)
        .map(|b| b.error)
        .unwrap_or_else(|_| body.to_string());
    let detail = if detail.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, detail)
    };

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::GONE => TransportError::SessionInvalidated(detail),
        s if s.is_client_error() => TransportError::Rejected(detail),
        _ => TransportError::Internal(detail),
    }
}
