//! Messaging transport abstraction
//!
//! The relay never speaks the messaging protocol itself. A [`Transport`]
//! starts the handshake, sends text, and closes the session; everything the
//! transport observes on its own (pairing codes, readiness, faults) arrives
//! as [`TransportEvent`]s on the stream handed out next to it.

mod bridge;

pub use bridge::BridgeTransport;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Receiving end of a transport's event stream.
pub type EventStream = mpsc::Receiver<TransportEvent>;

/// Something the transport reports about the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A pairing payload to be scanned by the companion device
    PairingCode(String),
    /// The session is authenticated and can send
    Ready,
    /// Session-level fault (auth failure, disconnect, lost stream)
    Error(String),
}

/// Failure of a transport operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("recipient rejected: {0}")]
    Rejected(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("session invalidated: {0}")]
    SessionInvalidated(String),

    #[error("transport fault: {0}")]
    Internal(String),
}

impl TransportError {
    /// Whether the session can no longer be used after this error
    pub fn invalidates_session(&self) -> bool {
        matches!(self, TransportError::SessionInvalidated(_))
    }
}

/// An opaque, externally-authenticated messaging session.
///
/// Implementations are treated as non-reentrant: the session manager never
/// issues two operations concurrently.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Begin the pairing handshake
    async fn initialize(&self) -> Result<(), TransportError>;

    /// Deliver `body` to an already-normalized recipient
    async fn send_message(&self, recipient: &str, body: &str) -> Result<(), TransportError>;

    /// Tear the session down
    async fn close(&self) -> Result<(), TransportError>;
}
