//! Session state machine

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::transport::TransportEvent;

/// Lifecycle state of the messaging session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    /// Process started, pairing not yet begun
    Uninitialized,
    /// Waiting for a companion device to scan `payload`
    AwaitingPairing {
        #[serde(skip_serializing)]
        payload: String,
    },
    /// Authenticated and able to send
    Ready { since: DateTime<Utc> },
    /// The transport reported a fault; waiting for recovery or re-pairing
    Degraded { reason: String, since: DateTime<Utc> },
    /// Explicitly closed; absorbing
    Terminated,
}

impl SessionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, SessionState::Ready { .. })
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, SessionState::Terminated)
    }

    /// Short lowercase name for logs and status output
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::AwaitingPairing { .. } => "awaiting_pairing",
            SessionState::Ready { .. } => "ready",
            SessionState::Degraded { .. } => "degraded",
            SessionState::Terminated => "terminated",
        }
    }

    /// Next state after `event`, or `None` when the event does not move
    /// the session.
    ///
    /// A pairing code always (re)enters `AwaitingPairing`, which covers the
    /// transport refreshing its code and forced re-pairing from `Ready` or
    /// `Degraded`. `Ready` from `Uninitialized` happens when the transport
    /// restores a previously paired session without a new handshake.
    pub fn apply(&self, event: &TransportEvent) -> Option<SessionState> {
        use SessionState::*;

        match (self, event) {
            (Terminated, _) => None,

            (_, TransportEvent::PairingCode(payload)) => Some(AwaitingPairing {
                payload: payload.clone(),
            }),

            (Ready { .. }, TransportEvent::Ready) => None,
            (_, TransportEvent::Ready) => Some(Ready { since: Utc::now() }),

            (Degraded { .. }, TransportEvent::Error(_)) => None,
            (_, TransportEvent::Error(reason)) => Some(Degraded {
                reason: reason.clone(),
                since: Utc::now(),
            }),
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
