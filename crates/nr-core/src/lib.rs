//! nr-core: notify-relay core library
//!
//! Owns the single messaging session (pairing, readiness, degradation),
//! the transport abstraction it drives, and the message model shared
//! with the HTTP relay.

pub mod config;
pub mod error;
pub mod message;
pub mod session;
pub mod transport;

pub use config::{ApiConfig, Config, RecipientConfig, SessionConfig};
pub use error::{Error, Result};
pub use message::{normalize_recipient, DispatchResult, ErrorKind, OutboundMessage};
pub use session::{SessionEvent, SessionManager, SessionState};
pub use transport::{BridgeTransport, Transport, TransportError, TransportEvent};
