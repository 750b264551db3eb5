//! Messaging session lifecycle

mod manager;
mod state;

pub use manager::{SessionEvent, SessionManager};
pub use state::SessionState;
