//! nr-api: HTTP relay for notify-relay
//!
//! Accepts notification requests over HTTP and hands them to the
//! session manager. Built with axum.

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod server;

pub use error::{ApiError, Result};
pub use server::{AppState, RelayServer};
