//! Route definitions

use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};

use crate::handlers::{health, send, status};
use crate::middleware::auth::auth_middleware;
use crate::server::AppState;

/// Create the relay router
pub fn routes(state: AppState) -> Router {
    let dispatch = Router::new()
        .route("/send", post(send))
        .route("/send-notification", post(send))
        .route_layer(from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .merge(dispatch)
        .with_state(state)
}
