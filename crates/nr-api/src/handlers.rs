//! HTTP relay handlers
//!
//! The dispatch contract:
//!
//! | outcome                  | status | body                                                   |
//! |--------------------------|--------|--------------------------------------------------------|
//! | delivered                | 200    | `{"success":"Message sent"}`                           |
//! | missing field / bad JSON | 400    | `{"error":"Missing number or message"}`                |
//! | non-numeric number       | 400    | `{"error":"Invalid number"}`                           |
//! | not on the allow-list    | 403    | `{"error":"Recipient not allowed"}`                    |
//! | session not ready        | 503    | `{"error":"Session not ready"}`                        |
//! | transport failure        | 500    | `{"error":"Failed to send message","detail":"..."}`    |

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use nr_core::message::is_valid_number;
use nr_core::{ErrorKind, OutboundMessage, SessionState};

use crate::server::AppState;

// ============================================================================
// Request/Response types
// ============================================================================

/// Recipient as sent by callers; some send it as a bare JSON number
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum NumberField {
    Text(String),
    Numeric(u64),
}

impl NumberField {
    fn into_string(self) -> String {
        match self {
            NumberField::Text(s) => s,
            NumberField::Numeric(n) => n.to_string(),
        }
    }
}

/// Dispatch request payload
#[derive(Debug, Deserialize)]
pub struct SendRequest {
    #[serde(default)]
    pub number: Option<NumberField>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Dispatch success payload
#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: String,
}

/// Generic API error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

type HandlerError = (StatusCode, Json<ErrorResponse>);

fn reject(status: StatusCode, error: &str) -> HandlerError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            detail: None,
        }),
    )
}

// ============================================================================
// Handler functions
// ============================================================================

/// Health check endpoint
pub async fn health() -> &'static str {
    "OK"
}

/// Current session state
pub async fn status(State(state): State<AppState>) -> Json<SessionState> {
    Json(state.session_manager.current_state())
}

/// Dispatch endpoint - relay one notification through the session
pub async fn send(
    State(state): State<AppState>,
    payload: Result<Json<SendRequest>, JsonRejection>,
) -> Result<Json<SuccessResponse>, HandlerError> {
    let Json(req) = payload.map_err(|e| {
        debug!("Unreadable dispatch request: {}", e);
        reject(StatusCode::BAD_REQUEST, "Missing number or message")
    })?;

    let number = req
        .number
        .map(NumberField::into_string)
        .filter(|n| !n.trim().is_empty());
    let message = req.message.filter(|m| !m.trim().is_empty());

    let (Some(number), Some(message)) = (number, message) else {
        return Err(reject(StatusCode::BAD_REQUEST, "Missing number or message"));
    };

    if !is_valid_number(&number, &state.recipient_suffix) {
        return Err(reject(StatusCode::BAD_REQUEST, "Invalid number"));
    }

    let outbound = OutboundMessage::new(&number, &state.recipient_suffix, &message);

    if !state.is_allowed(&outbound.recipient_normalized) {
        warn!("Recipient {} is not on the allow-list", outbound.recipient_normalized);
        return Err(reject(StatusCode::FORBIDDEN, "Recipient not allowed"));
    }

    let result = state.session_manager.dispatch(&outbound).await;

    match result.error_kind {
        None if result.ok => Ok(Json(SuccessResponse {
            success: "Message sent".to_string(),
        })),
        Some(ErrorKind::SessionNotReady) => {
            Err(reject(StatusCode::SERVICE_UNAVAILABLE, "Session not ready"))
        }
        Some(ErrorKind::DeliveryFailed) | None => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: "Failed to send message".to_string(),
                detail: Some(result.detail.unwrap_or_default()),
            }),
        )),
    }
}
