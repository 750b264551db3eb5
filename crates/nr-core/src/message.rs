//! Outbound message model and recipient normalization

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Why a dispatch did not go through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Session is not paired or currently degraded; retry later
    SessionNotReady,
    /// Transport rejected or could not complete the send
    DeliveryFailed,
}

/// Outcome of a single send attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl DispatchResult {
    pub fn sent() -> Self {
        Self {
            ok: true,
            error_kind: None,
            detail: None,
        }
    }

    pub fn not_ready() -> Self {
        Self {
            ok: false,
            error_kind: Some(ErrorKind::SessionNotReady),
            detail: None,
        }
    }

    pub fn delivery_failed(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            error_kind: Some(ErrorKind::DeliveryFailed),
            detail: Some(detail.into()),
        }
    }
}

/// A single notification on its way to the transport.
///
/// Lives for one HTTP request and is dropped once the response is written.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub id: Uuid,
    pub recipient_raw: String,
    pub recipient_normalized: String,
    pub body: String,
    pub requested_at: DateTime<Utc>,
}

impl OutboundMessage {
    pub fn new(recipient_raw: &str, suffix: &str, body: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            recipient_raw: recipient_raw.to_string(),
            recipient_normalized: normalize_recipient(recipient_raw, suffix),
            body: body.to_string(),
            requested_at: Utc::now(),
        }
    }
}

/// Convert a caller-supplied number into the transport's addressing form.
///
/// Identifiers that already end in `suffix` are returned unchanged; anything
/// else loses surrounding whitespace and a leading `+` and gets the suffix
/// appended. Applying it twice yields the same value as applying it once.
pub fn normalize_recipient(number: &str, suffix: &str) -> String {
    let number = number.trim();
    if number.ends_with(suffix) {
        return number.to_string();
    }
    let digits = number.strip_prefix('+').unwrap_or(number);
    format!("{}{}", digits, suffix)
}

/// Loose check for an international-format number.
///
/// Accepts plain digits with an optional leading `+`, or digits already
/// carrying `suffix`.
pub fn is_valid_number(number: &str, suffix: &str) -> bool {
    let number = number.trim();
    let local = number.strip_suffix(suffix).unwrap_or(number);
    let digits = local.strip_prefix('+').unwrap_or(local);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUFFIX: &str = "@c.us";

    #[test]
    fn test_normalize_appends_suffix_once() {
        assert_eq!(normalize_recipient("15551234567", SUFFIX), "15551234567@c.us");
        assert_eq!(normalize_recipient("+15551234567", SUFFIX), "15551234567@c.us");
        assert_eq!(normalize_recipient(" 8328618110 ", SUFFIX), "8328618110@c.us");
    }

    #[test]
    fn test_normalize_keeps_suffixed() {
        assert_eq!(normalize_recipient("15551234567@c.us", SUFFIX), "15551234567@c.us");
    }

    #[test]
    fn test_normalize_idempotent() {
        let inputs = [
            "15551234567",
            "+15551234567",
            "15551234567@c.us",
            "  42 ",
            "",
            "+",
            "abc",
            "123@g.us",
            "@c.us",
        ];
        for input in inputs {
            let once = normalize_recipient(input, SUFFIX);
            let twice = normalize_recipient(&once, SUFFIX);
            assert_eq!(once, twice, "not idempotent for {:?}", input);
            assert_eq!(once.matches(SUFFIX).count(), 1, "suffix count for {:?}", input);
        }
    }

    #[test]
    fn test_normalize_custom_suffix() {
        let suffix = "@s.whatsapp.net";
        assert_eq!(normalize_recipient("4915112345678", suffix), "4915112345678@s.whatsapp.net");
        assert_eq!(
            normalize_recipient("4915112345678@s.whatsapp.net", suffix),
            "4915112345678@s.whatsapp.net"
        );
    }

    #[test]
    fn test_is_valid_number() {
        assert!(is_valid_number("15551234567", SUFFIX));
        assert!(is_valid_number("+15551234567", SUFFIX));
        assert!(is_valid_number("15551234567@c.us", SUFFIX));
        assert!(!is_valid_number("", SUFFIX));
        assert!(!is_valid_number("+", SUFFIX));
        assert!(!is_valid_number("555-1234", SUFFIX));
        assert!(!is_valid_number("hello", SUFFIX));
        assert!(!is_valid_number("123@g.us", SUFFIX));
    }

    #[test]
    fn test_outbound_message_normalizes() {
        let msg = OutboundMessage::new("+15551234567", SUFFIX, "hello");
        assert_eq!(msg.recipient_raw, "+15551234567");
        assert_eq!(msg.recipient_normalized, "15551234567@c.us");
        assert_eq!(msg.body, "hello");
    }

    #[test]
    fn test_dispatch_result_constructors() {
        assert!(DispatchResult::sent().ok);

        let not_ready = DispatchResult::not_ready();
        assert!(!not_ready.ok);
        assert_eq!(not_ready.error_kind, Some(ErrorKind::SessionNotReady));
        assert!(not_ready.detail.is_none());

        let failed = DispatchResult::delivery_failed("boom");
        assert_eq!(failed.error_kind, Some(ErrorKind::DeliveryFailed));
        assert_eq!(failed.detail.as_deref(), Some("boom"));
    }
}
