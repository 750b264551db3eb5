//! Operator console
//!
//! Prints session status to the terminal: the pairing payload when a device
//! has to be linked, and a status line for every other transition.

use nu_ansi_term::{Color, Style};
use qrcode::render::unicode::Dense1x2;
use qrcode::QrCode;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::warn;

use nr_core::{SessionEvent, SessionState};

/// Render one session event as terminal text
pub fn render(event: &SessionEvent) -> String {
    match event {
        SessionEvent::StateChanged(SessionState::AwaitingPairing { payload }) => {
            let rule = Style::new().dimmed().paint("─".repeat(48));
            let code = match pairing_qr(payload) {
                Some(qr) => format!("{}\n{}", qr, Style::new().dimmed().paint(payload.as_str())),
                None => Color::White.bold().paint(payload.as_str()).to_string(),
            };
            format!(
                "{}\n{}\n\n{}\n\n{}\n{}",
                rule,
                Color::Yellow.bold().paint("📱 Pairing required"),
                code,
                "Scan this code from the companion device (Linked devices → Link a device).",
                rule,
            )
        }
        SessionEvent::StateChanged(SessionState::Ready { since }) => format!(
            "{} session ready (since {})",
            Color::Green.bold().paint("✅"),
            since.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        SessionEvent::StateChanged(SessionState::Degraded { reason, .. }) => format!(
            "{} session degraded: {} (sends return 503 until it recovers)",
            Color::Yellow.bold().paint("⚠️"),
            reason
        ),
        SessionEvent::StateChanged(SessionState::Terminated) => {
            format!("{} session closed", Color::Blue.bold().paint("⏹"))
        }
        SessionEvent::StateChanged(SessionState::Uninitialized) => {
            "session not started".to_string()
        }
        SessionEvent::InitializationFailed { attempts, error } => format!(
            "{} could not start the session after {} attempt(s): {}",
            Color::Red.bold().paint("❌"),
            attempts,
            error
        ),
    }
}

/// Pairing payload as a scannable terminal QR, two modules per character
pub fn pairing_qr(payload: &str) -> Option<String> {
    match QrCode::new(payload.as_bytes()) {
        Ok(code) => Some(
            code.render::<Dense1x2>()
                .dark_color(Dense1x2::Light)
                .light_color(Dense1x2::Dark)
                .quiet_zone(true)
                .build(),
        ),
        Err(e) => {
            warn!("Pairing code cannot be drawn as a QR code: {}", e);
            None
        }
    }
}

/// Print session events until the session terminates or the manager goes away
pub fn spawn_console(mut events: broadcast::Receiver<SessionEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    println!("{}", render(&event));
                    if let SessionEvent::StateChanged(SessionState::Terminated) = event {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Operator console skipped {} session events", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
