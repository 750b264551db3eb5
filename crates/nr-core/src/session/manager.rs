//! Session manager
//!
//! Owns the one transport session of the process. Every state transition and
//! every send goes through the same lock, so a send that saw `Ready` finishes
//! before any transition can land, and the transport never sees two
//! operations at once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, watch, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::message::{DispatchResult, OutboundMessage};
use crate::session::SessionState;
use crate::transport::{EventStream, Transport, TransportEvent};

const STATUS_BUFFER: usize = 64;

/// Operator-facing notification emitted by the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session moved to a new state
    StateChanged(SessionState),
    /// Every attempt to start the handshake failed
    InitializationFailed { attempts: u32, error: String },
}

/// Session manager that handles the messaging session lifecycle
pub struct SessionManager {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    state: Mutex<SessionState>,
    state_tx: watch::Sender<SessionState>,
    events_tx: broadcast::Sender<SessionEvent>,
    event_stream: std::sync::Mutex<Option<EventStream>>,
    started: AtomicBool,
}

impl SessionManager {
    /// Create a manager that exclusively owns `transport` and its event stream
    pub fn new(transport: Arc<dyn Transport>, events: EventStream, config: SessionConfig) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Uninitialized);
        let (events_tx, _) = broadcast::channel(STATUS_BUFFER);

        Self {
            transport,
            config,
            state: Mutex::new(SessionState::Uninitialized),
            state_tx,
            events_tx,
            event_stream: std::sync::Mutex::new(Some(events)),
            started: AtomicBool::new(false),
        }
    }

    /// Latest known state; never waits on the session lock
    pub fn current_state(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    /// Follow state changes
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Follow operator-facing events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Start pairing in the background.
    ///
    /// Only the first call on an uninitialized session does anything.
    /// Failures never surface here; they show up as state.
    pub fn initialize(self: &Arc<Self>) {
        if !matches!(self.current_state(), SessionState::Uninitialized) {
            debug!("Session already past initialization");
            return;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Session initialization already in progress");
            return;
        }

        let events = self
            .event_stream
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());

        if let Some(mut events) = events {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    manager.handle_event(event).await;
                }
                manager
                    .handle_event(TransportEvent::Error(
                        "transport event stream ended".to_string(),
                    ))
                    .await;
            });
        }

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run_handshake().await;
        });
    }

    /// Apply one transport event to the state machine
    pub async fn handle_event(&self, event: TransportEvent) {
        let mut guard = self.state.lock().await;
        match guard.apply(&event) {
            Some(next) => self.transition(&mut guard, next),
            None => debug!("Ignoring {:?} in state {}", event, *guard),
        }
    }

    /// Send `body` to an already-normalized recipient.
    ///
    /// Fails fast with `SessionNotReady` unless the session is `Ready`.
    pub async fn send(&self, recipient: &str, body: &str) -> DispatchResult {
        let mut guard = self.state.lock().await;
        if !guard.is_ready() {
            debug!("Rejecting send to {} while {}", recipient, *guard);
            return DispatchResult::not_ready();
        }

        let timeout = self.config.send_timeout();
        match tokio::time::timeout(timeout, self.transport.send_message(recipient, body)).await {
            Ok(Ok(())) => DispatchResult::sent(),
            Ok(Err(e)) => {
                warn!("Send to {} failed: {}", recipient, e);
                if e.invalidates_session() {
                    if let Some(next) = guard.apply(&TransportEvent::Error(e.to_string())) {
                        self.transition(&mut guard, next);
                    }
                }
                DispatchResult::delivery_failed(e.to_string())
            }
            Err(_) => {
                warn!("Send to {} timed out after {:?}", recipient, timeout);
                DispatchResult::delivery_failed(format!(
                    "send timed out after {}s",
                    timeout.as_secs()
                ))
            }
        }
    }

    /// Send an outbound message, logging the outcome against its id
    pub async fn dispatch(&self, message: &OutboundMessage) -> DispatchResult {
        info!(
            "Dispatching message {} to {}",
            message.id, message.recipient_normalized
        );

        let result = self.send(&message.recipient_normalized, &message.body).await;

        if result.ok {
            info!("Message {} delivered", message.id);
        } else {
            debug!("Message {} not delivered: {:?}", message.id, result);
        }
        result
    }

    /// Close the transport and move to `Terminated`
    pub async fn shutdown(&self) {
        let mut guard = self.state.lock().await;
        if guard.is_terminated() {
            return;
        }

        if self.started.load(Ordering::SeqCst) {
            match tokio::time::timeout(self.config.send_timeout(), self.transport.close()).await {
                Ok(Ok(())) => info!("Transport session closed"),
                Ok(Err(e)) => warn!("Error closing transport session: {}", e),
                Err(_) => warn!("Timed out closing transport session"),
            }
        }

        self.transition(&mut guard, SessionState::Terminated);
    }

    /// Try to start the handshake, up to the configured number of attempts
    async fn run_handshake(&self) {
        let attempts = self.config.init_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            {
                let guard = self.state.lock().await;
                if guard.is_terminated() {
                    return;
                }

                match tokio::time::timeout(self.config.send_timeout(), self.transport.initialize())
                    .await
                {
                    Ok(Ok(())) => {
                        info!("Pairing handshake started (attempt {}/{})", attempt, attempts);
                        return;
                    }
                    Ok(Err(e)) => last_error = e.to_string(),
                    Err(_) => last_error = "handshake start timed out".to_string(),
                }
            }

            warn!(
                "Session initialization attempt {}/{} failed: {}",
                attempt, attempts, last_error
            );
            if attempt < attempts {
                tokio::time::sleep(self.config.init_retry_delay()).await;
            }
        }

        error!(
            "Session initialization failed after {} attempts: {}",
            attempts, last_error
        );

        {
            let mut guard = self.state.lock().await;
            let event = TransportEvent::Error(format!("initialization failed: {}", last_error));
            if let Some(next) = guard.apply(&event) {
                self.transition(&mut guard, next);
            }
        }

        let _ = self.events_tx.send(SessionEvent::InitializationFailed {
            attempts,
            error: last_error,
        });
    }

    fn transition(&self, guard: &mut MutexGuard<'_, SessionState>, next: SessionState) {
        match &next {
            SessionState::AwaitingPairing { .. } => {
                info!("Pairing code issued, waiting for a device to scan it")
            }
            SessionState::Ready { since } => info!("Session ready since {}", since),
            SessionState::Degraded { reason, .. } => warn!("Session degraded: {}", reason),
            SessionState::Terminated => info!("Session terminated"),
            SessionState::Uninitialized => {}
        }

        **guard = next.clone();
        self.state_tx.send_replace(next.clone());
        // No subscribers is fine; the console may not be attached
        let _ = self.events_tx.send(SessionEvent::StateChanged(next));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::transport::TransportError;

    #[derive(Default)]
    struct MockTransport {
        init_calls: AtomicUsize,
        init_failures: AtomicUsize,
        close_calls: AtomicUsize,
        sent: std::sync::Mutex<Vec<(String, String)>>,
        fail_with: std::sync::Mutex<Option<TransportError>>,
        send_delay: Option<Duration>,
    }

    impl MockTransport {
        fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn initialize(&self) -> Result<(), TransportError> {
            self.init_calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.init_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.init_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(TransportError::Network("bridge unreachable".to_string()));
            }
            Ok(())
        }

        async fn send_message(&self, recipient: &str, body: &str) -> Result<(), TransportError> {
            if let Some(delay) = self.send_delay {
                tokio::time::sleep(delay).await;
            }
            self.sent
                .lock()
                .unwrap()
                .push((recipient.to_string(), body.to_string()));
            match self.fail_with.lock().unwrap().clone() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        async fn close(&self) -> Result<(), TransportError> {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_config() -> SessionConfig {
        SessionConfig {
            send_timeout_secs: 1,
            init_attempts: 2,
            init_retry_delay_secs: 0,
            ..Default::default()
        }
    }

    fn setup(
        transport: MockTransport,
    ) -> (Arc<SessionManager>, Arc<MockTransport>, mpsc::Sender<TransportEvent>) {
        let transport = Arc::new(transport);
        let (tx, rx) = mpsc::channel(8);
        let manager = Arc::new(SessionManager::new(transport.clone(), rx, test_config()));
        (manager, transport, tx)
    }

    async fn wait_for_state(manager: &SessionManager, pred: impl FnMut(&SessionState) -> bool) {
        let mut rx = manager.watch_state();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
            .await
            .expect("state not reached in time")
            .expect("state channel closed");
    }

    async fn wait_for_init_calls(transport: &MockTransport, calls: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while transport.init_calls.load(Ordering::SeqCst) < calls {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("handshake not attempted in time");
    }

    async fn make_ready(manager: &Arc<SessionManager>, tx: &mpsc::Sender<TransportEvent>) {
        manager.initialize();
        tx.send(TransportEvent::Ready).await.unwrap();
        wait_for_state(manager, |s| s.is_ready()).await;
    }

    #[tokio::test]
    async fn test_starts_uninitialized() {
        let (manager, transport, _tx) = setup(MockTransport::default());
        assert_eq!(manager.current_state(), SessionState::Uninitialized);
        assert_eq!(transport.init_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let (manager, transport, tx) = setup(MockTransport::default());
        manager.initialize();
        manager.initialize();

        tx.send(TransportEvent::PairingCode("code".to_string()))
            .await
            .unwrap();
        wait_for_state(&manager, |s| matches!(s, SessionState::AwaitingPairing { .. })).await;
        wait_for_init_calls(&transport, 1).await;
        manager.initialize();

        tokio::task::yield_now().await;
        assert_eq!(transport.init_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pairing_emits_payload() {
        let (manager, _transport, tx) = setup(MockTransport::default());
        let mut events = manager.subscribe();
        manager.initialize();

        tx.send(TransportEvent::PairingCode("2@pairing".to_string()))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            SessionEvent::StateChanged(SessionState::AwaitingPairing {
                payload: "2@pairing".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_send_not_ready_skips_transport() {
        let (manager, transport, tx) = setup(MockTransport::default());
        assert_eq!(manager.send("1@c.us", "hi").await, DispatchResult::not_ready());

        manager.initialize();
        tx.send(TransportEvent::PairingCode("code".to_string()))
            .await
            .unwrap();
        wait_for_state(&manager, |s| matches!(s, SessionState::AwaitingPairing { .. })).await;

        assert_eq!(manager.send("1@c.us", "hi").await, DispatchResult::not_ready());
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_send_when_ready() {
        let (manager, transport, tx) = setup(MockTransport::default());
        make_ready(&manager, &tx).await;

        let result = manager.send("15551234567@c.us", "hello").await;
        assert_eq!(result, DispatchResult::sent());
        assert_eq!(
            transport.sent(),
            vec![("15551234567@c.us".to_string(), "hello".to_string())]
        );
    }

    #[tokio::test]
    async fn test_delivery_failure_keeps_state() {
        let transport = MockTransport::default();
        *transport.fail_with.lock().unwrap() = Some(TransportError::Rejected("no such user".to_string()));
        let (manager, _transport, tx) = setup(transport);
        make_ready(&manager, &tx).await;

        let result = manager.send("1@c.us", "hello").await;
        assert_eq!(
            result,
            DispatchResult::delivery_failed("recipient rejected: no such user")
        );
        assert!(manager.current_state().is_ready());
    }

    #[tokio::test]
    async fn test_invalidation_degrades() {
        let transport = MockTransport::default();
        *transport.fail_with.lock().unwrap() =
            Some(TransportError::SessionInvalidated("logged out".to_string()));
        let (manager, _transport, tx) = setup(transport);
        make_ready(&manager, &tx).await;

        let result = manager.send("1@c.us", "hello").await;
        assert!(!result.ok);
        assert!(matches!(manager.current_state(), SessionState::Degraded { .. }));
        assert_eq!(manager.send("1@c.us", "hello").await, DispatchResult::not_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_timeout_is_delivery_failure() {
        let transport = MockTransport {
            send_delay: Some(Duration::from_secs(10)),
            ..Default::default()
        };
        let (manager, _transport, tx) = setup(transport);
        make_ready(&manager, &tx).await;

        let result = manager.send("1@c.us", "hello").await;
        assert_eq!(result, DispatchResult::delivery_failed("send timed out after 1s"));
        assert!(manager.current_state().is_ready());
    }

    #[tokio::test]
    async fn test_transport_error_degrades_then_recovers() {
        let (manager, _transport, tx) = setup(MockTransport::default());
        make_ready(&manager, &tx).await;

        tx.send(TransportEvent::Error("connection lost".to_string()))
            .await
            .unwrap();
        wait_for_state(&manager, |s| matches!(s, SessionState::Degraded { .. })).await;

        tx.send(TransportEvent::Ready).await.unwrap();
        wait_for_state(&manager, |s| s.is_ready()).await;
    }

    #[tokio::test]
    async fn test_closed_event_stream_degrades() {
        let (manager, _transport, tx) = setup(MockTransport::default());
        make_ready(&manager, &tx).await;

        drop(tx);
        wait_for_state(&manager, |s| matches!(s, SessionState::Degraded { .. })).await;
    }

    #[tokio::test]
    async fn test_initialization_retries_then_succeeds() {
        let transport = MockTransport::default();
        transport.init_failures.store(1, Ordering::SeqCst);
        let (manager, transport, tx) = setup(transport);

        manager.initialize();
        tx.send(TransportEvent::PairingCode("code".to_string()))
            .await
            .unwrap();
        wait_for_state(&manager, |s| matches!(s, SessionState::AwaitingPairing { .. })).await;

        // the retry happens in the background
        wait_for_init_calls(&transport, 2).await;
    }

    #[tokio::test]
    async fn test_initialization_exhausted() {
        let transport = MockTransport::default();
        transport.init_failures.store(5, Ordering::SeqCst);
        let (manager, transport, _tx) = setup(transport);
        let mut events = manager.subscribe();

        manager.initialize();

        let failure = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(SessionEvent::InitializationFailed { attempts, error }) = events.recv().await {
                    return (attempts, error);
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(failure.0, 2);
        assert!(failure.1.contains("bridge unreachable"));
        assert_eq!(transport.init_calls.load(Ordering::SeqCst), 2);
        assert!(matches!(manager.current_state(), SessionState::Degraded { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_terminates() {
        let (manager, transport, tx) = setup(MockTransport::default());
        make_ready(&manager, &tx).await;

        manager.shutdown().await;
        assert_eq!(manager.current_state(), SessionState::Terminated);
        assert_eq!(transport.close_calls.load(Ordering::SeqCst), 1);

        // absorbing
        manager.handle_event(TransportEvent::Ready).await;
        assert_eq!(manager.current_state(), SessionState::Terminated);
        assert_eq!(manager.send("1@c.us", "hi").await, DispatchResult::not_ready());

        manager.shutdown().await;
        assert_eq!(transport.close_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_before_initialize_skips_close() {
        let (manager, transport, _tx) = setup(MockTransport::default());
        manager.shutdown().await;
        assert_eq!(manager.current_state(), SessionState::Terminated);
        assert_eq!(transport.close_calls.load(Ordering::SeqCst), 0);

        manager.initialize();
        assert_eq!(transport.init_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dispatch_outbound_message() {
        let (manager, transport, tx) = setup(MockTransport::default());
        make_ready(&manager, &tx).await;

        let message = OutboundMessage::new("+15551234567", "@c.us", "disk full");
        assert!(manager.dispatch(&message).await.ok);
        assert_eq!(
            transport.sent(),
            vec![("15551234567@c.us".to_string(), "disk full".to_string())]
        );
    }
}
