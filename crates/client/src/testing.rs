// In-memory bus and refresher doubles shared by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::auth::{Credential, CredentialRefresher, RefreshError};
use crate::transport::{BusTransport, TransportConnector, TransportError, TransportEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect { authorization: String },
    Subscribe { id: String, destination: String },
    Unsubscribe { id: String },
    Send { destination: String, body: String },
    Disconnect,
}

#[derive(Debug, Default)]
struct BusState {
    calls: Vec<(Instant, Call)>,
    failing_connects: usize,
    always_fail: bool,
    inbound: Option<mpsc::UnboundedSender<TransportEvent>>,
}

/// Shared log and knobs behind every transport a `MockConnector` opens.
#[derive(Debug, Clone, Default)]
pub struct MockBus {
    state: Arc<Mutex<BusState>>,
}

impl MockBus {
    pub fn failing_every_connect() -> Self {
        let bus = Self::default();
        bus.lock().always_fail = true;
        bus
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.lock().failing_connects = count;
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector { bus: self.clone() }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.iter().map(|(_, call)| call.clone()).collect()
    }

    pub fn connect_count(&self) -> usize {
        self.calls().iter().filter(|call| matches!(call, Call::Connect { .. })).count()
    }

    pub fn connect_instants(&self) -> Vec<Instant> {
        self.lock()
            .calls
            .iter()
            .filter(|(_, call)| matches!(call, Call::Connect { .. }))
            .map(|(at, _)| *at)
            .collect()
    }

    pub fn sends(&self) -> Vec<(Instant, String, String)> {
        self.lock()
            .calls
            .iter()
            .filter_map(|(at, call)| match call {
                Call::Send { destination, body } => Some((*at, destination.clone(), body.clone())),
                _ => None,
            })
            .collect()
    }

    /// Deliver an event to the most recently connected transport.
    pub fn push(&self, event: TransportEvent) {
        if let Some(tx) = self.lock().inbound.as_ref() {
            let _ = tx.send(event);
        }
    }

    fn record(&self, call: Call) {
        self.lock().calls.push((Instant::now(), call));
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().expect("mock bus lock")
    }
}

#[derive(Debug, Clone)]
pub struct MockConnector {
    bus: MockBus,
}

impl TransportConnector for MockConnector {
    type Transport = MockTransport;

    fn open(&self) -> MockTransport {
        MockTransport { bus: self.bus.clone(), inbound: None }
    }
}

pub struct MockTransport {
    bus: MockBus,
    inbound: Option<mpsc::UnboundedReceiver<TransportEvent>>,
}

impl BusTransport for MockTransport {
    async fn connect(&mut self, authorization: &str) -> Result<(), TransportError> {
        self.bus.record(Call::Connect { authorization: authorization.to_string() });
        let mut state = self.bus.lock();
        if state.always_fail || state.failing_connects > 0 {
            state.failing_connects = state.failing_connects.saturating_sub(1);
            return Err(TransportError::Connect {
                endpoint: "mock://bus".to_string(),
                reason: "connection refused".to_string(),
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.inbound = Some(tx);
        self.inbound = Some(rx);
        Ok(())
    }

    async fn subscribe(&mut self, id: &str, destination: &str) -> Result<(), TransportError> {
        self.bus.record(Call::Subscribe { id: id.to_string(), destination: destination.to_string() });
        Ok(())
    }

    async fn unsubscribe(&mut self, id: &str) -> Result<(), TransportError> {
        self.bus.record(Call::Unsubscribe { id: id.to_string() });
        Ok(())
    }

    async fn send(&mut self, destination: &str, body: &str) -> Result<(), TransportError> {
        self.bus.record(Call::Send { destination: destination.to_string(), body: body.to_string() });
        Ok(())
    }

    async fn next_event(&mut self) -> TransportEvent {
        let Some(inbound) = self.inbound.as_mut() else {
            return TransportEvent::Closed { reason: "not connected".to_string() };
        };
        let event = inbound
            .recv()
            .await
            .unwrap_or_else(|| TransportEvent::Closed { reason: "bus dropped".to_string() });
        if matches!(event, TransportEvent::Closed { .. }) {
            self.inbound = None;
        }
        event
    }

    async fn disconnect(&mut self) {
        if self.inbound.take().is_some() {
            self.bus.record(Call::Disconnect);
        }
    }

    fn is_connected(&self) -> bool {
        self.inbound.is_some()
    }
}

/// Refresher that counts calls and either mints a fresh credential or fails.
#[derive(Debug, Clone, Default)]
pub struct MockRefresher {
    calls: Arc<AtomicUsize>,
    fail: bool,
}

impl MockRefresher {
    pub fn failing() -> Self {
        Self { fail: true, ..Self::default() }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CredentialRefresher for MockRefresher {
    async fn refresh(&self) -> Result<Credential, RefreshError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail {
            return Err(RefreshError::ReauthenticationRequired {
                reason: "refresh token expired".to_string(),
            });
        }
        Ok(credential(&format!("refreshed-{call}")))
    }
}

pub fn credential(token: &str) -> Credential {
    let now = crate::auth::token::current_unix_timestamp().expect("clock");
    Credential {
        subject: "tester".to_string(),
        issued_at: now,
        expires_at: now + 3600,
        token: token.to_string(),
    }
}

pub fn expired_credential(token: &str) -> Credential {
    Credential { subject: "tester".to_string(), issued_at: 1, expires_at: 2, token: token.to_string() }
}
