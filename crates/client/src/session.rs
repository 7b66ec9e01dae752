// Bus session: one authenticated connection with its subscriptions.
//
// Owns at most one transport at a time. A connect failure runs a single
// refresh-and-retry cycle guarded by the `reconnecting` flag; repeated
// cycles with backoff between them are driven by `connect_with_backoff`,
// never by recursion.
//
// Sends never fail the caller. While disconnected they are dropped, counted
// and logged so fixed-rate publishers survive transient outages.

use std::collections::HashMap;
use std::time::Duration;

use chatgen_common::protocol::chat::ChatMessage;
use serde::Serialize;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::auth::{Credential, CredentialRefresher, RefreshError};
use crate::transport::{BusTransport, TransportConnector, TransportError, TransportEvent};

// ── Configuration ───────────────────────────────────────────────────

/// Bounds on reconnect cycles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

// ── Errors and outcomes ─────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a reconnect is already in progress for this session")]
    ReconnectInProgress,
    #[error(transparent)]
    Connect(#[from] TransportError),
    #[error("reauthentication required after connect failure ({connect_error}): {source}")]
    ReauthenticationRequired {
        connect_error: String,
        #[source]
        source: RefreshError,
    },
    #[error("gave up after {attempts} consecutive connect failures: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
}

/// What happened to an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Dropped,
}

/// Result of waiting for the next inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A chat message was parsed and handed to the destination's handler.
    Delivered { destination: String },
    /// Nothing subscribed to the destination, or a frame with no payload.
    Ignored,
    Malformed { destination: String, error: String },
    ConnectionLost { reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub sent: u64,
    pub dropped: u64,
    pub received: u64,
}

impl std::ops::AddAssign for SessionStats {
    fn add_assign(&mut self, other: Self) {
        self.sent += other.sent;
        self.dropped += other.dropped;
        self.received += other.received;
    }
}

pub type MessageHandler = Box<dyn FnMut(ChatMessage) + Send>;

struct Subscription {
    id: String,
    handler: MessageHandler,
}

// ── Session ─────────────────────────────────────────────────────────

pub struct Session<C: TransportConnector, R: CredentialRefresher> {
    identity: String,
    connector: C,
    refresher: R,
    policy: ReconnectPolicy,
    transport: Option<C::Transport>,
    credential: Option<Credential>,
    subscriptions: HashMap<String, Subscription>,
    state: ConnectionState,
    reconnecting: bool,
    consecutive_failures: u32,
    next_subscription_id: u64,
    stats: SessionStats,
}

impl<C: TransportConnector, R: CredentialRefresher> Session<C, R> {
    pub fn new(identity: impl Into<String>, connector: C, refresher: R) -> Self {
        Self {
            identity: identity.into(),
            connector,
            refresher,
            policy: ReconnectPolicy::default(),
            transport: None,
            credential: None,
            subscriptions: HashMap::new(),
            state: ConnectionState::Disconnected,
            reconnecting: false,
            consecutive_failures: 0,
            next_subscription_id: 0,
            stats: SessionStats::default(),
        }
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
            && self.transport.as_ref().is_some_and(|transport| transport.is_connected())
    }

    /// The credential of the last successful connect or refresh.
    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting
    }

    pub fn is_subscribed(&self, destination: &str) -> bool {
        self.subscriptions.contains_key(destination)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Connect with `credential`. On failure, refresh the credential once and
    /// retry once; a failure of that retry is returned as-is.
    pub async fn connect(&mut self, credential: Credential) -> Result<(), SessionError> {
        if self.reconnecting {
            warn!(session = %self.identity, "connect rejected: reconnect already in progress");
            return Err(SessionError::ReconnectInProgress);
        }
        if self.transport.is_some() {
            self.drop_transport().await;
            self.subscriptions.clear();
        }

        match self.attempt(&credential).await {
            Ok(()) => Ok(()),
            Err(error) => self.reconnect_after(error).await,
        }
    }

    /// Repeat [`Session::connect`] with exponential backoff until it succeeds,
    /// reauthentication is required, or the policy's attempt bound is hit.
    pub async fn connect_with_backoff(&mut self, credential: Credential) -> Result<(), SessionError> {
        let mut credential = credential;
        loop {
            match self.connect(credential.clone()).await {
                Ok(()) => return Ok(()),
                Err(SessionError::Connect(error)) => {
                    if !self.should_reconnect() {
                        error!(
                            session = %self.identity,
                            attempts = self.consecutive_failures,
                            %error,
                            "giving up on connect"
                        );
                        return Err(SessionError::RetriesExhausted {
                            attempts: self.consecutive_failures,
                            last_error: error.to_string(),
                        });
                    }
                    let delay = self.reconnect_delay();
                    warn!(
                        session = %self.identity,
                        failures = self.consecutive_failures,
                        delay_ms = delay.as_millis() as u64,
                        "connect cycle failed, backing off"
                    );
                    sleep(delay).await;
                    if let Some(latest) = &self.credential {
                        credential = latest.clone();
                    }
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Register `handler` for chat messages on `destination`, replacing any
    /// earlier handler. Returns false (and logs) when not connected.
    pub async fn subscribe<F>(&mut self, destination: &str, handler: F) -> bool
    where
        F: FnMut(ChatMessage) + Send + 'static,
    {
        if !self.is_connected() {
            warn!(session = %self.identity, destination, "subscribe ignored: not connected");
            return false;
        }
        if let Some(existing) = self.subscriptions.get_mut(destination) {
            existing.handler = Box::new(handler);
            debug!(session = %self.identity, destination, "subscription handler replaced");
            return true;
        }

        let id = format!("sub-{}", self.next_subscription_id);
        self.next_subscription_id += 1;
        let Some(transport) = self.transport.as_mut() else {
            return false;
        };
        if let Err(error) = transport.subscribe(&id, destination).await {
            warn!(session = %self.identity, destination, %error, "subscribe failed");
            self.mark_lost();
            return false;
        }

        self.subscriptions.insert(destination.to_string(), Subscription { id, handler: Box::new(handler) });
        debug!(session = %self.identity, destination, "subscribed");
        true
    }

    pub async fn unsubscribe(&mut self, destination: &str) {
        let Some(subscription) = self.subscriptions.remove(destination) else {
            return;
        };
        if let Some(transport) = self.transport.as_mut().filter(|transport| transport.is_connected()) {
            if let Err(error) = transport.unsubscribe(&subscription.id).await {
                debug!(session = %self.identity, destination, %error, "unsubscribe not delivered");
            }
        }
    }

    /// Serialize `payload` as JSON and publish it to `destination`.
    pub async fn send<T>(&mut self, destination: &str, payload: &T) -> Delivery
    where
        T: Serialize + Sync + ?Sized,
    {
        if !self.is_connected() {
            return self.drop_send(destination, "not connected");
        }
        let body = match serde_json::to_string(payload) {
            Ok(body) => body,
            Err(error) => return self.drop_send(destination, &error.to_string()),
        };
        let Some(transport) = self.transport.as_mut() else {
            return self.drop_send(destination, "not connected");
        };

        match transport.send(destination, &body).await {
            Ok(()) => {
                self.stats.sent += 1;
                Delivery::Sent
            }
            Err(error) => {
                self.mark_lost();
                self.drop_send(destination, &error.to_string())
            }
        }
    }

    /// Wait for the next inbound frame and dispatch it. Pends forever while
    /// disconnected, so it is safe to race in a `select!`. Cancel-safe.
    pub async fn next_event(&mut self) -> SessionEvent {
        if self.state != ConnectionState::Connected {
            return std::future::pending().await;
        }
        let Some(transport) = self.transport.as_mut() else {
            return std::future::pending().await;
        };

        match transport.next_event().await {
            TransportEvent::Message { destination, body } => self.dispatch(destination, &body),
            TransportEvent::Receipt { .. } => SessionEvent::Ignored,
            TransportEvent::Closed { reason } => {
                warn!(session = %self.identity, %reason, "connection lost");
                self.mark_lost();
                SessionEvent::ConnectionLost { reason }
            }
        }
    }

    /// Tear down the transport and forget every subscription. Also clears a
    /// reconnect left pending by a cancelled connect.
    pub async fn disconnect(&mut self) {
        if self.transport.is_some() {
            self.state = ConnectionState::Disconnecting;
        }
        self.drop_transport().await;
        self.subscriptions.clear();
        self.reconnecting = false;
        if self.state != ConnectionState::Disconnected {
            info!(session = %self.identity, "disconnected");
        }
        self.state = ConnectionState::Disconnected;
    }

    /// Backoff before the next connect cycle.
    pub fn reconnect_delay(&self) -> Duration {
        let exp = self.consecutive_failures.min(7);
        self.policy.base_delay.saturating_mul(1u32 << exp).min(self.policy.max_delay)
    }

    pub fn should_reconnect(&self) -> bool {
        self.consecutive_failures < self.policy.max_attempts
    }

    async fn attempt(&mut self, credential: &Credential) -> Result<(), TransportError> {
        self.state = ConnectionState::Connecting;
        if !credential.is_valid_now() {
            self.state = ConnectionState::Disconnected;
            return Err(TransportError::Rejected(format!(
                "credential for `{}` expired at {}",
                credential.subject, credential.expires_at
            )));
        }

        let mut transport = self.connector.open();
        match transport.connect(&credential.bearer()).await {
            Ok(()) => {
                self.transport = Some(transport);
                self.credential = Some(credential.clone());
                self.state = ConnectionState::Connected;
                self.consecutive_failures = 0;
                info!(session = %self.identity, subject = %credential.subject, "connected");
                Ok(())
            }
            Err(error) => {
                transport.disconnect().await;
                self.state = ConnectionState::Disconnected;
                Err(error)
            }
        }
    }

    async fn reconnect_after(&mut self, error: TransportError) -> Result<(), SessionError> {
        warn!(session = %self.identity, %error, "connect failed, refreshing credential");
        self.reconnecting = true;
        self.state = ConnectionState::Reconnecting;

        let fresh = match self.refresher.refresh().await {
            Ok(credential) => credential,
            Err(source) => {
                self.reconnecting = false;
                self.state = ConnectionState::Disconnected;
                self.consecutive_failures += 1;
                error!(session = %self.identity, %source, "credential refresh failed");
                return Err(SessionError::ReauthenticationRequired {
                    connect_error: error.to_string(),
                    source,
                });
            }
        };

        self.credential = Some(fresh.clone());
        self.drop_transport().await;
        self.subscriptions.clear();
        sleep(self.reconnect_delay()).await;

        let result = self.attempt(&fresh).await;
        self.reconnecting = false;
        if let Err(retry_error) = result {
            self.consecutive_failures += 1;
            self.state = ConnectionState::Disconnected;
            warn!(
                session = %self.identity,
                failures = self.consecutive_failures,
                error = %retry_error,
                "reconnect failed"
            );
            return Err(SessionError::Connect(retry_error));
        }
        Ok(())
    }

    fn dispatch(&mut self, destination: String, body: &str) -> SessionEvent {
        let Some(subscription) = self.subscriptions.get_mut(&destination) else {
            debug!(session = %self.identity, %destination, "message for unknown destination");
            return SessionEvent::Ignored;
        };
        match serde_json::from_str::<ChatMessage>(body) {
            Ok(message) => {
                self.stats.received += 1;
                (subscription.handler)(message);
                SessionEvent::Delivered { destination }
            }
            Err(error) => {
                warn!(session = %self.identity, %destination, %error, "unparseable message body");
                SessionEvent::Malformed { destination, error: error.to_string() }
            }
        }
    }

    fn drop_send(&mut self, destination: &str, reason: &str) -> Delivery {
        self.stats.dropped += 1;
        warn!(session = %self.identity, destination, reason, "send dropped");
        Delivery::Dropped
    }

    fn mark_lost(&mut self) {
        self.transport = None;
        self.subscriptions.clear();
        self.state = ConnectionState::Disconnected;
    }

    async fn drop_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.disconnect().await;
        }
    }
}
