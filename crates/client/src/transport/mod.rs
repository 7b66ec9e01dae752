// Bus transport abstraction.
//
// A Session talks to the broker through `BusTransport`; the production
// implementation is STOMP over WebSocket (`stomp_ws`), tests use in-memory
// mocks. A `TransportConnector` hands out a fresh, unconnected transport for
// every connect attempt so a stale handle is never reused after a failure.

pub mod stomp_ws;

use std::future::Future;

use thiserror::Error;

pub use stomp_ws::{StompWsConnector, StompWsTransport};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },
    #[error("broker rejected the connection: {0}")]
    Rejected(String),
    #[error("connection closed: {0}")]
    Closed(String),
    #[error("transport i/o failed: {0}")]
    Io(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Something the broker pushed to us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message { destination: String, body: String },
    Receipt { id: String },
    Closed { reason: String },
}

/// One connection to the message bus.
pub trait BusTransport: Send + 'static {
    /// Open the connection, presenting `authorization` (a `Bearer ...` value)
    /// in the connect headers.
    fn connect(
        &mut self,
        authorization: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn subscribe(
        &mut self,
        id: &str,
        destination: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn unsubscribe(&mut self, id: &str) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn send(
        &mut self,
        destination: &str,
        body: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Wait for the next inbound event. Must be cancel-safe.
    fn next_event(&mut self) -> impl Future<Output = TransportEvent> + Send;

    /// Close the connection. Best effort, never fails.
    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;

    fn is_connected(&self) -> bool;
}

/// Factory for fresh transports.
pub trait TransportConnector: Send + Sync + 'static {
    type Transport: BusTransport;

    fn open(&self) -> Self::Transport;
}
