// STOMP 1.2 over a WebSocket.
//
// The broker endpoint may be given as ws(s):// or as the http(s):// URL a
// browser would hand to SockJS; the latter is rewritten to SockJS's raw
// WebSocket path (`<endpoint>/websocket`). After the STOMP handshake a reader
// task owns the receive half and forwards frames through a bounded channel.

use std::time::Duration;

use chatgen_common::protocol::stomp::{Command, Frame, STOMP_VERSION};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use super::{BusTransport, TransportConnector, TransportError, TransportEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_BUFFER: usize = 256;
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const RECEIPT_TIMEOUT: Duration = Duration::from_secs(2);
const DISCONNECT_RECEIPT: &str = "chatgen-disconnect";

/// Normalize a configured bus endpoint into a WebSocket URL.
pub fn resolve_endpoint(raw: &str) -> Result<Url, TransportError> {
    let invalid = |reason: String| TransportError::Connect { endpoint: raw.to_string(), reason };

    let mut url = Url::parse(raw.trim()).map_err(|error| invalid(error.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(url),
        "http" => "ws",
        "https" => "wss",
        other => return Err(invalid(format!("unsupported scheme `{other}`"))),
    };
    url.set_scheme(scheme).map_err(|()| invalid("cannot rewrite scheme".to_string()))?;

    if !url.path().ends_with("/websocket") {
        let path = format!("{}/websocket", url.path().trim_end_matches('/'));
        url.set_path(&path);
    }
    Ok(url)
}

#[derive(Debug, Clone)]
pub struct StompWsConnector {
    endpoint: Url,
    handshake_timeout: Duration,
}

impl StompWsConnector {
    pub fn new(endpoint: &str) -> Result<Self, TransportError> {
        Ok(Self { endpoint: resolve_endpoint(endpoint)?, handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT })
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

impl TransportConnector for StompWsConnector {
    type Transport = StompWsTransport;

    fn open(&self) -> StompWsTransport {
        StompWsTransport::new(self.endpoint.clone(), self.handshake_timeout)
    }
}

pub struct StompWsTransport {
    endpoint: Url,
    handshake_timeout: Duration,
    writer: Option<SplitSink<WsStream, WsMessage>>,
    events: Option<mpsc::Receiver<TransportEvent>>,
    reader: Option<JoinHandle<()>>,
    connected: bool,
}

impl StompWsTransport {
    pub fn new(endpoint: Url, handshake_timeout: Duration) -> Self {
        Self { endpoint, handshake_timeout, writer: None, events: None, reader: None, connected: false }
    }

    async fn write_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(TransportError::Closed("not connected".to_string()));
        };
        if let Err(error) = writer.send(WsMessage::Text(frame.encode().into())).await {
            self.connected = false;
            return Err(TransportError::Io(error.to_string()));
        }
        Ok(())
    }
}

impl Drop for StompWsTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl BusTransport for StompWsTransport {
    async fn connect(&mut self, authorization: &str) -> Result<(), TransportError> {
        let endpoint = self.endpoint.to_string();
        let connect_error =
            |reason: String| TransportError::Connect { endpoint: endpoint.clone(), reason };

        let (socket, _) = timeout(self.handshake_timeout, connect_async(endpoint.as_str()))
            .await
            .map_err(|_| connect_error("websocket handshake timed out".to_string()))?
            .map_err(|error| connect_error(error.to_string()))?;
        let (mut writer, mut reader) = socket.split();

        let connect = Frame::new(Command::Connect)
            .header("accept-version", STOMP_VERSION)
            .header("host", self.endpoint.host_str().unwrap_or("localhost"))
            .header("heart-beat", "0,0")
            .header("Authorization", authorization);
        writer
            .send(WsMessage::Text(connect.encode().into()))
            .await
            .map_err(|error| TransportError::Io(error.to_string()))?;

        timeout(self.handshake_timeout, await_connected(&mut reader))
            .await
            .map_err(|_| connect_error("STOMP handshake timed out".to_string()))??;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        self.reader = Some(tokio::spawn(forward_frames(reader, tx)));
        self.writer = Some(writer);
        self.events = Some(rx);
        self.connected = true;
        debug!(endpoint = %self.endpoint, "STOMP session established");
        Ok(())
    }

    async fn subscribe(&mut self, id: &str, destination: &str) -> Result<(), TransportError> {
        let frame = Frame::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto");
        self.write_frame(frame).await
    }

    async fn unsubscribe(&mut self, id: &str) -> Result<(), TransportError> {
        self.write_frame(Frame::new(Command::Unsubscribe).header("id", id)).await
    }

    async fn send(&mut self, destination: &str, body: &str) -> Result<(), TransportError> {
        let frame = Frame::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .body(body);
        self.write_frame(frame).await
    }

    async fn next_event(&mut self) -> TransportEvent {
        let Some(events) = self.events.as_mut() else {
            return TransportEvent::Closed { reason: "not connected".to_string() };
        };
        let event = events
            .recv()
            .await
            .unwrap_or_else(|| TransportEvent::Closed { reason: "reader stopped".to_string() });
        if matches!(event, TransportEvent::Closed { .. }) {
            self.connected = false;
        }
        event
    }

    async fn disconnect(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if self.connected {
                let frame = Frame::new(Command::Disconnect).header("receipt", DISCONNECT_RECEIPT);
                let sent = writer.send(WsMessage::Text(frame.encode().into())).await.is_ok();
                if let (true, Some(events)) = (sent, self.events.as_mut()) {
                    let receipt = timeout(RECEIPT_TIMEOUT, async {
                        while let Some(event) = events.recv().await {
                            match event {
                                TransportEvent::Receipt { id } if id == DISCONNECT_RECEIPT => break,
                                TransportEvent::Closed { .. } => break,
                                _ => {}
                            }
                        }
                    })
                    .await;
                    if receipt.is_err() {
                        debug!(endpoint = %self.endpoint, "no DISCONNECT receipt before timeout");
                    }
                }
            }
            let _ = writer.close().await;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.events = None;
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

async fn await_connected(reader: &mut SplitStream<WsStream>) -> Result<(), TransportError> {
    while let Some(message) = reader.next().await {
        let text = match message {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(close)) => {
                let reason = close.map(|frame| frame.reason.to_string()).unwrap_or_default();
                return Err(TransportError::Closed(format!("closed during handshake {reason}")));
            }
            Ok(_) => continue,
            Err(error) => return Err(TransportError::Io(error.to_string())),
        };

        match Frame::decode(text.as_str()) {
            Ok(Some(frame)) if frame.command == Command::Connected => return Ok(()),
            Ok(Some(frame)) if frame.command == Command::Error => {
                return Err(TransportError::Rejected(error_reason(&frame)));
            }
            Ok(Some(frame)) => {
                return Err(TransportError::Protocol(format!(
                    "expected CONNECTED, got {}",
                    frame.command
                )));
            }
            Ok(None) => continue,
            Err(error) => return Err(TransportError::Protocol(error.to_string())),
        }
    }
    Err(TransportError::Closed("stream ended during handshake".to_string()))
}

async fn forward_frames(mut reader: SplitStream<WsStream>, tx: mpsc::Sender<TransportEvent>) {
    let reason = loop {
        let text = match reader.next().await {
            Some(Ok(WsMessage::Text(text))) => text,
            Some(Ok(WsMessage::Close(close))) => {
                break close
                    .map(|frame| frame.reason.to_string())
                    .filter(|reason| !reason.is_empty())
                    .unwrap_or_else(|| "closed by broker".to_string());
            }
            Some(Ok(_)) => continue,
            Some(Err(error)) => break error.to_string(),
            None => break "stream ended".to_string(),
        };

        let frame = match Frame::decode(text.as_str()) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(error) => {
                warn!(%error, "dropping malformed STOMP frame");
                continue;
            }
        };

        match frame.command {
            Command::Message => {
                let event = TransportEvent::Message {
                    destination: frame.get("destination").unwrap_or_default().to_string(),
                    body: frame.body,
                };
                match tx.try_send(event) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => debug!("inbound buffer full, dropping MESSAGE"),
                    Err(TrySendError::Closed(_)) => return,
                }
            }
            Command::Receipt => {
                let id = frame.get("receipt-id").unwrap_or_default().to_string();
                if tx.send(TransportEvent::Receipt { id }).await.is_err() {
                    return;
                }
            }
            Command::Error => break error_reason(&frame),
            other => debug!(command = %other, "ignoring unexpected frame"),
        }
    };

    let _ = tx.send(TransportEvent::Closed { reason }).await;
}

fn error_reason(frame: &Frame) -> String {
    match frame.get("message") {
        Some(message) if !message.is_empty() => message.to_string(),
        _ if !frame.body.is_empty() => frame.body.clone(),
        _ => "broker sent ERROR".to_string(),
    }
}
