// Recorded-chat replay.
//
// Walks a recording in file order and re-emits each event into a room,
// sleeping the original gap between consecutive events (capped so long
// silences in a stream do not stall the replay). Without a session the
// engine runs dry and only logs what it would have sent.

use std::sync::Arc;
use std::time::Duration;

use chatgen_common::event::RecordedEvent;
use chatgen_common::protocol::chat::{publish_destination, topic_destination, ChatMessage};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::auth::CredentialRefresher;
use crate::events::EventSource;
use crate::session::{Delivery, Session, SessionEvent};
use crate::transport::TransportConnector;

pub const MAX_REPLAY_DELAY: Duration = Duration::from_millis(5_000);

/// Gap to wait before re-emitting `current`, clamped to `[0, MAX_REPLAY_DELAY]`.
pub fn replay_delay(previous: DateTime<Utc>, current: DateTime<Utc>) -> Duration {
    let cap = MAX_REPLAY_DELAY.as_millis() as i64;
    let millis = current.signed_duration_since(previous).num_milliseconds().clamp(0, cap);
    Duration::from_millis(millis as u64)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// Every event was emitted.
    Completed { sent: usize },
    /// Stopped early; `sent` events were emitted before the stop.
    Stopped { sent: usize },
    NotStarted { reason: String },
    AlreadyRunning,
}

/// Stops a running replay from another task.
#[derive(Debug, Clone)]
pub struct ReplayStopper {
    running: Arc<watch::Sender<bool>>,
}

impl ReplayStopper {
    pub fn stop(&self) {
        self.running.send_replace(false);
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }
}

pub struct ReplayEngine<C: TransportConnector, R: CredentialRefresher> {
    session: Option<Session<C, R>>,
    source: EventSource,
    room_id: String,
    buffer: Vec<RecordedEvent>,
    cursor: usize,
    running: Arc<watch::Sender<bool>>,
}

impl<C: TransportConnector, R: CredentialRefresher> ReplayEngine<C, R> {
    /// Replay through an already connected session.
    pub fn new(session: Session<C, R>, source: EventSource, room_id: impl Into<String>) -> Self {
        Self::with_session(Some(session), source, room_id)
    }

    /// Replay without a bus, logging each event instead of sending it.
    pub fn dry_run(source: EventSource, room_id: impl Into<String>) -> Self {
        Self::with_session(None, source, room_id)
    }

    fn with_session(
        session: Option<Session<C, R>>,
        source: EventSource,
        room_id: impl Into<String>,
    ) -> Self {
        Self {
            session,
            source,
            room_id: room_id.into(),
            buffer: Vec::new(),
            cursor: 0,
            running: Arc::new(watch::Sender::new(false)),
        }
    }

    pub fn stopper(&self) -> ReplayStopper {
        ReplayStopper { running: Arc::clone(&self.running) }
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    pub fn is_dry_run(&self) -> bool {
        self.session.is_none()
    }

    /// Index of the next event to emit.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn session(&self) -> Option<&Session<C, R>> {
        self.session.as_ref()
    }

    /// Load the recording and replay it to the end or until stopped.
    pub async fn start(&mut self) -> ReplayOutcome {
        if self.is_running() {
            return ReplayOutcome::AlreadyRunning;
        }

        let events = match self.source.load() {
            Ok(events) => events,
            Err(error) => {
                warn!(%error, "replay not started");
                return ReplayOutcome::NotStarted { reason: error.to_string() };
            }
        };
        if events.is_empty() {
            warn!(path = %self.source.path().display(), "recording is empty, replay not started");
            return ReplayOutcome::NotStarted { reason: "recording is empty".to_string() };
        }

        self.buffer = events;
        self.cursor = 0;
        if let Some(session) = self.session.as_mut() {
            let topic = topic_destination(&self.room_id);
            session
                .subscribe(&topic, |message: ChatMessage| {
                    debug!("[Received] {}: {}", message.sender.name, message.content);
                })
                .await;
        }
        self.running.send_replace(true);
        info!(
            events = self.buffer.len(),
            room = %self.room_id,
            dry_run = self.is_dry_run(),
            "replay started"
        );
        self.drive().await
    }

    /// Stop replaying and disconnect the session. Idempotent.
    pub async fn stop(&mut self) {
        let was_running = self.running.send_replace(false);
        if let Some(session) = self.session.as_mut() {
            session.disconnect().await;
        }
        if was_running {
            info!(sent = self.cursor, "replay stopped");
        }
    }

    async fn drive(&mut self) -> ReplayOutcome {
        let mut stop_rx = self.running.subscribe();

        while self.cursor < self.buffer.len() {
            let delay = match self.cursor {
                0 => Duration::ZERO,
                i => replay_delay(self.buffer[i - 1].published_at, self.buffer[i].published_at),
            };
            if !self.wait(delay, &mut stop_rx).await || !self.is_running() {
                break;
            }
            self.transmit().await;
            self.cursor += 1;
        }

        let sent = self.cursor;
        let completed = self.is_running();
        self.stop().await;
        if completed {
            info!(sent, "replay complete");
            ReplayOutcome::Completed { sent }
        } else {
            ReplayOutcome::Stopped { sent }
        }
    }

    /// Sleep for `delay` while draining inbound frames. Returns false if the
    /// replay was stopped first.
    async fn wait(&mut self, delay: Duration, stop_rx: &mut watch::Receiver<bool>) -> bool {
        let deadline = sleep(delay);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                biased;
                changed = stop_rx.changed() => {
                    if changed.is_err() || !*stop_rx.borrow_and_update() {
                        return false;
                    }
                }
                _ = &mut deadline => return true,
                event = next_inbound(&mut self.session) => {
                    if let SessionEvent::ConnectionLost { reason } = event {
                        warn!(%reason, "bus connection lost during replay, sends will be dropped");
                    }
                }
            }
        }
    }

    async fn transmit(&mut self) {
        let event = &self.buffer[self.cursor];
        match self.session.as_mut() {
            Some(session) => {
                let message = event.to_chat_message(&self.room_id);
                let destination = publish_destination(&self.room_id);
                if session.send(&destination, &message).await == Delivery::Sent {
                    info!("[Sent] {}: {}", event.author_name, event.body);
                }
            }
            None => info!("[Dry Run] {}: {}", event.author_name, event.body),
        }
    }
}

async fn next_inbound<C: TransportConnector, R: CredentialRefresher>(
    session: &mut Option<Session<C, R>>,
) -> SessionEvent {
    match session {
        Some(session) => session.next_event().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{credential, Call, MockBus, MockConnector, MockRefresher};
    use crate::transport::TransportEvent;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tracing_subscriber::fmt::MakeWriter;

    type TestEngine = ReplayEngine<MockConnector, MockRefresher>;

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + chrono::Duration::milliseconds(millis)
    }

    fn event(millis: i64, body: &str) -> RecordedEvent {
        RecordedEvent {
            author_id: "UC1".into(),
            author_name: "viewer".into(),
            author_avatar: "https://img.test/v.png".into(),
            body: body.into(),
            published_at: at(millis),
        }
    }

    fn recording(dir: &tempfile::TempDir, events: &[RecordedEvent]) -> EventSource {
        let source = EventSource::new(dir.path().join("chat-history-test.json"));
        source.write_all(events).expect("recording should be written");
        source
    }

    fn assert_gap(earlier: tokio::time::Instant, later: tokio::time::Instant, expected: Duration) {
        let gap = later - earlier;
        assert!(
            gap >= expected && gap <= expected + Duration::from_millis(5),
            "expected a gap of {expected:?}, got {gap:?}"
        );
    }

    async fn connected_engine(bus: &MockBus, source: EventSource) -> TestEngine {
        let mut session = Session::new("replayer", bus.connector(), MockRefresher::default());
        session.connect(credential("tok")).await.expect("connect");
        ReplayEngine::new(session, source, "1")
    }

    #[tokio::test(start_paused = true)]
    async fn replays_in_order_with_capped_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let source =
            recording(&dir, &[event(0, "first"), event(1_500, "second"), event(61_500, "third")]);
        let bus = MockBus::default();
        let mut engine = connected_engine(&bus, source).await;

        let outcome = engine.start().await;

        assert_eq!(outcome, ReplayOutcome::Completed { sent: 3 });
        let sends = bus.sends();
        let bodies: Vec<String> = sends
            .iter()
            .map(|(_, _, body)| serde_json::from_str::<serde_json::Value>(body).unwrap()["content"]
                .as_str()
                .unwrap()
                .to_string())
            .collect();
        assert_eq!(bodies, vec!["first", "second", "third"]);
        assert!(sends.iter().all(|(_, destination, _)| destination == "/publish/1"));
        assert_gap(sends[0].0, sends[1].0, Duration::from_millis(1_500));
        assert_gap(sends[1].0, sends[2].0, MAX_REPLAY_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_order_timestamps_replay_without_delay() {
        let dir = tempfile::tempdir().unwrap();
        let source = recording(&dir, &[event(5_000, "a"), event(1_000, "b")]);
        let bus = MockBus::default();
        let mut engine = connected_engine(&bus, source).await;

        assert_eq!(engine.start().await, ReplayOutcome::Completed { sent: 2 });
        let sends = bus.sends();
        assert_gap(sends[0].0, sends[1].0, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_delay_prevents_next_send() {
        let dir = tempfile::tempdir().unwrap();
        let source = recording(&dir, &[event(0, "sent"), event(3_000, "never")]);
        let bus = MockBus::default();
        let mut engine = connected_engine(&bus, source).await;
        let stopper = engine.stopper();

        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            stopper.stop();
        });
        let outcome = engine.start().await;

        assert_eq!(outcome, ReplayOutcome::Stopped { sent: 1 });
        assert_eq!(engine.cursor(), 1);
        assert_eq!(bus.sends().len(), 1);
        assert!(!engine.is_running());
        assert!(!engine.session().expect("session kept").is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn subscribes_to_room_and_counts_messages_received_mid_delay() {
        let dir = tempfile::tempdir().unwrap();
        let source = recording(&dir, &[event(0, "first"), event(3_000, "second")]);
        let bus = MockBus::default();
        let mut engine = connected_engine(&bus, source).await;

        let pusher = bus.clone();
        let body = serde_json::to_string(&event(0, "from the room").to_chat_message("1")).unwrap();
        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            pusher.push(TransportEvent::Message { destination: "/topic/stream/1/message".into(), body });
        });

        assert_eq!(engine.start().await, ReplayOutcome::Completed { sent: 2 });

        assert!(bus.calls().iter().any(
            |call| matches!(call, Call::Subscribe { destination, .. } if destination == "/topic/stream/1/message")
        ));
        assert_eq!(engine.session().expect("session kept").stats().received, 1);
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    struct LogBufferWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for LogBuffer {
        type Writer = LogBufferWriter;

        fn make_writer(&'a self) -> Self::Writer {
            LogBufferWriter(Arc::clone(&self.0))
        }
    }

    impl Write for LogBufferWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("log buffer").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dry_run_logs_every_event_then_stops() {
        let logs = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let dir = tempfile::tempdir().unwrap();
        let source = recording(&dir, &[event(0, "a"), event(100, "b"), event(200, "c")]);
        let mut engine = TestEngine::dry_run(source, "1");
        assert!(engine.is_dry_run());

        let outcome = engine.start().await;

        assert_eq!(outcome, ReplayOutcome::Completed { sent: 3 });
        assert!(!engine.is_running());
        assert_eq!(engine.cursor(), 3);

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        let dry_run_lines: Vec<&str> = output.lines().filter(|line| line.contains("[Dry Run]")).collect();
        assert_eq!(dry_run_lines.len(), 3, "{output}");
        assert!(dry_run_lines[0].ends_with("[Dry Run] viewer: a"));
        assert!(dry_run_lines[2].ends_with("[Dry Run] viewer: c"));
    }

    #[tokio::test]
    async fn empty_or_missing_recording_does_not_start() {
        let dir = tempfile::tempdir().unwrap();
        let empty = recording(&dir, &[]);
        let mut engine = TestEngine::dry_run(empty, "1");
        assert!(matches!(engine.start().await, ReplayOutcome::NotStarted { .. }));
        assert!(!engine.is_running());

        let missing = EventSource::new(dir.path().join("missing.json"));
        let mut engine = TestEngine::dry_run(missing, "1");
        assert!(matches!(engine.start().await, ReplayOutcome::NotStarted { .. }));
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn start_is_a_no_op_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = TestEngine::dry_run(recording(&dir, &[event(0, "a")]), "1");
        engine.running.send_replace(true);

        assert_eq!(engine.start().await, ReplayOutcome::AlreadyRunning);
        assert_eq!(engine.cursor(), 0);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let bus = MockBus::default();
        let mut engine = connected_engine(&bus, recording(&dir, &[event(0, "a")])).await;

        engine.stop().await;
        engine.stop().await;

        assert!(!engine.is_running());
        assert!(!engine.session().unwrap().is_connected());
    }

    proptest! {
        #[test]
        fn delay_is_clamped_gap(a in -10_000_000i64..10_000_000, b in -10_000_000i64..10_000_000) {
            let delay = replay_delay(at(a), at(b));
            let expected = (b - a).clamp(0, 5_000) as u64;
            prop_assert_eq!(delay, Duration::from_millis(expected));
            prop_assert!(delay <= MAX_REPLAY_DELAY);
        }
    }
}
