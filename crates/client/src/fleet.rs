// Load-generation fleet.
//
// Member k (1-based) connects at (k-1) * ramp_up / n after the run begins,
// then publishes on its own fixed-period timer until the observation window
// ends or an interrupt arrives. Every member runs in its own task and owns
// its Session outright; the orchestrator only sees connect outcomes and the
// stats each member hands back when it exits.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chatgen_common::protocol::chat::{publish_destination, topic_destination, ChatMessage, SenderInfo};
use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, sleep_until, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::auth::{AuthError, Credential, CredentialRefresher, LocalRefresher, TokenProvider};
use crate::session::{ReconnectPolicy, Session, SessionEvent, SessionStats};
use crate::shutdown::wait_for_shutdown;
use crate::transport::{StompWsConnector, TransportConnector};

pub const LOAD_TESTER_AVATAR: &str =
    "https://uxwing.com/wp-content/themes/uxwing/download/communication-chat-call/chatbot-icon.png";

/// Failure reasons kept verbatim in a report; the rest are only counted.
pub const MAX_REPORTED_FAILURES: usize = 5;

/// Shortest publish period a member's timer will run at.
pub const MIN_PUBLISH_PERIOD: Duration = Duration::from_millis(1);
/// Longest publish period; slower rates publish once a day.
pub const MAX_PUBLISH_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq)]
pub struct FleetConfig {
    pub clients: usize,
    pub ramp_up: Duration,
    pub messages_per_second: f64,
    pub observation: Duration,
    pub shutdown_grace: Duration,
    pub room_id: String,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            clients: 10,
            ramp_up: Duration::from_secs(10),
            messages_per_second: 0.5,
            observation: Duration::from_secs(10),
            shutdown_grace: Duration::from_millis(2_000),
            room_id: "1".to_string(),
        }
    }
}

impl FleetConfig {
    /// Spacing between consecutive connect attempts.
    pub fn ramp_step(&self) -> Duration {
        match u32::try_from(self.clients) {
            Ok(0) | Err(_) => Duration::ZERO,
            Ok(clients) => self.ramp_up / clients,
        }
    }

    /// Offset of member `ordinal`'s connect attempt from the start of the run.
    pub fn connect_offset(&self, ordinal: usize) -> Duration {
        let index = u32::try_from(ordinal.saturating_sub(1)).unwrap_or(u32::MAX);
        self.ramp_step().saturating_mul(index)
    }

    /// Timer period for the configured rate, clamped to
    /// `[MIN_PUBLISH_PERIOD, MAX_PUBLISH_PERIOD]`.
    pub fn publish_period(&self) -> Duration {
        Duration::try_from_secs_f64(1.0 / self.messages_per_second)
            .unwrap_or(MAX_PUBLISH_PERIOD)
            .clamp(MIN_PUBLISH_PERIOD, MAX_PUBLISH_PERIOD)
    }
}

/// Builds the credential and session for one fleet member.
pub trait SessionFactory: Send + Sync + 'static {
    type Connector: TransportConnector;
    type Refresher: CredentialRefresher;

    fn create(
        &self,
        ordinal: usize,
    ) -> Result<(Credential, Session<Self::Connector, Self::Refresher>), AuthError>;
}

/// Production factory: member k authenticates as subject `k`.
#[derive(Debug, Clone)]
pub struct TokenSessionFactory {
    provider: Arc<TokenProvider>,
    connector: StompWsConnector,
    policy: ReconnectPolicy,
}

impl TokenSessionFactory {
    pub fn new(provider: Arc<TokenProvider>, connector: StompWsConnector, policy: ReconnectPolicy) -> Self {
        Self { provider, connector, policy }
    }
}

impl SessionFactory for TokenSessionFactory {
    type Connector = StompWsConnector;
    type Refresher = LocalRefresher;

    fn create(
        &self,
        ordinal: usize,
    ) -> Result<(Credential, Session<StompWsConnector, LocalRefresher>), AuthError> {
        let (credential, refresher) =
            LocalRefresher::for_subject(Arc::clone(&self.provider), &ordinal.to_string())?;
        let session = Session::new(format!("client-{ordinal}"), self.connector.clone(), refresher)
            .with_reconnect_policy(self.policy.clone());
        Ok((credential, session))
    }
}

/// The synthetic message member `ordinal` publishes at `now`.
pub fn load_test_message(ordinal: usize, room_id: &str, now: DateTime<Utc>) -> ChatMessage {
    ChatMessage::new(
        SenderInfo {
            id: ordinal.to_string(),
            name: format!("Load Tester {ordinal}"),
            profile_image_url: LOAD_TESTER_AVATAR.to_string(),
        },
        format!(
            "(Load Test) Message from client {ordinal} at {}",
            now.to_rfc3339_opts(SecondsFormat::Millis, true)
        ),
        room_id,
    )
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FleetReport {
    pub attempted: usize,
    pub connected: usize,
    pub failed: usize,
    /// The first few failure reasons, as `client k: reason`.
    pub failure_samples: Vec<String>,
    /// Failures beyond the sampled ones.
    pub unreported_failures: usize,
    pub messages: SessionStats,
    /// Members that finished disconnecting within the grace period.
    pub disconnected: usize,
}

impl FleetReport {
    fn record_failure(&mut self, ordinal: usize, reason: &str) {
        self.failed += 1;
        if self.failure_samples.len() < MAX_REPORTED_FAILURES {
            self.failure_samples.push(format!("client {ordinal}: {reason}"));
        } else {
            self.unreported_failures += 1;
        }
    }
}

impl fmt::Display for FleetReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "clients: {} attempted, {} connected, {} failed",
            self.attempted, self.connected, self.failed
        )?;
        for sample in &self.failure_samples {
            writeln!(f, "  {sample}")?;
        }
        if self.unreported_failures > 0 {
            writeln!(f, "  ...and {} more", self.unreported_failures)?;
        }
        writeln!(
            f,
            "messages: {} sent, {} dropped, {} received",
            self.messages.sent, self.messages.dropped, self.messages.received
        )?;
        write!(f, "disconnected within grace: {}", self.disconnected)
    }
}

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("no fleet client connected out of {attempted} attempted")]
    NoClientsConnected { attempted: usize, report: Box<FleetReport> },
}

struct Member {
    ordinal: usize,
    outcome: oneshot::Receiver<Result<(), String>>,
    handle: JoinHandle<SessionStats>,
}

/// Run one load test. `interrupt` flipping to true stops scheduling and
/// starts shutdown early.
pub async fn run<F: SessionFactory>(
    factory: Arc<F>,
    config: FleetConfig,
    interrupt: watch::Receiver<bool>,
) -> Result<FleetReport, FleetError> {
    let config = Arc::new(config);
    let stop = Arc::new(watch::Sender::new(false));
    let forwarder = {
        let stop = Arc::clone(&stop);
        let mut interrupt = interrupt;
        tokio::spawn(async move {
            wait_for_shutdown(&mut interrupt).await;
            stop.send_replace(true);
        })
    };

    let mut report = FleetReport { attempted: config.clients, ..FleetReport::default() };
    let mut members = Vec::with_capacity(config.clients);
    let mut stopped = stop.subscribe();
    let started = Instant::now();
    info!(
        clients = config.clients,
        ramp_up_ms = config.ramp_up.as_millis() as u64,
        period_ms = config.publish_period().as_millis() as u64,
        "starting fleet"
    );

    for ordinal in 1..=config.clients {
        let interrupted = tokio::select! {
            _ = sleep_until(started + config.connect_offset(ordinal)) => false,
            _ = wait_for_shutdown(&mut stopped) => true,
        };
        if interrupted {
            warn!(scheduled = ordinal - 1, "interrupted during ramp-up");
            for remaining in ordinal..=config.clients {
                report.record_failure(remaining, "interrupted before connect");
            }
            break;
        }

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let handle = tokio::spawn(run_member(
            ordinal,
            Arc::clone(&factory),
            Arc::clone(&config),
            stop.subscribe(),
            outcome_tx,
        ));
        members.push(Member { ordinal, outcome: outcome_rx, handle });
    }

    for member in &mut members {
        match (&mut member.outcome).await {
            Ok(Ok(())) => report.connected += 1,
            Ok(Err(reason)) => report.record_failure(member.ordinal, &reason),
            Err(_) => report.record_failure(member.ordinal, "member task ended before connecting"),
        }
    }
    info!(connected = report.connected, failed = report.failed, "ramp-up complete");

    if report.connected > 0 {
        tokio::select! {
            _ = sleep(config.observation) => info!("observation window elapsed"),
            _ = wait_for_shutdown(&mut stopped) => info!("interrupted, shutting down early"),
        }
    }

    stop.send_replace(true);
    forwarder.abort();
    let deadline = Instant::now() + config.shutdown_grace;
    for member in &mut members {
        match timeout_at(deadline, &mut member.handle).await {
            Ok(Ok(stats)) => {
                report.messages += stats;
                report.disconnected += 1;
            }
            Ok(Err(error)) => warn!(client = member.ordinal, %error, "fleet member task failed"),
            Err(_) => {
                warn!(client = member.ordinal, "fleet member did not disconnect within grace period");
                member.handle.abort();
            }
        }
    }

    if report.connected == 0 {
        return Err(FleetError::NoClientsConnected {
            attempted: report.attempted,
            report: Box::new(report),
        });
    }
    Ok(report)
}

async fn run_member<F: SessionFactory>(
    ordinal: usize,
    factory: Arc<F>,
    config: Arc<FleetConfig>,
    mut stop: watch::Receiver<bool>,
    outcome: oneshot::Sender<Result<(), String>>,
) -> SessionStats {
    let (credential, mut session) = match factory.create(ordinal) {
        Ok(created) => created,
        Err(error) => {
            warn!(client = ordinal, %error, "could not issue credential");
            let _ = outcome.send(Err(error.to_string()));
            return SessionStats::default();
        }
    };

    let connected = tokio::select! {
        result = session.connect_with_backoff(credential) => result.map_err(|error| error.to_string()),
        _ = wait_for_shutdown(&mut stop) => Err("interrupted while connecting".to_string()),
    };
    if let Err(reason) = connected {
        warn!(client = ordinal, %reason, "fleet member failed to connect");
        session.disconnect().await;
        let _ = outcome.send(Err(reason));
        return session.stats();
    }

    session
        .subscribe(&topic_destination(&config.room_id), move |message| {
            debug!(client = ordinal, from = %message.sender.name, "received");
        })
        .await;
    let _ = outcome.send(Ok(()));
    info!(client = ordinal, "fleet member connected");

    let destination = publish_destination(&config.room_id);
    let period = config.publish_period();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut stop) => break,
            _ = ticker.tick() => {
                let message = load_test_message(ordinal, &config.room_id, Utc::now());
                session.send(&destination, &message).await;
            }
            event = session.next_event() => {
                if let SessionEvent::ConnectionLost { reason } = event {
                    warn!(client = ordinal, %reason, "connection lost, publishes will be dropped");
                }
            }
        }
    }

    session.disconnect().await;
    session.stats()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{credential, Call, MockBus, MockConnector, MockRefresher};
    use chrono::TimeZone;

    struct MockFactory {
        bus: MockBus,
        failing: Vec<usize>,
        policy: ReconnectPolicy,
    }

    impl MockFactory {
        fn new(bus: &MockBus) -> Self {
            Self { bus: bus.clone(), failing: Vec::new(), policy: ReconnectPolicy::default() }
        }
    }

    impl SessionFactory for MockFactory {
        type Connector = MockConnector;
        type Refresher = MockRefresher;

        fn create(
            &self,
            ordinal: usize,
        ) -> Result<(Credential, Session<MockConnector, MockRefresher>), AuthError> {
            if self.failing.contains(&ordinal) {
                return Err(AuthError::MissingSecret);
            }
            let session =
                Session::new(format!("client-{ordinal}"), self.bus.connector(), MockRefresher::default())
                    .with_reconnect_policy(self.policy.clone());
            Ok((credential(&format!("tok-{ordinal}")), session))
        }
    }

    fn config(clients: usize, ramp_secs: u64) -> FleetConfig {
        FleetConfig {
            clients,
            ramp_up: Duration::from_secs(ramp_secs),
            messages_per_second: 1.0,
            observation: Duration::from_secs(3),
            shutdown_grace: Duration::from_secs(2),
            room_id: "1".to_string(),
        }
    }

    fn never_interrupted() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[test]
    fn ramp_schedule_spreads_connects() {
        let config = config(10, 10);
        assert_eq!(config.ramp_step(), Duration::from_secs(1));
        assert_eq!(config.connect_offset(1), Duration::ZERO);
        assert_eq!(config.connect_offset(10), Duration::from_secs(9));
        assert_eq!(FleetConfig { messages_per_second: 0.5, ..config }.publish_period(), Duration::from_secs(2));
    }

    #[test]
    fn publish_period_is_clamped_at_both_ends() {
        let at = |rate: f64| FleetConfig { messages_per_second: rate, ..config(1, 0) }.publish_period();
        assert_eq!(at(1e10), MIN_PUBLISH_PERIOD);
        assert_eq!(at(1e-300), MAX_PUBLISH_PERIOD);
        assert_eq!(at(f64::MIN_POSITIVE), MAX_PUBLISH_PERIOD);
    }

    #[tokio::test(start_paused = true)]
    async fn extreme_rate_publishes_at_the_minimum_period() {
        let bus = MockBus::default();
        let (_interrupt_tx, interrupt) = never_interrupted();
        let config = FleetConfig {
            messages_per_second: 1e10,
            observation: Duration::from_millis(50),
            ..config(1, 0)
        };

        let report = run(Arc::new(MockFactory::new(&bus)), config, interrupt)
            .await
            .expect("member should connect and publish");

        assert_eq!(report.connected, 1);
        assert_eq!(report.disconnected, 1);
        assert!(report.messages.sent >= 1 && report.messages.sent <= 51, "{report}");
    }

    #[test]
    fn load_test_message_carries_ordinal_and_time() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let message = load_test_message(7, "3", now);
        assert_eq!(message.sender.id, "7");
        assert_eq!(message.sender.name, "Load Tester 7");
        assert_eq!(message.sender.profile_image_url, LOAD_TESTER_AVATAR);
        assert_eq!(message.stream_id, "3");
        assert_eq!(message.content, "(Load Test) Message from client 7 at 2024-05-01T12:00:00.000Z");
    }

    #[tokio::test(start_paused = true)]
    async fn ramp_up_spaces_connects_one_second_apart() {
        let bus = MockBus::default();
        let (_interrupt_tx, interrupt) = never_interrupted();
        let started = Instant::now();

        let report = run(Arc::new(MockFactory::new(&bus)), config(10, 10), interrupt)
            .await
            .expect("fleet should connect");

        assert_eq!(report.attempted, 10);
        assert_eq!(report.connected + report.failed, 10);
        assert_eq!(report.connected, 10);
        assert_eq!(report.disconnected, 10);

        let connects = bus.connect_instants();
        assert_eq!(connects.len(), 10);
        for (index, at) in connects.iter().enumerate() {
            let offset = *at - started;
            let expected = Duration::from_secs(index as u64);
            assert!(
                offset >= expected && offset <= expected + Duration::from_millis(5),
                "client {} connected at {offset:?}, expected {expected:?}",
                index + 1
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn members_publish_on_their_own_timers_and_subscribe() {
        let bus = MockBus::default();
        let (_interrupt_tx, interrupt) = never_interrupted();

        let report = run(Arc::new(MockFactory::new(&bus)), config(2, 2), interrupt)
            .await
            .expect("fleet should connect");

        // Member 2 connects at 1s; observation ends 3s later at 4s.
        // Member 1 publishes at 1,2,3,4s and member 2 at 2,3,4s (±1 at the edge).
        assert!(report.messages.sent >= 5 && report.messages.sent <= 7, "{report}");
        assert_eq!(report.messages.dropped, 0);

        let subscribes = bus
            .calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Subscribe { destination, .. } if destination == "/topic/stream/1/message"))
            .count();
        assert_eq!(subscribes, 2);
        let bodies: Vec<String> = bus.sends().into_iter().map(|(_, _, body)| body).collect();
        assert!(bodies.iter().any(|body| body.contains("Message from client 1")));
        assert!(bodies.iter().any(|body| body.contains("Message from client 2")));
    }

    #[tokio::test(start_paused = true)]
    async fn partial_failure_is_reported_not_fatal() {
        let bus = MockBus::default();
        let mut factory = MockFactory::new(&bus);
        factory.failing = vec![3, 7];
        let (_interrupt_tx, interrupt) = never_interrupted();

        let report = run(Arc::new(factory), config(10, 1), interrupt).await.expect("partial success");

        assert_eq!(report.connected, 8);
        assert_eq!(report.failed, 2);
        assert_eq!(report.failure_samples.len(), 2);
        assert!(report.failure_samples[0].starts_with("client 3:"));
        assert!(report.failure_samples[1].starts_with("client 7:"));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_connections_is_a_distinct_failure() {
        let bus = MockBus::failing_every_connect();
        let mut factory = MockFactory::new(&bus);
        factory.policy.max_attempts = 1;
        let (_interrupt_tx, interrupt) = never_interrupted();

        let error = run(Arc::new(factory), config(3, 0), interrupt).await.expect_err("all fail");

        let FleetError::NoClientsConnected { attempted, report } = error;
        assert_eq!(attempted, 3);
        assert_eq!(report.failed, 3);
        assert!(report.failure_samples.iter().all(|reason| reason.contains("gave up")));
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_during_ramp_fails_unscheduled_members() {
        let bus = MockBus::default();
        let (interrupt_tx, interrupt) = watch::channel(false);
        tokio::spawn(async move {
            sleep(Duration::from_millis(2_500)).await;
            interrupt_tx.send_replace(true);
        });

        let report = run(Arc::new(MockFactory::new(&bus)), config(10, 10), interrupt)
            .await
            .expect("three members connected before the interrupt");

        assert_eq!(report.connected, 3);
        assert_eq!(report.failed, 7);
        assert_eq!(report.failure_samples.len(), MAX_REPORTED_FAILURES);
        assert_eq!(report.unreported_failures, 2);
        assert!(report.failure_samples[0].contains("client 4: interrupted before connect"));
        assert_eq!(report.disconnected, 3);
    }

    #[test]
    fn report_display_bounds_failure_lines() {
        let mut report = FleetReport { attempted: 8, ..FleetReport::default() };
        for ordinal in 1..=7 {
            report.record_failure(ordinal, "refused");
        }
        report.connected = 1;

        let rendered = report.to_string();
        assert!(rendered.contains("8 attempted, 1 connected, 7 failed"));
        assert_eq!(rendered.matches("refused").count(), MAX_REPORTED_FAILURES);
        assert!(rendered.contains("...and 2 more"));
    }
}
