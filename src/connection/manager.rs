//! Lifecycle state machine and steady-state pump

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{Backoff, TelemetrySink};
use crate::credentials::{CredentialSet, Identity};
use crate::error::AgentError;
use crate::platform::{NetworkLink, RestartHandle};
use crate::timesync::TimeSync;
use crate::topic;
use crate::transport::{
    InboundMessage, LastWillConfig, QosLevel, SessionSetup, Transport, TransportEvent,
};

/// Number of short sleeps the startup time-sync probe is allowed.
const TIME_SYNC_POLLS: u32 = 10;
const TIME_SYNC_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Where the lifecycle currently stands. Mutated only by the state machine,
/// read by every publish path as a precondition gate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// Network link down at `begin()`; terminal for that invocation
    LinkDown,
    /// Waiting on the wall-clock probe (soft, never blocks progression)
    TimeUnsynced,
    /// Credentials or transport configuration rejected; terminal
    TransportError,
    Connecting,
    Connected,
}

/// Tunables of a single broker session.
#[derive(Clone, Debug)]
pub struct ConnectSettings {
    pub host: String,
    pub port: u16,
    /// Pump period must stay finer than this or the broker drops us
    pub keep_alive: Duration,
    /// Retry cap inside one `connect_server` invocation
    pub max_retries: u32,
    /// Delay between attempts inside the retry loop
    pub retry_delay: Duration,
    /// Pause before the restart escalation fires
    pub grace_delay: Duration,
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self {
            host: crate::config::DEFAULT_BROKER_HOST.to_string(),
            port: crate::config::DEFAULT_BROKER_PORT,
            keep_alive: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_millis(5_000),
            grace_delay: Duration::from_millis(1_000),
        }
    }
}

/// Owns the transport/session object exclusively; every other component
/// reaches the broker through this manager.
pub struct ConnectionManager<T: Transport> {
    identity: Identity,
    credentials: CredentialSet,
    transport: T,
    link: Box<dyn NetworkLink>,
    time_sync: Box<dyn TimeSync>,
    restart: Box<dyn RestartHandle>,
    settings: ConnectSettings,
    state: ConnectionState,
    backoff: Backoff,
    next_attempt_at: Option<Instant>,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(
        identity: Identity,
        credentials: CredentialSet,
        transport: T,
        link: Box<dyn NetworkLink>,
        time_sync: Box<dyn TimeSync>,
        restart: Box<dyn RestartHandle>,
        settings: ConnectSettings,
    ) -> Self {
        Self {
            identity,
            credentials,
            transport,
            link,
            time_sync,
            restart,
            settings,
            state: ConnectionState::Disconnected,
            backoff: Backoff::default(),
            next_attempt_at: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[cfg(test)]
    pub(crate) fn transport(&self) -> &T {
        &self.transport
    }

    /// Brings the device from "no session" to "subscribed and ready".
    ///
    /// Link loss is unrecoverable in-core and escalates to restart.
    /// Credential rejection is terminal for the attempt but NOT fatal: the
    /// operator must fix configuration, so the process stays up to report.
    pub async fn begin(&mut self) -> Result<(), AgentError> {
        if !self.link.is_up() {
            self.state = ConnectionState::LinkDown;
            error!("network link unavailable, requesting device restart");
            self.restart.restart();
            return Err(AgentError::LinkUnavailable);
        }

        self.state = ConnectionState::TimeUnsynced;
        if self.probe_time_sync().await.is_err() {
            // Soft dependency: certificate validity-window checks may still
            // fail downstream, but the broker is worth trying.
            warn!("wall clock not synchronized, proceeding anyway");
        }

        let mode = match self.credentials.validate() {
            Ok(mode) => mode,
            Err(e) => {
                self.state = ConnectionState::TransportError;
                error!("credential validation failed: {e}");
                return Err(e);
            }
        };
        if let Err(e) = self.transport.configure_tls(&self.credentials, mode) {
            self.state = ConnectionState::TransportError;
            error!("transport configuration failed: {e}");
            return Err(e);
        }
        debug!("transport configured, verification mode {:?}", mode);

        self.state = ConnectionState::Connecting;
        self.connect_server().await
    }

    /// One scheduling tick. When connected, drives one transport iteration
    /// and surfaces any inbound message; when not, runs the backoff-gated
    /// reconnect. Must be called no coarser than the keep-alive period.
    pub async fn pump(&mut self) -> Option<InboundMessage> {
        if self.state == ConnectionState::Connected && self.transport.is_connected() {
            match self.transport.poll().await {
                TransportEvent::Inbound(message) => return Some(message),
                TransportEvent::Disconnected(reason) => {
                    warn!("broker session dropped: {reason}");
                    self.state = ConnectionState::Connecting;
                }
                TransportEvent::Connected | TransportEvent::Idle => {}
            }
            return None;
        }

        if self.state == ConnectionState::Connected {
            // Transport noticed the drop before we did.
            self.state = ConnectionState::Connecting;
        }
        if !matches!(self.state, ConnectionState::Connecting) {
            return None;
        }

        let now = Instant::now();
        let due = self.next_attempt_at.map_or(true, |at| now >= at);
        if due {
            let delay = self.backoff.next_delay();
            self.next_attempt_at = Some(now + delay);
            if self.connect_server().await.is_ok() {
                self.next_attempt_at = None;
            }
        }
        None
    }

    /// Bounded-retry connect. Runs to completion before returning control:
    /// success, retry exhaustion, or restart.
    pub async fn connect_server(&mut self) -> Result<(), AgentError> {
        let mut attempt = 0;
        while attempt < self.settings.max_retries {
            attempt += 1;
            info!("connecting to broker (attempt {attempt})");
            match self.establish_session().await {
                Ok(()) => {
                    self.state = ConnectionState::Connected;
                    self.backoff.reset();
                    info!("connected to {}:{}", self.settings.host, self.settings.port);
                    return Ok(());
                }
                Err(e) => {
                    warn!("connect attempt {attempt} failed: {e}");
                    if attempt < self.settings.max_retries {
                        tokio::time::sleep(self.settings.retry_delay).await;
                    }
                }
            }
        }

        // A device that cannot reach the broker after sustained retries is
        // assumed to be in a bad state (clock, certificate or network) that
        // only a restart may clear.
        error!(
            "broker unreachable after {} attempts, requesting device restart",
            self.settings.max_retries
        );
        tokio::time::sleep(self.settings.grace_delay).await;
        self.restart.restart();
        Err(AgentError::RetriesExhausted(self.settings.max_retries))
    }

    /// Connect with last-will, then the fixed subscription batch, then the
    /// retained online liveness publish. Any failure fails the attempt.
    async fn establish_session(&mut self) -> Result<(), AgentError> {
        let setup = self.session_setup();
        self.transport.connect(&setup).await?;
        for topic in topic::subscription_set(&self.identity.device_id) {
            self.transport
                .subscribe(&topic, QosLevel::AtLeastOnce)
                .await?;
        }
        self.transport
            .publish(
                &topic::liveness(&self.identity.device_id),
                b"1",
                QosLevel::AtLeastOnce,
                true,
            )
            .await?;
        Ok(())
    }

    fn session_setup(&self) -> SessionSetup {
        SessionSetup {
            client_id: self.identity.device_id.clone(),
            username: self.identity.device_id.clone(),
            password: self.identity.device_key.clone(),
            host: self.settings.host.clone(),
            port: self.settings.port,
            keep_alive: self.settings.keep_alive,
            last_will: LastWillConfig {
                topic: topic::liveness(&self.identity.device_id),
                payload: "0".to_string(),
                qos: QosLevel::AtLeastOnce,
                retain: true,
            },
        }
    }

    async fn probe_time_sync(&mut self) -> Result<(), AgentError> {
        for _ in 0..TIME_SYNC_POLLS {
            if self.time_sync.poll_synced() {
                return Ok(());
            }
            tokio::time::sleep(TIME_SYNC_POLL_INTERVAL).await;
        }
        Err(AgentError::TimeSyncFailed)
    }
}

#[async_trait(?Send)]
impl<T: Transport> TelemetrySink for ConnectionManager<T> {
    fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected && self.transport.is_connected()
    }

    fn device_id(&self) -> &str {
        &self.identity.device_id
    }

    async fn send(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), AgentError> {
        if !self.is_connected() {
            return Err(AgentError::PublishFailed("transport not connected".into()));
        }
        self.transport
            .publish(topic, payload, QosLevel::AtLeastOnce, retain)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::tests::fake_pem;
    use crate::credentials::VerifyMode;
    use crate::platform::mock::{FixedLink, RecordingRestart};
    use crate::transport::mock::MockTransport;

    struct SyncedProbe;
    impl TimeSync for SyncedProbe {
        fn poll_synced(&mut self) -> bool {
            true
        }
    }

    struct NeverSyncedProbe;
    impl TimeSync for NeverSyncedProbe {
        fn poll_synced(&mut self) -> bool {
            false
        }
    }

    fn manager(
        transport: MockTransport,
        link_up: bool,
        restart: RecordingRestart,
    ) -> ConnectionManager<MockTransport> {
        ConnectionManager::new(
            Identity::new("dev-1", "PKEY-SECRET"),
            CredentialSet::with_trust_anchor(fake_pem("CERTIFICATE")),
            transport,
            Box::new(FixedLink(link_up)),
            Box::new(SyncedProbe),
            Box::new(restart),
            ConnectSettings {
                host: "broker.test".into(),
                port: 8883,
                ..ConnectSettings::default()
            },
        )
    }

    #[tokio::test]
    async fn begin_subscribes_and_announces_liveness() {
        let restart = RecordingRestart::default();
        let mut conn = manager(MockTransport::default(), true, restart.clone());

        conn.begin().await.unwrap();

        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.transport.configured_mode, Some(VerifyMode::TrustAnchor));
        assert_eq!(conn.transport.connect_attempts, 1);

        let lwt = conn.transport.last_will.clone().unwrap();
        assert_eq!(lwt.topic, "device/dev-1/lwt");
        assert_eq!(lwt.payload, "0");
        assert!(lwt.retain);
        assert_eq!(lwt.qos, QosLevel::AtLeastOnce);

        let topics: Vec<&str> = conn
            .transport
            .subscriptions
            .iter()
            .map(|(t, _)| t.as_str())
            .collect();
        assert_eq!(topics.len(), 7);
        assert!(topics.contains(&"/c/dev-1/pm"));
        assert!(topics.contains(&"/d/dev-1/rs/+"));

        let online = &conn.transport.published[0];
        assert_eq!(online.topic, "device/dev-1/lwt");
        assert_eq!(online.payload, "1");
        assert!(online.retain);
        assert_eq!(restart.0.get(), 0);
    }

    #[tokio::test]
    async fn link_down_is_terminal_and_restarts() {
        let restart = RecordingRestart::default();
        let mut conn = manager(MockTransport::default(), false, restart.clone());

        let result = conn.begin().await;
        assert!(matches!(result, Err(AgentError::LinkUnavailable)));
        assert_eq!(conn.state(), ConnectionState::LinkDown);
        assert_eq!(restart.0.get(), 1);
        assert_eq!(conn.transport.connect_attempts, 0);
    }

    #[tokio::test]
    async fn bad_credentials_are_terminal_but_not_fatal() {
        let restart = RecordingRestart::default();
        let mut conn = ConnectionManager::new(
            Identity::new("dev-1", "k"),
            CredentialSet::default(),
            MockTransport::default(),
            Box::new(FixedLink(true)),
            Box::new(SyncedProbe),
            Box::new(restart.clone()),
            ConnectSettings::default(),
        );

        let result = conn.begin().await;
        assert!(matches!(result, Err(AgentError::CredentialInvalid(_))));
        assert_eq!(conn.state(), ConnectionState::TransportError);
        // Logged only; the operator fixes configuration, no restart.
        assert_eq!(restart.0.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exhaustion_escalates_to_restart() {
        let restart = RecordingRestart::default();
        let transport = MockTransport {
            fail_connects: u32::MAX,
            ..MockTransport::default()
        };
        let mut conn = manager(transport, true, restart.clone());

        // The retry loop runs to completion inside this one call. On a
        // cooperative scheduler with large retry/backoff caps this in-call
        // loop can starve other deferred tasks; the bounded default cap of
        // three attempts keeps it tolerable.
        let result = conn.begin().await;
        assert!(matches!(result, Err(AgentError::RetriesExhausted(3))));
        assert_eq!(conn.transport.connect_attempts, 3);
        assert_eq!(restart.0.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn time_sync_failure_is_soft() {
        let restart = RecordingRestart::default();
        let mut conn = ConnectionManager::new(
            Identity::new("dev-1", "k"),
            CredentialSet::with_trust_anchor(fake_pem("CERTIFICATE")),
            MockTransport::default(),
            Box::new(FixedLink(true)),
            Box::new(NeverSyncedProbe),
            Box::new(restart.clone()),
            ConnectSettings::default(),
        );
        conn.begin().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn pump_surfaces_inbound_and_recovers_from_drops() {
        let restart = RecordingRestart::default();
        let mut transport = MockTransport::default();
        transport.inbound.push_back(InboundMessage {
            topic: "/c/dev-1/pm".into(),
            payload: "{\"state\":\"on_ok\"}".into(),
        });
        let mut conn = manager(transport, true, restart.clone());
        conn.begin().await.unwrap();

        let message = conn.pump().await.unwrap();
        assert_eq!(message.topic, "/c/dev-1/pm");

        // Scripted session drop: the next pump notices and flips to
        // Connecting, the one after reconnects.
        conn.transport.drop_session = true;
        assert!(conn.pump().await.is_none());
        assert_eq!(conn.state(), ConnectionState::Connecting);

        assert!(conn.pump().await.is_none());
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.transport.connect_attempts, 2);
        assert_eq!(restart.0.get(), 0);
    }

    #[tokio::test]
    async fn publishes_are_gated_on_connected_state() {
        let restart = RecordingRestart::default();
        let mut conn = manager(MockTransport::default(), true, restart.clone());
        let result = conn.send("/d/dev-1/ps", b"{}", false).await;
        assert!(matches!(result, Err(AgentError::PublishFailed(_))));
        assert!(conn.transport.published.is_empty());
    }
}
