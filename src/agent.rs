//! # Device Agent Facade
//!
//! Wires the connection manager, topic router, virtual-channel registry and
//! telemetry paths into one object the application drives with a periodic
//! `pump()` tick. Everything runs on that single cooperative task; there is
//! no locking because no state is shared across concurrent contexts.

use tracing::warn;

use crate::channel::{PushOutcome, VirtualChannel, VirtualChannelRegistry};
use crate::config::AgentConfig;
use crate::connection::{
    ConnectSettings, ConnectionManager, ConnectionState, TelemetrySink,
};
use crate::credentials::{CredentialSet, Identity};
use crate::error::AgentError;
use crate::gpio::OutputDriver;
use crate::payload::{end_session_payload, AckPayload, EventPayload};
use crate::platform::{AlwaysUpLink, NetworkLink, ProcessRestart, RestartHandle};
use crate::router::TopicRouter;
use crate::telemetry::TelemetryBatch;
use crate::timesync::{Clock, MonotonicClock, SystemTimeSync, TimeSync};
use crate::topic;
use crate::transport::Transport;

pub struct DeviceAgent<T: Transport> {
    config: AgentConfig,
    connection: ConnectionManager<T>,
    router: TopicRouter,
    channels: VirtualChannelRegistry,
}

impl<T: Transport> DeviceAgent<T> {
    /// Host-default wiring: OS-owned link, system wall clock, process exit
    /// as the restart primitive.
    pub fn new(
        config: AgentConfig,
        credentials: CredentialSet,
        transport: T,
        driver: Box<dyn OutputDriver>,
    ) -> Result<Self, AgentError> {
        let time_sync = SystemTimeSync::new(
            config.gmt_offset_secs(),
            config.daylight_offset_secs,
            config.ntp_host.clone(),
        );
        Self::with_parts(
            config,
            credentials,
            transport,
            driver,
            Box::new(AlwaysUpLink),
            Box::new(time_sync),
            Box::new(ProcessRestart),
            Box::new(MonotonicClock::new()),
        )
    }

    /// Full dependency injection; every platform seam is explicit.
    #[allow(clippy::too_many_arguments)]
    pub fn with_parts(
        config: AgentConfig,
        credentials: CredentialSet,
        transport: T,
        driver: Box<dyn OutputDriver>,
        link: Box<dyn NetworkLink>,
        time_sync: Box<dyn TimeSync>,
        restart: Box<dyn RestartHandle>,
        clock: Box<dyn Clock>,
    ) -> Result<Self, AgentError> {
        config.validate()?;
        let identity = Identity::new(config.device_id.clone(), config.device_key.clone());
        let settings = ConnectSettings {
            host: config.broker_host.clone(),
            port: config.broker_port,
            ..ConnectSettings::default()
        };
        let connection = ConnectionManager::new(
            identity, credentials, transport, link, time_sync, restart, settings,
        );
        let router = TopicRouter::new(config.device_id.clone(), config.verbose);
        let channels = VirtualChannelRegistry::new(driver, clock);
        Ok(Self {
            config,
            connection,
            router,
            channels,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Registers a state-event handler (observer category).
    pub fn on_state(&mut self, event: impl Into<String>, handler: impl FnMut(&EventPayload) + 'static) {
        self.router.on_state(event, Box::new(handler));
    }

    /// Registers a command handler (actuator category, independent map).
    pub fn on_command(&mut self, event: impl Into<String>, handler: impl FnMut(&EventPayload) + 'static) {
        self.router.on_command(event, Box::new(handler));
    }

    pub fn register_channel(&mut self, channel: VirtualChannel) {
        self.channels.register(channel);
    }

    /// Brings the session up: link check, time sync, credential validation,
    /// transport configuration, broker connect with last-will, subscription
    /// batch, online announcement.
    pub async fn begin(&mut self) -> Result<(), AgentError> {
        self.connection.begin().await
    }

    /// One scheduling tick: transport I/O plus inbound dispatch, or a
    /// backoff-gated reconnect while the session is down.
    pub async fn pump(&mut self) {
        let Some(message) = self.connection.pump().await else {
            return;
        };
        let event = self
            .router
            .dispatch(&message.topic, &message.payload, &mut self.channels);
        if let Some(event) = event {
            if self.config.auto_ack && event.message_id > 0 {
                self.acknowledge(&event).await;
            }
        }
    }

    async fn acknowledge(&mut self, event: &EventPayload) {
        let ack = AckPayload::for_event(event);
        let topic = topic::callback(self.connection.device_id());
        if let Err(e) = self
            .connection
            .send(&topic, ack.to_json().as_bytes(), false)
            .await
        {
            warn!("acknowledgement publish failed: {e}");
        }
    }

    /// Policy-gated single-value telemetry for a channel.
    pub async fn push_channel(&mut self, id: u16, value: f64) -> PushOutcome {
        self.channels.push(&mut self.connection, id, value).await
    }

    /// Unconditional single-value telemetry for a channel.
    pub async fn force_push_channel(&mut self, id: u16, value: f64) -> PushOutcome {
        self.channels
            .force_push(&mut self.connection, id, value)
            .await
    }

    /// Flushes a batch through this agent's session.
    pub async fn send_batch(&mut self, batch: &mut TelemetryBatch) -> bool {
        batch.send(&mut self.connection).await
    }

    /// Announces the end of the active cloud session; a silent no-op while
    /// disconnected. Chainable.
    pub async fn end_session(&mut self) -> &mut Self {
        let topic = topic::session(self.connection.device_id());
        let payload = end_session_payload();
        if self.connection.is_connected() {
            if let Err(e) = self.connection.send(&topic, payload.as_bytes(), false).await {
                warn!("end_session publish failed: {e}");
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::tests::fake_pem;
    use crate::gpio::mock::{Drive, RecordingDriver};
    use crate::platform::mock::{FixedLink, RecordingRestart};
    use crate::timesync::mock::FakeClock;
    use crate::channel::OutputKind;
    use crate::transport::mock::MockTransport;
    use crate::transport::InboundMessage;

    struct SyncedProbe;
    impl TimeSync for SyncedProbe {
        fn poll_synced(&mut self) -> bool {
            true
        }
    }

    fn agent(transport: MockTransport, driver: RecordingDriver) -> DeviceAgent<MockTransport> {
        let config = AgentConfig::new("dev-1", "PKEY-SECRET");
        DeviceAgent::with_parts(
            config,
            CredentialSet::with_trust_anchor(fake_pem("CERTIFICATE")),
            transport,
            Box::new(driver),
            Box::new(FixedLink(true)),
            Box::new(SyncedProbe),
            Box::new(RecordingRestart::default()),
            Box::new(FakeClock::default()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn inbound_channel_command_reaches_the_hardware() {
        let mut transport = MockTransport::default();
        transport.inbound.push_back(InboundMessage {
            topic: "/d/dev-1/rs/7".into(),
            payload: "128".into(),
        });
        let driver = RecordingDriver::default();
        let mut agent = agent(transport, driver.clone());
        agent.register_channel(VirtualChannel::new(7).with_output(5, OutputKind::Analog));

        agent.begin().await.unwrap();
        agent.pump().await;

        assert_eq!(driver.0.borrow().as_slice(), &[Drive::Analog(5, 128)]);
    }

    #[tokio::test]
    async fn events_with_message_ids_are_acknowledged() {
        let mut transport = MockTransport::default();
        transport.inbound.push_back(InboundMessage {
            topic: "/c/dev-1/pm".into(),
            payload: r#"{"state":"on_ok","message_id":42,"active_session_id":3}"#.into(),
        });
        let mut agent = agent(transport, RecordingDriver::default());
        agent.begin().await.unwrap();
        agent.pump().await;

        let acks: Vec<_> = agent
            .connection
            .transport()
            .published
            .iter()
            .filter(|p| p.topic == "device/dev-1/callback")
            .collect();
        assert_eq!(acks.len(), 1);
        let ack: serde_json::Value = serde_json::from_str(&acks[0].payload).unwrap();
        assert_eq!(ack["state"], "on_ok");
        assert_eq!(ack["message_id"], 42);
        assert_eq!(ack["active_session_id"], 3);
    }

    #[tokio::test]
    async fn events_without_message_ids_are_not_acknowledged() {
        let mut transport = MockTransport::default();
        transport.inbound.push_back(InboundMessage {
            topic: "/c/dev-1/ds".into(),
            payload: r#"{"state":"on_idle"}"#.into(),
        });
        let mut agent = agent(transport, RecordingDriver::default());
        agent.begin().await.unwrap();
        agent.pump().await;

        assert!(agent
            .connection
            .transport()
            .published
            .iter()
            .all(|p| p.topic != "device/dev-1/callback"));
    }

    #[tokio::test]
    async fn end_session_publishes_only_while_connected() {
        let mut agent = agent(MockTransport::default(), RecordingDriver::default());
        agent.end_session().await;
        assert!(agent.connection.transport().published.is_empty());

        agent.begin().await.unwrap();
        agent.end_session().await;
        let sessions: Vec<_> = agent
            .connection
            .transport()
            .published
            .iter()
            .filter(|p| p.topic == "device/dev-1")
            .collect();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].payload.contains("end_session"));
    }

    #[tokio::test]
    async fn push_goes_through_the_agents_session() {
        let mut agent = agent(MockTransport::default(), RecordingDriver::default());
        agent.register_channel(VirtualChannel::new(1));

        assert_eq!(agent.push_channel(1, 4.5).await, PushOutcome::Offline);
        agent.begin().await.unwrap();
        assert_eq!(agent.push_channel(1, 4.5).await, PushOutcome::Sent);
        assert_eq!(agent.force_push_channel(1, 4.5).await, PushOutcome::Sent);
    }
}
