//! # firmlink
//!
//! Device-side connectivity agent for a cloud publish/subscribe backend.
//! Maintains a durable, authenticated MQTT session, routes inbound broker
//! messages to application-registered handlers, and pushes outbound
//! telemetry under configurable throttling policies.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌────────────────┐
//!   inbound  ───► │ ConnectionMgr  │ ◄─── CredentialValidator (setup)
//!                 │  (pump tick)   │
//!                 └──────┬─────────┘
//!                        ▼
//!                 ┌────────────────┐      ┌──────────────────────┐
//!                 │  TopicRouter   │ ───► │ VirtualChannelRegistry│──► GPIO
//!                 └──────┬─────────┘      └──────────┬───────────┘
//!                        ▼                           ▼ (policy-gated)
//!                  state/command             single-value + batch
//!                    handlers                telemetry publishes
//! ```
//!
//! Everything executes on one cooperative task driven by an external
//! scheduling tick; all waits are bounded.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use firmlink::{
//!     AgentConfig, CredentialSet, DeviceAgent, NullOutputDriver, RumqttcTransport,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), firmlink::AgentError> {
//! let config = AgentConfig::new("dev-1741155039", "PKEY-TCTLLW2S4CHG");
//! let credentials = CredentialSet::with_trust_anchor(std::fs::read_to_string("ca.pem").unwrap());
//!
//! let mut agent = DeviceAgent::new(
//!     config,
//!     credentials,
//!     RumqttcTransport::new(),
//!     Box::new(NullOutputDriver),
//! )?;
//! agent.on_state("pm", |event| println!("payment: {}", event.reference_id));
//!
//! agent.begin().await?;
//! loop {
//!     agent.pump().await;
//!     tokio::time::sleep(std::time::Duration::from_millis(100)).await;
//! }
//! # }
//! ```

pub mod agent;
pub mod channel;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod gpio;
pub mod payload;
pub mod platform;
pub mod router;
pub mod telemetry;
pub mod timesync;
pub mod topic;
pub mod transport;

pub use agent::DeviceAgent;
pub use channel::{OutputKind, PushOutcome, PushPolicy, VirtualChannel, VirtualChannelRegistry};
pub use config::AgentConfig;
pub use connection::{Backoff, ConnectSettings, ConnectionManager, ConnectionState, TelemetrySink};
pub use credentials::{CredentialSet, Identity, VerifyMode};
pub use error::AgentError;
pub use gpio::{NullOutputDriver, OutputDriver, RppalOutputDriver};
pub use payload::{AckPayload, EventPayload};
pub use platform::{AlwaysUpLink, NetworkLink, ProcessRestart, RestartHandle};
pub use router::TopicRouter;
pub use telemetry::TelemetryBatch;
pub use timesync::{Clock, MonotonicClock, SystemTimeSync, TimeSync};
pub use transport::{InboundMessage, QosLevel, RumqttcTransport, Transport};
