//! # Connection Lifecycle Module
//!
//! Owns the device's broker session from "no session" to "subscribed and
//! ready" and keeps it alive afterwards.
//!
//! ## Module Architecture
//!
//! ```text
//! connection/
//! ├── backoff.rs  - exponential reconnect delay policy
//! └── manager.rs  - lifecycle state machine and steady-state pump
//! ```
//!
//! ## Lifecycle
//!
//! ```text
//! Disconnected ──link down──► LinkDown (terminal, restart)
//!      │
//!      ▼
//! TimeUnsynced ──probe (soft)──► Connecting ──credential/format reject──► TransportError
//!                                    │
//!                          connect + LWT + subscribe + online publish
//!                                    ▼
//!                                Connected ◄──backoff-gated reconnect──┐
//!                                    │                                 │
//!                                    └──transport reports dropped──────┘
//! ```
//!
//! All waits are bounded and synchronous with respect to the cooperative
//! pump: the time-sync probe is a fixed number of short sleeps, and the
//! bounded-retry connect loop runs to completion inside one pump call.
//!
//! ## Publish Gating
//!
//! Every outbound path (virtual channels, batch telemetry, acks) goes
//! through the [`TelemetrySink`] trait implemented by the manager, which
//! refuses I/O while the session is down instead of queueing.

mod backoff;
mod manager;

pub use backoff::Backoff;
pub use manager::{ConnectSettings, ConnectionManager, ConnectionState};

use crate::error::AgentError;
use async_trait::async_trait;

/// Outbound seam handed to the registry and the batch builder.
///
/// Explicit dependency injection: callers pass `&mut dyn TelemetrySink` at
/// the call site instead of reaching through process-wide state.
#[async_trait(?Send)]
pub trait TelemetrySink {
    fn is_connected(&self) -> bool;
    fn device_id(&self) -> &str;
    /// QoS-1 publish; fails without side effects when the session is down.
    async fn send(&mut self, topic: &str, payload: &[u8], retain: bool)
        -> Result<(), AgentError>;
}
