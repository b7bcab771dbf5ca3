//! # Virtual Channel Registry
//!
//! ## Why This Module Exists
//! A virtual channel is a logical, numbered bidirectional telemetry/control
//! point, independent of physical pin numbering. The registry maps channel
//! ids to optional physical outputs and owns the push-gating policy that
//! decides when an accumulated sensor value is actually transmitted.
//!
//! A channel used purely for outbound telemetry carries no output binding;
//! a channel used purely for inbound control may still be pushed to report
//! its resulting state.
//!
//! ## Push Policy
//! Evaluation precedence, in this exact order:
//! 1. First push ever: always transmit (gives the server a baseline).
//! 2. Nothing configured: always transmit.
//! 3. Otherwise ALL configured conditions must hold; unconfigured ones are
//!    vacuously true.
//!
//! Policy state (`last_value`, `last_push_ms`) moves only when a push
//! actually happens; suppressed and offline pushes leave it untouched.
//! Nothing is ever queued: an offline transmit is a refusal, not a buffer.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::connection::TelemetrySink;
use crate::gpio::OutputDriver;
use crate::timesync::Clock;
use crate::topic;

/// How a channel's physical line interprets values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputKind {
    Binary,
    /// Binary with the driven sense inverted (active-low wiring)
    InvertedBinary,
    /// 0-255 level
    Analog,
}

/// Physical line a channel drives on inbound commands.
#[derive(Clone, Copy, Debug)]
pub struct OutputBinding {
    pub line: u8,
    pub kind: OutputKind,
}

/// Outbound throttling knobs. Zero means "not configured" for the numeric
/// fields.
#[derive(Clone, Copy, Debug, Default)]
pub struct PushPolicy {
    /// Transmit only when the value changed
    pub on_change: bool,
    /// Minimum milliseconds between transmissions
    pub min_interval_ms: u64,
    /// Minimum absolute delta against the last transmitted value
    pub min_delta: f64,
}

impl PushPolicy {
    fn is_unconfigured(&self) -> bool {
        !self.on_change && self.min_interval_ms == 0 && self.min_delta == 0.0
    }
}

/// What happened to a push request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Sent,
    /// Policy said no; state untouched
    Suppressed,
    /// Transport down; state untouched, nothing queued
    Offline,
}

/// Inbound handler bound to a channel, invoked with the raw payload.
pub type ChannelHandler = Box<dyn FnMut(&str)>;

pub struct VirtualChannel {
    id: u16,
    binding: Option<OutputBinding>,
    policy: PushPolicy,
    last_value: Option<f64>,
    last_push_ms: Option<u64>,
    handler: Option<ChannelHandler>,
}

impl VirtualChannel {
    pub fn new(id: u16) -> Self {
        Self {
            id,
            binding: None,
            policy: PushPolicy::default(),
            last_value: None,
            last_push_ms: None,
            handler: None,
        }
    }

    pub fn with_output(mut self, line: u8, kind: OutputKind) -> Self {
        self.binding = Some(OutputBinding { line, kind });
        self
    }

    pub fn with_policy(mut self, policy: PushPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn on_inbound(mut self, handler: ChannelHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// First push ever for this channel?
    fn is_first_push(&self) -> bool {
        self.last_push_ms.is_none()
    }

    fn policy_allows(&self, value: f64, now_ms: u64) -> bool {
        if self.is_first_push() || self.policy.is_unconfigured() {
            return true;
        }
        let last_value = self.last_value.unwrap_or_default();
        let last_push = self.last_push_ms.unwrap_or_default();
        let change_ok = !self.policy.on_change || value != last_value;
        let interval_ok = self.policy.min_interval_ms == 0
            || now_ms.saturating_sub(last_push) >= self.policy.min_interval_ms;
        let delta_ok =
            self.policy.min_delta == 0.0 || (value - last_value).abs() >= self.policy.min_delta;
        change_ok && interval_ok && delta_ok
    }
}

pub struct VirtualChannelRegistry {
    channels: HashMap<u16, VirtualChannel>,
    driver: Box<dyn OutputDriver>,
    clock: Box<dyn Clock>,
}

impl VirtualChannelRegistry {
    pub fn new(driver: Box<dyn OutputDriver>, clock: Box<dyn Clock>) -> Self {
        Self {
            channels: HashMap::new(),
            driver,
            clock,
        }
    }

    /// Registers a channel; re-registering an id replaces it.
    pub fn register(&mut self, channel: VirtualChannel) {
        self.channels.insert(channel.id, channel);
    }

    /// Applies an inbound control payload to a channel.
    ///
    /// Absence of the channel (or of a binding and handler) is a no-op, not
    /// an error: the cloud may address channels the firmware variant does
    /// not populate.
    pub fn apply_inbound(&mut self, id: u16, raw: &str) {
        let Some(channel) = self.channels.get_mut(&id) else {
            debug!("no channel {id} registered, ignoring inbound command");
            return;
        };

        if let Some(binding) = channel.binding {
            let result = match binding.kind {
                OutputKind::Binary => self.driver.set_binary(binding.line, parse_binary(raw)),
                OutputKind::InvertedBinary => {
                    self.driver.set_binary(binding.line, !parse_binary(raw))
                }
                OutputKind::Analog => match parse_analog(raw) {
                    Some(level) => self.driver.set_analog(binding.line, level),
                    None => {
                        warn!("channel {id}: non-numeric analog payload {raw:?}, dropped");
                        Ok(())
                    }
                },
            };
            if let Err(e) = result {
                warn!("channel {id}: {e}");
            }
        }

        if let Some(handler) = channel.handler.as_mut() {
            handler(raw);
        }
    }

    /// Policy-gated transmit of a channel value as single-value telemetry.
    pub async fn push(
        &mut self,
        sink: &mut dyn TelemetrySink,
        id: u16,
        value: f64,
    ) -> PushOutcome {
        self.push_inner(sink, id, value, false).await
    }

    /// Bypasses every policy check; still refuses while offline.
    pub async fn force_push(
        &mut self,
        sink: &mut dyn TelemetrySink,
        id: u16,
        value: f64,
    ) -> PushOutcome {
        self.push_inner(sink, id, value, true).await
    }

    async fn push_inner(
        &mut self,
        sink: &mut dyn TelemetrySink,
        id: u16,
        value: f64,
        force: bool,
    ) -> PushOutcome {
        let now_ms = self.clock.now_ms();
        let Some(channel) = self.channels.get_mut(&id) else {
            debug!("no channel {id} registered, push ignored");
            return PushOutcome::Suppressed;
        };

        if !force && !channel.policy_allows(value, now_ms) {
            return PushOutcome::Suppressed;
        }
        if !sink.is_connected() {
            return PushOutcome::Offline;
        }

        let payload = serde_json::json!({ "channel": id, "value": value }).to_string();
        let topic = topic::telemetry_single(sink.device_id());
        match sink.send(&topic, payload.as_bytes(), false).await {
            Ok(()) => {
                channel.last_value = Some(value);
                channel.last_push_ms = Some(now_ms);
                PushOutcome::Sent
            }
            Err(e) => {
                warn!("channel {id} push failed: {e}");
                PushOutcome::Offline
            }
        }
    }
}

fn parse_binary(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "on" | "1" | "high"
    )
}

fn parse_analog(raw: &str) -> Option<u8> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .map(|v| v.clamp(0, 255) as u8)
}
