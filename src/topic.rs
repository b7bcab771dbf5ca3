//! Topic namespace for the device's broker session
//!
//! Topics are derived deterministically from the device id and a topic kind;
//! they are computed on demand and never stored. The shapes here are wire
//! contracts with the cloud side and must stay bit-exact:
//!
//! ```text
//! device/<id>/lwt        retained liveness, payload "0"/"1"
//! device/<id>/callback   event acknowledgements
//! device/<id>            session control
//! /c/<id>/pm             payment success
//! /c/<id>/ds             device status
//! /c/<id>/pp             payment pending
//! /c/<id>/mop|moe|mos    payment-method events
//! /d/<id>/rs/<channel>   addressed channel control (subscribed as .../rs/+)
//! /d/<id>/ps             single-value telemetry
//! /d/<id>/psb            batch telemetry
//! ```

/// Root for device-scoped housekeeping topics (liveness, acks).
const DEVICE_ROOT: &str = "device";

pub const T_PAYMENT_SUCCESS: &str = "pm";
pub const T_DEVICE_STATUS: &str = "ds";
pub const T_PAYMENT_PENDING: &str = "pp";
pub const T_PM_ON_PAYMENT: &str = "mop";
pub const T_PM_ON_EXPIRED: &str = "moe";
pub const T_PM_ON_SUCCESS: &str = "mos";

/// Example: `liveness("dev-1")` returns `device/dev-1/lwt`
pub fn liveness(device_id: &str) -> String {
    format!("{DEVICE_ROOT}/{device_id}/lwt")
}

/// Example: `callback("dev-1")` returns `device/dev-1/callback`
pub fn callback(device_id: &str) -> String {
    format!("{DEVICE_ROOT}/{device_id}/callback")
}

/// Example: `session("dev-1")` returns `device/dev-1`
pub fn session(device_id: &str) -> String {
    format!("{DEVICE_ROOT}/{device_id}")
}

/// Example: `event("dev-1", T_PAYMENT_SUCCESS)` returns `/c/dev-1/pm`
pub fn event(device_id: &str, kind: &str) -> String {
    format!("/c/{device_id}/{kind}")
}

/// Example: `channel_control("dev-1", 7)` returns `/d/dev-1/rs/7`
pub fn channel_control(device_id: &str, channel: u16) -> String {
    format!("/d/{device_id}/rs/{channel}")
}

/// Wildcard form of [`channel_control`] used for the subscription.
pub fn channel_control_wildcard(device_id: &str) -> String {
    format!("/d/{device_id}/rs/+")
}

/// Example: `telemetry_single("dev-1")` returns `/d/dev-1/ps`
pub fn telemetry_single(device_id: &str) -> String {
    format!("/d/{device_id}/ps")
}

/// Example: `telemetry_batch("dev-1")` returns `/d/dev-1/psb`
pub fn telemetry_batch(device_id: &str) -> String {
    format!("/d/{device_id}/psb")
}

/// The fixed set subscribed on every successful connect, all at QoS 1.
pub fn subscription_set(device_id: &str) -> Vec<String> {
    vec![
        event(device_id, T_PAYMENT_SUCCESS),
        event(device_id, T_DEVICE_STATUS),
        event(device_id, T_PAYMENT_PENDING),
        event(device_id, T_PM_ON_PAYMENT),
        event(device_id, T_PM_ON_EXPIRED),
        event(device_id, T_PM_ON_SUCCESS),
        channel_control_wildcard(device_id),
    ]
}

/// Inverse of [`channel_control`]: extracts the channel id from an addressed
/// control topic for this device.
///
/// Returns `None` for foreign topics and also for non-numeric or
/// non-positive trailing segments; the router logs those as no-ops.
pub fn parse_channel_control(device_id: &str, topic: &str) -> Option<u16> {
    let prefix = format!("/d/{device_id}/rs/");
    let rest = topic.strip_prefix(&prefix)?;
    match rest.parse::<u16>() {
        Ok(id) if id > 0 => Some(id),
        _ => None,
    }
}

/// True when the topic belongs to the addressed channel-control namespace of
/// this device, regardless of whether its trailing segment parses.
pub fn is_channel_control(device_id: &str, topic: &str) -> bool {
    topic.starts_with(&format!("/d/{device_id}/rs/"))
}

/// Final path segment, the event key for state/command dispatch.
pub fn event_key(topic: &str) -> &str {
    topic.rsplit('/').next().unwrap_or(topic)
}
