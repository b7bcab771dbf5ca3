//! Batch telemetry accumulator
//!
//! Collects key/value observations and flushes them as one array-shaped
//! payload over a single publish. The caller owns the batching boundary:
//! entries persist across `add` calls until an explicit `send` or `clear`.

use serde_json::Value;
use tracing::warn;

use crate::connection::TelemetrySink;
use crate::topic;

/// Keeps the serialized batch inside the transport's payload budget.
const MAX_BATCH_ENTRIES: usize = 64;

/// Ordered key/value accumulator flushed as one atomic publish.
#[derive(Default)]
pub struct TelemetryBatch {
    entries: Vec<(String, Value)>,
}

impl TelemetryBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one observation; chainable. Entries past the batch bound are
    /// dropped with a warning rather than growing past the payload budget.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        if self.entries.len() >= MAX_BATCH_ENTRIES {
            warn!("telemetry batch full, dropping entry");
            return self;
        }
        self.entries.push((key.into(), value.into()));
        self
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Serializes the accumulated pairs in insertion order and publishes
    /// them once to the batch topic. Success clears the accumulator; failure
    /// leaves it intact and reports the transport's verdict without retry.
    pub async fn send(&mut self, sink: &mut dyn TelemetrySink) -> bool {
        let payload: Vec<Value> = self
            .entries
            .iter()
            .map(|(key, value)| serde_json::json!({ "key": key, "value": value }))
            .collect();
        let body = Value::Array(payload).to_string();
        let topic = topic::telemetry_batch(sink.device_id());

        match sink.send(&topic, body.as_bytes(), false).await {
            Ok(()) => {
                self.entries.clear();
                true
            }
            Err(e) => {
                warn!("batch telemetry send failed: {e}");
                false
            }
        }
    }
}
