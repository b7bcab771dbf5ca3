//! # Topic Router
//!
//! Classifies an inbound (topic, payload) pair and hands it to the right
//! handler category. Priority order:
//!
//! 1. Addressed channel control `/d/<deviceId>/rs/<n>`: the trailing
//!    segment is the channel id; a non-positive or non-numeric id is a
//!    logged no-op. The raw payload goes to the virtual-channel registry.
//! 2. Anything else: the final path segment is the event key, looked up
//!    independently in the "state" and the "command" handler map. Both may
//!    fire for the same key; the two maps are deliberately separate so one
//!    key can carry a state-observer and a command-actuator at once. The
//!    relative order of the two is unspecified.
//!
//! The router never blocks and catches nothing: a panicking handler
//! propagates to the global fault handler.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::channel::VirtualChannelRegistry;
use crate::payload::EventPayload;
use crate::topic;

/// Callback bound at registration time; invoked synchronously on dispatch.
pub type EventHandler = Box<dyn FnMut(&EventPayload)>;

pub struct TopicRouter {
    device_id: String,
    state_handlers: HashMap<String, EventHandler>,
    command_handlers: HashMap<String, EventHandler>,
    verbose: bool,
}

impl TopicRouter {
    pub fn new(device_id: impl Into<String>, verbose: bool) -> Self {
        Self {
            device_id: device_id.into(),
            state_handlers: HashMap::new(),
            command_handlers: HashMap::new(),
            verbose,
        }
    }

    /// Registers a state-event handler. Last registration for a key wins;
    /// entries live for the process lifetime.
    pub fn on_state(&mut self, event: impl Into<String>, handler: EventHandler) {
        self.state_handlers.insert(event.into(), handler);
    }

    /// Registers a command handler, independent of the state map.
    pub fn on_command(&mut self, event: impl Into<String>, handler: EventHandler) {
        self.command_handlers.insert(event.into(), handler);
    }

    /// Classifies and dispatches one inbound message.
    ///
    /// Returns the parsed event document when the message was an event
    /// (for acknowledgement by the caller); channel commands and dropped
    /// messages return `None`.
    pub fn dispatch(
        &mut self,
        topic: &str,
        payload: &str,
        channels: &mut VirtualChannelRegistry,
    ) -> Option<EventPayload> {
        if self.verbose {
            debug!("[{topic}]: {payload}");
        }

        if topic::is_channel_control(&self.device_id, topic) {
            match topic::parse_channel_control(&self.device_id, topic) {
                Some(id) => channels.apply_inbound(id, payload),
                None => warn!("ignoring channel control with bad id: {topic}"),
            }
            return None;
        }

        let key = topic::event_key(topic);
        let event = match EventPayload::from_json(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("dropping inbound message on {topic}: {e}");
                return None;
            }
        };

        if let Some(handler) = self.state_handlers.get_mut(key) {
            handler(&event);
        }
        if let Some(handler) = self.command_handlers.get_mut(key) {
            handler(&event);
        }
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::mock::{Drive, RecordingDriver};
    use crate::timesync::mock::FakeClock;
    use crate::channel::{OutputKind, VirtualChannel};
    use std::cell::Cell;
    use std::rc::Rc;

    fn registry(driver: RecordingDriver) -> VirtualChannelRegistry {
        VirtualChannelRegistry::new(Box::new(driver), Box::new(FakeClock::default()))
    }

    #[test]
    fn channel_topic_reaches_exactly_the_addressed_channel() {
        let driver = RecordingDriver::default();
        let mut channels = registry(driver.clone());
        channels.register(VirtualChannel::new(7).with_output(5, OutputKind::Analog));
        channels.register(VirtualChannel::new(8).with_output(6, OutputKind::Analog));

        let state_fired = Rc::new(Cell::new(0));
        let fired = state_fired.clone();
        let mut router = TopicRouter::new("dev-1", false);
        router.on_state("rs", Box::new(move |_| fired.set(fired.get() + 1)));

        let result = router.dispatch("/d/dev-1/rs/7", "128", &mut channels);

        assert!(result.is_none());
        assert_eq!(driver.0.borrow().as_slice(), &[Drive::Analog(5, 128)]);
        // No state/command handler fires for channel control.
        assert_eq!(state_fired.get(), 0);
    }

    #[test]
    fn bad_channel_ids_are_dropped_not_propagated() {
        let driver = RecordingDriver::default();
        let mut channels = registry(driver.clone());
        channels.register(VirtualChannel::new(7).with_output(5, OutputKind::Binary));

        let mut router = TopicRouter::new("dev-1", false);
        assert!(router.dispatch("/d/dev-1/rs/0", "1", &mut channels).is_none());
        assert!(router.dispatch("/d/dev-1/rs/x", "1", &mut channels).is_none());
        assert!(driver.0.borrow().is_empty());
    }

    #[test]
    fn state_and_command_maps_fire_independently_for_one_key() {
        let driver = RecordingDriver::default();
        let mut channels = registry(driver);

        let state_seen = Rc::new(Cell::new(0));
        let command_seen = Rc::new(Cell::new(0));
        let mut router = TopicRouter::new("dev-1", false);
        {
            let seen = state_seen.clone();
            router.on_state("pm", Box::new(move |e| {
                assert_eq!(e.reference_id, "ref-1");
                seen.set(seen.get() + 1);
            }));
        }
        {
            let seen = command_seen.clone();
            router.on_command("pm", Box::new(move |e| {
                assert_eq!(e.reference_id, "ref-1");
                seen.set(seen.get() + 1);
            }));
        }

        let event = router
            .dispatch("/c/dev-1/pm", r#"{"state":"on_ok","reference_id":"ref-1"}"#, &mut channels)
            .unwrap();

        assert_eq!(event.reference_id, "ref-1");
        assert_eq!(state_seen.get(), 1);
        assert_eq!(command_seen.get(), 1);
    }

    #[test]
    fn last_registration_for_a_key_wins() {
        let driver = RecordingDriver::default();
        let mut channels = registry(driver);
        let winner = Rc::new(Cell::new(0u8));
        let mut router = TopicRouter::new("dev-1", false);

        let first = winner.clone();
        router.on_state("ds", Box::new(move |_| first.set(1)));
        let second = winner.clone();
        router.on_state("ds", Box::new(move |_| second.set(2)));

        router.dispatch("/c/dev-1/ds", "{}", &mut channels);
        assert_eq!(winner.get(), 2);
    }

    #[test]
    fn malformed_event_payload_is_dropped_with_no_dispatch() {
        let driver = RecordingDriver::default();
        let mut channels = registry(driver);
        let fired = Rc::new(Cell::new(0));
        let mut router = TopicRouter::new("dev-1", false);
        let seen = fired.clone();
        router.on_state("pm", Box::new(move |_| seen.set(seen.get() + 1)));

        assert!(router.dispatch("/c/dev-1/pm", "not json", &mut channels).is_none());
        assert_eq!(fired.get(), 0);
    }

    #[test]
    fn unhandled_event_keys_are_a_no_op() {
        let driver = RecordingDriver::default();
        let mut channels = registry(driver);
        let mut router = TopicRouter::new("dev-1", false);
        // Still returns the parsed event so the caller can acknowledge it.
        assert!(router.dispatch("/c/dev-1/pp", "{}", &mut channels).is_some());
    }
}
