//! Wall-clock synchronization probe and the monotonic clock seam
//!
//! Certificate validation needs a plausible wall clock, so startup polls a
//! [`TimeSync`] a bounded number of times before the first TLS handshake.
//! Failure is soft: the agent proceeds with a warning and lets the handshake
//! decide. The monotonic [`Clock`] exists so push-policy intervals can be
//! tested without sleeping.

use chrono::{Datelike, Utc};
use std::time::Instant;
use tracing::debug;

/// Synchronization probe for the device's wall clock.
///
/// `poll_synced` returns whether a synchronized timestamp is available yet;
/// it never blocks. The caller owns the polling cadence.
pub trait TimeSync {
    fn poll_synced(&mut self) -> bool;
}

/// Treats the host clock as synchronized once it reports a post-2020 date.
/// A device booting with an unset RTC reads as 1970 until NTP catches up,
/// which is exactly the state this probe is meant to detect.
pub struct SystemTimeSync {
    /// Offsets are applied by the host's time daemon; logged at probe
    /// creation so a misconfigured device is diagnosable from its boot log.
    pub gmt_offset_secs: i32,
    pub daylight_offset_secs: i32,
    pub ntp_host: String,
}

impl SystemTimeSync {
    pub fn new(gmt_offset_secs: i32, daylight_offset_secs: i32, ntp_host: impl Into<String>) -> Self {
        let ntp_host = ntp_host.into();
        debug!(
            "time probe: ntp_host={ntp_host} gmt_offset_secs={gmt_offset_secs} daylight_offset_secs={daylight_offset_secs}"
        );
        Self {
            gmt_offset_secs,
            daylight_offset_secs,
            ntp_host,
        }
    }
}

impl TimeSync for SystemTimeSync {
    fn poll_synced(&mut self) -> bool {
        Utc::now().year() >= 2020
    }
}

/// Monotonic milliseconds source for push-policy interval checks.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

/// Milliseconds since construction.
pub struct MonotonicClock {
    epoch: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::Clock;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Manually advanced clock shared between test and registry.
    #[derive(Clone, Default)]
    pub(crate) struct FakeClock(pub Rc<Cell<u64>>);

    impl FakeClock {
        pub(crate) fn advance(&self, ms: u64) {
            self.0.set(self.0.get() + ms);
        }
    }

    impl Clock for FakeClock {
        fn now_ms(&self) -> u64 {
            self.0.get()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_clock_reads_synced_on_a_developer_machine() {
        let mut probe = SystemTimeSync::new(7 * 3600, 0, "pool.ntp.org");
        assert!(probe.poll_synced());
    }

    #[test]
    fn probe_keeps_the_configured_time_parameters() {
        let probe = SystemTimeSync::new(7 * 3600, 3600, "ntp.example.net");
        assert_eq!(probe.gmt_offset_secs, 7 * 3600);
        assert_eq!(probe.daylight_offset_secs, 3600);
        assert_eq!(probe.ntp_host, "ntp.example.net");
    }

    #[test]
    fn monotonic_clock_does_not_run_backwards() {
        let clock = MonotonicClock::new();
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
    }
}
