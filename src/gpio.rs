//! Physical output driver seam and the Raspberry Pi implementation
//!
//! Virtual channels reference a physical line by number; this module turns
//! "set line 17 high" into hardware access. The trait keeps the registry
//! testable and lets hosts without GPIO run with the null driver.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use rppal::gpio::{Gpio, OutputPin};
use tracing::debug;

use crate::error::AgentError;

/// Software-PWM carrier used for analog (0-255) levels.
const PWM_FREQUENCY_HZ: f64 = 1000.0;

/// Drives a binary or analog level onto a named physical line.
pub trait OutputDriver {
    fn set_binary(&mut self, line: u8, level: bool) -> Result<(), AgentError>;
    /// `value` is the full analog range 0-255.
    fn set_analog(&mut self, line: u8, value: u8) -> Result<(), AgentError>;
}

/// Raspberry Pi GPIO driver backed by rppal. Pins are claimed lazily on
/// first use and held for the process lifetime.
pub struct RppalOutputDriver {
    gpio: Gpio,
    pins: HashMap<u8, OutputPin>,
}

impl RppalOutputDriver {
    pub fn new() -> Result<Self, AgentError> {
        let gpio = Gpio::new().map_err(|e| AgentError::OutputFailure(e.to_string()))?;
        Ok(Self {
            gpio,
            pins: HashMap::new(),
        })
    }

    fn pin(&mut self, line: u8) -> Result<&mut OutputPin, AgentError> {
        match self.pins.entry(line) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let pin = self
                    .gpio
                    .get(line)
                    .map_err(|e| AgentError::OutputFailure(format!("line {line}: {e}")))?
                    .into_output();
                Ok(entry.insert(pin))
            }
        }
    }
}

impl OutputDriver for RppalOutputDriver {
    fn set_binary(&mut self, line: u8, level: bool) -> Result<(), AgentError> {
        let pin = self.pin(line)?;
        if level {
            pin.set_high();
        } else {
            pin.set_low();
        }
        Ok(())
    }

    fn set_analog(&mut self, line: u8, value: u8) -> Result<(), AgentError> {
        let duty = f64::from(value) / 255.0;
        self.pin(line)?
            .set_pwm_frequency(PWM_FREQUENCY_HZ, duty)
            .map_err(|e| AgentError::OutputFailure(format!("line {line}: {e}")))
    }
}

/// Logs instead of driving hardware. Used on hosts without GPIO and for
/// channels whose effect is purely application-level.
#[derive(Default)]
pub struct NullOutputDriver;

impl OutputDriver for NullOutputDriver {
    fn set_binary(&mut self, line: u8, level: bool) -> Result<(), AgentError> {
        debug!("null driver: line {line} <- {}", if level { "high" } else { "low" });
        Ok(())
    }

    fn set_analog(&mut self, line: u8, value: u8) -> Result<(), AgentError> {
        debug!("null driver: line {line} <- {value}/255");
        Ok(())
    }
}
