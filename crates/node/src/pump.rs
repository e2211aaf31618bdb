//! Pump relay output. The `gpio` feature gates the real rppal driver;
//! without it, a mock implementation only logs state changes.

use anyhow::Result;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

// ---------------------------------------------------------------------------
// Real GPIO relay (field device, requires rppal on a Raspberry Pi)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub(crate) struct PumpRelay {
    pin: OutputPin,
    active_low: bool, // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl PumpRelay {
    pub(crate) fn new(pin_num: u8, active_low: bool) -> Result<Self> {
        let mut pin = Gpio::new()?.get(pin_num)?.into_output();

        // Fail-safe: pump off at startup
        if active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }

        Ok(Self { pin, active_low })
    }

    pub(crate) fn set(&mut self, on: bool) {
        // active-low: LOW = ON; active-high: HIGH = ON
        if on != self.active_low {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        tracing::info!(pump = if on { "ON" } else { "OFF" }, "relay switched");
    }
}

// ---------------------------------------------------------------------------
// Mock relay (simulated device, no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub(crate) struct PumpRelay {
    pub(super) on: bool,
}

#[cfg(not(feature = "gpio"))]
impl PumpRelay {
    pub(crate) fn new(pin_num: u8, _active_low: bool) -> Result<Self> {
        tracing::info!(gpio = pin_num, "[mock-gpio] pump relay initialised (not wired)");
        Ok(Self { on: false })
    }

    pub(crate) fn set(&mut self, on: bool) {
        self.on = on;
        tracing::debug!(pump = if on { "ON" } else { "OFF" }, "[mock-gpio] relay switched");
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, not(feature = "gpio")))]
mod tests {
    use super::*;

    #[test]
    fn relay_starts_off() {
        let relay = PumpRelay::new(17, true).unwrap();
        assert!(!relay.on);
    }

    #[test]
    fn relay_set_on_then_off() {
        let mut relay = PumpRelay::new(17, true).unwrap();
        relay.set(true);
        assert!(relay.on);
        relay.set(false);
        assert!(!relay.on);
    }
}
