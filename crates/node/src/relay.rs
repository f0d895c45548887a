//! Digital outputs: the pump relay and the optional link LED. The `gpio`
//! feature gates the real rppal driver; without it, a mock implementation
//! just tracks and logs the state.

use anyhow::Result;
use tracing::info;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

// ---------------------------------------------------------------------------
// Real GPIO output (requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct Switch {
    label: &'static str,
    pin: OutputPin,
    active_low: bool,
    on: bool,
}

#[cfg(feature = "gpio")]
impl Switch {
    pub fn new(label: &'static str, gpio_pin: u8, active_low: bool) -> Result<Self> {
        let pin = Gpio::new()?.get(gpio_pin)?.into_output();
        let mut switch = Self {
            label,
            pin,
            active_low,
            on: true,
        };
        // Fail-safe: ensure OFF at startup
        switch.set(false);
        info!(label, gpio = gpio_pin, active_low, "output ready");
        Ok(switch)
    }

    pub fn set(&mut self, on: bool) {
        // active-low: LOW = ON; active-high: HIGH = ON
        if on != self.active_low {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        if on != self.on {
            info!(label = self.label, state = if on { "ON" } else { "OFF" }, "output switched");
        }
        self.on = on;
    }

    pub fn is_on(&self) -> bool {
        self.on
    }
}

// ---------------------------------------------------------------------------
// Mock output (development, no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct Switch {
    label: &'static str,
    on: bool,
}

#[cfg(not(feature = "gpio"))]
impl Switch {
    pub fn new(label: &'static str, gpio_pin: u8, active_low: bool) -> Result<Self> {
        info!(label, gpio = gpio_pin, active_low, "[mock-gpio] output (not wired)");
        Ok(Self { label, on: false })
    }

    pub fn set(&mut self, on: bool) {
        if on != self.on {
            info!(
                label = self.label,
                state = if on { "ON" } else { "OFF" },
                "[mock-gpio] output switched"
            );
        }
        self.on = on;
    }

    pub fn is_on(&self) -> bool {
        self.on
    }
}

// ===========================================================================
// Tests
// ===========================================================================
