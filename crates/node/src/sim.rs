//! Sensor behaviour of the simulated field device.
//!
//! Soil moisture and rain level follow a bounded random walk:
//! - soil drifts by -2..=2 per tick while the pump is off
//! - soil gains 3..=6 per tick while the pump is on
//! - rain drifts by -5..=5 per tick
//!
//! Clamping to 0..=100 is the caller's job (see `DeviceState::tick`).

use std::fmt;

// ---------------------------------------------------------------------------
// Drift source
// ---------------------------------------------------------------------------

/// Per-tick change of the two sensor readings.
pub(crate) trait Drift: Send {
    fn soil_delta(&mut self, pump_on: bool) -> i32;
    fn rain_delta(&mut self) -> i32;
}

/// Uniform random walk backed by `fastrand`.
pub(crate) struct RandomWalk {
    rng: fastrand::Rng,
}

impl RandomWalk {
    pub(crate) fn new() -> Self {
        Self {
            rng: fastrand::Rng::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_seed(seed: u64) -> Self {
        Self {
            rng: fastrand::Rng::with_seed(seed),
        }
    }
}

impl Drift for RandomWalk {
    fn soil_delta(&mut self, pump_on: bool) -> i32 {
        if pump_on {
            self.rng.i32(3..=6)
        } else {
            self.rng.i32(-2..=2)
        }
    }

    fn rain_delta(&mut self) -> i32 {
        self.rng.i32(-5..=5)
    }
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Starting conditions selectable via the `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Soil 45%, rain 20%.  Auto mode idles until the soil dries out.
    Normal,
    /// Soil 15%, rain 10%.  Auto mode starts watering on the first tick.
    Dry,
    /// Soil 80%, rain 30%.
    Wet,
    /// Soil 20%, rain 90%.  Dry soil, but rain suppresses watering.
    Stormy,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "dry" => Self::Dry,
            "wet" => Self::Wet,
            "stormy" => Self::Stormy,
            _ => Self::Normal, // default
        }
    }

    /// `(soil, rain)` at startup.
    pub fn initial_levels(&self) -> (u8, u8) {
        match self {
            Self::Normal => (45, 20),
            Self::Dry => (15, 10),
            Self::Wet => (80, 30),
            Self::Stormy => (20, 90),
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Dry => write!(f, "dry"),
            Self::Wet => write!(f, "wet"),
            Self::Stormy => write!(f, "stormy"),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
