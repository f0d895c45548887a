//! Stateful field simulator for local development: one soil moisture probe
//! and one reservoir level probe on a 12-bit ADC.
//!
//! Soil channel models:
//! - Temporal coherence via random walk with mean reversion
//! - Gradual drying drift (evaporation)
//! - Per-reading ADC noise and occasional spikes
//! - Diurnal (day/night) cycle
//! - Closed-loop watering response (wetter while the pump runs)
//!
//! The reservoir drains while the pump runs and never refills by itself.
//! Both probes read high when dry/empty.

use std::fmt;
use time::OffsetDateTime;

use crate::reading::ADC_MAX;

/// Soil probe calibration endpoints, in ADC counts.
const SOIL_RAW_DRY: f64 = 3400.0;
const SOIL_RAW_WET: f64 = 1300.0;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

/// Sample from N(mean, sigma).
fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Starts mid-range, slow drift toward dry.  Moderate noise.
    Drying,
    /// Hovers near the centre.  Low noise, rare spikes.
    Stable,
    /// High noise, ~10% spike rate, larger spikes.
    Flaky,
    /// Starts near the wet end, very slow drying.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "wet" => Self::Wet,
            _ => Self::Drying, // default
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

pub struct FieldSim {
    /// Current "true" soil reading in ADC counts.  Evolves each sample.
    soil_base: f64,
    /// Reservoir fill, percent.
    water_pct: f64,

    // Random walk parameters (ADC counts)
    drift_per_sample: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    center: f64,
    noise_sigma: f64,

    // Spike parameters
    spike_prob: f32,
    spike_sigma: f64,

    // Diurnal cycle
    diurnal_amplitude: f64,
    diurnal_period_s: f64,

    // Pump response
    pumping: bool,
    wet_rate: f64,
    drain_pct_per_sample: f64,
}

impl FieldSim {
    /// `diurnal_period_s` controls the day/night cycle length.  Use 600
    /// (10 min) for fast dev iteration or 86400 for real-time.
    pub fn new(scenario: Scenario, diurnal_period_s: f64) -> Self {
        let range = SOIL_RAW_DRY - SOIL_RAW_WET;
        let center = (SOIL_RAW_DRY + SOIL_RAW_WET) / 2.0;

        // Per-sample values as fractions of the soil range.
        // start_frac: 0.0 = at SOIL_RAW_WET (wettest), 1.0 = at SOIL_RAW_DRY (driest)
        let (drift, walk, mean_rev, noise, spike_prob, spike, start_frac, water_pct) =
            match scenario {
                Scenario::Drying => (0.001, 0.011, 0.02, 0.006, 0.03_f32, 0.14, 0.5, 80.0),
                Scenario::Stable => (0.000_15, 0.004, 0.05, 0.003, 0.005, 0.07, 0.5, 90.0),
                Scenario::Flaky => (0.0007, 0.018, 0.02, 0.014, 0.10, 0.21, 0.5, 70.0),
                Scenario::Wet => (0.0002, 0.006, 0.02, 0.004, 0.02, 0.11, 0.2, 100.0),
            };

        let start = SOIL_RAW_WET + start_frac * range + gaussian(0.0, range * 0.03);

        Self {
            soil_base: start.clamp(SOIL_RAW_WET, SOIL_RAW_DRY),
            water_pct,
            drift_per_sample: drift * range,
            walk_sigma: walk * range,
            mean_reversion: mean_rev,
            center,
            noise_sigma: noise * range,
            spike_prob,
            spike_sigma: spike * range,
            diurnal_amplitude: range * 0.06,
            diurnal_period_s,
            pumping: false,
            wet_rate: -range * 0.02,
            drain_pct_per_sample: 1.5,
        }
    }

    /// Inform the simulator whether the pump is currently running.
    pub fn set_pumping(&mut self, on: bool) {
        self.pumping = on;
    }

    /// Produce the next `(soil_raw, water_raw)` ADC pair.
    pub fn sample(&mut self) -> (u16, u16) {
        (self.sample_soil(), self.sample_water())
    }

    fn sample_soil(&mut self) -> u16 {
        // -- Evolve the base value ----------------------------------------
        let pull = self.mean_reversion * (self.center - self.soil_base);
        let walk = gaussian(0.0, self.walk_sigma);
        let wet = if self.pumping { self.wet_rate } else { 0.0 };

        self.soil_base = (self.soil_base + self.drift_per_sample + pull + walk + wet)
            .clamp(SOIL_RAW_WET - 100.0, SOIL_RAW_DRY + 100.0);

        // -- Build the instantaneous reading ------------------------------
        let now_s = OffsetDateTime::now_utc().unix_timestamp() as f64;
        let phase = 2.0 * std::f64::consts::PI * now_s / self.diurnal_period_s;
        let diurnal = self.diurnal_amplitude * phase.sin();

        let noise = gaussian(0.0, self.noise_sigma);
        let spike = if fastrand::f32() < self.spike_prob {
            gaussian(0.0, self.spike_sigma)
        } else {
            0.0
        };

        to_adc(self.soil_base + diurnal + noise + spike)
    }

    fn sample_water(&mut self) -> u16 {
        if self.pumping {
            self.water_pct = (self.water_pct - self.drain_pct_per_sample).max(0.0);
        }
        let level = (self.water_pct + gaussian(0.0, 0.3)).clamp(0.0, 100.0);
        to_adc((100.0 - level) / 100.0 * f64::from(ADC_MAX))
    }
}

/// Round and clamp to the 12-bit ADC range.
fn to_adc(v: f64) -> u16 {
    v.round().clamp(0.0, f64::from(ADC_MAX)) as u16
}

// ===========================================================================
// Tests
// ===========================================================================
