//! Wire format shared with the hub, plus the ADC → percent mapping.

use serde::Serialize;

/// Full-scale value of the 12-bit ADC.
pub const ADC_MAX: u16 = 4095;

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ReadingMsg {
    pub ts: i64,
    pub moisture_level: f64,
    pub water_level: f64,
}

impl ReadingMsg {
    pub fn from_raw(ts: i64, soil_raw: u16, water_raw: u16) -> Self {
        Self {
            ts,
            moisture_level: adc_percent(soil_raw) as f64,
            water_level: adc_percent(water_raw) as f64,
        }
    }
}

/// Both probes read high when dry, so full scale is 0 % and zero is 100 %.
/// Integer arithmetic, truncating; values above full scale clamp to 0 %.
pub fn adc_percent(raw: u16) -> u8 {
    let raw = u32::from(raw.min(ADC_MAX));
    ((u32::from(ADC_MAX) - raw) * 100 / u32::from(ADC_MAX)) as u8
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

pub fn reading_topic(node_id: &str) -> String {
    format!("tele/{node_id}/reading")
}

pub fn command_topic(node_id: &str) -> String {
    format!("pump/{node_id}/set")
}

/// Parse an "ON"/"OFF" payload into a bool (case-insensitive, trims whitespace).
pub fn parse_pump_command(payload: &[u8]) -> Result<bool, String> {
    let s = String::from_utf8_lossy(payload).trim().to_uppercase();
    match s.as_str() {
        "ON" => Ok(true),
        "OFF" => Ok(false),
        _ => Err(format!("unknown pump command '{s}'")),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
