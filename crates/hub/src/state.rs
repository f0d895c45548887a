use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use sysinfo::System;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::pump::PumpStatus;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Ephemeral runtime view of the hub, for `/api/status`.  Nothing here is a
/// source of truth for the pump decision; that lives in the store.
pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub pump_status: Option<PumpStatus>,
    pub last_evaluated: Option<OffsetDateTime>,
    pub devices: HashMap<String, DeviceState>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct DeviceState {
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub moisture_level: f64,
    pub water_level: f64,
    pub command: PumpStatus,
}

#[derive(Clone, Debug, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Pump,
    Control,
    Schedule,
    Error,
    System,
}

#[derive(Clone, Serialize)]
pub struct HostStats {
    pub total_memory_bytes: u64,
    pub used_memory_bytes: u64,
    pub load_avg_1m: f64,
    pub host_uptime_secs: u64,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub pump_status: Option<PumpStatus>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_evaluated: Option<OffsetDateTime>,
    pub devices: HashMap<String, DeviceState>,
    pub events: Vec<SystemEvent>,
    pub host: HostStats,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            pump_status: None,
            last_evaluated: None,
            devices: HashMap::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Record a sensor report and the command sent back for it.
    pub fn record_reading(
        &mut self,
        device_id: &str,
        moisture_level: f64,
        water_level: f64,
        command: PumpStatus,
    ) {
        self.devices.insert(
            device_id.to_string(),
            DeviceState {
                last_seen: OffsetDateTime::now_utc(),
                moisture_level,
                water_level,
                command,
            },
        );
        self.push_event(
            EventKind::Reading,
            format!("{device_id}: moisture={moisture_level:.1}% water={water_level:.1}% -> {command}"),
        );
    }

    /// Note the latest resolved status.  Returns true when it differs from
    /// the previous one (or is the first), in which case a pump event is
    /// recorded.
    pub fn observe_status(&mut self, status: PumpStatus, at: OffsetDateTime, source: &str) -> bool {
        let changed = self.pump_status != Some(status);
        self.pump_status = Some(status);
        self.last_evaluated = Some(at);
        if changed {
            self.push_event(EventKind::Pump, format!("pump {status} ({source})"));
        }
        changed
    }

    pub fn record_control(&mut self, detail: String) {
        self.push_event(EventKind::Control, detail);
    }

    pub fn record_schedule(&mut self, detail: String) {
        self.push_event(EventKind::Schedule, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self, host: HostStats) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            pump_status: self.pump_status,
            last_evaluated: self.last_evaluated,
            devices: self.devices.clone(),
            events: self.events.iter().rev().cloned().collect(),
            host,
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

/// Memory and load of the machine the hub runs on.
pub fn host_stats() -> HostStats {
    let mut sys = System::new();
    sys.refresh_memory();
    HostStats {
        total_memory_bytes: sys.total_memory(),
        used_memory_bytes: sys.used_memory(),
        load_avg_1m: System::load_average().one,
        host_uptime_secs: System::uptime(),
    }
}
