//! TOML config file loading, environment overrides, and validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use time::UtcOffset;

use crate::clock::parse_offset;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub clock: ClockConfig,
    pub sweep: SweepConfig,
    /// Absent means the hub runs HTTP-only.
    pub mqtt: Option<MqttConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub url: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClockConfig {
    /// `+HH:MM` / `-HH:MM`.
    pub utc_offset: String,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SweepConfig {
    pub interval_sec: u64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

const MAX_DB_TIMEOUT_MS: u64 = 60_000;
const MAX_SWEEP_INTERVAL_SEC: u64 = 3_600;

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "pump-hub".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:pump.db?mode=rwc".to_string(),
            timeout_ms: 2_000,
        }
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            utc_offset: "+07:00".to_string(),
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self { interval_sec: 10 }
    }
}

// ---------------------------------------------------------------------------
// Accessors
// ---------------------------------------------------------------------------

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .bind
            .parse()
            .with_context(|| format!("invalid bind address '{}'", self.bind))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl Config {
    pub fn db_timeout(&self) -> Duration {
        Duration::from_millis(self.database.timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep.interval_sec)
    }

    pub fn utc_offset(&self) -> Result<UtcOffset> {
        parse_offset(&self.clock.utc_offset)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate every section. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_server(&mut errors);
        self.validate_database(&mut errors);

        if let Err(e) = self.utc_offset() {
            errors.push(format!("clock: {e}"));
        }

        // ── Sweep ───────────────────────────────────────────────
        if !(1..=MAX_SWEEP_INTERVAL_SEC).contains(&self.sweep.interval_sec) {
            errors.push(format!(
                "sweep: interval_sec {} out of range [1, {MAX_SWEEP_INTERVAL_SEC}]",
                self.sweep.interval_sec
            ));
        }

        if let Some(m) = &self.mqtt {
            if m.host.trim().is_empty() {
                errors.push("mqtt: host is empty".to_string());
            }
            if m.port == 0 {
                errors.push("mqtt: port must be non-zero".to_string());
            }
            if m.client_id.trim().is_empty() {
                errors.push("mqtt: client_id is empty".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_server(&self, errors: &mut Vec<String>) {
        let s = &self.server;
        if s.bind.parse::<IpAddr>().is_err() {
            errors.push(format!("server: bind '{}' is not an IP address", s.bind));
        }
        if s.port == 0 {
            errors.push("server: port must be non-zero".to_string());
        }
        match (&s.tls_cert, &s.tls_key) {
            (Some(_), None) => errors.push("server: tls_cert set without tls_key".to_string()),
            (None, Some(_)) => errors.push("server: tls_key set without tls_cert".to_string()),
            _ => {}
        }
    }

    fn validate_database(&self, errors: &mut Vec<String>) {
        let d = &self.database;
        if d.url.trim().is_empty() {
            errors.push("database: url is empty".to_string());
        } else if !d.url.starts_with("sqlite:") {
            errors.push(format!("database: url '{}' is not a sqlite: URL", d.url));
        }
        if !(1..=MAX_DB_TIMEOUT_MS).contains(&d.timeout_ms) {
            errors.push(format!(
                "database: timeout_ms {} out of range [1, {MAX_DB_TIMEOUT_MS}]",
                d.timeout_ms
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Environment overrides
// ---------------------------------------------------------------------------

impl Config {
    /// Apply `DB_URL`, `WEB_PORT`, `MQTT_HOST` and `MQTT_PORT`.  `MQTT_HOST`
    /// turns MQTT on even when the file has no `[mqtt]` section.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup("DB_URL") {
            self.database.url = url;
        }
        if let Some(port) = lookup("WEB_PORT") {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("WEB_PORT '{port}' is not a port number"))?;
        }
        if let Some(host) = lookup("MQTT_HOST") {
            match &mut self.mqtt {
                Some(m) => m.host = host,
                None => {
                    self.mqtt = Some(MqttConfig {
                        host,
                        port: default_mqtt_port(),
                        client_id: default_client_id(),
                    })
                }
            }
        }
        if let Some(port) = lookup("MQTT_PORT") {
            let port: u16 = port
                .trim()
                .parse()
                .with_context(|| format!("MQTT_PORT '{port}' is not a port number"))?;
            if let Some(m) = &mut self.mqtt {
                m.port = port;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file; a missing file means all defaults.
/// Environment overrides are applied before validation.
pub fn load(path: &str) -> Result<Config> {
    let mut config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
    } else {
        tracing::warn!(path, "config file not found, using defaults");
        Config::default()
    };
    config.apply_env(|key| std::env::var(key).ok())?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use time::macros::offset;

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[server]
bind = "127.0.0.1"
port = 9000

[database]
url = "sqlite:/var/lib/pump/pump.db?mode=rwc"
timeout_ms = 500

[clock]
utc_offset = "+05:30"

[sweep]
interval_sec = 30

[mqtt]
host = "broker.local"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.socket_addr().unwrap().to_string(), "127.0.0.1:9000");
        assert_eq!(config.db_timeout(), Duration::from_millis(500));
        assert_eq!(config.utc_offset().unwrap(), offset!(+5:30));
        assert_eq!(config.sweep_interval(), Duration::from_secs(30));
        let mqtt = config.mqtt.unwrap();
        assert_eq!(mqtt.host, "broker.local");
        assert_eq!(mqtt.port, 1883);
        assert_eq!(mqtt.client_id, "pump-hub");
    }

    #[test]
    fn parse_empty_config_gives_defaults() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.database.timeout_ms, 2_000);
        assert_eq!(config.utc_offset().unwrap(), offset!(+7));
        assert_eq!(config.sweep.interval_sec, 10);
        assert!(config.mqtt.is_none());
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config: Config = toml::from_str("[server]\nport = 80\n").unwrap();
        assert_eq!(config.server.port, 80);
        assert_eq!(config.server.bind, "0.0.0.0");
    }

    #[test]
    fn unknown_key_rejected() {
        assert!(toml::from_str::<Config>("[server]\nprot = 80\n").is_err());
        assert!(toml::from_str::<Config>("[zones]\n").is_err());
    }

    #[test]
    fn mqtt_section_requires_host() {
        assert!(toml::from_str::<Config>("[mqtt]\nport = 1883\n").is_err());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config = load("/nonexistent/pump-hub-config.toml").unwrap();
        assert_eq!(config.server.bind, "0.0.0.0");
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn bad_bind_rejected() {
        let mut cfg = Config::default();
        cfg.server.bind = "localhost".into();
        assert_validation_err(&cfg, "not an IP address");
    }

    #[test]
    fn zero_port_rejected() {
        let mut cfg = Config::default();
        cfg.server.port = 0;
        assert_validation_err(&cfg, "server: port must be non-zero");
    }

    #[test]
    fn half_tls_rejected() {
        let mut cfg = Config::default();
        cfg.server.tls_cert = Some("cert.pem".into());
        assert_validation_err(&cfg, "tls_cert set without tls_key");

        let mut cfg = Config::default();
        cfg.server.tls_key = Some("key.pem".into());
        assert_validation_err(&cfg, "tls_key set without tls_cert");
    }

    #[test]
    fn non_sqlite_url_rejected() {
        let mut cfg = Config::default();
        cfg.database.url = "postgres://localhost/pump".into();
        assert_validation_err(&cfg, "is not a sqlite: URL");
    }

    #[test]
    fn timeout_bounds() {
        let mut cfg = Config::default();
        cfg.database.timeout_ms = 0;
        assert_validation_err(&cfg, "timeout_ms 0 out of range");
        cfg.database.timeout_ms = MAX_DB_TIMEOUT_MS + 1;
        assert_validation_err(&cfg, "timeout_ms");
        cfg.database.timeout_ms = MAX_DB_TIMEOUT_MS;
        cfg.validate().unwrap();
    }

    #[test]
    fn bad_offset_rejected() {
        let mut cfg = Config::default();
        cfg.clock.utc_offset = "UTC+7".into();
        assert_validation_err(&cfg, "clock: invalid UTC offset");
    }

    #[test]
    fn sweep_interval_bounds() {
        let mut cfg = Config::default();
        cfg.sweep.interval_sec = 0;
        assert_validation_err(&cfg, "interval_sec 0 out of range");
        cfg.sweep.interval_sec = 1;
        cfg.validate().unwrap();
    }

    #[test]
    fn empty_mqtt_fields_rejected() {
        let mut cfg = Config::default();
        cfg.mqtt = Some(MqttConfig {
            host: " ".into(),
            port: 0,
            client_id: String::new(),
        });
        assert_validation_err(&cfg, "mqtt: host is empty");
        assert_validation_err(&cfg, "mqtt: port must be non-zero");
        assert_validation_err(&cfg, "mqtt: client_id is empty");
    }

    #[test]
    fn multiple_errors_reported_together() {
        let mut cfg = Config::default();
        cfg.server.port = 0;
        cfg.database.url = String::new();
        cfg.sweep.interval_sec = 0;
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "{msg}");
        assert!(msg.contains("server: port"), "{msg}");
        assert!(msg.contains("database: url is empty"), "{msg}");
        assert!(msg.contains("sweep: interval_sec"), "{msg}");
    }

    #[test]
    fn single_error_uses_singular() {
        let mut cfg = Config::default();
        cfg.server.port = 0;
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("(1 error)"), "{msg}");
    }

    // -- Environment overrides -------------------------------------------

    #[test]
    fn env_overrides_file_values() {
        let mut cfg = Config::default();
        cfg.apply_env(env(&[("DB_URL", "sqlite::memory:"), ("WEB_PORT", "9090")]))
            .unwrap();
        assert_eq!(cfg.database.url, "sqlite::memory:");
        assert_eq!(cfg.server.port, 9090);
        assert!(cfg.mqtt.is_none());
    }

    #[test]
    fn mqtt_host_env_enables_mqtt() {
        let mut cfg = Config::default();
        cfg.apply_env(env(&[("MQTT_HOST", "10.0.0.5"), ("MQTT_PORT", "1884")]))
            .unwrap();
        let m = cfg.mqtt.unwrap();
        assert_eq!(m.host, "10.0.0.5");
        assert_eq!(m.port, 1884);
    }

    #[test]
    fn mqtt_port_alone_does_not_enable_mqtt() {
        let mut cfg = Config::default();
        cfg.apply_env(env(&[("MQTT_PORT", "1884")])).unwrap();
        assert!(cfg.mqtt.is_none());
    }

    #[test]
    fn bad_port_env_is_an_error() {
        let mut cfg = Config::default();
        let err = cfg.apply_env(env(&[("WEB_PORT", "eighty")])).unwrap_err();
        assert!(err.to_string().contains("WEB_PORT 'eighty'"));
    }
}
