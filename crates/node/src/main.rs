mod reading;
mod relay;
#[cfg(feature = "sim")]
mod sim;

#[cfg(not(feature = "sim"))]
compile_error!("pump-node has no hardware sampler; build with the `sim` feature");

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::{env, time::Duration};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use reading::{command_topic, parse_pump_command, reading_topic, ReadingMsg};
use relay::Switch;
use sim::{FieldSim, Scenario};

// ---------------------------------------------------------------------------
// Env config
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct NodeConfig {
    broker: String,
    port: u16,
    node_id: String,
    sample_every: Duration,
    scenario: Scenario,
    relay_gpio: u8,
    relay_active_low: bool,
    /// Lit while the MQTT session is up.  Unset means no LED is wired.
    link_led_gpio: Option<u8>,
}

impl NodeConfig {
    fn from_env(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
            default: T,
        ) -> Result<T> {
            match lookup(key) {
                Some(v) => v
                    .trim()
                    .parse()
                    .map_err(|_| anyhow::anyhow!("{key} '{v}' is not valid")),
                None => Ok(default),
            }
        }

        let sample_every_s: u64 = parsed(&lookup, "SAMPLE_EVERY_S", 5)?;
        anyhow::ensure!(sample_every_s > 0, "SAMPLE_EVERY_S must be positive");

        let node_id = lookup("NODE_ID").unwrap_or_else(|| "esp32-a".to_string());
        anyhow::ensure!(
            !node_id.is_empty() && !node_id.contains(['/', '+', '#']),
            "NODE_ID '{node_id}' cannot be used in an MQTT topic"
        );

        Ok(Self {
            broker: lookup("MQTT_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parsed(&lookup, "MQTT_PORT", 1883)?,
            node_id,
            sample_every: Duration::from_secs(sample_every_s),
            scenario: Scenario::from_str_lossy(&lookup("SIM_SCENARIO").unwrap_or_default()),
            relay_gpio: parsed(&lookup, "RELAY_GPIO", 16)?,
            relay_active_low: lookup("RELAY_ACTIVE_LOW")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            link_led_gpio: lookup("LINK_LED_GPIO")
                .map(|v| {
                    v.trim()
                        .parse()
                        .map_err(|_| anyhow::anyhow!("LINK_LED_GPIO '{v}' is not valid"))
                })
                .transpose()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// Everything the link task drives: the pump relay, the optional link LED
/// and the pump state shared with the sampling loop.
struct Outputs {
    relay: Switch,
    led: Option<Switch>,
    pump: watch::Sender<bool>,
}

impl Outputs {
    /// Apply one command payload to the relay.  Unknown payloads are logged
    /// and leave the relay as it was.
    fn apply_command(&mut self, payload: &[u8]) {
        match parse_pump_command(payload) {
            Ok(on) => {
                self.relay.set(on);
                self.pump.send_replace(on);
            }
            Err(msg) => warn!("{msg} (use ON/OFF), ignored"),
        }
    }

    fn link_up(&mut self) {
        if let Some(led) = &mut self.led {
            led.set(true);
        }
    }

    /// Turn the pump off while the link to the hub is down.
    fn fail_safe(&mut self) {
        if self.relay.is_on() {
            warn!("link lost, forcing pump OFF");
        }
        self.relay.set(false);
        self.pump.send_replace(false);
        if let Some(led) = &mut self.led {
            led.set(false);
        }
    }
}

/// Own the outputs and the MQTT event loop: follow commands from the hub
/// and drop the pump on any link error.
async fn run_link(mut eventloop: EventLoop, client: AsyncClient, cmd_topic: String, mut out: Outputs) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("node connected to mqtt");
                out.link_up();
                if let Err(e) = client.subscribe(&cmd_topic, QoS::AtLeastOnce).await {
                    error!("subscribe {cmd_topic} failed: {e}");
                }
            }
            Ok(Event::Incoming(Packet::Publish(p))) if p.topic == cmd_topic => {
                out.apply_command(&p.payload);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => out.fail_safe(),
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. retrying...");
                out.fail_safe();
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = NodeConfig::from_env(|key| env::var(key).ok()).context("invalid node config")?;
    let relay = Switch::new("pump", cfg.relay_gpio, cfg.relay_active_low)?;
    let led = cfg
        .link_led_gpio
        .map(|pin| Switch::new("link-led", pin, false))
        .transpose()?;

    let client_id = format!("pump-node-{}", cfg.node_id);
    let mut mqttoptions = MqttOptions::new(client_id, cfg.broker.clone(), cfg.port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, eventloop) = AsyncClient::new(mqttoptions, 10);

    let (pump_tx, pump_rx) = watch::channel(false);
    let cmd_topic = command_topic(&cfg.node_id);
    let outputs = Outputs {
        relay,
        led,
        pump: pump_tx,
    };
    tokio::spawn(run_link(eventloop, client.clone(), cmd_topic.clone(), outputs));

    let topic = reading_topic(&cfg.node_id);
    info!(
        broker = %cfg.broker,
        port = cfg.port,
        %topic,
        %cmd_topic,
        scenario = %cfg.scenario,
        every_s = cfg.sample_every.as_secs(),
        "node started"
    );

    let mut field = FieldSim::new(cfg.scenario, 600.0);
    let mut ticker = tokio::time::interval(cfg.sample_every);

    loop {
        ticker.tick().await;
        field.set_pumping(*pump_rx.borrow());

        let (soil_raw, water_raw) = field.sample();
        let msg = ReadingMsg::from_raw(OffsetDateTime::now_utc().unix_timestamp(), soil_raw, water_raw);
        let payload = serde_json::to_vec(&msg)?;

        if let Err(e) = client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
            error!("publish error: {e}");
        } else {
            debug!(
                soil_raw,
                water_raw,
                moisture = msg.moisture_level,
                water = msg.water_level,
                "published reading"
            );
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
