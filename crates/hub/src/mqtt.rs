use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::db::NewReading;
use crate::engine::Engine;
use crate::pump::PumpStatus;
use crate::state::SharedState;

const READING_FILTER: &str = "tele/+/reading";

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

/// Telemetry published by a field node.  `ts` is the node's own clock and
/// is informational only; readings are stamped with hub time.
#[derive(Debug, Deserialize)]
pub(crate) struct ReadingMsg {
    #[serde(default)]
    pub(crate) ts: Option<i64>,
    pub(crate) moisture_level: f64,
    pub(crate) water_level: f64,
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Extract device_id from "tele/<device_id>/reading".
pub(crate) fn extract_device_id(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "tele" && parts[2] == "reading" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

pub(crate) fn command_topic(device_id: &str) -> String {
    format!("pump/{device_id}/set")
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub fn connect(cfg: &MqttConfig) -> (AsyncClient, EventLoop) {
    let mut opts = MqttOptions::new(&cfg.client_id, &cfg.host, cfg.port);
    opts.set_keep_alive(Duration::from_secs(30));
    AsyncClient::new(opts, 20)
}

/// Send a pump command to one device.  Retained, so a node that reconnects
/// picks up the last decision straight away.
pub async fn publish_command(client: &AsyncClient, device_id: &str, status: PumpStatus) -> anyhow::Result<()> {
    client
        .publish(command_topic(device_id), QoS::AtLeastOnce, true, status.as_str().as_bytes().to_vec())
        .await?;
    Ok(())
}

/// Drive the MQTT event loop forever: ingest telemetry, answer each
/// reading with a pump command, track link state.
pub async fn run(mut eventloop: EventLoop, client: AsyncClient, engine: Engine, shared: SharedState) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                handle_publish(&p.topic, &p.payload, &client, &engine, &shared).await;
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                // Subscriptions do not survive a clean-session reconnect.
                if let Err(e) = client.subscribe(READING_FILTER, QoS::AtLeastOnce).await {
                    error!("mqtt subscribe failed: {e}");
                }
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                {
                    let mut st = shared.write().await;
                    st.mqtt_connected = false;
                    st.record_error(format!("mqtt error: {e}"));
                }
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

async fn handle_publish(
    topic: &str,
    payload: &[u8],
    client: &AsyncClient,
    engine: &Engine,
    shared: &SharedState,
) {
    let Some(device_id) = extract_device_id(topic) else {
        debug!(topic, "unhandled topic");
        return;
    };

    let msg = match serde_json::from_slice::<ReadingMsg>(payload) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(topic, "bad telemetry json: {e}");
            shared.write().await.record_error(format!("bad telemetry json from {device_id}: {e}"));
            return;
        }
    };

    let reading = NewReading {
        device_id: Some(device_id.to_string()),
        moisture_level: msg.moisture_level,
        water_level: msg.water_level,
    };
    if let Err(e) = reading.validate() {
        warn!(device = device_id, "rejected telemetry: {e}");
        shared.write().await.record_error(format!("{device_id}: {e}"));
        return;
    }

    // A failed insert still gets an answer; the command is what keeps the
    // pump safe.
    let eval = match engine.ingest(&reading).await {
        Ok((eval, _)) => eval,
        Err(e) => {
            error!(device = device_id, "storing reading failed: {e:#}");
            shared.write().await.record_error(format!("store reading from {device_id}: {e:#}"));
            engine.evaluate().await
        }
    };

    debug!(device = device_id, node_ts = ?msg.ts, status = %eval.status, "telemetry");

    {
        let mut st = shared.write().await;
        st.record_reading(device_id, reading.moisture_level, reading.water_level, eval.status);
        st.observe_status(eval.status, eval.evaluated_at, "sensor");
        if let Some(fault) = &eval.fault {
            st.record_error(format!("forced OFF: {fault}"));
        }
    }

    if let Err(e) = publish_command(client, device_id, eval.status).await {
        error!(device = device_id, "publish command failed: {e}");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
