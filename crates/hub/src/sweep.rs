//! Periodic re-evaluation of the pump status.
//!
//! Sensor reports already get a fresh decision, but a schedule boundary or a
//! pause expiry can pass between reports.  The sweep evaluates on a fixed
//! tick, which also persists pause expiry, and pushes a command to every
//! known device whenever the status changes.

use std::time::Duration;

use rumqttc::AsyncClient;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::engine::{Engine, Evaluation};
use crate::mqtt;
use crate::state::SharedState;

/// Run the sweep loop.  Intended to be `tokio::spawn`-ed from main.
pub async fn run(engine: Engine, shared: SharedState, notifier: Option<AsyncClient>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(interval_sec = every.as_secs(), "sweep started");
    shared
        .write()
        .await
        .record_system(format!("sweep started (every {}s)", every.as_secs()));

    loop {
        ticker.tick().await;
        sweep_once(&engine, &shared, notifier.as_ref()).await;
    }
}

/// One evaluation.  Returns it along with whether the status changed.
pub(crate) async fn sweep_once(
    engine: &Engine,
    shared: &SharedState,
    notifier: Option<&AsyncClient>,
) -> (Evaluation, bool) {
    let eval = engine.evaluate().await;

    let (changed, devices) = {
        let mut st = shared.write().await;
        if eval.cleared_pause {
            st.record_control("pause expired".to_string());
        }
        if let Some(fault) = &eval.fault {
            st.record_error(format!("forced OFF: {fault}"));
        }
        (st.observe_status(eval.status, eval.evaluated_at, "sweep"), st.device_ids())
    };

    if changed {
        info!(status = %eval.status, devices = devices.len(), "pump status changed");
        if let Some(client) = notifier {
            for device in &devices {
                if let Err(e) = mqtt::publish_command(client, device, eval.status).await {
                    error!(device = %device, "sweep: publish command failed: {e}");
                }
            }
        }
    }

    (eval, changed)
}

// ===========================================================================
// Tests
// ===========================================================================
