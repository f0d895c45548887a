mod clock;
mod config;
mod db;
mod engine;
mod error;
mod mqtt;
mod pump;
mod state;
mod sweep;
mod web;

use anyhow::Result;
use std::{env, sync::Arc};
use tokio::sync::RwLock;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use clock::Clock;
use db::Db;
use engine::Engine;
use state::SystemState;
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    let clock = Clock::new(cfg.utc_offset()?);

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&cfg.database.url).await?;
    db.migrate().await?;
    if db.ensure_control_row(clock.now()).await? {
        info!("control state initialised (AUTO, no pause)");
    }
    info!(url = %cfg.database.url, offset = %clock.offset(), "db ready");

    let engine = Engine::new(db, clock, cfg.db_timeout());

    // ── Shared state (ephemeral, for /api/status) ───────────────────
    let shared = Arc::new(RwLock::new(SystemState::new()));
    shared.write().await.record_system("hub started".to_string());

    // ── MQTT (optional) ─────────────────────────────────────────────
    let notifier = match &cfg.mqtt {
        Some(mqtt_cfg) => {
            let (client, eventloop) = mqtt::connect(mqtt_cfg);
            info!(host = %mqtt_cfg.host, port = mqtt_cfg.port, "mqtt enabled");
            tokio::spawn(mqtt::run(
                eventloop,
                client.clone(),
                engine.clone(),
                Arc::clone(&shared),
            ));
            Some(client)
        }
        None => {
            warn!("no [mqtt] section and no MQTT_HOST; running HTTP-only");
            None
        }
    };

    // ── Sweep ───────────────────────────────────────────────────────
    tokio::spawn(sweep::run(
        engine.clone(),
        Arc::clone(&shared),
        notifier,
        cfg.sweep_interval(),
    ));

    // ── Web server ──────────────────────────────────────────────────
    web::serve(AppState { engine, shared }, &cfg.server).await
}
