use anyhow::{Context, Result};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::ServerConfig;
use crate::db::{NewReading, SensorReading};
use crate::engine::{Engine, Evaluation};
use crate::error::ApiError;
use crate::pump::{parse_time_of_day, ControlAction, Mode, PumpStatus, Schedule};
use crate::state::{host_stats, SharedState};

const DEFAULT_HISTORY: i64 = 50;
const MAX_HISTORY: i64 = 500;

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub shared: SharedState,
}

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SaveReadingRequest {
    pub moisture_level: f64,
    pub water_level: f64,
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Serialize)]
struct SaveReadingResponse {
    status: &'static str,
    command: PumpStatus,
    id: i64,
}

#[derive(Debug, Deserialize)]
pub struct ControlRequest {
    pub action: String,
    #[serde(default)]
    pub minutes: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    pub on_time: String,
    pub off_time: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

#[derive(Serialize)]
struct ControlStatusResponse {
    mode: Mode,
    #[serde(with = "time::serde::rfc3339::option")]
    pause_end_time: Option<OffsetDateTime>,
    paused: bool,
    pump_status: PumpStatus,
    schedule: Option<Schedule>,
    #[serde(with = "time::serde::rfc3339")]
    evaluated_at: OffsetDateTime,
}

#[derive(Serialize)]
struct ScheduleResponse {
    schedule: Option<Schedule>,
}

#[derive(Serialize)]
struct ClearScheduleResponse {
    deactivated: u64,
}

/// A stored reading plus its timestamp on the controller's wall clock.
#[derive(Serialize)]
struct ReadingView {
    #[serde(flatten)]
    reading: SensorReading,
    #[serde(with = "time::serde::rfc3339")]
    recorded_at: OffsetDateTime,
}

impl ControlStatusResponse {
    fn from_evaluation(eval: &Evaluation) -> Result<Self, ApiError> {
        let Some(control) = eval.control else {
            let why = eval.fault.clone().unwrap_or_else(|| "control state unreadable".to_string());
            return Err(ApiError::Unavailable(why));
        };
        Ok(Self {
            mode: control.mode,
            pause_end_time: control.pause_end_time,
            paused: eval.is_paused(),
            pump_status: eval.status,
            schedule: eval.schedule.clone(),
            evaluated_at: eval.evaluated_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/sensor/save", post(save_reading))
        .route("/api/sensor/latest", get(latest_reading))
        .route("/api/sensor/history", get(reading_history))
        .route("/api/control/status", get(control_status))
        .route("/api/control", post(update_control))
        .route(
            "/api/schedule",
            get(get_schedule).post(set_schedule).delete(clear_schedule),
        )
        .route("/api/status", get(api_status))
        .with_state(state)
}

async fn save_reading(
    State(app): State<AppState>,
    body: Result<Json<SaveReadingRequest>, JsonRejection>,
) -> Result<Json<SaveReadingResponse>, ApiError> {
    let Json(req) = body?;
    let reading = NewReading {
        device_id: req.device_id,
        moisture_level: req.moisture_level,
        water_level: req.water_level,
    };
    reading.validate().map_err(ApiError::InvalidRequest)?;

    let (eval, id) = app.engine.ingest(&reading).await.map_err(ApiError::store)?;

    {
        let mut st = app.shared.write().await;
        if let Some(device) = &reading.device_id {
            st.record_reading(device, reading.moisture_level, reading.water_level, eval.status);
        }
        st.observe_status(eval.status, eval.evaluated_at, "sensor");
        if let Some(fault) = &eval.fault {
            st.record_error(format!("forced OFF: {fault}"));
        }
    }

    Ok(Json(SaveReadingResponse {
        status: "success",
        command: eval.status,
        id,
    }))
}

async fn latest_reading(State(app): State<AppState>) -> Result<Json<Option<ReadingView>>, ApiError> {
    let latest = app.engine.latest_reading().await.map_err(ApiError::store)?;
    let view = latest.map(|r| to_view(&app.engine, r)).transpose()?;
    Ok(Json(view))
}

async fn reading_history(
    State(app): State<AppState>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<Vec<ReadingView>>, ApiError> {
    let Query(q) = query?;
    let limit = q.limit.unwrap_or(DEFAULT_HISTORY);
    if !(1..=MAX_HISTORY).contains(&limit) {
        return Err(ApiError::InvalidRequest(format!(
            "limit {limit} out of range [1, {MAX_HISTORY}]"
        )));
    }
    let rows = app.engine.recent_readings(limit).await.map_err(ApiError::store)?;
    let views = rows
        .into_iter()
        .map(|r| to_view(&app.engine, r))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(views))
}

fn to_view(engine: &Engine, reading: SensorReading) -> Result<ReadingView, ApiError> {
    let recorded_at = engine
        .clock()
        .local_from_unix(reading.ts)
        .map_err(|e| ApiError::Internal(format!("{e:#}")))?;
    Ok(ReadingView {
        reading,
        recorded_at,
    })
}

async fn control_status(State(app): State<AppState>) -> Result<Json<ControlStatusResponse>, ApiError> {
    let eval = app.engine.evaluate().await;
    app.shared
        .write()
        .await
        .observe_status(eval.status, eval.evaluated_at, "status");
    Ok(Json(ControlStatusResponse::from_evaluation(&eval)?))
}

async fn update_control(
    State(app): State<AppState>,
    body: Result<Json<ControlRequest>, JsonRejection>,
) -> Result<Json<ControlStatusResponse>, ApiError> {
    let Json(req) = body?;
    let action = ControlAction::parse(&req.action, req.minutes)?;
    let eval = app.engine.apply(action).await.map_err(ApiError::store)?;

    {
        let mut st = app.shared.write().await;
        match action {
            ControlAction::Pause { minutes } => st.record_control(format!("PAUSE {minutes} min")),
            _ => st.record_control(action.name().to_string()),
        }
        st.observe_status(eval.status, eval.evaluated_at, "control");
    }

    Ok(Json(ControlStatusResponse::from_evaluation(&eval)?))
}

async fn get_schedule(State(app): State<AppState>) -> Result<Json<ScheduleResponse>, ApiError> {
    let schedule = app.engine.active_schedule().await.map_err(ApiError::store)?;
    Ok(Json(ScheduleResponse { schedule }))
}

async fn set_schedule(
    State(app): State<AppState>,
    body: Result<Json<ScheduleRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = body?;
    let on = parse_time_of_day(&req.on_time)?;
    let off = parse_time_of_day(&req.off_time)?;
    let schedule = app.engine.set_schedule(on, off).await.map_err(ApiError::store)?;

    app.shared.write().await.record_schedule(format!(
        "schedule {} -> {} (control reset to AUTO)",
        schedule.on_time, schedule.off_time
    ));

    Ok((
        StatusCode::CREATED,
        Json(ScheduleResponse {
            schedule: Some(schedule),
        }),
    ))
}

async fn clear_schedule(State(app): State<AppState>) -> Result<Json<ClearScheduleResponse>, ApiError> {
    let deactivated = app.engine.clear_schedule().await.map_err(ApiError::store)?;
    app.shared
        .write()
        .await
        .record_schedule(format!("schedule cleared ({deactivated} deactivated)"));
    Ok(Json(ClearScheduleResponse { deactivated }))
}

async fn api_status(State(app): State<AppState>) -> impl IntoResponse {
    let host = host_stats();
    let st = app.shared.read().await;
    Json(st.to_status(host))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, cfg: &ServerConfig) -> Result<()> {
    let addr = cfg.socket_addr()?;
    let app = router(state);

    if let (Some(cert), Some(key)) = (&cfg.tls_cert, &cfg.tls_key) {
        return serve_tls(app, addr, cert, key).await;
    }

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {addr}"))?;
    info!(%addr, "api listening on http://{addr}");
    axum::serve(listener, app).await.context("web server error")?;
    Ok(())
}

#[cfg(feature = "tls")]
async fn serve_tls(app: Router, addr: SocketAddr, cert: &str, key: &str) -> Result<()> {
    let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
        .await
        .with_context(|| format!("failed to load TLS cert {cert} / key {key}"))?;
    info!(%addr, "api listening on https://{addr}");
    axum_server::bind_rustls(addr, tls)
        .serve(app.into_make_service())
        .await
        .context("web server error")
}

#[cfg(not(feature = "tls"))]
async fn serve_tls(_app: Router, _addr: SocketAddr, _cert: &str, _key: &str) -> Result<()> {
    anyhow::bail!("tls_cert is configured but pump-hub was built without the `tls` feature")
}

// ===========================================================================
// Tests
// ===========================================================================
