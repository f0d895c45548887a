//! Store-backed pump controller.
//!
//! [`Engine`] is what request handlers, the MQTT listener and the sweep talk
//! to.  It reads the control record and active schedule, runs
//! [`pump::resolve`], and persists the only side effect the resolver has:
//! clearing an expired pause.
//!
//! The clear is a compare-and-clear on the observed expiry.  If another
//! writer got there first (a fresh PAUSE, or a concurrent clear) the write is
//! skipped and the evaluation restarts from a fresh read, so a new pause is
//! never lost.
//!
//! Every store call is bounded by a timeout.  Whatever goes wrong while
//! reading, [`Engine::evaluate`] answers OFF.

use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use serde::Serialize;
use time::{OffsetDateTime, Time};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::db::{Db, NewReading, SensorReading};
use crate::pump::{self, format_time_of_day, ControlAction, ControlState, PumpStatus, Schedule};

/// Compare-and-clear retries before giving up and failing safe.
const CLEAR_ATTEMPTS: u32 = 3;

#[derive(Clone)]
pub struct Engine {
    db: Db,
    clock: Clock,
    timeout: Duration,
}

/// Result of one evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct Evaluation {
    pub status: PumpStatus,
    pub cleared_pause: bool,
    /// Control record after the evaluation; `None` when it could not be read.
    pub control: Option<ControlState>,
    pub schedule: Option<Schedule>,
    #[serde(with = "time::serde::rfc3339")]
    pub evaluated_at: OffsetDateTime,
    /// Why the status was forced OFF without a full evaluation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
}

impl Evaluation {
    fn fail_safe(at: OffsetDateTime, fault: String) -> Self {
        Self {
            status: PumpStatus::Off,
            cleared_pause: false,
            control: None,
            schedule: None,
            evaluated_at: at,
            fault: Some(fault),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.control
            .is_some_and(|c| c.is_paused_at(self.evaluated_at))
    }
}

impl Engine {
    pub fn new(db: Db, clock: Clock, timeout: Duration) -> Self {
        Self { db, clock, timeout }
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    #[cfg(test)]
    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Current pump status.  Never fails: unreadable state means OFF.
    pub async fn evaluate(&self) -> Evaluation {
        match self.try_evaluate().await {
            Ok(eval) => eval,
            Err(e) => {
                error!("pump evaluation failed, forcing OFF: {e:#}");
                Evaluation::fail_safe(self.clock.now(), format!("{e:#}"))
            }
        }
    }

    async fn try_evaluate(&self) -> Result<Evaluation> {
        for attempt in 1..=CLEAR_ATTEMPTS {
            let snapshot = self.bounded(self.db.read_state()).await?;
            let now = self.clock.now();

            let Some(control) = snapshot.control else {
                warn!("control state missing, forcing OFF");
                return Ok(Evaluation {
                    schedule: snapshot.schedule,
                    ..Evaluation::fail_safe(now, "control state missing".to_string())
                });
            };

            let res = pump::resolve(now, &control, snapshot.schedule.as_ref());

            if let (true, Some(observed)) = (res.cleared_pause, control.pause_end_time) {
                if !self.bounded(self.db.clear_pause_if(observed, now)).await? {
                    debug!(attempt, "pause changed during evaluation, re-reading");
                    continue;
                }
                info!(expired_at = %observed.to_offset(self.clock.offset()), "pause expired and cleared");
            }

            let mut control = res.control;
            control.pause_end_time = control
                .pause_end_time
                .map(|t| t.to_offset(self.clock.offset()));

            return Ok(Evaluation {
                status: res.status,
                cleared_pause: res.cleared_pause,
                control: Some(control),
                schedule: snapshot.schedule,
                evaluated_at: now,
                fault: None,
            });
        }
        bail!("control state kept changing during evaluation ({CLEAR_ATTEMPTS} attempts)")
    }

    /// Apply an operator action, then report the newly effective status.
    pub async fn apply(&self, action: ControlAction) -> Result<Evaluation> {
        let now = self.clock.now();
        self.bounded(self.db.apply_action(&action, now)).await?;
        match action {
            ControlAction::Pause { minutes } => info!(minutes, "control: PAUSE"),
            _ => info!(action = action.name(), "control: mode set"),
        }
        Ok(self.evaluate().await)
    }

    // ----------------------------
    // Schedule
    // ----------------------------

    pub async fn active_schedule(&self) -> Result<Option<Schedule>> {
        self.bounded(self.db.active_schedule()).await
    }

    /// Replace the active schedule.  Control goes back to AUTO, no pause.
    pub async fn set_schedule(&self, on: Time, off: Time) -> Result<Schedule> {
        let on = format_time_of_day(on);
        let off = format_time_of_day(off);
        let schedule = self
            .bounded(self.db.replace_schedule(&on, &off, self.clock.now()))
            .await?;
        info!(id = schedule.id, on = %on, off = %off, "schedule replaced, control reset to AUTO");
        Ok(schedule)
    }

    /// Deactivate all schedules.  Control goes back to AUTO, no pause.
    pub async fn clear_schedule(&self) -> Result<u64> {
        let n = self
            .bounded(self.db.deactivate_schedules(self.clock.now()))
            .await?;
        info!(deactivated = n, "schedules cleared, control reset to AUTO");
        Ok(n)
    }

    // ----------------------------
    // Sensor ingestion
    // ----------------------------

    /// Resolve the pump status for a sensor report and store both.  The
    /// caller validates the reading first.
    pub async fn ingest(&self, reading: &NewReading) -> Result<(Evaluation, i64)> {
        let eval = self.evaluate().await;
        let id = self
            .bounded(self.db.insert_reading(
                eval.evaluated_at.unix_timestamp(),
                reading,
                eval.status,
            ))
            .await?;
        debug!(
            id,
            device = reading.device_id.as_deref().unwrap_or("-"),
            moisture = reading.moisture_level,
            water = reading.water_level,
            status = %eval.status,
            "reading stored"
        );
        Ok((eval, id))
    }

    pub async fn latest_reading(&self) -> Result<Option<SensorReading>> {
        self.bounded(self.db.latest_reading()).await
    }

    pub async fn recent_readings(&self, limit: i64) -> Result<Vec<SensorReading>> {
        self.bounded(self.db.recent_readings(limit)).await
    }

    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| anyhow!("store call timed out after {:?}", self.timeout))?
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MAX_CONNECTIONS;
    use crate::pump::Mode;
    use time::macros::{datetime, time};

    const NOON: OffsetDateTime = datetime!(2024-06-01 12:00 +7);

    async fn engine_at(now: OffsetDateTime) -> Engine {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.ensure_control_row(now).await.unwrap();
        Engine::new(db, Clock::fixed(now), Duration::from_secs(2))
    }

    /// Same store, different clock.
    fn at(engine: &Engine, now: OffsetDateTime) -> Engine {
        Engine::new(engine.db.clone(), Clock::fixed(now), engine.timeout)
    }

    fn reading() -> NewReading {
        NewReading {
            device_id: None,
            moisture_level: 42.0,
            water_level: 90.0,
        }
    }

    #[tokio::test]
    async fn fresh_controller_is_off() {
        let engine = engine_at(NOON).await;
        let eval = engine.evaluate().await;
        assert_eq!(eval.status, PumpStatus::Off);
        assert_eq!(eval.control, Some(ControlState::default()));
        assert!(eval.fault.is_none());
    }

    #[tokio::test]
    async fn missing_control_row_fails_safe() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.replace_schedule("00:00:00", "23:59:59", NOON).await.unwrap();
        sqlx::query("DELETE FROM control_state").execute(db.pool()).await.unwrap();

        let engine = Engine::new(db, Clock::fixed(NOON), Duration::from_secs(2));
        let eval = engine.evaluate().await;
        assert_eq!(eval.status, PumpStatus::Off);
        assert!(eval.control.is_none());
        assert_eq!(eval.fault.as_deref(), Some("control state missing"));
    }

    #[tokio::test]
    async fn unreadable_control_row_fails_safe() {
        let engine = engine_at(NOON).await;
        engine.apply(ControlAction::ManualOn).await.unwrap();
        sqlx::query("UPDATE control_state SET mode = 'on'")
            .execute(engine.db.pool())
            .await
            .unwrap();

        let eval = engine.evaluate().await;
        assert_eq!(eval.status, PumpStatus::Off);
        assert!(eval.fault.unwrap().contains("unknown control mode"));
    }

    #[tokio::test]
    async fn closed_store_fails_safe() {
        let engine = engine_at(NOON).await;
        engine.apply(ControlAction::ManualOn).await.unwrap();
        engine.db.pool().close().await;

        let eval = engine.evaluate().await;
        assert_eq!(eval.status, PumpStatus::Off);
        assert!(eval.fault.is_some());
    }

    #[tokio::test]
    async fn timed_out_store_call_is_an_error() {
        let engine = engine_at(NOON).await;
        let slow = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        };
        let short = Engine {
            timeout: Duration::from_millis(10),
            ..engine
        };
        let err = short.bounded(slow).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn timed_out_read_fails_safe() {
        let engine = engine_at(NOON).await;
        engine.apply(ControlAction::ManualOn).await.unwrap();

        // Hold every pooled connection so the read cannot start.
        let mut held = Vec::new();
        for _ in 0..MAX_CONNECTIONS {
            held.push(engine.db.pool().acquire().await.unwrap());
        }
        let short = Engine {
            timeout: Duration::from_millis(50),
            ..engine.clone()
        };

        let eval = short.evaluate().await;
        assert_eq!(eval.status, PumpStatus::Off);
        assert!(eval.control.is_none());
        assert!(eval.fault.unwrap().contains("timed out"));

        drop(held);
        assert_eq!(engine.evaluate().await.status, PumpStatus::On);
    }

    #[tokio::test]
    async fn manual_on_reports_on() {
        let engine = engine_at(NOON).await;
        let eval = engine.apply(ControlAction::ManualOn).await.unwrap();
        assert_eq!(eval.status, PumpStatus::On);
    }

    #[tokio::test]
    async fn pause_forces_off_then_expires_back_to_manual_on() {
        let engine = engine_at(NOON).await;
        engine.apply(ControlAction::ManualOn).await.unwrap();

        let eval = engine.apply(ControlAction::Pause { minutes: 10 }).await.unwrap();
        assert_eq!(eval.status, PumpStatus::Off);
        assert!(eval.is_paused());
        assert_eq!(eval.control.unwrap().mode, Mode::ManualOn);

        let later = at(&engine, NOON + time::Duration::minutes(10));
        let eval = later.evaluate().await;
        assert!(eval.cleared_pause);
        assert_eq!(eval.status, PumpStatus::On);

        // The clear was persisted.
        let snap = engine.db.read_state().await.unwrap();
        assert_eq!(snap.control.unwrap().pause_end_time, None);

        // Idempotent: nothing left to clear, same answer.
        let again = later.evaluate().await;
        assert!(!again.cleared_pause);
        assert_eq!(again.status, PumpStatus::On);
    }

    #[tokio::test]
    async fn pause_taken_mid_second_holds_for_the_full_duration() {
        let start = NOON + time::Duration::milliseconds(900);
        let engine = engine_at(start).await;
        engine.apply(ControlAction::ManualOn).await.unwrap();
        engine.apply(ControlAction::Pause { minutes: 1 }).await.unwrap();

        let just_before = at(&engine, start + time::Duration::minutes(1) - time::Duration::milliseconds(800));
        let eval = just_before.evaluate().await;
        assert_eq!(eval.status, PumpStatus::Off);
        assert!(eval.is_paused());
        assert!(!eval.cleared_pause);

        let after = at(&engine, NOON + time::Duration::seconds(61));
        let eval = after.evaluate().await;
        assert!(eval.cleared_pause);
        assert_eq!(eval.status, PumpStatus::On);
    }

    #[tokio::test]
    async fn pause_end_time_reported_in_local_offset() {
        let engine = engine_at(NOON).await;
        let eval = engine.apply(ControlAction::Pause { minutes: 30 }).await.unwrap();
        let end = eval.control.unwrap().pause_end_time.unwrap();
        assert_eq!(end.offset(), engine.clock().offset());
        assert_eq!(end, NOON + time::Duration::minutes(30));
    }

    #[tokio::test]
    async fn schedule_drives_auto_mode() {
        let engine = engine_at(NOON).await;
        engine.set_schedule(time!(07:00), time!(18:00)).await.unwrap();
        assert_eq!(engine.evaluate().await.status, PumpStatus::On);

        let evening = at(&engine, datetime!(2024-06-01 19:00 +7));
        assert_eq!(evening.evaluate().await.status, PumpStatus::Off);
    }

    #[tokio::test]
    async fn schedule_change_resets_manual_mode() {
        let engine = engine_at(NOON).await;
        engine.apply(ControlAction::ManualOn).await.unwrap();
        engine.apply(ControlAction::Pause { minutes: 5 }).await.unwrap();

        let s = engine.set_schedule(time!(22:00), time!(06:00)).await.unwrap();
        assert_eq!((s.on_time.as_str(), s.off_time.as_str()), ("22:00:00", "06:00:00"));

        let eval = engine.evaluate().await;
        assert_eq!(eval.control, Some(ControlState::default()));
        assert_eq!(eval.status, PumpStatus::Off);

        engine.apply(ControlAction::ManualOn).await.unwrap();
        assert_eq!(engine.clear_schedule().await.unwrap(), 1);
        let eval = engine.evaluate().await;
        assert_eq!(eval.control.unwrap().mode, Mode::Auto);
        assert!(eval.schedule.is_none());
        assert_eq!(eval.status, PumpStatus::Off);
    }

    #[tokio::test]
    async fn malformed_stored_schedule_is_off() {
        let engine = engine_at(NOON).await;
        engine.db.replace_schedule("seven", "18:00:00", NOON).await.unwrap();
        let eval = engine.evaluate().await;
        assert_eq!(eval.status, PumpStatus::Off);
        assert!(eval.fault.is_none());
        assert!(eval.schedule.is_some());
    }

    #[tokio::test]
    async fn concurrent_evaluations_clear_once() {
        let engine = engine_at(NOON).await;
        engine.apply(ControlAction::ManualOn).await.unwrap();
        engine.apply(ControlAction::Pause { minutes: 1 }).await.unwrap();

        let later = at(&engine, NOON + time::Duration::minutes(5));
        let (a, b) = tokio::join!(later.evaluate(), later.evaluate());

        assert_eq!(a.status, PumpStatus::On);
        assert_eq!(b.status, PumpStatus::On);
        assert!(a.fault.is_none() && b.fault.is_none());

        let snap = engine.db.read_state().await.unwrap();
        assert_eq!(snap.control.unwrap().pause_end_time, None);
    }

    #[tokio::test]
    async fn fresh_pause_wins_over_stale_clear() {
        let engine = engine_at(NOON).await;
        engine.apply(ControlAction::Pause { minutes: 1 }).await.unwrap();
        let stale = engine.db.read_state().await.unwrap().control.unwrap();

        // A new pause lands between the sweep's read and its clear.
        let later = at(&engine, NOON + time::Duration::minutes(2));
        later.apply(ControlAction::Pause { minutes: 30 }).await.unwrap();

        let observed = stale.pause_end_time.unwrap();
        assert!(!engine.db.clear_pause_if(observed, later.clock().now()).await.unwrap());

        let eval = later.evaluate().await;
        assert_eq!(eval.status, PumpStatus::Off);
        assert!(eval.is_paused());
        assert!(!eval.cleared_pause);
    }

    #[tokio::test]
    async fn ingest_stores_resolved_status() {
        let engine = engine_at(NOON).await;
        engine.apply(ControlAction::ManualOn).await.unwrap();

        let (eval, id) = engine.ingest(&reading()).await.unwrap();
        assert_eq!(eval.status, PumpStatus::On);

        let latest = engine.latest_reading().await.unwrap().unwrap();
        assert_eq!(latest.id, id);
        assert_eq!(latest.pump_status, PumpStatus::On);
        assert_eq!(latest.ts, NOON.unix_timestamp());
    }

    #[tokio::test]
    async fn ingest_clears_expired_pause() {
        let engine = engine_at(NOON).await;
        engine.apply(ControlAction::Pause { minutes: 1 }).await.unwrap();

        let later = at(&engine, NOON + time::Duration::minutes(1));
        let (eval, _) = later.ingest(&reading()).await.unwrap();
        assert!(eval.cleared_pause);
        assert_eq!(eval.status, PumpStatus::Off); // AUTO, no schedule
    }

    #[tokio::test]
    async fn recent_readings_limit() {
        let engine = engine_at(NOON).await;
        for _ in 0..4 {
            engine.ingest(&reading()).await.unwrap();
        }
        assert_eq!(engine.recent_readings(3).await.unwrap().len(), 3);
    }
}
