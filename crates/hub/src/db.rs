use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Executor, Pool, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;

use crate::pump::{ControlAction, ControlState, Mode, PumpStatus, Schedule};

/// Fixed primary key of the singleton control row.
const CONTROL_ID: i64 = 1;

/// Pool size; also what a caller must hold to starve the store.
pub const MAX_CONNECTIONS: u32 = 5;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// Control record and active schedule read in one transaction.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub control: Option<ControlState>,
    pub schedule: Option<Schedule>,
}

/// A sensor report before it is stored.
#[derive(Debug, Clone)]
pub struct NewReading {
    pub device_id: Option<String>,
    pub moisture_level: f64,
    pub water_level: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SensorReading {
    pub id: i64,
    pub ts: i64,
    pub device_id: Option<String>,
    pub moisture_level: f64,
    pub water_level: f64,
    pub pump_status: PumpStatus,
}

/// Device ids end up in `pump/<id>/set`.
const MAX_DEVICE_ID_LEN: usize = 64;

type ScheduleRow = (i64, String, String, bool);
type ReadingRow = (i64, i64, Option<String>, f64, f64, String);

impl NewReading {
    /// Levels are percentages.  Reports every violation, not just the first.
    pub fn validate(&self) -> Result<(), String> {
        let mut errors = Vec::new();
        for (name, v) in [
            ("moisture_level", self.moisture_level),
            ("water_level", self.water_level),
        ] {
            if !v.is_finite() || !(0.0..=100.0).contains(&v) {
                errors.push(format!("{name} {v} out of range [0, 100]"));
            }
        }
        if let Some(id) = &self.device_id {
            if id.trim().is_empty() {
                errors.push("device_id is empty".to_string());
            } else if id.len() > MAX_DEVICE_ID_LEN {
                errors.push(format!("device_id longer than {MAX_DEVICE_ID_LEN} bytes"));
            } else if id.contains(['/', '+', '#']) || id.chars().any(char::is_control) {
                errors.push(format!("device_id '{id}' cannot be used in an MQTT topic"));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/pump-hub/pump.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Control state
    // ----------------------------

    /// Create the control row (AUTO, no pause) if it does not exist yet.
    /// Returns true when a row was created.
    pub async fn ensure_control_row(&self, now: OffsetDateTime) -> Result<bool> {
        let res = sqlx::query(
            r#"
            INSERT INTO control_state (id, mode, pause_end_time, updated_at)
            VALUES (?, ?, NULL, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(CONTROL_ID)
        .bind(Mode::Auto.as_str())
        .bind(now.unix_timestamp())
        .execute(&self.pool)
        .await
        .context("ensure_control_row failed")?;
        Ok(res.rows_affected() == 1)
    }

    /// Read the control record and the active schedule as one consistent
    /// snapshot.  A stored mode that does not parse is an error.
    pub async fn read_state(&self) -> Result<StateSnapshot> {
        let mut tx = self.pool.begin().await.context("read_state: begin failed")?;

        let control_row: Option<(String, Option<i64>)> =
            sqlx::query_as("SELECT mode, pause_end_time FROM control_state WHERE id = ?")
                .bind(CONTROL_ID)
                .fetch_optional(&mut *tx)
                .await
                .context("load control state failed")?;

        let schedule = fetch_active_schedule(&mut *tx).await?;

        tx.commit().await.context("read_state: commit failed")?;

        let control = control_row
            .map(|(mode, pause)| -> Result<ControlState> {
                let mode = mode.parse::<Mode>().map_err(anyhow::Error::msg)?;
                let pause_end_time = pause
                    .map(OffsetDateTime::from_unix_timestamp)
                    .transpose()
                    .context("stored pause_end_time out of range")?;
                Ok(ControlState {
                    mode,
                    pause_end_time,
                })
            })
            .transpose()?;

        Ok(StateSnapshot { control, schedule })
    }

    /// Clear the pause only if it still holds `observed`.  Returns false when
    /// the pause changed in the meantime (a fresh PAUSE or a concurrent
    /// clear), in which case nothing is written.
    pub async fn clear_pause_if(&self, observed: OffsetDateTime, now: OffsetDateTime) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE control_state
            SET pause_end_time = NULL, updated_at = ?
            WHERE id = ? AND pause_end_time = ?
            "#,
        )
        .bind(now.unix_timestamp())
        .bind(CONTROL_ID)
        .bind(observed.unix_timestamp())
        .execute(&self.pool)
        .await
        .context("clear_pause_if failed")?;
        Ok(res.rows_affected() == 1)
    }

    /// Apply one operator action.  PAUSE writes only the pause column; the
    /// mode actions write the mode and clear the pause.
    pub async fn apply_action(&self, action: &ControlAction, now: OffsetDateTime) -> Result<()> {
        let ts = now.unix_timestamp();
        let pause = action.pause_end(now).map(unix_seconds_ceil);

        match action.mode() {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO control_state (id, mode, pause_end_time, updated_at)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(id) DO UPDATE SET
                      pause_end_time=excluded.pause_end_time,
                      updated_at=excluded.updated_at
                    "#,
                )
                .bind(CONTROL_ID)
                .bind(Mode::Auto.as_str())
                .bind(pause)
                .bind(ts)
                .execute(&self.pool)
                .await
            }
            Some(mode) => upsert_control(&self.pool, mode, ts).await,
        }
        .with_context(|| format!("apply_action {} failed", action.name()))?;
        Ok(())
    }

    // ----------------------------
    // Schedules
    // ----------------------------

    pub async fn active_schedule(&self) -> Result<Option<Schedule>> {
        fetch_active_schedule(&self.pool).await
    }

    /// Deactivate every active schedule, insert the new one as active and
    /// reset control to AUTO with no pause, atomically.
    pub async fn replace_schedule(&self, on_time: &str, off_time: &str, now: OffsetDateTime) -> Result<Schedule> {
        let ts = now.unix_timestamp();
        let mut tx = self.pool.begin().await.context("replace_schedule: begin failed")?;

        sqlx::query("UPDATE schedules SET is_active = 0 WHERE is_active = 1")
            .execute(&mut *tx)
            .await
            .context("deactivate schedules failed")?;

        let id = sqlx::query(
            r#"
            INSERT INTO schedules (on_time, off_time, is_active, created_at)
            VALUES (?, ?, 1, ?)
            "#,
        )
        .bind(on_time)
        .bind(off_time)
        .bind(ts)
        .execute(&mut *tx)
        .await
        .context("insert schedule failed")?
        .last_insert_rowid();

        upsert_control(&mut *tx, Mode::Auto, ts)
            .await
            .context("reset control failed")?;

        tx.commit().await.context("replace_schedule: commit failed")?;

        Ok(Schedule {
            id,
            on_time: on_time.to_string(),
            off_time: off_time.to_string(),
            is_active: true,
        })
    }

    /// Deactivate every active schedule and reset control to AUTO with no
    /// pause, atomically.  Returns the number of schedules deactivated.
    pub async fn deactivate_schedules(&self, now: OffsetDateTime) -> Result<u64> {
        let mut tx = self.pool.begin().await.context("deactivate_schedules: begin failed")?;

        let n = sqlx::query("UPDATE schedules SET is_active = 0 WHERE is_active = 1")
            .execute(&mut *tx)
            .await
            .context("deactivate schedules failed")?
            .rows_affected();

        upsert_control(&mut *tx, Mode::Auto, now.unix_timestamp())
            .await
            .context("reset control failed")?;

        tx.commit().await.context("deactivate_schedules: commit failed")?;
        Ok(n)
    }

    // ----------------------------
    // Sensor readings
    // ----------------------------

    pub async fn insert_reading(&self, ts: i64, r: &NewReading, status: PumpStatus) -> Result<i64> {
        let id = sqlx::query(
            r#"
            INSERT INTO sensor_readings (ts, device_id, moisture_level, water_level, pump_status)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(ts)
        .bind(r.device_id.as_deref())
        .bind(r.moisture_level)
        .bind(r.water_level)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .context("insert_reading failed")?
        .last_insert_rowid();
        Ok(id)
    }

    pub async fn latest_reading(&self) -> Result<Option<SensorReading>> {
        Ok(self.recent_readings(1).await?.into_iter().next())
    }

    /// Newest first.
    pub async fn recent_readings(&self, limit: i64) -> Result<Vec<SensorReading>> {
        let rows: Vec<ReadingRow> = sqlx::query_as(
            r#"
            SELECT id, ts, device_id, moisture_level, water_level, pump_status
            FROM sensor_readings
            ORDER BY ts DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_readings failed")?;

        Ok(rows
            .into_iter()
            .map(|(id, ts, device_id, moisture_level, water_level, status)| SensorReading {
                id,
                ts,
                device_id,
                moisture_level,
                water_level,
                pump_status: if status == "ON" {
                    PumpStatus::On
                } else {
                    PumpStatus::Off
                },
            })
            .collect())
    }
}

/// Whole unix seconds, rounded up.  A stored pause expiry never ends before
/// the requested instant.
fn unix_seconds_ceil(t: OffsetDateTime) -> i64 {
    t.unix_timestamp() + i64::from(t.nanosecond() > 0)
}

async fn fetch_active_schedule<'e, E>(exec: E) -> Result<Option<Schedule>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: Option<ScheduleRow> = sqlx::query_as(
        r#"
        SELECT id, on_time, off_time, is_active
        FROM schedules
        WHERE is_active = 1
        ORDER BY id DESC
        LIMIT 1
        "#,
    )
    .fetch_optional(exec)
    .await
    .context("load active schedule failed")?;

    Ok(row.map(|(id, on_time, off_time, is_active)| Schedule {
        id,
        on_time,
        off_time,
        is_active,
    }))
}

/// Set the mode and clear any pause on the singleton row, creating it if
/// missing.
async fn upsert_control<'e, E>(exec: E, mode: Mode, ts: i64) -> sqlx::Result<sqlx::sqlite::SqliteQueryResult>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO control_state (id, mode, pause_end_time, updated_at)
        VALUES (?, ?, NULL, ?)
        ON CONFLICT(id) DO UPDATE SET
          mode=excluded.mode,
          pause_end_time=NULL,
          updated_at=excluded.updated_at
        "#,
    )
    .bind(CONTROL_ID)
    .bind(mode.as_str())
    .bind(ts)
    .execute(exec)
    .await
}

// ===========================================================================
// Tests
// ===========================================================================
