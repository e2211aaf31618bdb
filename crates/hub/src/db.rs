use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};

use crate::error::StoreError;
use crate::history::{HistoryEntry, NewHistoryEntry};
use crate::schedule::{parse_once, ScheduleRecord, ScheduleStatus, ScheduleType, ValidSchedule};

// Per-type columns come back as text whatever was stored in them, so a
// hand-edited row fails its own checks instead of the whole query.
const SCHEDULE_COLUMNS: &str = "id, \
     CAST(type AS TEXT) AS type, \
     CAST(datetime AS TEXT) AS datetime, \
     CAST(duration AS TEXT) AS duration, \
     CAST(repeat_interval AS TEXT) AS repeat_interval, \
     CAST(weekday AS TEXT) AS weekday, \
     CAST(keep_after_run AS INTEGER) AS keep_after_run, \
     CAST(status AS TEXT) AS status";

const HISTORY_COLUMNS: &str = "id, timestamp, status, mode, soil, rain, temperature, humidity, \
     weather_condition, wind_speed, location";

// ---------------------------------------------------------------------------
// Schedule store
// ---------------------------------------------------------------------------

/// Durable schedule records.  The job scheduler only ever talks to this
/// trait so it can run against an in-memory double in tests.
#[async_trait]
pub trait ScheduleStore: Send + Sync + 'static {
    /// Every record, newest first.
    async fn list_all(&self) -> Result<Vec<ScheduleRecord>, StoreError>;
    async fn list_active(&self) -> Result<Vec<ScheduleRecord>, StoreError>;
    async fn get(&self, id: i64) -> Result<Option<ScheduleRecord>, StoreError>;
    async fn insert(&self, schedule: &ValidSchedule) -> Result<i64, StoreError>;
    /// `false` when no such record exists.
    async fn delete(&self, id: i64) -> Result<bool, StoreError>;
    async fn set_status(&self, id: i64, status: ScheduleStatus) -> Result<bool, StoreError>;
    /// Remove one-shot records whose time is before `now_local` and that are
    /// not marked keep-after-run.  Returns the number removed.
    async fn delete_expired_once(&self, now_local: NaiveDateTime) -> Result<u64, StoreError>;
}

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/irrigation/irrigation.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Each connection to :memory: is its own database.
        let pool = if db_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    // ----------------------------
    // History
    // ----------------------------

    pub async fn insert_history(&self, e: &NewHistoryEntry) -> Result<i64, StoreError> {
        let res = sqlx::query(
            r#"
            INSERT INTO irrigation_history (
              timestamp, status, mode, soil, rain,
              temperature, humidity, weather_condition, wind_speed, location
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(e.timestamp_string())
        .bind(e.status_str())
        .bind(e.mode_str())
        .bind(i64::from(e.soil))
        .bind(i64::from(e.rain))
        .bind(e.weather.temperature)
        .bind(e.weather.humidity)
        .bind(e.weather.condition.as_deref())
        .bind(e.weather.wind_speed)
        .bind(e.weather.location.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(res.last_insert_rowid())
    }

    /// Newest first.
    pub async fn list_history(&self, limit: i64) -> Result<Vec<HistoryEntry>, StoreError> {
        let rows = sqlx::query_as::<_, HistoryEntry>(&format!(
            "SELECT {HISTORY_COLUMNS} FROM irrigation_history ORDER BY id DESC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn delete_history(&self, id: i64) -> Result<bool, StoreError> {
        let res = sqlx::query("DELETE FROM irrigation_history WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn clear_history(&self) -> Result<u64, StoreError> {
        let res = sqlx::query("DELETE FROM irrigation_history")
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}

#[async_trait]
impl ScheduleStore for Db {
    async fn list_all(&self) -> Result<Vec<ScheduleRecord>, StoreError> {
        let rows = sqlx::query_as::<_, ScheduleRecord>(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM irrigation_schedule ORDER BY id DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_active(&self) -> Result<Vec<ScheduleRecord>, StoreError> {
        let rows = sqlx::query_as::<_, ScheduleRecord>(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM irrigation_schedule WHERE status = ? ORDER BY id"
        ))
        .bind(ScheduleStatus::Active.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn get(&self, id: i64) -> Result<Option<ScheduleRecord>, StoreError> {
        let row = sqlx::query_as::<_, ScheduleRecord>(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM irrigation_schedule WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn insert(&self, s: &ValidSchedule) -> Result<i64, StoreError> {
        let res = sqlx::query(
            r#"
            INSERT INTO irrigation_schedule (
              type, datetime, duration, repeat_interval, weekday, keep_after_run, status
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(s.kind.as_str())
        .bind(s.datetime.as_deref())
        .bind(s.duration)
        .bind(s.repeat_interval)
        .bind(s.weekday.as_deref())
        .bind(s.keep_after_run)
        .bind(ScheduleStatus::Active.as_str())
        .execute(&self.pool)
        .await?;
        Ok(res.last_insert_rowid())
    }

    async fn delete(&self, id: i64) -> Result<bool, StoreError> {
        let res = sqlx::query("DELETE FROM irrigation_schedule WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn set_status(&self, id: i64, status: ScheduleStatus) -> Result<bool, StoreError> {
        let res = sqlx::query("UPDATE irrigation_schedule SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn delete_expired_once(&self, now_local: NaiveDateTime) -> Result<u64, StoreError> {
        // Compared as timestamps, not strings: stored values may lack
        // zero padding or use a `T` separator from older clients.
        let candidates: Vec<(i64, Option<String>)> = sqlx::query_as(
            "SELECT id, CAST(datetime AS TEXT) FROM irrigation_schedule \
             WHERE lower(trim(type)) = ? AND keep_after_run = 0",
        )
        .bind(ScheduleType::Once.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut removed = 0;
        for (id, datetime) in candidates {
            let expired = datetime
                .as_deref()
                .and_then(|s| parse_once(s.trim()).ok())
                .is_some_and(|at| at < now_local);
            if expired && self.delete(id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
