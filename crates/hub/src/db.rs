use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Executor, Pool, Row, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;

use crate::actuator::{Cause, RelayHistoryEntry};
use crate::climate::ClimateSettings;
use crate::forecast::HistoryPoint;
use crate::light::{LightSchedule, TimeOfDay};
use crate::protocol::Relay;
use crate::sampler::{SensorSnapshot, SoilMoisture};
use crate::state::{ControlMode, Controls};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// A persisted sensor row. Unlike a live snapshot it has no monotonic
/// capture time and is always a valid reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredSnapshot {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub soil_moisture: SoilMoisture,
}

impl StoredSnapshot {
    pub fn history_point(&self) -> HistoryPoint {
        HistoryPoint {
            ts: self.ts,
            temperature: self.temperature,
            humidity: self.humidity,
        }
    }
}

mod keys {
    pub const CLIMATE_MODE: &str = "climate_mode";
    pub const LIGHT_MODE: &str = "light_mode";
    pub const TARGET_TEMP: &str = "target_temp";
    pub const TEMP_TOLERANCE: &str = "temp_tolerance";
    pub const TARGET_HUMIDITY: &str = "target_humidity";
    pub const HUMIDITY_TOLERANCE: &str = "humidity_tolerance";
    pub const PREDICTIVE: &str = "predictive";
}

fn to_millis(ts: OffsetDateTime) -> i64 {
    (ts.unix_timestamp_nanos() / 1_000_000) as i64
}

fn from_millis(ms: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .with_context(|| format!("timestamp out of range: {ms}"))
}

fn stored_snapshot(row: &SqliteRow) -> Result<StoredSnapshot> {
    Ok(StoredSnapshot {
        ts: from_millis(row.try_get("ts")?)?,
        temperature: row.try_get("temperature")?,
        humidity: row.try_get("humidity")?,
        soil_moisture: SoilMoisture::from_values([
            row.try_get("soil1")?,
            row.try_get("soil2")?,
            row.try_get("soil3")?,
            row.try_get("soil4")?,
        ]),
    })
}

async fn upsert_setting<'e, E>(exec: E, key: &str, value: &str) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
    )
    .bind(key)
    .bind(value)
    .bind(to_millis(OffsetDateTime::now_utc()))
    .execute(exec)
    .await
    .with_context(|| format!("upsert setting {key} failed"))?;
    Ok(())
}

async fn upsert_light_schedule<'e, E>(exec: E, s: &LightSchedule) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO light_schedule (id, on_time, off_time, enabled) VALUES (1, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
          on_time = excluded.on_time,
          off_time = excluded.off_time,
          enabled = excluded.enabled
        "#,
    )
    .bind(s.on_time.to_string())
    .bind(s.off_time.to_string())
    .bind(s.enabled)
    .execute(exec)
    .await
    .context("upsert light_schedule failed")?;
    Ok(())
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/greenhouse/greenhouse.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every pooled connection to :memory: is its own empty database.
        let pool_options = if db_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
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
    // Sensor data
    // ----------------------------

    pub async fn insert_snapshot(&self, s: &SensorSnapshot) -> Result<()> {
        let [s1, s2, s3, s4] = s.soil_moisture.values();
        sqlx::query(
            r#"
            INSERT INTO sensor_data (ts, temperature, humidity, soil1, soil2, soil3, soil4)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(to_millis(s.ts))
        .bind(s.temperature)
        .bind(s.humidity)
        .bind(s1)
        .bind(s2)
        .bind(s3)
        .bind(s4)
        .execute(&self.pool)
        .await
        .context("insert_snapshot failed")?;
        Ok(())
    }

    /// The newest `n` snapshots, oldest first.
    pub async fn recent_snapshots(&self, n: i64) -> Result<Vec<StoredSnapshot>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM (
              SELECT id, ts, temperature, humidity, soil1, soil2, soil3, soil4
              FROM sensor_data
              ORDER BY ts DESC, id DESC
              LIMIT ?
            ) ORDER BY ts ASC, id ASC
            "#,
        )
        .bind(n)
        .fetch_all(&self.pool)
        .await
        .context("recent_snapshots failed")?;

        rows.iter().map(stored_snapshot).collect()
    }

    /// Every snapshot at or after `since`, oldest first.
    pub async fn snapshots_since(&self, since: OffsetDateTime) -> Result<Vec<StoredSnapshot>> {
        let rows = sqlx::query(
            r#"
            SELECT ts, temperature, humidity, soil1, soil2, soil3, soil4
            FROM sensor_data
            WHERE ts >= ?
            ORDER BY ts ASC, id ASC
            "#,
        )
        .bind(to_millis(since))
        .fetch_all(&self.pool)
        .await
        .context("snapshots_since failed")?;

        rows.iter().map(stored_snapshot).collect()
    }

    // ----------------------------
    // Relay history
    // ----------------------------

    pub async fn insert_relay_event(&self, e: &RelayHistoryEntry) -> Result<()> {
        sqlx::query("INSERT INTO relay_history (ts, relay, state, cause) VALUES (?, ?, ?, ?)")
            .bind(to_millis(e.ts))
            .bind(e.relay.as_str())
            .bind(e.state)
            .bind(e.cause.as_str())
            .execute(&self.pool)
            .await
            .context("insert_relay_event failed")?;
        Ok(())
    }

    /// Latest `limit` transitions, newest first.
    pub async fn relay_history(&self, limit: i64) -> Result<Vec<RelayHistoryEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT ts, relay, state, cause
            FROM relay_history
            ORDER BY ts DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("relay_history failed")?;

        rows.iter()
            .map(|r| {
                let relay: String = r.try_get("relay")?;
                let cause: String = r.try_get("cause")?;
                Ok(RelayHistoryEntry {
                    relay: relay.parse::<Relay>().map_err(|e| anyhow!(e))?,
                    state: r.try_get("state")?,
                    cause: cause.parse::<Cause>().map_err(|e| anyhow!(e))?,
                    ts: from_millis(r.try_get("ts")?)?,
                })
            })
            .collect()
    }

    // ----------------------------
    // Settings
    // ----------------------------

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("get_setting({key}) failed"))?;
        Ok(value)
    }

    async fn seed_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(to_millis(OffsetDateTime::now_utc()))
        .execute(&self.pool)
        .await
        .with_context(|| format!("seed_setting({key}) failed"))?;
        Ok(())
    }

    async fn parsed_setting<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        Ok(match self.get_setting(key).await? {
            Some(raw) => match raw.parse::<T>() {
                Ok(v) => v,
                Err(_) => {
                    tracing::warn!(key, value = %raw, "unparseable setting; using default");
                    default
                }
            },
            None => default,
        })
    }

    fn control_pairs(c: &Controls) -> [(&'static str, String); 7] {
        [
            (keys::CLIMATE_MODE, c.climate_mode.to_string()),
            (keys::LIGHT_MODE, c.light_mode.to_string()),
            (keys::TARGET_TEMP, c.settings.target_temp.to_string()),
            (keys::TEMP_TOLERANCE, c.settings.temp_tolerance.to_string()),
            (keys::TARGET_HUMIDITY, c.settings.target_humidity.to_string()),
            (keys::HUMIDITY_TOLERANCE, c.settings.humidity_tolerance.to_string()),
            (keys::PREDICTIVE, c.predictive.to_string()),
        ]
    }

    /// Write `defaults` for every control that has never been stored.
    pub async fn seed_controls(&self, defaults: &Controls) -> Result<()> {
        for (key, value) in Self::control_pairs(defaults) {
            self.seed_setting(key, &value).await?;
        }
        sqlx::query(
            r#"
            INSERT INTO light_schedule (id, on_time, off_time, enabled) VALUES (1, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(defaults.schedule.on_time.to_string())
        .bind(defaults.schedule.off_time.to_string())
        .bind(defaults.schedule.enabled)
        .execute(&self.pool)
        .await
        .context("seed light_schedule failed")?;
        Ok(())
    }

    /// Stored controls, falling back to `defaults` per missing key.
    pub async fn load_controls(&self, defaults: &Controls) -> Result<Controls> {
        let settings = ClimateSettings {
            target_temp: self
                .parsed_setting(keys::TARGET_TEMP, defaults.settings.target_temp)
                .await?,
            temp_tolerance: self
                .parsed_setting(keys::TEMP_TOLERANCE, defaults.settings.temp_tolerance)
                .await?,
            target_humidity: self
                .parsed_setting(keys::TARGET_HUMIDITY, defaults.settings.target_humidity)
                .await?,
            humidity_tolerance: self
                .parsed_setting(keys::HUMIDITY_TOLERANCE, defaults.settings.humidity_tolerance)
                .await?,
        };

        Ok(Controls {
            climate_mode: self
                .parsed_setting::<ControlMode>(keys::CLIMATE_MODE, defaults.climate_mode)
                .await?,
            light_mode: self
                .parsed_setting::<ControlMode>(keys::LIGHT_MODE, defaults.light_mode)
                .await?,
            settings,
            schedule: self
                .load_light_schedule()
                .await?
                .unwrap_or(defaults.schedule),
            predictive: self
                .parsed_setting(keys::PREDICTIVE, defaults.predictive)
                .await?,
        })
    }

    /// Persist every control in one transaction; a failure leaves the stored
    /// controls as they were.
    pub async fn save_controls(&self, c: &Controls) -> Result<()> {
        let mut tx = self.pool.begin().await.context("save_controls: begin failed")?;
        for (key, value) in Self::control_pairs(c) {
            upsert_setting(&mut *tx, key, &value).await?;
        }
        upsert_light_schedule(&mut *tx, &c.schedule).await?;
        tx.commit().await.context("save_controls: commit failed")?;
        Ok(())
    }

    // ----------------------------
    // Light schedule
    // ----------------------------

    pub async fn load_light_schedule(&self) -> Result<Option<LightSchedule>> {
        let row = sqlx::query("SELECT on_time, off_time, enabled FROM light_schedule WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .context("load_light_schedule failed")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let on: String = row.try_get("on_time")?;
        let off: String = row.try_get("off_time")?;
        Ok(Some(LightSchedule {
            on_time: TimeOfDay::parse(&on).map_err(|e| anyhow!("stored on_time: {e}"))?,
            off_time: TimeOfDay::parse(&off).map_err(|e| anyhow!("stored off_time: {e}"))?,
            enabled: row.try_get("enabled")?,
        }))
    }

    // ----------------------------
    // Retention
    // ----------------------------

    /// Delete sensor and relay rows older than `days` before `now`. Returns
    /// the number of rows removed.
    pub async fn cleanup_older_than(&self, days: u32, now: OffsetDateTime) -> Result<u64> {
        let cutoff = to_millis(now - time::Duration::days(days as i64));
        let sensors = sqlx::query("DELETE FROM sensor_data WHERE ts < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("cleanup sensor_data failed")?
            .rows_affected();
        let relays = sqlx::query("DELETE FROM relay_history WHERE ts < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("cleanup relay_history failed")?
            .rows_affected();
        Ok(sensors + relays)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
