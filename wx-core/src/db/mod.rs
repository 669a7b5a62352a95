//! Relational store access: pooled `sqlx` Postgres client plus the four
//! operations the core needs (§6.4). Pool sizing and the `after_connect`
//! hook follow the teacher's `PostgresDatabase` constructor.

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::info;

use crate::error::Result;
use crate::model::{LocationKey, MetricName, Operator, RawSample, Threshold};

#[derive(Debug, Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connects with the spec's fixed pool sizing: 25 open, 5 idle.
    pub async fn connect(database_url: &str) -> Result<Self> {
        info!("connecting to relational store");
        let pool = PgPoolOptions::new()
            .max_connections(25)
            .min_connections(5)
            .acquire_timeout(std::time::Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Wraps an already-constructed pool, used by integration tests that
    /// provision their own ephemeral database via `#[sqlx::test]`.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Upserts a minimal `location` row on first sighting of a location
    /// key. Called by the persistence worker before inserting a sample.
    pub async fn upsert_location(&self, key: &str, label: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO location (key, label)
            VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET label = EXCLUDED.label, updated_at = now()
            "#,
        )
        .bind(key)
        .bind(label)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Inserts a raw sample idempotently: the unique key
    /// `(location, client_ts, connection_id)` makes redelivery a no-op
    /// rather than a duplicate row (§4.G idempotency strategy).
    pub async fn insert_raw_sample(&self, sample: &RawSample) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO raw_sample (
                location, client_ts, server_ts, connection_id,
                temperature, humidity, precipitation, wind_speed,
                wind_direction, pollution, pollen
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (location, client_ts, connection_id) DO NOTHING
            "#,
        )
        .bind(&sample.location)
        .bind(sample.data.timestamp)
        .bind(sample.received_at)
        .bind(sample.connection_id)
        .bind(sample.data.metrics.temperature)
        .bind(sample.data.metrics.humidity)
        .bind(sample.data.metrics.precipitation)
        .bind(sample.data.metrics.wind_speed)
        .bind(sample.data.metrics.wind_direction.map(|d| format!("{d:?}")))
        .bind(sample.data.metrics.pollution)
        .bind(sample.data.metrics.pollen)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Active thresholds configured for `location`.
    pub async fn active_thresholds(&self, location: &str) -> Result<Vec<Threshold>> {
        let rows = sqlx::query(
            r#"
            SELECT location, metric, operator, value, duration_minutes, active
            FROM threshold
            WHERE location = $1 AND active
            "#,
        )
        .bind(location)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_threshold).collect()
    }

    /// Inserts a new ACTIVE alarm-log row, returning its assigned id.
    pub async fn insert_alarm_log(
        &self,
        location: &LocationKey,
        metric: MetricName,
        first_value: f64,
        threshold_json: &serde_json::Value,
        start_ts: DateTime<Utc>,
    ) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO alarm_log (location, metric, first_value, threshold_json, start_ts, status)
            VALUES ($1, $2, $3, $4, $5, 'ACTIVE')
            RETURNING id
            "#,
        )
        .bind(location)
        .bind(metric.as_str())
        .bind(first_value)
        .bind(threshold_json)
        .bind(start_ts)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    /// Marks an alarm-log row CLEARED with its end timestamp.
    pub async fn clear_alarm_log(&self, alarm_id: i64, end_ts: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE alarm_log SET status = 'CLEARED', end_ts = $2 WHERE id = $1
            "#,
        )
        .bind(alarm_id)
        .bind(end_ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[cfg(test)]
    pub fn stats(&self) -> PoolStats {
        PoolStats { size: self.pool.size(), idle: self.pool.num_idle() as u32 }
    }
}

#[derive(Debug, Clone)]
pub struct PoolStats {
    pub size: u32,
    pub idle: u32,
}

fn row_to_threshold(row: &PgRow) -> Result<Threshold> {
    let metric_str: String = row.try_get("metric")?;
    let operator_str: String = row.try_get("operator")?;
    Ok(Threshold {
        location: row.try_get("location")?,
        metric: metric_str.parse().map_err(|_| {
            crate::error::Error::InvalidFrame(format!("unknown metric in store: {metric_str}"))
        })?,
        operator: parse_operator(&operator_str)?,
        value: row.try_get("value")?,
        duration_minutes: row.try_get("duration_minutes")?,
        active: row.try_get("active")?,
    })
}

fn parse_operator(s: &str) -> Result<Operator> {
    match s {
        ">" => Ok(Operator::Gt),
        "<" => Ok(Operator::Lt),
        ">=" => Ok(Operator::Ge),
        "<=" => Ok(Operator::Le),
        other => Err(crate::error::Error::InvalidFrame(format!("unknown operator: {other}"))),
    }
}

/// Immutable JSON snapshot of a threshold, stored on the alarm-log row at
/// trigger time.
pub fn threshold_snapshot(t: &Threshold) -> serde_json::Value {
    serde_json::json!({
        "location": t.location,
        "metric": t.metric.as_str(),
        "operator": t.operator.as_str(),
        "value": t.value,
        "duration_minutes": t.duration_minutes,
    })
}
