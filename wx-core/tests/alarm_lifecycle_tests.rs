//! End-to-end alarm lifecycle tests against real Postgres and Redis,
//! covering the CLEAR -> PENDING -> ACTIVE -> CLEARED scenarios (S4/S5)
//! and the transient-breach scenario (S6) from the design's end-to-end
//! scenario list. Each `#[sqlx::test]` gets its own ephemeral database;
//! Redis is shared, so every test uses a fresh, randomly keyed location
//! to avoid cross-test cache collisions, and cleans its own key up.
//!
//! Requires a reachable `REDIS_URL` (defaults to `redis://127.0.0.1:6379`
//! if unset), in addition to the ephemeral Postgres `#[sqlx::test]`
//! already provisions.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use sqlx::PgPool;

use wx_core::alarm::AlarmEvaluator;
use wx_core::cache::StateCache;
use wx_core::db::Database;
use wx_core::error::Result;
use wx_core::log::LogProducer;
use wx_core::model::{Metrics, RawSample, RawSampleData};

struct RecordingProducer {
    published: Mutex<Vec<(String, String)>>,
}

impl RecordingProducer {
    fn new() -> Self {
        Self { published: Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl LogProducer for RecordingProducer {
    async fn publish(&self, topic: &str, key: &str, _value: &[u8]) -> Result<()> {
        self.published.lock().push((topic.to_string(), key.to_string()));
        Ok(())
    }
}

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

async fn seed_threshold(pool: &PgPool, location: &str) {
    sqlx::query("INSERT INTO location (key, label) VALUES ($1, $2)")
        .bind(location)
        .bind("Test City")
        .execute(pool)
        .await
        .unwrap();

    sqlx::query(
        "INSERT INTO threshold (location, metric, operator, value, duration_minutes, active) \
         VALUES ($1, 'temperature', '>', 30.0, 10, true)",
    )
    .bind(location)
    .execute(pool)
    .await
    .unwrap();
}

// The evaluator runs duration semantics off `received_at` (server wall
// time), not the sensor-supplied `data.timestamp`, so these tests drive
// the simulated passage of time through `received_at`; `data.timestamp`
// just tags along with the same value since nothing under test reads it.
fn sample(location: &str, received_at: DateTime<Utc>, temperature: f64) -> RawSample {
    RawSample {
        connection_id: uuid::Uuid::new_v4(),
        location: location.to_string(),
        label: "Test City".to_string(),
        received_at,
        data: RawSampleData {
            timestamp: received_at,
            metrics: Metrics { temperature: Some(temperature), ..Default::default() },
        },
    }
}

async fn cache_key_present(cache: &StateCache, location: &str) -> bool {
    cache.get::<serde_json::Value>(&wx_core::cache::alarm_state_key(location, "temperature"))
        .await
        .unwrap()
        .is_some()
}

#[sqlx::test(migrations = "./migrations")]
async fn alarm_triggers_after_sustained_breach_then_clears(pool: PgPool) {
    let location = format!("90210-{}", uuid::Uuid::new_v4());
    seed_threshold(&pool, &location).await;

    let db = Arc::new(Database::from_pool(pool.clone()));
    let cache = Arc::new(StateCache::connect(&redis_url()).await.expect("redis reachable"));
    let producer = Arc::new(RecordingProducer::new());
    let evaluator = AlarmEvaluator::new(db, cache.clone(), producer.clone());

    let t0 = Utc::now();

    // t0: first breaching sample -> CLEAR -> PENDING, no external effect.
    evaluator.evaluate(&sample(&location, t0, 31.0)).await.unwrap();
    assert!(producer.published.lock().is_empty());
    assert!(cache_key_present(&cache, &location).await);

    // t0+6min: still breaching, still under the 10-minute duration -> PENDING continues.
    evaluator.evaluate(&sample(&location, t0 + Duration::minutes(6), 32.0)).await.unwrap();
    assert!(producer.published.lock().is_empty());

    // t0+11min: breach has now persisted >= duration -> PENDING -> ACTIVE.
    evaluator.evaluate(&sample(&location, t0 + Duration::minutes(11), 32.5)).await.unwrap();
    {
        let published = producer.published.lock();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0], ("alarm".to_string(), format!("{location}-temperature")));
    }

    let active_status: String =
        sqlx::query_scalar("SELECT status FROM alarm_log WHERE location = $1")
            .bind(&location)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(active_status, "ACTIVE");

    // t0+20min: no longer breaching -> ACTIVE -> CLEAR, alarm_log row updated, one more event.
    evaluator.evaluate(&sample(&location, t0 + Duration::minutes(20), 28.0)).await.unwrap();
    {
        let published = producer.published.lock();
        assert_eq!(published.len(), 2);
    }
    assert!(!cache_key_present(&cache, &location).await);

    let cleared_status: String =
        sqlx::query_scalar("SELECT status FROM alarm_log WHERE location = $1")
            .bind(&location)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(cleared_status, "CLEARED");

    cache.delete(&wx_core::cache::alarm_state_key(&location, "temperature")).await.unwrap();
}

#[sqlx::test(migrations = "./migrations")]
async fn transient_breach_clears_without_any_external_effect(pool: PgPool) {
    let location = format!("transient-{}", uuid::Uuid::new_v4());
    seed_threshold(&pool, &location).await;

    let db = Arc::new(Database::from_pool(pool.clone()));
    let cache = Arc::new(StateCache::connect(&redis_url()).await.expect("redis reachable"));
    let producer = Arc::new(RecordingProducer::new());
    let evaluator = AlarmEvaluator::new(db, cache.clone(), producer.clone());

    let t0 = Utc::now();

    // One breaching sample moves CLEAR -> PENDING...
    evaluator.evaluate(&sample(&location, t0, 31.0)).await.unwrap();
    assert!(cache_key_present(&cache, &location).await);

    // ...and an immediate non-breaching sample discards it: PENDING -> CLEAR.
    evaluator.evaluate(&sample(&location, t0 + Duration::seconds(1), 29.0)).await.unwrap();

    assert!(producer.published.lock().is_empty());
    assert!(!cache_key_present(&cache, &location).await);

    let alarm_log_rows: i64 = sqlx::query_scalar("SELECT count(*) FROM alarm_log WHERE location = $1")
        .bind(&location)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(alarm_log_rows, 0);
}
