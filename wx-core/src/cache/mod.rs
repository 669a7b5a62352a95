//! Shared state cache: a thin `redis` wrapper used as the alarm state
//! store (§6.5). Ported from the teacher's `RedisCache` (JSON-over-string
//! get/set/delete with an optional TTL) and narrowed to what the alarm
//! evaluator needs.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Result;

#[derive(Clone)]
pub struct StateCache {
    conn: ConnectionManager,
}

impl std::fmt::Debug for StateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateCache").finish_non_exhaustive()
    }
}

impl StateCache {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;
        match raw {
            Some(json) => {
                debug!(key, "cache hit");
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => {
                debug!(key, "cache miss");
                Ok(None)
            }
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(value)?;
        conn.set_ex::<_, _, ()>(key, json, ttl.as_secs()).await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}

/// Logs and swallows a cache error, matching the evaluator's degraded-mode
/// policy (§7: cache-store errors are logged but do not abort evaluation).
pub fn log_degraded(context: &str, err: &crate::error::Error) {
    warn!(context, error = %err, "cache unavailable, proceeding in degraded mode");
}

/// Key under which alarm state for a (location, metric) pair lives.
pub fn alarm_state_key(location: &str, metric: &str) -> String {
    format!("alarm_state:{location}:{metric}")
}

/// TTL applied to alarm-state cache entries (§6.5): generous, for
/// automatic cleanup rather than correctness.
pub const ALARM_STATE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alarm_state_key_is_stable() {
        assert_eq!(alarm_state_key("90210", "temperature"), "alarm_state:90210:temperature");
    }
}
