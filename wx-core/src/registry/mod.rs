//! Thread-safe connection registry: O(1) lookup by connection id, and
//! O(1)-amortized lookup of all ids for a given location key. Modeled on
//! the teacher's split between a coarse `RwLock` over the bulk structure
//! and a fine-grained per-record lock for the one field mutated on every
//! hot-path read (`last_activity`), so activity updates never contend on
//! the registry-wide lock.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::LocationKey;

pub type ConnectionId = Uuid;

/// One live TCP connection's server-side state. Immutable attributes are
/// set at construction; `last_activity` is the only field mutated after
/// registration, and carries its own lock to keep that off the
/// registry's hot path.
#[derive(Debug)]
pub struct SessionRecord {
    pub connection_id: ConnectionId,
    pub location: LocationKey,
    pub label: String,
    pub accepted_at: Instant,
    last_activity: Mutex<Instant>,
}

impl SessionRecord {
    pub fn new(connection_id: ConnectionId, location: LocationKey, label: String) -> Self {
        let now = Instant::now();
        Self { connection_id, location, label, accepted_at: now, last_activity: Mutex::new(now) }
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }
}

/// A point-in-time copy of a session's attributes, returned from lookups
/// so callers never observe a record mid-mutation.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub connection_id: ConnectionId,
    pub location: LocationKey,
    pub label: String,
    pub accepted_at: Instant,
    pub last_activity: Instant,
}

impl From<&std::sync::Arc<SessionRecord>> for SessionSnapshot {
    fn from(r: &std::sync::Arc<SessionRecord>) -> Self {
        Self {
            connection_id: r.connection_id,
            location: r.location.clone(),
            label: r.label.clone(),
            accepted_at: r.accepted_at,
            last_activity: r.last_activity(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RegistryStats {
    pub live: usize,
    pub max: usize,
}

#[derive(Debug)]
struct Inner {
    by_id: HashMap<ConnectionId, std::sync::Arc<SessionRecord>>,
    by_location: HashMap<LocationKey, HashSet<ConnectionId>>,
}

/// The live set of sessions, enforcing a configurable maximum.
#[derive(Debug)]
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            inner: RwLock::new(Inner { by_id: HashMap::new(), by_location: HashMap::new() }),
            max_connections,
        }
    }

    /// Registers a new session. Fails with `RegistryFull` when the live
    /// count would exceed the configured maximum, or `DuplicateConnection`
    /// if the id is already registered.
    pub fn register(&self, record: std::sync::Arc<SessionRecord>) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.by_id.contains_key(&record.connection_id) {
            return Err(Error::DuplicateConnection(record.connection_id));
        }
        if inner.by_id.len() >= self.max_connections {
            return Err(Error::RegistryFull { max: self.max_connections });
        }
        inner
            .by_location
            .entry(record.location.clone())
            .or_default()
            .insert(record.connection_id);
        inner.by_id.insert(record.connection_id, record);
        Ok(())
    }

    pub fn unregister(&self, id: ConnectionId) -> Option<std::sync::Arc<SessionRecord>> {
        let mut inner = self.inner.write();
        let record = inner.by_id.remove(&id)?;
        if let Some(set) = inner.by_location.get_mut(&record.location) {
            set.remove(&id);
            if set.is_empty() {
                inner.by_location.remove(&record.location);
            }
        }
        Some(record)
    }

    pub fn get(&self, id: ConnectionId) -> Option<std::sync::Arc<SessionRecord>> {
        self.inner.read().by_id.get(&id).cloned()
    }

    /// Returns a snapshot of every session currently registered for
    /// `location`. Snapshots, not live references, so callers never see
    /// mid-mutation state.
    pub fn get_by_location(&self, location: &str) -> Vec<SessionSnapshot> {
        let inner = self.inner.read();
        let Some(ids) = inner.by_location.get(location) else {
            return Vec::new();
        };
        ids.iter().filter_map(|id| inner.by_id.get(id).map(SessionSnapshot::from)).collect()
    }

    pub fn update_activity(&self, id: ConnectionId) {
        if let Some(record) = self.inner.read().by_id.get(&id) {
            record.touch();
        }
    }

    pub fn count(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats { live: self.count(), max: self.max_connections }
    }

    /// All connection ids whose `last_activity` is older than `timeout`.
    pub fn find_inactive(&self, timeout: std::time::Duration) -> Vec<ConnectionId> {
        let now = Instant::now();
        self.inner
            .read()
            .by_id
            .values()
            .filter(|r| now.duration_since(r.last_activity()) >= timeout)
            .map(|r| r.connection_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn rec(id: ConnectionId, loc: &str) -> Arc<SessionRecord> {
        Arc::new(SessionRecord::new(id, loc.to_string(), "Test City".into()))
    }

    #[test]
    fn register_then_unregister_removes_from_both_indices() {
        let reg = ConnectionRegistry::new(10);
        let id = Uuid::new_v4();
        reg.register(rec(id, "90210")).unwrap();
        assert!(reg.get(id).is_some());
        assert_eq!(reg.get_by_location("90210").len(), 1);

        reg.unregister(id);
        assert!(reg.get(id).is_none());
        assert!(reg.get_by_location("90210").is_empty());
    }

    #[test]
    fn register_rejects_duplicate_id() {
        let reg = ConnectionRegistry::new(10);
        let id = Uuid::new_v4();
        reg.register(rec(id, "90210")).unwrap();
        let err = reg.register(rec(id, "90210")).unwrap_err();
        assert!(matches!(err, Error::DuplicateConnection(_)));
    }

    #[test]
    fn register_rejects_over_capacity() {
        let reg = ConnectionRegistry::new(1);
        reg.register(rec(Uuid::new_v4(), "90210")).unwrap();
        let err = reg.register(rec(Uuid::new_v4(), "10001")).unwrap_err();
        assert!(matches!(err, Error::RegistryFull { max: 1 }));
    }

    #[test]
    fn find_inactive_reports_stale_sessions() {
        let reg = ConnectionRegistry::new(10);
        let id = Uuid::new_v4();
        reg.register(rec(id, "90210")).unwrap();
        assert!(reg.find_inactive(std::time::Duration::from_secs(0)).contains(&id));
        assert!(reg.find_inactive(std::time::Duration::from_secs(3600)).is_empty());
    }

    #[test]
    fn get_by_location_is_a_snapshot() {
        let reg = ConnectionRegistry::new(10);
        let id = Uuid::new_v4();
        reg.register(rec(id, "90210")).unwrap();
        let snap = reg.get_by_location("90210");
        reg.unregister(id);
        // the snapshot taken before unregister is unaffected
        assert_eq!(snap.len(), 1);
    }
}
