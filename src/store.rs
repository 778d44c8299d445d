//! Authoritative in-memory pool state and its on-disk snapshot
//!
//! One mutex guards the whole store. Mutation sections serialize the
//! snapshot while still holding the lock and perform the file write after
//! releasing it, so persistence never re-enters the lock.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::descriptor::{PerformanceRecord, ProxyDescriptor};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Persisted form of the pool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    #[serde(default)]
    pub proxies: Vec<ProxyDescriptor>,
    #[serde(default)]
    pub performance: HashMap<String, PerformanceRecord>,
    #[serde(default)]
    pub blacklisted: Vec<ProxyDescriptor>,
    #[serde(default)]
    pub last_refresh: Option<DateTime<Utc>>,
}

/// Mutable pool state, only ever touched under the store mutex
#[derive(Debug, Default)]
pub(crate) struct PoolState {
    /// All descriptors ever seen, insertion order, never removed
    pub proxies: Vec<ProxyDescriptor>,
    /// Indices into `proxies` of the active set, rebuilt on membership change
    pub active: Vec<usize>,
    /// Tombstones for descriptors removed from rotation
    pub blacklisted: Vec<ProxyDescriptor>,
    pub performance: HashMap<String, PerformanceRecord>,
    pub last_refresh: Option<DateTime<Utc>>,
}

impl PoolState {
    pub fn from_snapshot(snapshot: PoolSnapshot) -> Self {
        let mut state = Self {
            proxies: snapshot.proxies,
            active: Vec::new(),
            blacklisted: snapshot.blacklisted,
            performance: snapshot.performance,
            last_refresh: snapshot.last_refresh,
        };
        state.rebuild_active();
        state
    }

    pub fn to_snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            proxies: self.proxies.clone(),
            performance: self.performance.clone(),
            blacklisted: self.blacklisted.clone(),
            last_refresh: self.last_refresh,
        }
    }

    /// Recompute the active view after any liveness change.
    pub fn rebuild_active(&mut self) {
        self.active = self
            .proxies
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_active)
            .map(|(i, _)| i)
            .collect();
    }

    pub fn find_mut(&mut self, target: &ProxyDescriptor) -> Option<&mut ProxyDescriptor> {
        let key = target.key();
        self.proxies.iter_mut().find(|p| p.key() == key)
    }
}

/// The pool store: state behind one mutex plus the snapshot location
pub struct PoolStore {
    state: Mutex<PoolState>,
    path: PathBuf,
    /// When false (proxies disabled) neither loads nor saves touch disk
    persist_enabled: bool,
}

impl PoolStore {
    pub fn new(path: PathBuf, persist_enabled: bool) -> Self {
        let state = if persist_enabled {
            match Self::load(&path) {
                Ok(snapshot) => {
                    let state = PoolState::from_snapshot(snapshot);
                    info!(
                        active = state.active.len(),
                        total = state.proxies.len(),
                        "loaded proxies from cache"
                    );
                    state
                }
                Err(SnapshotError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                    info!("no proxy cache found, will fetch new proxies");
                    PoolState::default()
                }
                Err(err) => {
                    warn!(error = %err, "proxy cache unreadable, starting empty");
                    PoolState::default()
                }
            }
        } else {
            PoolState::default()
        };

        Self {
            state: Mutex::new(state),
            path,
            persist_enabled,
        }
    }

    fn load(path: &Path) -> Result<PoolSnapshot, SnapshotError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Run a closure against the locked state.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut PoolState) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// Clone the current state into its persisted form.
    pub fn snapshot(&self) -> PoolSnapshot {
        self.state.lock().to_snapshot()
    }

    /// Write an already-serialized snapshot; call with the lock released.
    ///
    /// Failures are logged, the in-memory state stays authoritative.
    pub fn write_snapshot(&self, snapshot: &PoolSnapshot) {
        if !self.persist_enabled {
            return;
        }
        let result = serde_json::to_string(snapshot)
            .map_err(SnapshotError::from)
            .and_then(|json| fs::write(&self.path, json).map_err(SnapshotError::from));
        match result {
            Ok(()) => debug!(path = %self.path.display(), "saved proxy snapshot"),
            Err(err) => warn!(error = %err, "error saving proxy cache"),
        }
    }

    /// Snapshot the state and persist it in one step.
    pub fn persist(&self) {
        if !self.persist_enabled {
            return;
        }
        let snapshot = self.snapshot();
        self.write_snapshot(&snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_state() -> PoolState {
        let mut proxy = ProxyDescriptor::new("10.0.0.1", 8080);
        proxy.country = "us".to_string();
        proxy.added_at = Some(Utc::now());

        let mut dead = ProxyDescriptor::new("10.0.0.2", 8080);
        dead.is_active = false;
        dead.failure_count = 3;

        let mut perf = PerformanceRecord::default();
        perf.record_success(Some(120));

        let mut state = PoolState::default();
        state.performance.insert(proxy.key(), perf);
        state.proxies.push(proxy);
        state.proxies.push(dead.clone());
        state.blacklisted.push(dead);
        state.last_refresh = Some(Utc::now());
        state.rebuild_active();
        state
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("proxy_cache.json");

        let store = PoolStore::new(path.clone(), true);
        store.with_state(|state| *state = sample_state());
        store.persist();

        let reloaded = PoolStore::new(path, true);
        assert_eq!(store.snapshot(), reloaded.snapshot());
        assert_eq!(reloaded.with_state(|s| s.active.len()), 1);
    }

    #[test]
    fn test_missing_cache_is_not_fatal() {
        let dir = tempdir().unwrap();
        let store = PoolStore::new(dir.path().join("absent.json"), true);
        assert!(store.snapshot().proxies.is_empty());
    }

    #[test]
    fn test_corrupt_cache_is_not_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("proxy_cache.json");
        fs::write(&path, "{not json").unwrap();

        let store = PoolStore::new(path, true);
        assert!(store.snapshot().proxies.is_empty());
    }

    #[test]
    fn test_disabled_store_never_touches_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("proxy_cache.json");

        let store = PoolStore::new(path.clone(), false);
        store.with_state(|state| *state = sample_state());
        store.persist();

        assert!(!path.exists());
    }

    #[test]
    fn test_rebuild_active_tracks_liveness() {
        let mut state = sample_state();
        assert_eq!(state.active, vec![0]);

        state.proxies[0].is_active = false;
        state.rebuild_active();
        assert!(state.active.is_empty());
    }
}
