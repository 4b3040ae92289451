// =============================================================================
// State persistence - snapshots of detector and transition state
// =============================================================================
//
// A snapshot is built from explicit deep copies taken under each component's
// own read lock, so nothing in it aliases live state. Writing it is a
// blocking file operation and never runs on the detection path:
// `SnapshotScheduler::maybe_save` hands it to `spawn_blocking` once the save
// interval has elapsed, with at most one save in flight.
// =============================================================================

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::regime::DetectorSnapshot;
use crate::transition::ManagerSnapshot;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub symbol: String,
    pub detector: DetectorSnapshot,
    pub manager: ManagerSnapshot,
}

impl StateSnapshot {
    pub fn new(symbol: impl Into<String>, detector: DetectorSnapshot, manager: ManagerSnapshot) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            symbol: symbol.into(),
            detector,
            manager,
        }
    }
}

/// Save / load capability. The format behind it is the store's business.
pub trait StateStore: Send + Sync {
    fn save_state(&self, snapshot: &StateSnapshot) -> Result<()>;

    /// `Ok(None)` when nothing has been saved yet.
    fn load_state(&self) -> Result<Option<StateSnapshot>>;
}

// ---------------------------------------------------------------------------
// JsonFileStore
// ---------------------------------------------------------------------------

/// Pretty JSON file, replaced atomically (write tmp, then rename).
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for JsonFileStore {
    fn save_state(&self, snapshot: &StateSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create state dir: {}", parent.display()))?;
            }
        }
        let json = serde_json::to_string_pretty(snapshot).context("Failed to serialize state snapshot")?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).with_context(|| format!("Failed to write state tmp: {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to rename state file into place: {}", self.path.display()))?;
        debug!(path = %self.path.display(), "state snapshot written");
        Ok(())
    }

    fn load_state(&self) -> Result<Option<StateSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read state file: {}", self.path.display()))?;
        let snapshot: StateSnapshot = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", self.path.display()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            anyhow::bail!(
                "unsupported state snapshot version {} (expected {SNAPSHOT_VERSION})",
                snapshot.version
            );
        }
        info!(
            path = %self.path.display(),
            saved_at = %snapshot.saved_at,
            signals = snapshot.detector.history.len(),
            transitions = snapshot.manager.history.len(),
            "state snapshot loaded"
        );
        Ok(Some(snapshot))
    }
}

// ---------------------------------------------------------------------------
// SnapshotScheduler
// ---------------------------------------------------------------------------

/// Opportunistic background saver.
pub struct SnapshotScheduler {
    store: Arc<dyn StateStore>,
    interval: Duration,
    last_save: Mutex<Option<Instant>>,
    in_flight: Arc<AtomicBool>,
    saves: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
}

impl SnapshotScheduler {
    pub fn new(store: Arc<dyn StateStore>, interval_secs: u64) -> Self {
        Self {
            store,
            interval: Duration::from_secs(interval_secs),
            last_save: Mutex::new(None),
            in_flight: Arc::new(AtomicBool::new(false)),
            saves: Arc::new(AtomicU64::new(0)),
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn store(&self) -> Arc<dyn StateStore> {
        self.store.clone()
    }

    /// Interval elapsed since the last triggered save (or none yet).
    pub fn is_due(&self) -> bool {
        match *self.last_save.lock() {
            Some(at) => at.elapsed() >= self.interval,
            None => true,
        }
    }

    /// Start a background save when one is due and none is running. `build`
    /// is only called when a save actually starts.
    pub fn maybe_save(&self, build: impl FnOnce() -> StateSnapshot) -> Option<JoinHandle<()>> {
        if !self.is_due() {
            return None;
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("state save already in flight, skipping");
            return None;
        }
        *self.last_save.lock() = Some(Instant::now());

        let snapshot = build();
        let store = self.store.clone();
        let in_flight = self.in_flight.clone();
        let saves = self.saves.clone();
        let failures = self.failures.clone();

        Some(tokio::task::spawn_blocking(move || {
            match store.save_state(&snapshot) {
                Ok(()) => {
                    saves.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    failures.fetch_add(1, Ordering::SeqCst);
                    warn!(error = %e, "background state save failed");
                }
            }
            in_flight.store(false, Ordering::SeqCst);
        }))
    }

    /// Save immediately, waiting for the write (shutdown path).
    pub async fn save_now(&self, snapshot: StateSnapshot) -> Result<()> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.save_state(&snapshot))
            .await
            .context("state save task panicked")??;
        self.saves.fetch_add(1, Ordering::SeqCst);
        *self.last_save.lock() = Some(Instant::now());
        Ok(())
    }

    pub fn saves(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn is_saving(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transition::TransitionMetrics;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("regime-shift-state-{}", uuid::Uuid::new_v4()))
            .join(name)
    }

    fn snapshot() -> StateSnapshot {
        let manager = ManagerSnapshot {
            metrics: TransitionMetrics {
                total_transitions: 4,
                successful: 3,
                ..Default::default()
            },
            manual_override: true,
            ..Default::default()
        };
        StateSnapshot::new("BTCUSDT", DetectorSnapshot::default(), manager)
    }

    struct SlowStore;

    impl StateStore for SlowStore {
        fn save_state(&self, _snapshot: &StateSnapshot) -> Result<()> {
            std::thread::sleep(Duration::from_millis(100));
            Ok(())
        }

        fn load_state(&self) -> Result<Option<StateSnapshot>> {
            Ok(None)
        }
    }

    #[test]
    fn json_store_round_trip() {
        let path = temp_path("state.json");
        let store = JsonFileStore::new(&path);
        assert!(store.load_state().unwrap().is_none());

        store.save_state(&snapshot()).unwrap();
        let loaded = store.load_state().unwrap().unwrap();
        assert_eq!(loaded.symbol, "BTCUSDT");
        assert_eq!(loaded.manager.metrics.total_transitions, 4);
        assert!(loaded.manager.manual_override);
        assert!(!path.with_extension("json.tmp").exists());

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn wrong_version_is_rejected() {
        let path = temp_path("state.json");
        let store = JsonFileStore::new(&path);
        let mut snap = snapshot();
        snap.version = 99;
        store.save_state(&snap).unwrap();
        assert!(store.load_state().is_err());

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[tokio::test]
    async fn scheduler_respects_interval() {
        let path = temp_path("state.json");
        let scheduler = SnapshotScheduler::new(Arc::new(JsonFileStore::new(&path)), 3600);

        let handle = scheduler.maybe_save(snapshot).unwrap();
        handle.await.unwrap();
        assert_eq!(scheduler.saves(), 1);
        assert!(path.exists());
        assert!(scheduler.maybe_save(snapshot).is_none());

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[tokio::test]
    async fn one_save_in_flight() {
        let scheduler = SnapshotScheduler::new(Arc::new(SlowStore), 0);

        let first = scheduler.maybe_save(snapshot).unwrap();
        assert!(scheduler.is_saving());
        assert!(scheduler.maybe_save(snapshot).is_none());

        first.await.unwrap();
        assert!(!scheduler.is_saving());
        let again = scheduler.maybe_save(snapshot).unwrap();
        again.await.unwrap();
        assert_eq!(scheduler.saves(), 2);
    }

    #[tokio::test]
    async fn save_now_writes_immediately() {
        let path = temp_path("state.json");
        let scheduler = SnapshotScheduler::new(Arc::new(JsonFileStore::new(&path)), 3600);
        scheduler.save_now(snapshot()).await.unwrap();
        assert!(scheduler.store().load_state().unwrap().is_some());

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}
