use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::sync::{RunStatus, SyncMode};

/// Number of pipeline steps a run walks through; percentage is derived as
/// `step_index / TOTAL_STEPS * 100`.
pub const TOTAL_STEPS: u32 = 5;

/// How long terminal entries stay queryable before the sweeper evicts them.
const TERMINAL_RETENTION_SECS: i64 = 3600;

/// Per-stage record counters carried on every progress update.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ProgressCounters {
    pub patients_fetched: u64,
    pub appointments_fetched: u64,
    pub records_processed: u64,
    pub records_succeeded: u64,
    pub records_failed: u64,
}

/// Ephemeral, in-process view of one sync run. Never persisted; the
/// `sync_runs` table is the durable record.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressState {
    pub sync_id: String,
    pub tenant_id: String,
    pub mode: SyncMode,
    pub status: RunStatus,
    pub step: String,
    pub step_index: u32,
    pub total_steps: u32,
    pub counters: ProgressCounters,
    pub errors: Vec<String>,
    pub cancel_requested: bool,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProgressState {
    pub fn percent(&self) -> f64 {
        if self.total_steps == 0 {
            return 0.0;
        }
        f64::from(self.step_index) / f64::from(self.total_steps) * 100.0
    }
}

/// Outcome of attempting to reserve the per-tenant run slot.
#[derive(Debug)]
pub enum BeginOutcome {
    Started(ProgressState),
    /// Another run for the tenant is still non-terminal; its id is returned.
    AlreadyRunning(String),
}

struct Entry {
    state: ProgressState,
    tx: watch::Sender<ProgressState>,
}

impl Entry {
    fn publish(&self) {
        // Streaming is best-effort; a send with no receivers is fine.
        let _ = self.tx.send(self.state.clone());
    }
}

/// Lock-protected store of running and recently finished syncs, shared
/// between the orchestrator and the status/stream surfaces. One instance
/// per process; the single-run-per-tenant guarantee holds within it.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically reserve the tenant's run slot. Fails with the existing
    /// run's id when the tenant already has a non-terminal entry.
    pub fn try_begin(&self, tenant_id: &str, sync_id: &str, mode: SyncMode) -> BeginOutcome {
        let mut map = self.lock();

        if let Some(existing) = map
            .values()
            .find(|e| e.state.tenant_id == tenant_id && !e.state.status.is_terminal())
        {
            return BeginOutcome::AlreadyRunning(existing.state.sync_id.clone());
        }

        let now = Utc::now();
        let state = ProgressState {
            sync_id: sync_id.to_string(),
            tenant_id: tenant_id.to_string(),
            mode,
            status: RunStatus::Running,
            step: "starting".to_string(),
            step_index: 0,
            total_steps: TOTAL_STEPS,
            counters: ProgressCounters::default(),
            errors: Vec::new(),
            cancel_requested: false,
            started_at: now,
            updated_at: now,
            completed_at: None,
        };
        let (tx, _) = watch::channel(state.clone());
        map.insert(
            sync_id.to_string(),
            Entry {
                state: state.clone(),
                tx,
            },
        );
        BeginOutcome::Started(state)
    }

    /// Record a stage transition or terminal outcome. Updates to entries
    /// already terminal are ignored so a cancel or sweep cannot be undone
    /// by a late-running orchestrator.
    pub fn update(
        &self,
        sync_id: &str,
        status: RunStatus,
        step: &str,
        step_index: u32,
        counters: ProgressCounters,
    ) {
        let mut map = self.lock();
        let Some(entry) = map.get_mut(sync_id) else {
            return;
        };
        if entry.state.status.is_terminal() {
            return;
        }
        entry.state.status = status;
        entry.state.step = step.to_string();
        entry.state.step_index = step_index;
        entry.state.counters = counters;
        entry.state.updated_at = Utc::now();
        if status.is_terminal() {
            entry.state.completed_at = Some(entry.state.updated_at);
        }
        entry.publish();
    }

    pub fn record_error(&self, sync_id: &str, error: &str) {
        let mut map = self.lock();
        if let Some(entry) = map.get_mut(sync_id) {
            entry.state.errors.push(error.to_string());
            entry.state.updated_at = Utc::now();
            entry.publish();
        }
    }

    pub fn get(&self, sync_id: &str) -> Option<ProgressState> {
        self.lock().get(sync_id).map(|e| e.state.clone())
    }

    /// Latest state for a tenant: a live run if one exists, otherwise the
    /// most recently started finished one still in the store.
    pub fn get_by_tenant(&self, tenant_id: &str) -> Option<ProgressState> {
        let map = self.lock();
        let mut candidates: Vec<&Entry> = map
            .values()
            .filter(|e| e.state.tenant_id == tenant_id)
            .collect();
        candidates.sort_by_key(|e| e.state.started_at);
        candidates
            .iter()
            .rev()
            .find(|e| !e.state.status.is_terminal())
            .or_else(|| candidates.last())
            .map(|e| e.state.clone())
    }

    pub fn list_active(&self) -> Vec<ProgressState> {
        self.lock()
            .values()
            .filter(|e| !e.state.status.is_terminal())
            .map(|e| e.state.clone())
            .collect()
    }

    /// Request cancellation of a non-terminal run. The status flips to
    /// cancelled immediately; in-flight remote calls are not interrupted —
    /// the orchestrator observes the flag at its next checkpoint.
    pub fn cancel(&self, sync_id: &str) -> bool {
        let mut map = self.lock();
        let Some(entry) = map.get_mut(sync_id) else {
            return false;
        };
        if entry.state.status.is_terminal() {
            return false;
        }
        entry.state.cancel_requested = true;
        entry.state.status = RunStatus::Cancelled;
        entry.state.step = "cancelled".to_string();
        entry.state.updated_at = Utc::now();
        entry.state.completed_at = Some(entry.state.updated_at);
        entry.publish();
        true
    }

    /// Cancel regardless of current state, terminal included.
    pub fn force_cancel(&self, sync_id: &str) -> bool {
        let mut map = self.lock();
        let Some(entry) = map.get_mut(sync_id) else {
            return false;
        };
        entry.state.cancel_requested = true;
        entry.state.status = RunStatus::Cancelled;
        entry.state.step = "cancelled".to_string();
        entry.state.updated_at = Utc::now();
        entry.state.completed_at = Some(entry.state.updated_at);
        entry.publish();
        true
    }

    pub fn is_cancel_requested(&self, sync_id: &str) -> bool {
        self.lock()
            .get(sync_id)
            .map(|e| e.state.cancel_requested)
            .unwrap_or(false)
    }

    /// Subscribe to state changes for one run. Returns `None` for unknown
    /// ids; the receiver sees every update and the caller filters.
    pub fn subscribe(&self, sync_id: &str) -> Option<watch::Receiver<ProgressState>> {
        self.lock().get(sync_id).map(|e| e.tx.subscribe())
    }

    /// Force runs stuck in `running` beyond `max_age` to failed and evict
    /// terminal entries past their retention. Invoked opportunistically on
    /// status reads rather than a timer. Returns the swept run ids.
    pub fn sweep_stale(&self, max_age: Duration) -> Vec<String> {
        let now = Utc::now();
        let mut swept = Vec::new();
        let mut map = self.lock();

        for entry in map.values_mut() {
            if entry.state.status == RunStatus::Running && now - entry.state.started_at > max_age {
                entry.state.status = RunStatus::Failed;
                entry.state.step = "stale".to_string();
                entry
                    .state
                    .errors
                    .push("timed out and was cleaned up".to_string());
                entry.state.updated_at = now;
                entry.state.completed_at = Some(now);
                entry.publish();
                swept.push(entry.state.sync_id.clone());
            }
        }

        let retention = Duration::seconds(TERMINAL_RETENTION_SECS);
        map.retain(|_, e| match e.state.completed_at {
            Some(done) => now - done <= retention,
            None => true,
        });

        swept
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        // A poisoned lock only happens if a holder panicked; the map is
        // still structurally sound, so keep serving.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
