pub mod orchestrator;
pub mod progress;

use serde::{Deserialize, Serialize};

/// How a sync run covers the remote dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Fetch everything inside the wide default window.
    Full,
    /// Fetch only records changed since the tenant's watermark.
    Incremental,
    /// Watermark is fresher than the cooldown; nothing to do.
    SkippedRecent,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Full => "full",
            SyncMode::Incremental => "incremental",
            SyncMode::SkippedRecent => "skipped_recent",
        }
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Timeout => "timeout",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tunables for the sync engine. Defaults match typical practice-management
/// API limits; embedders override per deployment.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Minimum seconds between successful syncs before a new request is
    /// short-circuited as `skipped_recent`.
    pub cooldown_secs: u64,
    /// Wall-clock budget for one run.
    pub budget_secs: u64,
    /// Subtracted from the budget so in-flight work can land before the
    /// hard limit.
    pub safety_buffer_secs: u64,
    pub full_window_back_days: i64,
    pub full_window_forward_days: i64,
    pub incremental_window_back_days: i64,
    pub incremental_window_forward_days: i64,
    /// Trailing window that counts as "recent" patient activity.
    pub recent_window_days: i64,
    pub patient_batch_size: usize,
    pub appointment_batch_size: usize,
    /// Running progress entries older than this are swept to failed.
    pub stale_after_secs: u64,
    pub page_size: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 300,
            budget_secs: 300,
            safety_buffer_secs: 10,
            full_window_back_days: 180,
            full_window_forward_days: 180,
            incremental_window_back_days: 7,
            incremental_window_forward_days: 30,
            recent_window_days: crate::stats::DEFAULT_RECENT_WINDOW_DAYS,
            patient_batch_size: 50,
            appointment_batch_size: 100,
            stale_after_secs: 900,
            page_size: 100,
        }
    }
}

/// Returned by `ClinicSync::start_sync`.
#[derive(Debug, Clone, Serialize)]
pub struct StartedSync {
    pub sync_id: String,
    pub mode: SyncMode,
    /// True when an earlier run for the tenant was still active and its id
    /// was returned instead of starting a new one.
    pub already_running: bool,
}
