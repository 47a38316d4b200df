pub mod credentials;
pub mod error;
pub mod fetch;
pub mod stats;
pub mod storage;
pub mod sync;

pub use credentials::{
    ApiCredentials, CredentialProvider, EnvCredentialProvider, StaticCredentialProvider,
};
pub use error::{Error, Result};
pub use stats::{ActivityStatus, PatientStats};
pub use storage::Database;
pub use sync::progress::{ProgressCounters, ProgressState, ProgressTracker};
pub use sync::{RunStatus, StartedSync, SyncConfig, SyncMode};

// Re-export repository types needed by the binary crate, but not the module itself
pub use storage::repository::{SyncRunRow, SyncRunTotals};

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use storage::repository;
use sync::orchestrator::{select_mode, PlannedRun, SyncOrchestrator};
use sync::progress::BeginOutcome;

/// A tenant's sync history: aggregate totals plus the most recent runs.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SyncHistory {
    pub totals: SyncRunTotals,
    pub recent: Vec<SyncRunRow>,
}

/// Main entry point for the practice-management sync engine.
///
/// Owns the progress store and spawns each sync as an independent
/// background task; all methods are safe to call from concurrent request
/// handlers. At most one sync per tenant runs at a time within this
/// process — multi-instance deployments need an external lock.
pub struct ClinicSync {
    db: Database,
    tracker: ProgressTracker,
    orchestrator: Arc<SyncOrchestrator>,
    config: SyncConfig,
}

impl ClinicSync {
    pub fn new(
        db: Database,
        credentials: Arc<dyn CredentialProvider>,
        config: SyncConfig,
    ) -> Self {
        let tracker = ProgressTracker::new();
        let orchestrator = Arc::new(SyncOrchestrator::new(
            db.clone(),
            tracker.clone(),
            credentials,
            config.clone(),
        ));
        Self {
            db,
            tracker,
            orchestrator,
            config,
        }
    }

    /// Access the database (for direct queries in the CLI).
    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    // ── Sync control ───────────────────────────────────────────────

    /// Start a sync for a tenant, or return the live run when one is
    /// already active. Mode is selected from the tenant's watermark before
    /// the background task starts, so the caller learns it immediately.
    pub async fn start_sync(&self, tenant_id: &str, force_full: bool) -> Result<StartedSync> {
        // Opportunistic sweep so a crashed run cannot hold the tenant slot.
        self.tracker.sweep_stale(self.stale_age());

        let watermark = self
            .db
            .reader()
            .call({
                let tenant = tenant_id.to_string();
                move |conn| repository::get_sync_cursor(conn, &tenant)
            })
            .await?;

        let started_at = Utc::now();
        let mode = select_mode(watermark, force_full, started_at, self.config.cooldown_secs);
        let sync_id = Uuid::new_v4().to_string();

        match self.tracker.try_begin(tenant_id, &sync_id, mode) {
            BeginOutcome::AlreadyRunning(existing) => {
                let mode = self
                    .tracker
                    .get(&existing)
                    .map(|s| s.mode)
                    .unwrap_or(mode);
                log::debug!("tenant {tenant_id} already has active sync {existing}");
                return Ok(StartedSync {
                    sync_id: existing,
                    mode,
                    already_running: true,
                });
            }
            BeginOutcome::Started(_) => {}
        }

        log::info!("starting {mode} sync {sync_id} for tenant {tenant_id}");
        let planned = PlannedRun {
            sync_id: sync_id.clone(),
            tenant_id: tenant_id.to_string(),
            mode,
            watermark,
            started_at,
        };
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move { orchestrator.run(planned).await });

        Ok(StartedSync {
            sync_id,
            mode,
            already_running: false,
        })
    }

    /// Best-known state of one run; `None` once it has been evicted or was
    /// never started here.
    pub fn sync_status(&self, sync_id: &str) -> Option<ProgressState> {
        self.tracker.sweep_stale(self.stale_age());
        self.tracker.get(sync_id)
    }

    /// A tenant's live run if any, otherwise its most recent tracked one.
    pub fn tenant_sync_status(&self, tenant_id: &str) -> Option<ProgressState> {
        self.tracker.sweep_stale(self.stale_age());
        self.tracker.get_by_tenant(tenant_id)
    }

    pub fn list_active_syncs(&self) -> Vec<ProgressState> {
        self.tracker.list_active()
    }

    /// Stream a run's states. An update is pushed only when the status
    /// changes; the channel closes after a terminal status is delivered.
    pub fn stream_progress(&self, sync_id: &str) -> Option<mpsc::Receiver<ProgressState>> {
        let mut rx = self.tracker.subscribe(sync_id)?;
        let (tx, out) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut last: Option<RunStatus> = None;
            loop {
                let state = rx.borrow_and_update().clone();
                if last != Some(state.status) {
                    last = Some(state.status);
                    if tx.send(state.clone()).await.is_err() {
                        break;
                    }
                }
                if state.status.is_terminal() {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        });
        Some(out)
    }

    /// Request cooperative cancellation. Returns false for unknown or
    /// already-terminal runs.
    pub fn cancel_sync(&self, sync_id: &str) -> bool {
        self.tracker.cancel(sync_id)
    }

    /// Cancel regardless of current state.
    pub fn force_cancel_sync(&self, sync_id: &str) -> bool {
        self.tracker.force_cancel(sync_id)
    }

    /// Sweep runs stuck past the stale threshold — both tracked entries and
    /// orphaned `running` audit rows left by a dead process. Returns how
    /// many runs were cleaned up.
    pub async fn cleanup_stale_syncs(&self) -> Result<usize> {
        let swept = self.tracker.sweep_stale(self.stale_age());
        let cutoff = Utc::now() - self.stale_age();
        let orphaned = self
            .db
            .writer()
            .call(move |conn| {
                repository::fail_stale_runs(conn, cutoff, "timed out and was cleaned up")
            })
            .await?;

        let mut ids: HashSet<String> = swept.into_iter().collect();
        ids.extend(orphaned);
        Ok(ids.len())
    }

    // ── History ────────────────────────────────────────────────────

    pub async fn sync_history(&self, tenant_id: &str, limit: u32) -> Result<SyncHistory> {
        self.tracker.sweep_stale(self.stale_age());
        let tenant = tenant_id.to_string();
        self.db
            .reader()
            .call(move |conn| {
                let totals = repository::sync_run_totals(conn, &tenant)?;
                let recent = repository::list_sync_runs(conn, &tenant, limit)?;
                Ok::<SyncHistory, rusqlite::Error>(SyncHistory { totals, recent })
            })
            .await
            .map_err(Into::into)
    }

    pub async fn get_sync_run(&self, sync_id: &str) -> Result<Option<SyncRunRow>> {
        let id = sync_id.to_string();
        self.db
            .reader()
            .call(move |conn| repository::get_sync_run(conn, &id))
            .await
            .map_err(Into::into)
    }

    // ── Config commands ────────────────────────────────────────────

    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        self.db
            .reader()
            .call({
                let key = key.to_string();
                move |conn| repository::get_config(conn, &key)
            })
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub async fn config_set(&self, key: &str, value: &str) -> Result<()> {
        self.db
            .writer()
            .call({
                let key = key.to_string();
                let value = value.to_string();
                move |conn| repository::set_config(conn, &key, &value)
            })
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub async fn config_list(&self) -> Result<Vec<(String, String)>> {
        self.db
            .reader()
            .call(|conn| repository::list_config(conn))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    fn stale_age(&self) -> Duration {
        Duration::seconds(self.config.stale_after_secs as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TENANT: &str = "t1";

    fn fast_config() -> SyncConfig {
        SyncConfig {
            budget_secs: 30,
            safety_buffer_secs: 0,
            ..SyncConfig::default()
        }
    }

    async fn engine_for(server: &MockServer, config: SyncConfig) -> ClinicSync {
        let db = Database::open_memory().await.unwrap();
        let provider = StaticCredentialProvider::single(
            TENANT,
            ApiCredentials {
                base_url: server.uri(),
                api_key: "test-key".into(),
            },
        );
        ClinicSync::new(db, Arc::new(provider), config)
    }

    async fn wait_terminal(engine: &ClinicSync, sync_id: &str) -> ProgressState {
        for _ in 0..400 {
            if let Some(state) = engine.tracker().get(sync_id) {
                if state.status.is_terminal() {
                    return state;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        panic!("sync {sync_id} did not reach a terminal state");
    }

    fn iso(ts: chrono::DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    }

    /// Two patients; p1 has appointments at now-60d, now-10d, and now+5d.
    async fn mount_standard_remote(server: &MockServer) {
        let now = Utc::now();
        Mock::given(method("GET"))
            .and(path("/patients"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "patients": [
                    { "id": "p1", "first_name": "Ada", "last_name": "Lovelace",
                      "email": "ada@example.com" },
                    { "id": "p2", "first_name": "Grace", "last_name": "Hopper" }
                ],
                "links": {}
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/appointment_types"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "appointment_types": [{ "id": "ty1", "name": "Physio" }],
                "links": {}
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/appointments"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "appointments": [
                    { "id": "a1", "patient_id": "p1",
                      "starts_at": iso(now - Duration::days(60)),
                      "appointment_type_id": "ty1" },
                    { "id": "a2", "patient_id": "p1",
                      "starts_at": iso(now - Duration::days(10)),
                      "appointment_type_id": "ty1",
                      "notes": "responding well" },
                    { "id": "a3", "patient_id": "p1",
                      "starts_at": iso(now + Duration::days(5)),
                      "appointment_type_id": "ty1" }
                ],
                "links": {}
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_full_sync_end_to_end() {
        let server = MockServer::start().await;
        mount_standard_remote(&server).await;
        let engine = engine_for(&server, fast_config()).await;

        let started = engine.start_sync(TENANT, false).await.unwrap();
        assert_eq!(started.mode, SyncMode::Full);
        assert!(!started.already_running);

        let state = wait_terminal(&engine, &started.sync_id).await;
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.counters.patients_fetched, 2);
        assert_eq!(state.counters.appointments_fetched, 3);
        assert_eq!(state.counters.records_processed, 5);
        assert_eq!(state.counters.records_succeeded, 5);
        assert_eq!(state.counters.records_failed, 0);

        let p1 = engine
            .db()
            .reader()
            .call(|conn| repository::get_patient(conn, TENANT, "p1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(p1.first_name, "Ada");
        assert_eq!(p1.recent_appointment_count, 1);
        assert_eq!(p1.upcoming_appointment_count, 1);
        assert_eq!(p1.total_appointment_count, 3);
        assert_eq!(p1.activity_status, ActivityStatus::Active);
        assert_eq!(p1.next_appointment_type.as_deref(), Some("Physio"));
        assert_eq!(p1.primary_appointment_type.as_deref(), Some("Physio"));

        // Watermark advanced to the run's start time.
        let cursor = engine
            .db()
            .reader()
            .call(|conn| repository::get_sync_cursor(conn, TENANT))
            .await
            .unwrap();
        assert!(cursor.is_some());
    }

    #[tokio::test]
    async fn test_second_sync_within_cooldown_is_skipped() {
        let server = MockServer::start().await;
        mount_standard_remote(&server).await;
        let engine = engine_for(&server, fast_config()).await;

        let first = engine.start_sync(TENANT, false).await.unwrap();
        wait_terminal(&engine, &first.sync_id).await;

        let second = engine.start_sync(TENANT, false).await.unwrap();
        assert_eq!(second.mode, SyncMode::SkippedRecent);
        let state = wait_terminal(&engine, &second.sync_id).await;
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.counters.records_processed, 0);

        let history = engine.sync_history(TENANT, 10).await.unwrap();
        assert_eq!(history.totals.total_runs, 2);
        assert_eq!(history.recent[0].mode, "skipped_recent");
    }

    #[tokio::test]
    async fn test_repeat_full_sync_is_idempotent() {
        let server = MockServer::start().await;
        mount_standard_remote(&server).await;
        let engine = engine_for(&server, fast_config()).await;

        let first = engine.start_sync(TENANT, false).await.unwrap();
        wait_terminal(&engine, &first.sync_id).await;

        // Force a second full pass over the unchanged remote data.
        let second = engine.start_sync(TENANT, true).await.unwrap();
        assert_eq!(second.mode, SyncMode::Full);
        let state = wait_terminal(&engine, &second.sync_id).await;
        assert_eq!(state.status, RunStatus::Completed);

        let (p1, appt_count) = engine
            .db()
            .reader()
            .call(|conn| {
                Ok::<_, rusqlite::Error>((
                    repository::get_patient(conn, TENANT, "p1")?.unwrap(),
                    repository::count_appointments(conn, TENANT)?,
                ))
            })
            .await
            .unwrap();
        assert_eq!(p1.total_appointment_count, 3);
        assert_eq!(appt_count, 3);
    }

    #[tokio::test]
    async fn test_start_twice_returns_same_run() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/patients"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "patients": [], "links": {} }))
                    .set_delay(std::time::Duration::from_millis(500)),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/appointment_types"))
            .respond_with(ResponseTemplate::new(200)
                .set_body_json(json!({ "appointment_types": [], "links": {} })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/appointments"))
            .respond_with(ResponseTemplate::new(200)
                .set_body_json(json!({ "appointments": [], "links": {} })))
            .mount(&server)
            .await;

        let engine = engine_for(&server, fast_config()).await;
        let first = engine.start_sync(TENANT, false).await.unwrap();
        let second = engine.start_sync(TENANT, false).await.unwrap();

        assert_eq!(first.sync_id, second.sync_id);
        assert!(second.already_running);
        assert_eq!(engine.list_active_syncs().len(), 1);

        wait_terminal(&engine, &first.sync_id).await;
    }

    #[tokio::test]
    async fn test_deadline_produces_timeout_with_partial_data() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/patients"))
            .and(query_param("page", "1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({
                        "patients": [{ "id": "p1", "first_name": "Ada", "last_name": "L" }],
                        "links": { "next": format!("{}/patients?page=2", server.uri()) }
                    }))
                    .set_delay(std::time::Duration::from_millis(1500)),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/patients"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200)
                .set_body_json(json!({ "patients": [], "links": {} })))
            .expect(0)
            .mount(&server)
            .await;

        let config = SyncConfig {
            budget_secs: 1,
            safety_buffer_secs: 0,
            ..SyncConfig::default()
        };
        let engine = engine_for(&server, config).await;
        let started = engine.start_sync(TENANT, false).await.unwrap();
        let state = wait_terminal(&engine, &started.sync_id).await;

        assert_eq!(state.status, RunStatus::Timeout);
        assert_eq!(state.counters.patients_fetched, 1);

        // Page-1 data is persisted, but the watermark does not advance.
        let (p1, cursor) = engine
            .db()
            .reader()
            .call(|conn| {
                Ok::<_, rusqlite::Error>((
                    repository::get_patient(conn, TENANT, "p1")?,
                    repository::get_sync_cursor(conn, TENANT)?,
                ))
            })
            .await
            .unwrap();
        assert!(p1.is_some());
        assert!(cursor.is_none());

        let run = engine.get_sync_run(&started.sync_id).await.unwrap().unwrap();
        assert_eq!(run.status, "timeout");
    }

    #[tokio::test]
    async fn test_incremental_refreshes_stats_of_affected_patients() {
        let server = MockServer::start().await;
        mount_standard_remote(&server).await;
        let engine = engine_for(&server, fast_config()).await;

        let first = engine.start_sync(TENANT, false).await.unwrap();
        wait_terminal(&engine, &first.sync_id).await;

        // Age the watermark past the cooldown, then change the remote: no
        // patient updates, one new appointment for p2.
        let aged = Utc::now() - Duration::hours(1);
        engine
            .db()
            .writer()
            .call(move |conn| repository::set_sync_cursor(conn, TENANT, aged))
            .await
            .unwrap();
        server.reset().await;
        let now = Utc::now();
        Mock::given(method("GET"))
            .and(path("/patients"))
            .respond_with(ResponseTemplate::new(200)
                .set_body_json(json!({ "patients": [], "links": {} })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/appointment_types"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "appointment_types": [{ "id": "ty1", "name": "Physio" }],
                "links": {}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/appointments"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "appointments": [
                    { "id": "a9", "patient_id": "p2",
                      "starts_at": iso(now + Duration::days(3)),
                      "appointment_type_id": "ty1" }
                ],
                "links": {}
            })))
            .mount(&server)
            .await;

        let second = engine.start_sync(TENANT, false).await.unwrap();
        assert_eq!(second.mode, SyncMode::Incremental);
        let state = wait_terminal(&engine, &second.sync_id).await;
        assert_eq!(state.status, RunStatus::Completed);

        // p2 was not re-fetched, yet its stats reflect the new appointment.
        let p2 = engine
            .db()
            .reader()
            .call(|conn| repository::get_patient(conn, TENANT, "p2"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(p2.upcoming_appointment_count, 1);
        assert_eq!(p2.total_appointment_count, 1);
        assert_eq!(p2.activity_status, ActivityStatus::UpcomingOnly);
        // Contact data survived the stats-only refresh.
        assert_eq!(p2.first_name, "Grace");
    }

    #[tokio::test]
    async fn test_cancel_lands_at_next_checkpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/patients"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "patients": [], "links": {} }))
                    .set_delay(std::time::Duration::from_millis(800)),
            )
            .mount(&server)
            .await;

        let engine = engine_for(&server, fast_config()).await;
        let started = engine.start_sync(TENANT, false).await.unwrap();
        assert!(engine.cancel_sync(&started.sync_id));
        // Cancelling again is a no-op on a terminal entry.
        assert!(!engine.cancel_sync(&started.sync_id));

        let state = wait_terminal(&engine, &started.sync_id).await;
        assert_eq!(state.status, RunStatus::Cancelled);

        let run_status = loop {
            // The audit row finalizes after the in-flight fetch returns.
            if let Some(run) = engine.get_sync_run(&started.sync_id).await.unwrap() {
                if run.status != "running" {
                    break run.status;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        };
        assert_eq!(run_status, "cancelled");
    }

    #[tokio::test]
    async fn test_missing_credentials_fail_the_run() {
        let db = Database::open_memory().await.unwrap();
        let engine = ClinicSync::new(
            db,
            Arc::new(StaticCredentialProvider::new()),
            fast_config(),
        );

        let started = engine.start_sync(TENANT, false).await.unwrap();
        let state = wait_terminal(&engine, &started.sync_id).await;
        assert_eq!(state.status, RunStatus::Failed);
        assert!(state.errors.iter().any(|e| e.contains("Credential")));

        let run = engine.get_sync_run(&started.sync_id).await.unwrap().unwrap();
        assert_eq!(run.status, "failed");
        assert!(!run.errors.is_empty());
    }

    #[tokio::test]
    async fn test_stream_pushes_only_status_changes() {
        let server = MockServer::start().await;
        mount_standard_remote(&server).await;
        let engine = engine_for(&server, fast_config()).await;

        let started = engine.start_sync(TENANT, false).await.unwrap();
        let mut rx = engine.stream_progress(&started.sync_id).unwrap();

        let mut statuses = Vec::new();
        while let Some(state) = rx.recv().await {
            statuses.push(state.status);
        }

        assert!(statuses.last().unwrap().is_terminal());
        for pair in statuses.windows(2) {
            assert_ne!(pair[0], pair[1], "duplicate status pushed: {statuses:?}");
        }
    }

    #[tokio::test]
    async fn test_cleanup_stale_syncs_counts_orphans() {
        let server = MockServer::start().await;
        let engine = engine_for(&server, fast_config()).await;

        let old = Utc::now() - Duration::hours(2);
        engine
            .db()
            .writer()
            .call(move |conn| repository::insert_sync_run(conn, "orphan", TENANT, "full", old))
            .await
            .unwrap();

        let cleaned = engine.cleanup_stale_syncs().await.unwrap();
        assert_eq!(cleaned, 1);

        let run = engine.get_sync_run("orphan").await.unwrap().unwrap();
        assert_eq!(run.status, "failed");
        assert!(run.errors.iter().any(|e| e.contains("cleaned up")));
    }

    #[tokio::test]
    async fn test_tenant_status_surfaces_latest_run() {
        let server = MockServer::start().await;
        mount_standard_remote(&server).await;
        let engine = engine_for(&server, fast_config()).await;

        assert!(engine.tenant_sync_status(TENANT).is_none());

        let started = engine.start_sync(TENANT, false).await.unwrap();
        wait_terminal(&engine, &started.sync_id).await;

        let state = engine.tenant_sync_status(TENANT).unwrap();
        assert_eq!(state.sync_id, started.sync_id);
        assert!(engine.sync_status("no-such-run").is_none());
    }
}
