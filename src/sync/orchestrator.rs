use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::time::Instant;

use crate::credentials::CredentialProvider;
use crate::error::Result;
use crate::fetch::{FetchOutcome, PracticeClient, RemoteAppointment, RemotePatient};
use crate::stats::{self, AppointmentFacts, PatientStats};
use crate::storage::repository::{self, AppointmentUpsert, PatientUpsert};
use crate::storage::Database;
use crate::sync::progress::{ProgressCounters, ProgressTracker, TOTAL_STEPS};
use crate::sync::{RunStatus, SyncConfig, SyncMode};

/// Decide how a run should cover the remote dataset.
///
/// No watermark or an explicit force ⇒ full. A watermark fresher than the
/// cooldown ⇒ skipped. Anything else ⇒ incremental from the watermark.
pub fn select_mode(
    watermark: Option<DateTime<Utc>>,
    force_full: bool,
    now: DateTime<Utc>,
    cooldown_secs: u64,
) -> SyncMode {
    if force_full {
        return SyncMode::Full;
    }
    let Some(mark) = watermark else {
        return SyncMode::Full;
    };
    if now - mark < Duration::seconds(cooldown_secs as i64) {
        return SyncMode::SkippedRecent;
    }
    SyncMode::Incremental
}

fn appointment_window(
    mode: SyncMode,
    started_at: DateTime<Utc>,
    config: &SyncConfig,
) -> (DateTime<Utc>, DateTime<Utc>) {
    match mode {
        SyncMode::Incremental => (
            started_at - Duration::days(config.incremental_window_back_days),
            started_at + Duration::days(config.incremental_window_forward_days),
        ),
        _ => (
            started_at - Duration::days(config.full_window_back_days),
            started_at + Duration::days(config.full_window_forward_days),
        ),
    }
}

/// A run as planned by `start_sync`: mode and watermark are fixed up front
/// so the caller can report them before the background task does any work.
#[derive(Debug, Clone)]
pub struct PlannedRun {
    pub sync_id: String,
    pub tenant_id: String,
    pub mode: SyncMode,
    pub watermark: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
}

/// Mutable run state threaded through the pipeline so counters and errors
/// survive an early exit on any path.
#[derive(Default)]
struct RunCtx {
    counters: ProgressCounters,
    errors: Vec<String>,
    metadata: serde_json::Map<String, serde_json::Value>,
}

/// Everything the storing stage writes, produced by the analysis stage.
struct StorePlan {
    patient_rows: Vec<PatientUpsert>,
    stats_updates: Vec<(String, PatientStats)>,
    appointment_rows: Vec<AppointmentUpsert>,
}

enum Gate {
    Proceed,
    Timeout,
    Cancel,
}

/// Drives one sync run end to end: fetch → aggregate → store → finalize.
/// Cancellation and the wall-clock budget are observed cooperatively at
/// stage boundaries and before each remote round trip; an in-flight request
/// always runs to completion.
pub struct SyncOrchestrator {
    db: Database,
    tracker: ProgressTracker,
    credentials: Arc<dyn CredentialProvider>,
    config: SyncConfig,
}

impl SyncOrchestrator {
    pub fn new(
        db: Database,
        tracker: ProgressTracker,
        credentials: Arc<dyn CredentialProvider>,
        config: SyncConfig,
    ) -> Self {
        Self {
            db,
            tracker,
            credentials,
            config,
        }
    }

    /// Execute a planned run. Consumes errors internally: every exit path
    /// finalizes the audit row and the progress entry exactly once.
    pub async fn run(&self, planned: PlannedRun) {
        let inserted = self
            .db
            .writer()
            .call({
                let planned = planned.clone();
                move |conn| {
                    repository::insert_sync_run(
                        conn,
                        &planned.sync_id,
                        &planned.tenant_id,
                        planned.mode.as_str(),
                        planned.started_at,
                    )
                }
            })
            .await;
        if let Err(e) = inserted {
            log::error!("sync {}: could not create audit row: {e}", planned.sync_id);
            self.tracker.record_error(&planned.sync_id, &e.to_string());
            self.tracker.update(
                &planned.sync_id,
                RunStatus::Failed,
                "failed",
                0,
                ProgressCounters::default(),
            );
            return;
        }

        let mut ctx = RunCtx::default();

        if planned.mode == SyncMode::SkippedRecent {
            log::info!(
                "sync {}: tenant {} synced within cooldown, skipping",
                planned.sync_id,
                planned.tenant_id
            );
            self.finalize(&planned, RunStatus::Completed, &ctx).await;
            return;
        }

        let status = match self.pipeline(&planned, &mut ctx).await {
            Ok(status) => status,
            Err(e) => {
                log::error!("sync {} failed: {e}", planned.sync_id);
                ctx.errors.push(e.to_string());
                RunStatus::Failed
            }
        };
        self.finalize(&planned, status, &ctx).await;
    }

    async fn pipeline(&self, planned: &PlannedRun, ctx: &mut RunCtx) -> Result<RunStatus> {
        let config = &self.config;
        let sync_id = &planned.sync_id;
        let deadline = Instant::now()
            + std::time::Duration::from_secs(
                config.budget_secs.saturating_sub(config.safety_buffer_secs),
            );

        let creds = self.credentials.credentials(&planned.tenant_id).await?;
        let client = PracticeClient::new(creds)?.with_page_size(config.page_size);

        // ── Fetch patients ─────────────────────────────────────────
        self.tracker.update(
            sync_id,
            RunStatus::Running,
            "fetching_patients",
            1,
            ctx.counters,
        );
        let mut partial = false;
        let patients = match self.gate(sync_id, deadline) {
            Gate::Cancel => return Ok(RunStatus::Cancelled),
            Gate::Timeout => {
                partial = true;
                FetchOutcome::empty()
            }
            Gate::Proceed => {
                let since = match planned.mode {
                    SyncMode::Incremental => planned.watermark,
                    _ => None,
                };
                let outcome = client.fetch_patients(since, deadline).await?;
                partial |= outcome.partial;
                ctx.metadata
                    .insert("patient_pages".into(), outcome.pages.into());
                outcome
            }
        };
        ctx.counters.patients_fetched = patients.records.len() as u64;
        log::info!(
            "sync {sync_id}: fetched {} patients{}",
            patients.records.len(),
            if partial { " (partial)" } else { "" }
        );

        // ── Fetch appointments ─────────────────────────────────────
        self.tracker.update(
            sync_id,
            RunStatus::Running,
            "fetching_appointments",
            2,
            ctx.counters,
        );
        let mut appointments: FetchOutcome<RemoteAppointment> = FetchOutcome::empty();
        let mut type_names: HashMap<String, String> = HashMap::new();
        if !partial {
            match self.gate(sync_id, deadline) {
                Gate::Cancel => return Ok(RunStatus::Cancelled),
                Gate::Timeout => partial = true,
                Gate::Proceed => {
                    type_names = client.fetch_appointment_types().await?;
                    let (from, to) = appointment_window(planned.mode, planned.started_at, config);
                    let since = match planned.mode {
                        SyncMode::Incremental => planned.watermark,
                        _ => None,
                    };
                    appointments = client.fetch_appointments(from, to, since, deadline).await?;
                    partial |= appointments.partial;
                    ctx.metadata
                        .insert("window_from".into(), repository::fmt_ts(from).into());
                    ctx.metadata
                        .insert("window_to".into(), repository::fmt_ts(to).into());
                    ctx.metadata
                        .insert("appointment_pages".into(), appointments.pages.into());
                }
            }
        }
        ctx.counters.appointments_fetched = appointments.records.len() as u64;
        ctx.counters.records_processed =
            ctx.counters.patients_fetched + ctx.counters.appointments_fetched;
        if partial {
            ctx.metadata.insert("partial".into(), true.into());
        }

        // ── Aggregate ──────────────────────────────────────────────
        self.tracker
            .update(sync_id, RunStatus::Running, "analyzing", 3, ctx.counters);
        if self.tracker.is_cancel_requested(sync_id) {
            return Ok(RunStatus::Cancelled);
        }
        let plan = self
            .analyze(planned, &patients.records, &appointments.records, &type_names)
            .await?;

        // ── Store ──────────────────────────────────────────────────
        self.tracker
            .update(sync_id, RunStatus::Running, "storing", 4, ctx.counters);
        if self.tracker.is_cancel_requested(sync_id) {
            return Ok(RunStatus::Cancelled);
        }
        self.store(planned, plan, ctx).await?;

        // Reconcile patients that disappeared from a complete full fetch.
        if planned.mode == SyncMode::Full && !partial {
            let deactivated = self
                .db
                .writer()
                .call({
                    let tenant = planned.tenant_id.clone();
                    let started_at = planned.started_at;
                    move |conn| repository::deactivate_unseen_patients(conn, &tenant, started_at)
                })
                .await?;
            if deactivated > 0 {
                log::info!("sync {sync_id}: deactivated {deactivated} patients absent upstream");
                ctx.metadata
                    .insert("patients_deactivated".into(), (deactivated as u64).into());
            }
        }

        Ok(if partial {
            RunStatus::Timeout
        } else {
            RunStatus::Completed
        })
    }

    /// Merge fetched appointments with the stored set for every affected
    /// patient, recompute stats, and lay out the rows to write. Affected =
    /// fetched patients ∪ owners of fetched appointments, so an appointment
    /// change refreshes its patient even when the patient record itself was
    /// not re-fetched.
    async fn analyze(
        &self,
        planned: &PlannedRun,
        patients: &[RemotePatient],
        appointments: &[RemoteAppointment],
        type_names: &HashMap<String, String>,
    ) -> Result<StorePlan> {
        let now = planned.started_at;
        let label_of = |type_id: &Option<String>| {
            type_id
                .as_ref()
                .map(|id| type_names.get(id).cloned().unwrap_or_else(|| id.clone()))
        };

        let mut fetched: HashMap<String, Vec<(String, AppointmentFacts)>> = HashMap::new();
        let mut appointment_rows = Vec::with_capacity(appointments.len());
        for a in appointments {
            let label = label_of(&a.appointment_type_id);
            fetched.entry(a.patient_id.clone()).or_default().push((
                a.id.clone(),
                AppointmentFacts {
                    starts_at: a.starts_at,
                    appointment_type: label.clone(),
                    treatment_note: a.notes.clone(),
                    archived: a.is_cancelled(),
                },
            ));
            appointment_rows.push(AppointmentUpsert {
                external_id: a.id.clone(),
                patient_external_id: a.patient_id.clone(),
                starts_at: a.starts_at,
                ends_at: a.ends_at,
                status: a.status.clone(),
                appointment_type: label,
                notes: a.notes.clone(),
                cancelled_at: a.cancelled_at,
                raw_metadata: serde_json::to_string(a).ok(),
                updated_at: a.updated_at,
            });
        }

        let mut affected: HashSet<String> = patients.iter().map(|p| p.id.clone()).collect();
        affected.extend(fetched.keys().cloned());
        let affected: Vec<String> = affected.into_iter().collect();

        let stored = self
            .db
            .reader()
            .call({
                let tenant = planned.tenant_id.clone();
                let affected = affected.clone();
                move |conn| repository::list_appointment_facts(conn, &tenant, &affected)
            })
            .await?;

        let mut stats_by_patient: HashMap<String, PatientStats> = HashMap::new();
        for ext in &affected {
            // Keyed by appointment external id; freshly fetched data wins.
            let mut merged: HashMap<String, AppointmentFacts> = HashMap::new();
            if let Some(rows) = stored.get(ext) {
                for (id, facts) in rows {
                    merged.insert(id.clone(), facts.clone());
                }
            }
            if let Some(rows) = fetched.get(ext) {
                for (id, facts) in rows {
                    merged.insert(id.clone(), facts.clone());
                }
            }
            let facts: Vec<AppointmentFacts> = merged.into_values().collect();
            stats_by_patient.insert(
                ext.clone(),
                stats::compute_stats(&facts, now, self.config.recent_window_days),
            );
        }

        let fetched_patient_ids: HashSet<&str> = patients.iter().map(|p| p.id.as_str()).collect();
        let patient_rows = patients
            .iter()
            .map(|p| PatientUpsert {
                external_id: p.id.clone(),
                first_name: p.first_name.clone(),
                last_name: p.last_name.clone(),
                email: p.email.clone(),
                phone_number: p.phone_number.clone(),
                date_of_birth: p.date_of_birth.clone(),
                is_active: p.is_active(),
                stats: stats_by_patient.get(&p.id).cloned().unwrap_or_default(),
            })
            .collect();
        let stats_updates = affected
            .iter()
            .filter(|ext| !fetched_patient_ids.contains(ext.as_str()))
            .filter_map(|ext| {
                stats_by_patient
                    .get(ext)
                    .map(|s| (ext.clone(), s.clone()))
            })
            .collect();

        Ok(StorePlan {
            patient_rows,
            stats_updates,
            appointment_rows,
        })
    }

    /// Write the plan in bounded batches: patients first so appointment FK
    /// resolution can see them. Each batch commits independently; a failed
    /// batch is recorded and the rest proceed.
    async fn store(&self, planned: &PlannedRun, plan: StorePlan, ctx: &mut RunCtx) -> Result<()> {
        let sync_id = &planned.sync_id;

        for (i, chunk) in plan
            .patient_rows
            .chunks(self.config.patient_batch_size)
            .enumerate()
        {
            let result = self
                .db
                .writer()
                .call({
                    let tenant = planned.tenant_id.clone();
                    let batch = chunk.to_vec();
                    let synced_at = planned.started_at;
                    move |conn| repository::upsert_patient_batch(conn, &tenant, &batch, synced_at)
                })
                .await;
            match result {
                Ok(n) => ctx.counters.records_succeeded += n as u64,
                Err(e) => {
                    let msg = format!("patient batch {} failed: {e}", i + 1);
                    log::warn!("sync {sync_id}: {msg}");
                    ctx.errors.push(msg);
                    ctx.counters.records_failed += chunk.len() as u64;
                }
            }
            self.tracker
                .update(sync_id, RunStatus::Running, "storing", 4, ctx.counters);
        }

        if !plan.stats_updates.is_empty() {
            let result = self
                .db
                .writer()
                .call({
                    let tenant = planned.tenant_id.clone();
                    let updates = plan.stats_updates;
                    let synced_at = planned.started_at;
                    move |conn| {
                        repository::update_patient_stats(conn, &tenant, &updates, synced_at)
                    }
                })
                .await;
            if let Err(e) = result {
                let msg = format!("stats refresh failed: {e}");
                log::warn!("sync {sync_id}: {msg}");
                ctx.errors.push(msg);
            }
        }

        for (i, chunk) in plan
            .appointment_rows
            .chunks(self.config.appointment_batch_size)
            .enumerate()
        {
            let patient_exts: Vec<String> = chunk
                .iter()
                .map(|a| a.patient_external_id.clone())
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();
            let result = self
                .db
                .writer()
                .call({
                    let tenant = planned.tenant_id.clone();
                    let batch = chunk.to_vec();
                    move |conn| {
                        let ids = repository::resolve_patient_ids(conn, &tenant, &patient_exts)?;
                        repository::upsert_appointment_batch(conn, &tenant, &batch, &ids)
                    }
                })
                .await;
            match result {
                Ok(res) => {
                    ctx.counters.records_succeeded += res.written as u64;
                    ctx.counters.records_failed += res.missing_patient as u64;
                    if res.missing_patient > 0 {
                        log::warn!(
                            "sync {sync_id}: {} appointments referenced unknown patients",
                            res.missing_patient
                        );
                    }
                }
                Err(e) => {
                    let msg = format!("appointment batch {} failed: {e}", i + 1);
                    log::warn!("sync {sync_id}: {msg}");
                    ctx.errors.push(msg);
                    ctx.counters.records_failed += chunk.len() as u64;
                }
            }
            self.tracker
                .update(sync_id, RunStatus::Running, "storing", 4, ctx.counters);
        }

        Ok(())
    }

    /// Persist the terminal state exactly once: audit row, watermark (on a
    /// non-skipped completed run), then the progress entry.
    async fn finalize(&self, planned: &PlannedRun, status: RunStatus, ctx: &RunCtx) {
        let advance_watermark =
            status == RunStatus::Completed && planned.mode != SyncMode::SkippedRecent;
        let metadata = if ctx.metadata.is_empty() {
            None
        } else {
            Some(serde_json::Value::Object(ctx.metadata.clone()))
        };

        let result = self
            .db
            .writer()
            .call({
                let planned = planned.clone();
                let counters = ctx.counters;
                let errors = ctx.errors.clone();
                move |conn| {
                    if advance_watermark {
                        repository::set_sync_cursor(conn, &planned.tenant_id, planned.started_at)?;
                    }
                    repository::finalize_sync_run(
                        conn,
                        &planned.sync_id,
                        status.as_str(),
                        Utc::now(),
                        counters.records_processed,
                        counters.records_succeeded,
                        counters.records_failed,
                        &errors,
                        metadata.as_ref(),
                    )?;
                    Ok::<(), rusqlite::Error>(())
                }
            })
            .await;
        if let Err(e) = result {
            log::error!("sync {}: could not finalize audit row: {e}", planned.sync_id);
        }

        for error in &ctx.errors {
            self.tracker.record_error(&planned.sync_id, error);
        }
        self.tracker.update(
            &planned.sync_id,
            status,
            status.as_str(),
            TOTAL_STEPS,
            ctx.counters,
        );
        log::info!(
            "sync {} finished: {} ({} processed, {} succeeded, {} failed)",
            planned.sync_id,
            status,
            ctx.counters.records_processed,
            ctx.counters.records_succeeded,
            ctx.counters.records_failed
        );
    }

    fn gate(&self, sync_id: &str, deadline: Instant) -> Gate {
        if self.tracker.is_cancel_requested(sync_id) {
            return Gate::Cancel;
        }
        if Instant::now() >= deadline {
            log::warn!("sync {sync_id}: wall-clock budget exhausted");
            return Gate::Timeout;
        }
        Gate::Proceed
    }
}
