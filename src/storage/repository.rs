use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::stats::{ActivityStatus, AppointmentFacts, PatientStats};

/// Canonical timestamp format for TEXT columns. Fixed-width UTC so that
/// lexicographic comparison in SQL matches chronological order.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

// ── Patients ───────────────────────────────────────────────────────

/// Write model for one patient row, stats included.
#[derive(Debug, Clone)]
pub struct PatientUpsert {
    pub external_id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub date_of_birth: Option<String>,
    pub is_active: bool,
    pub stats: PatientStats,
}

/// Read model for a stored patient row.
#[derive(Debug, Clone)]
pub struct PatientRecord {
    pub id: i64,
    pub external_id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub is_active: bool,
    pub activity_status: ActivityStatus,
    pub recent_appointment_count: u32,
    pub upcoming_appointment_count: u32,
    pub total_appointment_count: u32,
    pub next_appointment_at: Option<DateTime<Utc>>,
    pub next_appointment_type: Option<String>,
    pub primary_appointment_type: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Upsert one batch of patients inside a single transaction.
/// Key is (tenant_id, external_id); contact fields and stats are replaced,
/// `last_synced_at` is stamped with the run's start time.
pub fn upsert_patient_batch(
    conn: &mut Connection,
    tenant_id: &str,
    batch: &[PatientUpsert],
    synced_at: DateTime<Utc>,
) -> Result<usize, rusqlite::Error> {
    let tx = conn.transaction()?;
    let synced = fmt_ts(synced_at);
    {
        let mut stmt = tx.prepare(
            "INSERT INTO patients (
                tenant_id, external_id, first_name, last_name, email,
                phone_number, date_of_birth, is_active, activity_status,
                recent_appointment_count, upcoming_appointment_count,
                total_appointment_count, first_appointment_at, last_appointment_at,
                next_appointment_at, next_appointment_type, primary_appointment_type,
                latest_treatment_note, recent_appointments, upcoming_appointments,
                last_synced_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21
            )
            ON CONFLICT(tenant_id, external_id) DO UPDATE SET
                first_name=excluded.first_name, last_name=excluded.last_name,
                email=excluded.email, phone_number=excluded.phone_number,
                date_of_birth=excluded.date_of_birth, is_active=excluded.is_active,
                activity_status=excluded.activity_status,
                recent_appointment_count=excluded.recent_appointment_count,
                upcoming_appointment_count=excluded.upcoming_appointment_count,
                total_appointment_count=excluded.total_appointment_count,
                first_appointment_at=excluded.first_appointment_at,
                last_appointment_at=excluded.last_appointment_at,
                next_appointment_at=excluded.next_appointment_at,
                next_appointment_type=excluded.next_appointment_type,
                primary_appointment_type=excluded.primary_appointment_type,
                latest_treatment_note=excluded.latest_treatment_note,
                recent_appointments=excluded.recent_appointments,
                upcoming_appointments=excluded.upcoming_appointments,
                last_synced_at=excluded.last_synced_at",
        )?;
        for p in batch {
            let s = &p.stats;
            stmt.execute(params![
                tenant_id,
                p.external_id,
                p.first_name,
                p.last_name,
                p.email,
                p.phone_number,
                p.date_of_birth,
                p.is_active as i32,
                s.activity_status.as_str(),
                s.recent_count,
                s.upcoming_count,
                s.total_count,
                s.first_appointment_at.map(fmt_ts),
                s.last_appointment_at.map(fmt_ts),
                s.next_appointment_at.map(fmt_ts),
                s.next_appointment_type,
                s.primary_appointment_type,
                s.latest_treatment_note,
                serde_json::to_string(&s.recent_appointments).ok(),
                serde_json::to_string(&s.upcoming_appointments).ok(),
                synced,
            ])?;
        }
    }
    tx.commit()?;
    Ok(batch.len())
}

/// Refresh only the stats columns of patients already present. Used for
/// patients touched via appointment changes in incremental runs; contact
/// fields are left as-is. Returns how many rows matched.
pub fn update_patient_stats(
    conn: &mut Connection,
    tenant_id: &str,
    updates: &[(String, PatientStats)],
    synced_at: DateTime<Utc>,
) -> Result<usize, rusqlite::Error> {
    let tx = conn.transaction()?;
    let synced = fmt_ts(synced_at);
    let mut matched = 0usize;
    {
        let mut stmt = tx.prepare(
            "UPDATE patients SET
                activity_status=?3, recent_appointment_count=?4,
                upcoming_appointment_count=?5, total_appointment_count=?6,
                first_appointment_at=?7, last_appointment_at=?8,
                next_appointment_at=?9, next_appointment_type=?10,
                primary_appointment_type=?11, latest_treatment_note=?12,
                recent_appointments=?13, upcoming_appointments=?14,
                last_synced_at=?15
             WHERE tenant_id=?1 AND external_id=?2",
        )?;
        for (external_id, s) in updates {
            matched += stmt.execute(params![
                tenant_id,
                external_id,
                s.activity_status.as_str(),
                s.recent_count,
                s.upcoming_count,
                s.total_count,
                s.first_appointment_at.map(fmt_ts),
                s.last_appointment_at.map(fmt_ts),
                s.next_appointment_at.map(fmt_ts),
                s.next_appointment_type,
                s.primary_appointment_type,
                s.latest_treatment_note,
                serde_json::to_string(&s.recent_appointments).ok(),
                serde_json::to_string(&s.upcoming_appointments).ok(),
                synced,
            ])?;
        }
    }
    tx.commit()?;
    Ok(matched)
}

/// Resolve external patient ids to internal row ids in one batched lookup
/// per chunk (avoids a query per appointment row).
pub fn resolve_patient_ids(
    conn: &Connection,
    tenant_id: &str,
    external_ids: &[String],
) -> Result<HashMap<String, i64>, rusqlite::Error> {
    let mut map = HashMap::with_capacity(external_ids.len());
    for chunk in external_ids.chunks(500) {
        let placeholders = chunk.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT external_id, id FROM patients
             WHERE tenant_id = ? AND external_id IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;
        stmt.raw_bind_parameter(1, tenant_id)?;
        for (i, ext) in chunk.iter().enumerate() {
            stmt.raw_bind_parameter(i + 2, ext)?;
        }
        let mut rows = stmt.raw_query();
        while let Some(row) = rows.next()? {
            map.insert(row.get::<_, String>(0)?, row.get::<_, i64>(1)?);
        }
    }
    Ok(map)
}

/// Flip `is_active` off for patients absent from a complete full-mode fetch:
/// every patient present in the fetch has `last_synced_at` stamped with the
/// run start, so anything older was not seen. Returns rows deactivated.
pub fn deactivate_unseen_patients(
    conn: &Connection,
    tenant_id: &str,
    run_started_at: DateTime<Utc>,
) -> Result<usize, rusqlite::Error> {
    let n = conn.execute(
        "UPDATE patients
         SET is_active = 0, activity_status = 'inactive'
         WHERE tenant_id = ?1 AND is_active = 1
           AND (last_synced_at IS NULL OR last_synced_at < ?2)",
        params![tenant_id, fmt_ts(run_started_at)],
    )?;
    Ok(n)
}

pub fn get_patient(
    conn: &Connection,
    tenant_id: &str,
    external_id: &str,
) -> Result<Option<PatientRecord>, rusqlite::Error> {
    conn.query_row(
        "SELECT id, external_id, first_name, last_name, email, is_active,
                activity_status, recent_appointment_count,
                upcoming_appointment_count, total_appointment_count,
                next_appointment_at, next_appointment_type,
                primary_appointment_type, last_synced_at
         FROM patients WHERE tenant_id = ?1 AND external_id = ?2",
        params![tenant_id, external_id],
        |row| {
            Ok(PatientRecord {
                id: row.get(0)?,
                external_id: row.get(1)?,
                first_name: row.get(2)?,
                last_name: row.get(3)?,
                email: row.get(4)?,
                is_active: row.get::<_, i32>(5)? != 0,
                activity_status: ActivityStatus::parse(&row.get::<_, String>(6)?),
                recent_appointment_count: row.get(7)?,
                upcoming_appointment_count: row.get(8)?,
                total_appointment_count: row.get(9)?,
                next_appointment_at: row
                    .get::<_, Option<String>>(10)?
                    .as_deref()
                    .and_then(parse_ts),
                next_appointment_type: row.get(11)?,
                primary_appointment_type: row.get(12)?,
                last_synced_at: row
                    .get::<_, Option<String>>(13)?
                    .as_deref()
                    .and_then(parse_ts),
            })
        },
    )
    .optional()
}

// ── Appointments ───────────────────────────────────────────────────

/// Write model for one appointment row. The owning patient is referenced by
/// external id and resolved to an internal id at write time.
#[derive(Debug, Clone)]
pub struct AppointmentUpsert {
    pub external_id: String,
    pub patient_external_id: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub status: Option<String>,
    pub appointment_type: Option<String>,
    pub notes: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub raw_metadata: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Outcome of one appointment batch write.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppointmentBatchResult {
    pub written: usize,
    /// Rows skipped because their patient could not be resolved.
    pub missing_patient: usize,
}

/// Upsert one batch of appointments inside a single transaction, keyed by
/// the globally unique external id. `patient_ids` comes from
/// [`resolve_patient_ids`]; rows whose patient is absent are skipped and
/// counted, not errored.
pub fn upsert_appointment_batch(
    conn: &mut Connection,
    tenant_id: &str,
    batch: &[AppointmentUpsert],
    patient_ids: &HashMap<String, i64>,
) -> Result<AppointmentBatchResult, rusqlite::Error> {
    let tx = conn.transaction()?;
    let mut result = AppointmentBatchResult::default();
    {
        let mut stmt = tx.prepare(
            "INSERT INTO appointments (
                external_id, patient_id, tenant_id, starts_at, ends_at,
                status, appointment_type, notes, cancelled_at, raw_metadata,
                updated_at, cached_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, datetime('now'))
            ON CONFLICT(external_id) DO UPDATE SET
                patient_id=excluded.patient_id, starts_at=excluded.starts_at,
                ends_at=excluded.ends_at, status=excluded.status,
                appointment_type=excluded.appointment_type, notes=excluded.notes,
                cancelled_at=excluded.cancelled_at,
                raw_metadata=excluded.raw_metadata,
                updated_at=excluded.updated_at, cached_at=excluded.cached_at",
        )?;
        for a in batch {
            let Some(patient_id) = patient_ids.get(&a.patient_external_id) else {
                log::debug!(
                    "skipping appointment {}: unknown patient {}",
                    a.external_id,
                    a.patient_external_id
                );
                result.missing_patient += 1;
                continue;
            };
            stmt.execute(params![
                a.external_id,
                patient_id,
                tenant_id,
                fmt_ts(a.starts_at),
                a.ends_at.map(fmt_ts),
                a.status,
                a.appointment_type,
                a.notes,
                a.cancelled_at.map(fmt_ts),
                a.raw_metadata,
                a.updated_at.map(fmt_ts),
            ])?;
            result.written += 1;
        }
    }
    tx.commit()?;
    Ok(result)
}

/// Load the stored appointment facts for a set of patients, keyed by the
/// patient's external id. Each entry carries the appointment's external id
/// so callers can dedupe against freshly fetched records.
pub fn list_appointment_facts(
    conn: &Connection,
    tenant_id: &str,
    patient_external_ids: &[String],
) -> Result<HashMap<String, Vec<(String, AppointmentFacts)>>, rusqlite::Error> {
    let mut map: HashMap<String, Vec<(String, AppointmentFacts)>> = HashMap::new();
    for chunk in patient_external_ids.chunks(500) {
        let placeholders = chunk.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT p.external_id, a.external_id, a.starts_at,
                    a.appointment_type, a.notes, a.cancelled_at
             FROM appointments a
             JOIN patients p ON p.id = a.patient_id
             WHERE a.tenant_id = ? AND p.external_id IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;
        stmt.raw_bind_parameter(1, tenant_id)?;
        for (i, ext) in chunk.iter().enumerate() {
            stmt.raw_bind_parameter(i + 2, ext)?;
        }
        let mut rows = stmt.raw_query();
        while let Some(row) = rows.next()? {
            let patient_ext: String = row.get(0)?;
            let appt_ext: String = row.get(1)?;
            let starts_at: String = row.get(2)?;
            let Some(starts_at) = parse_ts(&starts_at) else {
                continue;
            };
            let facts = AppointmentFacts {
                starts_at,
                appointment_type: row.get(3)?,
                treatment_note: row.get(4)?,
                archived: row.get::<_, Option<String>>(5)?.is_some(),
            };
            map.entry(patient_ext).or_default().push((appt_ext, facts));
        }
    }
    Ok(map)
}

pub fn count_appointments(conn: &Connection, tenant_id: &str) -> Result<i64, rusqlite::Error> {
    conn.query_row(
        "SELECT COUNT(*) FROM appointments WHERE tenant_id = ?1",
        params![tenant_id],
        |row| row.get(0),
    )
}

// ── Sync runs ──────────────────────────────────────────────────────

/// One row of the append-only sync audit log.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SyncRunRow {
    pub id: String,
    pub tenant_id: String,
    pub mode: String,
    pub status: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub records_processed: u64,
    pub records_succeeded: u64,
    pub records_failed: u64,
    pub errors: Vec<String>,
    pub metadata: Option<serde_json::Value>,
}

pub fn insert_sync_run(
    conn: &Connection,
    id: &str,
    tenant_id: &str,
    mode: &str,
    started_at: DateTime<Utc>,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO sync_runs (id, tenant_id, mode, status, started_at)
         VALUES (?1, ?2, ?3, 'running', ?4)",
        params![id, tenant_id, mode, fmt_ts(started_at)],
    )?;
    Ok(())
}

/// Terminal update of a sync run. Only transitions rows still `running`, so
/// a finalize racing a stale-sweep writes the terminal state exactly once.
#[allow(clippy::too_many_arguments)]
pub fn finalize_sync_run(
    conn: &Connection,
    id: &str,
    status: &str,
    completed_at: DateTime<Utc>,
    records_processed: u64,
    records_succeeded: u64,
    records_failed: u64,
    errors: &[String],
    metadata: Option<&serde_json::Value>,
) -> Result<bool, rusqlite::Error> {
    let errors_json = if errors.is_empty() {
        None
    } else {
        serde_json::to_string(errors).ok()
    };
    let n = conn.execute(
        "UPDATE sync_runs SET
            status=?2, completed_at=?3, records_processed=?4,
            records_succeeded=?5, records_failed=?6, errors=?7, metadata=?8
         WHERE id=?1 AND status='running'",
        params![
            id,
            status,
            fmt_ts(completed_at),
            records_processed as i64,
            records_succeeded as i64,
            records_failed as i64,
            errors_json,
            metadata.and_then(|m| serde_json::to_string(m).ok()),
        ],
    )?;
    Ok(n > 0)
}

fn sync_run_from_row(row: &rusqlite::Row<'_>) -> Result<SyncRunRow, rusqlite::Error> {
    let errors: Vec<String> = row
        .get::<_, Option<String>>(9)?
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();
    let metadata = row
        .get::<_, Option<String>>(10)?
        .and_then(|s| serde_json::from_str(&s).ok());
    Ok(SyncRunRow {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        mode: row.get(2)?,
        status: row.get(3)?,
        started_at: row.get(4)?,
        completed_at: row.get(5)?,
        records_processed: row.get::<_, i64>(6)? as u64,
        records_succeeded: row.get::<_, i64>(7)? as u64,
        records_failed: row.get::<_, i64>(8)? as u64,
        errors,
        metadata,
    })
}

const SYNC_RUN_COLUMNS: &str = "id, tenant_id, mode, status, started_at, completed_at, \
     records_processed, records_succeeded, records_failed, errors, metadata";

pub fn get_sync_run(conn: &Connection, id: &str) -> Result<Option<SyncRunRow>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {SYNC_RUN_COLUMNS} FROM sync_runs WHERE id = ?1"),
        params![id],
        sync_run_from_row,
    )
    .optional()
}

pub fn list_sync_runs(
    conn: &Connection,
    tenant_id: &str,
    limit: u32,
) -> Result<Vec<SyncRunRow>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SYNC_RUN_COLUMNS} FROM sync_runs
         WHERE tenant_id = ?1 ORDER BY started_at DESC LIMIT ?2"
    ))?;
    let rows = stmt.query_map(params![tenant_id, limit], sync_run_from_row)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Aggregate counts over a tenant's sync history.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SyncRunTotals {
    pub total_runs: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub records_succeeded: u64,
}

pub fn sync_run_totals(
    conn: &Connection,
    tenant_id: &str,
) -> Result<SyncRunTotals, rusqlite::Error> {
    conn.query_row(
        "SELECT COUNT(*),
                SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END),
                SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END),
                SUM(CASE WHEN status = 'timeout' THEN 1 ELSE 0 END),
                SUM(CASE WHEN status = 'cancelled' THEN 1 ELSE 0 END),
                SUM(records_succeeded)
         FROM sync_runs WHERE tenant_id = ?1",
        params![tenant_id],
        |row| {
            Ok(SyncRunTotals {
                total_runs: row.get::<_, i64>(0)? as u64,
                completed: row.get::<_, Option<i64>>(1)?.unwrap_or(0) as u64,
                failed: row.get::<_, Option<i64>>(2)?.unwrap_or(0) as u64,
                timed_out: row.get::<_, Option<i64>>(3)?.unwrap_or(0) as u64,
                cancelled: row.get::<_, Option<i64>>(4)?.unwrap_or(0) as u64,
                records_succeeded: row.get::<_, Option<i64>>(5)?.unwrap_or(0) as u64,
            })
        },
    )
}

/// Fail `running` rows whose run started before `cutoff`. Covers runs whose
/// process died without finalizing. Returns the ids that were flipped.
pub fn fail_stale_runs(
    conn: &Connection,
    cutoff: DateTime<Utc>,
    message: &str,
) -> Result<Vec<String>, rusqlite::Error> {
    let ids: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT id FROM sync_runs WHERE status = 'running' AND started_at < ?1",
        )?;
        let rows = stmt.query_map(params![fmt_ts(cutoff)], |row| row.get(0))?;
        rows.filter_map(|r| r.ok()).collect()
    };
    for id in &ids {
        conn.execute(
            "UPDATE sync_runs SET status='failed', completed_at=?2, errors=?3
             WHERE id=?1 AND status='running'",
            params![
                id,
                fmt_ts(Utc::now()),
                serde_json::to_string(&[message]).ok(),
            ],
        )?;
    }
    Ok(ids)
}

// ── Sync cursors ───────────────────────────────────────────────────

pub fn get_sync_cursor(
    conn: &Connection,
    tenant_id: &str,
) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    let ts: Option<String> = conn
        .query_row(
            "SELECT last_synced_at FROM sync_cursors WHERE tenant_id = ?1",
            params![tenant_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(ts.as_deref().and_then(parse_ts))
}

pub fn set_sync_cursor(
    conn: &Connection,
    tenant_id: &str,
    last_synced_at: DateTime<Utc>,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO sync_cursors (tenant_id, last_synced_at, updated_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(tenant_id) DO UPDATE SET
            last_synced_at=excluded.last_synced_at, updated_at=excluded.updated_at",
        params![tenant_id, fmt_ts(last_synced_at)],
    )?;
    Ok(())
}

// ── App config ─────────────────────────────────────────────────────

pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO app_config (key, value, updated_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(key) DO UPDATE SET
            value=excluded.value, updated_at=excluded.updated_at",
        params![key, value],
    )?;
    Ok(())
}

pub fn list_config(conn: &Connection) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT key, value FROM app_config ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::compute_stats;
    use crate::storage::Database;
    use chrono::Duration;

    fn patient(ext: &str, name: &str) -> PatientUpsert {
        PatientUpsert {
            external_id: ext.to_string(),
            first_name: name.to_string(),
            last_name: "Tester".to_string(),
            email: Some(format!("{ext}@example.com")),
            phone_number: None,
            date_of_birth: None,
            is_active: true,
            stats: PatientStats::default(),
        }
    }

    fn appt(ext: &str, patient_ext: &str, starts_at: DateTime<Utc>) -> AppointmentUpsert {
        AppointmentUpsert {
            external_id: ext.to_string(),
            patient_external_id: patient_ext.to_string(),
            starts_at,
            ends_at: None,
            status: Some("booked".to_string()),
            appointment_type: Some("Checkup".to_string()),
            notes: None,
            cancelled_at: None,
            raw_metadata: None,
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn test_patient_upsert_is_idempotent() {
        let db = Database::open_memory().await.unwrap();
        let now = Utc::now();

        for _ in 0..2 {
            db.writer()
                .call(move |conn| {
                    upsert_patient_batch(conn, "t1", &[patient("p1", "Ada")], now)
                })
                .await
                .unwrap();
        }

        let (count, rec) = db
            .reader()
            .call(|conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM patients WHERE tenant_id='t1'",
                    [],
                    |row| row.get(0),
                )?;
                let rec = get_patient(conn, "t1", "p1")?;
                Ok::<_, rusqlite::Error>((count, rec))
            })
            .await
            .unwrap();

        assert_eq!(count, 1);
        assert_eq!(rec.unwrap().first_name, "Ada");
    }

    #[tokio::test]
    async fn test_appointment_fk_resolution_in_batch() {
        let db = Database::open_memory().await.unwrap();
        let now = Utc::now();

        let result = db
            .writer()
            .call(move |conn| {
                upsert_patient_batch(conn, "t1", &[patient("p1", "Ada")], now)?;
                let ids = resolve_patient_ids(conn, "t1", &["p1".to_string()])?;
                upsert_appointment_batch(
                    conn,
                    "t1",
                    &[appt("a1", "p1", now), appt("a2", "ghost", now)],
                    &ids,
                )
            })
            .await
            .unwrap();

        assert_eq!(result.written, 1);
        assert_eq!(result.missing_patient, 1);

        let linked: i64 = db
            .reader()
            .call(|conn| {
                Ok::<_, rusqlite::Error>(conn.query_row(
                    "SELECT COUNT(*) FROM appointments a
                     JOIN patients p ON p.id = a.patient_id
                     WHERE p.external_id = 'p1'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(linked, 1);
    }

    #[tokio::test]
    async fn test_appointment_upsert_keyed_by_external_id() {
        let db = Database::open_memory().await.unwrap();
        let now = Utc::now();

        db.writer()
            .call(move |conn| {
                upsert_patient_batch(conn, "t1", &[patient("p1", "Ada")], now)?;
                let ids = resolve_patient_ids(conn, "t1", &["p1".to_string()])?;
                upsert_appointment_batch(conn, "t1", &[appt("a1", "p1", now)], &ids)?;
                let mut moved = appt("a1", "p1", now + Duration::hours(2));
                moved.status = Some("rescheduled".to_string());
                upsert_appointment_batch(conn, "t1", &[moved], &ids)
            })
            .await
            .unwrap();

        let (count, status) = db
            .reader()
            .call(|conn| {
                let count = count_appointments(conn, "t1")?;
                let status: String = conn.query_row(
                    "SELECT status FROM appointments WHERE external_id='a1'",
                    [],
                    |row| row.get(0),
                )?;
                Ok::<_, rusqlite::Error>((count, status))
            })
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(status, "rescheduled");
    }

    #[tokio::test]
    async fn test_deactivate_unseen_patients() {
        let db = Database::open_memory().await.unwrap();
        let earlier = Utc::now() - Duration::hours(2);
        let run_start = Utc::now();

        db.writer()
            .call(move |conn| {
                upsert_patient_batch(conn, "t1", &[patient("old", "Old")], earlier)?;
                upsert_patient_batch(conn, "t1", &[patient("seen", "Seen")], run_start)?;
                let n = deactivate_unseen_patients(conn, "t1", run_start)?;
                Ok::<_, rusqlite::Error>(n)
            })
            .await
            .map(|n| assert_eq!(n, 1))
            .unwrap();

        let (old, seen) = db
            .reader()
            .call(|conn| {
                Ok::<_, rusqlite::Error>((
                    get_patient(conn, "t1", "old")?.unwrap(),
                    get_patient(conn, "t1", "seen")?.unwrap(),
                ))
            })
            .await
            .unwrap();
        assert!(!old.is_active);
        assert!(seen.is_active);
    }

    #[tokio::test]
    async fn test_sync_run_lifecycle_and_totals() {
        let db = Database::open_memory().await.unwrap();
        let now = Utc::now();

        db.writer()
            .call(move |conn| {
                insert_sync_run(conn, "run-1", "t1", "full", now)?;
                let finalized = finalize_sync_run(
                    conn,
                    "run-1",
                    "completed",
                    now,
                    10,
                    9,
                    1,
                    &["batch 2 failed".to_string()],
                    None,
                )?;
                assert!(finalized);
                // Second finalize is a no-op: the row is already terminal.
                let again =
                    finalize_sync_run(conn, "run-1", "failed", now, 0, 0, 0, &[], None)?;
                assert!(!again);
                Ok::<_, rusqlite::Error>(())
            })
            .await
            .unwrap();

        let (run, totals) = db
            .reader()
            .call(|conn| {
                Ok::<_, rusqlite::Error>((
                    get_sync_run(conn, "run-1")?.unwrap(),
                    sync_run_totals(conn, "t1")?,
                ))
            })
            .await
            .unwrap();
        assert_eq!(run.status, "completed");
        assert_eq!(run.records_succeeded, 9);
        assert_eq!(run.errors, vec!["batch 2 failed".to_string()]);
        assert_eq!(totals.total_runs, 1);
        assert_eq!(totals.completed, 1);
    }

    #[tokio::test]
    async fn test_cursor_roundtrip() {
        let db = Database::open_memory().await.unwrap();
        let ts = Utc::now();

        db.writer()
            .call(move |conn| {
                assert!(get_sync_cursor(conn, "t1")?.is_none());
                set_sync_cursor(conn, "t1", ts)?;
                Ok::<_, rusqlite::Error>(())
            })
            .await
            .unwrap();

        let stored = db
            .reader()
            .call(|conn| get_sync_cursor(conn, "t1"))
            .await
            .unwrap()
            .unwrap();
        // Round-trips at microsecond precision.
        assert_eq!(stored.timestamp_micros(), ts.timestamp_micros());
    }

    #[tokio::test]
    async fn test_fail_stale_runs() {
        let db = Database::open_memory().await.unwrap();
        let old = Utc::now() - Duration::hours(1);
        let cutoff = Utc::now() - Duration::minutes(15);

        let ids = db
            .writer()
            .call(move |conn| {
                insert_sync_run(conn, "stuck", "t1", "full", old)?;
                insert_sync_run(conn, "fresh", "t1", "full", Utc::now())?;
                fail_stale_runs(conn, cutoff, "timed out and was cleaned up")
            })
            .await
            .unwrap();

        assert_eq!(ids, vec!["stuck".to_string()]);
        let fresh = db
            .reader()
            .call(|conn| get_sync_run(conn, "fresh"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fresh.status, "running");
    }

    #[tokio::test]
    async fn test_stats_columns_persisted() {
        let db = Database::open_memory().await.unwrap();
        let now = Utc::now();
        let facts = vec![
            AppointmentFacts {
                starts_at: now - Duration::days(10),
                appointment_type: Some("Physio".to_string()),
                treatment_note: Some("note".to_string()),
                archived: false,
            },
            AppointmentFacts {
                starts_at: now + Duration::days(5),
                appointment_type: Some("Physio".to_string()),
                treatment_note: None,
                archived: false,
            },
        ];
        let stats = compute_stats(&facts, now, 30);

        db.writer()
            .call(move |conn| {
                let mut p = patient("p1", "Ada");
                p.stats = stats;
                upsert_patient_batch(conn, "t1", &[p], now)
            })
            .await
            .unwrap();

        let rec = db
            .reader()
            .call(|conn| get_patient(conn, "t1", "p1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rec.activity_status, ActivityStatus::Active);
        assert_eq!(rec.recent_appointment_count, 1);
        assert_eq!(rec.upcoming_appointment_count, 1);
        assert_eq!(rec.total_appointment_count, 2);
        assert_eq!(rec.primary_appointment_type.as_deref(), Some("Physio"));
        assert!(rec.next_appointment_at.is_some());
    }
}
