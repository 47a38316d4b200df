use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Trailing window, in days, that counts as "recent" activity.
pub const DEFAULT_RECENT_WINDOW_DAYS: i64 = 30;

/// Maximum number of appointment snippets serialized onto a patient row.
const SNIPPET_LIMIT: usize = 5;

/// Derived engagement classification for a patient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Active,
    RecentlyActive,
    UpcomingOnly,
    Inactive,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityStatus::Active => "active",
            ActivityStatus::RecentlyActive => "recently_active",
            ActivityStatus::UpcomingOnly => "upcoming_only",
            ActivityStatus::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "active" => ActivityStatus::Active,
            "recently_active" => ActivityStatus::RecentlyActive,
            "upcoming_only" => ActivityStatus::UpcomingOnly,
            _ => ActivityStatus::Inactive,
        }
    }
}

impl std::fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The facts about one appointment that feed the aggregation. Built from
/// both freshly fetched and already-stored appointments.
#[derive(Debug, Clone)]
pub struct AppointmentFacts {
    pub starts_at: DateTime<Utc>,
    pub appointment_type: Option<String>,
    pub treatment_note: Option<String>,
    /// Soft-deleted upstream (cancelled/archived). Excluded from all stats.
    pub archived: bool,
}

/// Compact appointment view serialized onto the patient row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppointmentSnippet {
    pub starts_at: DateTime<Utc>,
    pub appointment_type: Option<String>,
}

/// Per-patient rollup computed from the complete appointment set.
#[derive(Debug, Clone)]
pub struct PatientStats {
    pub recent_count: u32,
    pub upcoming_count: u32,
    pub total_count: u32,
    pub first_appointment_at: Option<DateTime<Utc>>,
    pub last_appointment_at: Option<DateTime<Utc>>,
    pub next_appointment_at: Option<DateTime<Utc>>,
    pub next_appointment_type: Option<String>,
    pub primary_appointment_type: Option<String>,
    pub latest_treatment_note: Option<String>,
    pub activity_status: ActivityStatus,
    pub recent_appointments: Vec<AppointmentSnippet>,
    pub upcoming_appointments: Vec<AppointmentSnippet>,
}

impl Default for PatientStats {
    fn default() -> Self {
        Self {
            recent_count: 0,
            upcoming_count: 0,
            total_count: 0,
            first_appointment_at: None,
            last_appointment_at: None,
            next_appointment_at: None,
            next_appointment_type: None,
            primary_appointment_type: None,
            latest_treatment_note: None,
            activity_status: ActivityStatus::Inactive,
            recent_appointments: Vec::new(),
            upcoming_appointments: Vec::new(),
        }
    }
}

/// Compute a patient's engagement stats from their complete appointment set.
///
/// Pure and deterministic: the same input always yields the same output, so
/// re-running a sync over unchanged data is a no-op at the row level.
/// Archived appointments are dropped before any counting.
///
/// Partitioning: "recent" is within `recent_window_days` trailing from `now`
/// (inclusive of `now` itself); "upcoming" is strictly in the future.
pub fn compute_stats(
    appointments: &[AppointmentFacts],
    now: DateTime<Utc>,
    recent_window_days: i64,
) -> PatientStats {
    let mut live: Vec<&AppointmentFacts> =
        appointments.iter().filter(|a| !a.archived).collect();
    live.sort_by_key(|a| a.starts_at);

    if live.is_empty() {
        return PatientStats::default();
    }

    let window_start = now - Duration::days(recent_window_days);

    let mut stats = PatientStats {
        total_count: live.len() as u32,
        first_appointment_at: live.first().map(|a| a.starts_at),
        last_appointment_at: live.last().map(|a| a.starts_at),
        ..PatientStats::default()
    };

    // Primary type: most frequent label, ties broken by first appearance
    // in chronological order.
    let mut type_counts: HashMap<&str, (u32, usize)> = HashMap::new();
    for (i, appt) in live.iter().enumerate() {
        if appt.starts_at > now {
            stats.upcoming_count += 1;
            if stats.next_appointment_at.is_none() {
                stats.next_appointment_at = Some(appt.starts_at);
                stats.next_appointment_type = appt.appointment_type.clone();
            }
        } else if appt.starts_at >= window_start {
            stats.recent_count += 1;
        }

        if let Some(ref label) = appt.appointment_type {
            let entry = type_counts.entry(label.as_str()).or_insert((0, i));
            entry.0 += 1;
        }

        if let Some(note) = appt.treatment_note.as_deref() {
            if !note.trim().is_empty() {
                stats.latest_treatment_note = Some(note.to_string());
            }
        }
    }

    stats.primary_appointment_type = type_counts
        .iter()
        .max_by(|a, b| a.1 .0.cmp(&b.1 .0).then(b.1 .1.cmp(&a.1 .1)))
        .map(|(label, _)| label.to_string());

    stats.activity_status = match (stats.recent_count > 0, stats.upcoming_count > 0) {
        (true, true) => ActivityStatus::Active,
        (true, false) => ActivityStatus::RecentlyActive,
        (false, true) => ActivityStatus::UpcomingOnly,
        (false, false) => ActivityStatus::Inactive,
    };

    // Snippets: most recent first for the trailing window, soonest first
    // for upcoming.
    stats.recent_appointments = live
        .iter()
        .rev()
        .filter(|a| a.starts_at <= now && a.starts_at >= window_start)
        .take(SNIPPET_LIMIT)
        .map(|a| AppointmentSnippet {
            starts_at: a.starts_at,
            appointment_type: a.appointment_type.clone(),
        })
        .collect();
    stats.upcoming_appointments = live
        .iter()
        .filter(|a| a.starts_at > now)
        .take(SNIPPET_LIMIT)
        .map(|a| AppointmentSnippet {
            starts_at: a.starts_at,
            appointment_type: a.appointment_type.clone(),
        })
        .collect();

    stats
}
