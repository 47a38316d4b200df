pub mod client;

pub use client::PracticeClient;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result of walking a paginated endpoint. `partial` is set when the
/// caller's deadline expired before the last page; the accumulated records
/// are still returned so the caller can decide whether they are usable.
#[derive(Debug, Clone)]
pub struct FetchOutcome<T> {
    pub records: Vec<T>,
    pub partial: bool,
    pub pages: u32,
}

impl<T> FetchOutcome<T> {
    pub fn empty() -> Self {
        Self {
            records: Vec::new(),
            partial: false,
            pages: 0,
        }
    }
}

/// Pagination links as returned by the practice API. `next` is an absolute
/// URL; absent on the last page.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageLinks {
    #[serde(default)]
    pub next: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemotePatient {
    pub id: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub date_of_birth: Option<String>,
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl RemotePatient {
    /// Archived upstream means soft-deactivated locally.
    pub fn is_active(&self) -> bool {
        self.archived_at.is_none()
    }
}

/// An appointment as the practice API returns it. Unknown fields are kept
/// in `extra` so the raw payload can be persisted losslessly.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteAppointment {
    pub id: String,
    pub patient_id: String,
    pub starts_at: DateTime<Utc>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub appointment_type_id: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RemoteAppointment {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled_at.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteAppointmentType {
    pub id: String,
    pub name: String,
}
