use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::time::Instant;

use crate::credentials::ApiCredentials;
use crate::error::{Error, Result};
use crate::fetch::{
    FetchOutcome, PageLinks, RemoteAppointment, RemoteAppointmentType, RemotePatient,
};

const DEFAULT_PAGE_SIZE: u32 = 100;
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Default, Deserialize)]
struct PatientPage {
    #[serde(default)]
    patients: Vec<RemotePatient>,
    #[serde(default)]
    links: PageLinks,
}

#[derive(Debug, Default, Deserialize)]
struct AppointmentPage {
    #[serde(default)]
    appointments: Vec<RemoteAppointment>,
    #[serde(default)]
    links: PageLinks,
}

#[derive(Debug, Default, Deserialize)]
struct AppointmentTypePage {
    #[serde(default)]
    appointment_types: Vec<RemoteAppointmentType>,
    #[serde(default)]
    links: PageLinks,
}

fn ts_param(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Paginated client for one tenant's practice-management API account.
///
/// Pages are followed via the `links.next` URL each response carries. The
/// deadline is checked before every page request; when it expires the
/// records accumulated so far are returned with `partial` set, never an
/// error. A non-2xx page response is a hard failure for the whole fetch —
/// retry policy belongs to the scheduler, not this client.
pub struct PracticeClient {
    http: reqwest::Client,
    credentials: ApiCredentials,
    page_size: u32,
}

impl PracticeClient {
    pub fn new(credentials: ApiCredentials) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            credentials,
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}?page=1&per_page={}",
            self.credentials.base_url.trim_end_matches('/'),
            path,
            self.page_size
        )
    }

    /// Fetch all patients, optionally restricted to those updated since the
    /// given watermark (incremental mode).
    pub async fn fetch_patients(
        &self,
        updated_since: Option<DateTime<Utc>>,
        deadline: Instant,
    ) -> Result<FetchOutcome<RemotePatient>> {
        let mut url = self.endpoint("patients");
        if let Some(since) = updated_since {
            url.push_str(&format!("&updated_since={}", ts_param(since)));
        }
        self.fetch_pages(url, deadline, |page: PatientPage| {
            (page.patients, page.links)
        })
        .await
    }

    /// Fetch appointments whose start time falls inside [from, to],
    /// optionally restricted by update time.
    pub async fn fetch_appointments(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        updated_since: Option<DateTime<Utc>>,
        deadline: Instant,
    ) -> Result<FetchOutcome<RemoteAppointment>> {
        let mut url = self.endpoint("appointments");
        url.push_str(&format!(
            "&starts_at_from={}&starts_at_to={}",
            ts_param(from),
            ts_param(to)
        ));
        if let Some(since) = updated_since {
            url.push_str(&format!("&updated_since={}", ts_param(since)));
        }
        self.fetch_pages(url, deadline, |page: AppointmentPage| {
            (page.appointments, page.links)
        })
        .await
    }

    /// Fetch the appointment-type lookup as an id → name map. Lightweight;
    /// callers cache it for the duration of one sync.
    pub async fn fetch_appointment_types(&self) -> Result<HashMap<String, String>> {
        let mut map = HashMap::new();
        let mut next = Some(self.endpoint("appointment_types"));
        while let Some(url) = next {
            let page: AppointmentTypePage = self.get_page(&url).await?;
            for t in page.appointment_types {
                map.insert(t.id, t.name);
            }
            next = page.links.next;
        }
        Ok(map)
    }

    async fn fetch_pages<T, P, F>(
        &self,
        first_url: String,
        deadline: Instant,
        split: F,
    ) -> Result<FetchOutcome<T>>
    where
        P: DeserializeOwned,
        F: Fn(P) -> (Vec<T>, PageLinks),
    {
        let mut records = Vec::new();
        let mut pages = 0u32;
        let mut next = Some(first_url);

        while let Some(url) = next {
            if Instant::now() >= deadline {
                log::debug!("fetch deadline reached after {pages} pages, returning partial");
                return Ok(FetchOutcome {
                    records,
                    partial: true,
                    pages,
                });
            }
            let page: P = self.get_page(&url).await?;
            let (mut batch, links) = split(page);
            records.append(&mut batch);
            pages += 1;
            next = links.next;
        }

        Ok(FetchOutcome {
            records,
            partial: false,
            pages,
        })
    }

    async fn get_page<P: DeserializeOwned>(&self, url: &str) -> Result<P> {
        let response = self
            .http
            .get(url)
            .basic_auth(&self.credentials.api_key, Some(""))
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json::<P>().await?)
    }
}
