use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Decrypted credentials for one tenant's practice-management API account.
#[derive(Debug, Clone)]
pub struct ApiCredentials {
    pub base_url: String,
    pub api_key: String,
}

/// Supplies decrypted API credentials for a tenant. The engine never sees
/// how credentials are stored; encrypted-at-rest or KMS-backed providers
/// implement this trait outside the crate.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credentials(&self, tenant_id: &str) -> Result<ApiCredentials>;
}

/// In-memory provider backed by a fixed map. Used by embedders that manage
/// credential storage themselves, and by tests.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentialProvider {
    creds: HashMap<String, ApiCredentials>,
}

impl StaticCredentialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(tenant_id: impl Into<String>, credentials: ApiCredentials) -> Self {
        let mut provider = Self::new();
        provider.insert(tenant_id, credentials);
        provider
    }

    pub fn insert(&mut self, tenant_id: impl Into<String>, credentials: ApiCredentials) {
        self.creds.insert(tenant_id.into(), credentials);
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn credentials(&self, tenant_id: &str) -> Result<ApiCredentials> {
        self.creds
            .get(tenant_id)
            .cloned()
            .ok_or_else(|| Error::Credential {
                tenant_id: tenant_id.to_string(),
                message: "no credentials configured".into(),
            })
    }
}

/// Provider that reads `CLINICSYNC_BASE_URL` / `CLINICSYNC_API_KEY` from the
/// environment. Serves the single-tenant CLI; the env is read per call so a
/// long-lived process picks up rotation.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentialProvider;

#[async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn credentials(&self, tenant_id: &str) -> Result<ApiCredentials> {
        let base_url = std::env::var("CLINICSYNC_BASE_URL").map_err(|_| Error::Credential {
            tenant_id: tenant_id.to_string(),
            message: "CLINICSYNC_BASE_URL is not set".into(),
        })?;
        let api_key = std::env::var("CLINICSYNC_API_KEY").map_err(|_| Error::Credential {
            tenant_id: tenant_id.to_string(),
            message: "CLINICSYNC_API_KEY is not set".into(),
        })?;
        Ok(ApiCredentials { base_url, api_key })
    }
}
