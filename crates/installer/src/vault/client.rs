//! Vault `sys` API client.

use std::time::Duration;

use reqwest::{Client, Response};
use tracing::debug;

use super::models::{InitRequest, UnsealRequest, UnsealResponse, VaultInitResponse};
use super::VaultError;

/// Vault through the local tunnel.
pub const LOCAL_BASE_URL: &str = "http://localhost:8200";

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// `/v1/sys/health` status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// 200: initialized, unsealed, active.
    Active,
    /// 429: unsealed standby.
    Standby,
    /// 501: not initialized.
    Uninitialized,
    /// 503: sealed.
    Sealed,
    Other(u16),
}

impl From<u16> for Health {
    fn from(code: u16) -> Self {
        match code {
            200 => Self::Active,
            429 => Self::Standby,
            501 => Self::Uninitialized,
            503 => Self::Sealed,
            other => Self::Other(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VaultClient {
    client: Client,
    base_url: String,
}

impl VaultClient {
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(base_url: impl Into<String>) -> Result<Self, VaultError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// # Errors
    /// Returns error on transport failures.
    pub async fn health(&self) -> Result<Health, VaultError> {
        let response = self.client.get(self.url("/v1/sys/health")).send().await?;
        let health = Health::from(response.status().as_u16());
        debug!(?health, "Vault health");
        Ok(health)
    }

    /// # Errors
    /// Returns [`VaultError::Rejected`] if Vault answers with a failure status.
    pub async fn init(&self, request: &InitRequest) -> Result<VaultInitResponse, VaultError> {
        let response = self
            .client
            .put(self.url("/v1/sys/init"))
            .json(request)
            .send()
            .await?;
        Ok(check("init", response).await?.json().await?)
    }

    /// Submit one unseal key share.
    ///
    /// # Errors
    /// Returns [`VaultError::Rejected`] if Vault answers with a failure status.
    pub async fn unseal(&self, key: &str) -> Result<UnsealResponse, VaultError> {
        let response = self
            .client
            .put(self.url("/v1/sys/unseal"))
            .json(&UnsealRequest { key })
            .send()
            .await?;
        Ok(check("unseal", response).await?.json().await?)
    }
}

async fn check(op: &'static str, response: Response) -> Result<Response, VaultError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(VaultError::Rejected {
        op,
        status: status.as_u16(),
        body: response.text().await.unwrap_or_default(),
    })
}
