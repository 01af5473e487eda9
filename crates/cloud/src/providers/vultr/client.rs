//! Vultr API client implementation.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use tracing::{debug, info, warn};

use super::models::{
    AccountResponse, DomainResponse, LoadBalancersResponse, Record, RecordRequest,
    RecordsResponse,
};
use crate::providers::awscli::AwsCli;
use crate::providers::traits::{
    CloudIdentity, CloudKind, CloudProvider, CloudProviderError, HostedZone, TxtRecord,
};

/// Base URL for Vultr API.
const API_BASE_URL: &str = "https://api.vultr.com";

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Connect timeout for API requests.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default object storage cluster.
const DEFAULT_OBJECT_STORAGE_HOSTNAME: &str = "ewr1.vultrobjects.com";

/// Vultr cloud provider.
#[derive(Clone)]
pub struct Vultr {
    client: Client,
    base_url: String,
    api_key: String,
    region: String,
    objects: AwsCli,
    objects_ready: bool,
}

impl std::fmt::Debug for Vultr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vultr")
            .field("base_url", &self.base_url)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl Vultr {
    /// Create a new Vultr provider.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(
        api_key: impl Into<String>,
        region: impl Into<String>,
        objects: Option<AwsCli>,
    ) -> Result<Self, CloudProviderError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: API_BASE_URL.to_string(),
            api_key: api_key.into(),
            region: region.into(),
            objects_ready: objects.is_some(),
            objects: objects.unwrap_or_default(),
        })
    }

    /// Build from `VULTR_API_KEY` and the `VULTR_OBJECT_STORAGE_*` variables.
    ///
    /// # Errors
    /// Returns [`CloudProviderError::Config`] if `VULTR_API_KEY` is unset.
    pub fn from_env(region: &str) -> Result<Self, CloudProviderError> {
        let api_key = std::env::var("VULTR_API_KEY")
            .map_err(|_| CloudProviderError::Config("VULTR_API_KEY must be set".to_string()))?;
        let objects = match (
            std::env::var("VULTR_OBJECT_STORAGE_ACCESS_KEY"),
            std::env::var("VULTR_OBJECT_STORAGE_SECRET_KEY"),
        ) {
            (Ok(access), Ok(secret)) => {
                let host = std::env::var("VULTR_OBJECT_STORAGE_HOSTNAME")
                    .unwrap_or_else(|_| DEFAULT_OBJECT_STORAGE_HOSTNAME.to_string());
                Some(AwsCli::s3_compatible(
                    format!("https://{host}"),
                    region,
                    access,
                    secret,
                ))
            }
            _ => None,
        };
        Self::new(api_key, region, objects)
    }

    /// Point the client at a different API root (used by tests).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, CloudProviderError> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "GET request");
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, "Failed to parse response");
                CloudProviderError::Serialization(e)
            })
        } else {
            Err(Self::error_for(status, text))
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&RecordRequest>,
    ) -> Result<(), CloudProviderError> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, method = %method, "Request");
        let mut request = self.client.request(method, &url).bearer_auth(&self.api_key);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Self::error_for(status, response.text().await?))
        }
    }

    fn error_for(status: StatusCode, text: String) -> CloudProviderError {
        match status {
            StatusCode::NOT_FOUND => CloudProviderError::NotFound(text),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CloudProviderError::Auth(text),
            _ => CloudProviderError::Api {
                status: status.as_u16(),
                message: text,
            },
        }
    }

    async fn find_txt(
        &self,
        zone: &HostedZone,
        record: &TxtRecord,
    ) -> Result<Option<Record>, CloudProviderError> {
        let response: RecordsResponse = self
            .get(&format!("/v2/domains/{}/records?per_page=500", zone.name))
            .await?;
        let relative = record.relative_name(&zone.name);
        Ok(response
            .records
            .into_iter()
            .find(|r| r.record_type == "TXT" && r.name == relative))
    }

    fn objects(&self) -> Result<&AwsCli, CloudProviderError> {
        if self.objects_ready {
            Ok(&self.objects)
        } else {
            Err(CloudProviderError::Config(
                "VULTR_OBJECT_STORAGE_ACCESS_KEY and VULTR_OBJECT_STORAGE_SECRET_KEY must be set"
                    .to_string(),
            ))
        }
    }
}

#[async_trait]
impl CloudProvider for Vultr {
    fn kind(&self) -> CloudKind {
        CloudKind::Vultr
    }

    fn region(&self) -> &str {
        &self.region
    }

    async fn identity(&self) -> Result<CloudIdentity, CloudProviderError> {
        let response: AccountResponse = self.get("/v2/account").await?;
        Ok(CloudIdentity {
            account_id: response.account.email.clone(),
            principal: if response.account.name.is_empty() {
                response.account.email
            } else {
                response.account.name
            },
        })
    }

    async fn hosted_zone(&self, domain: &str) -> Result<HostedZone, CloudProviderError> {
        match self.get::<DomainResponse>(&format!("/v2/domains/{domain}")).await {
            Ok(response) => Ok(HostedZone {
                id: response.domain.domain.clone(),
                name: response.domain.domain,
            }),
            Err(CloudProviderError::NotFound(_)) => {
                Err(CloudProviderError::HostedZoneNotFound(domain.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn upsert_txt_record(
        &self,
        zone: &HostedZone,
        record: &TxtRecord,
    ) -> Result<(), CloudProviderError> {
        let body = RecordRequest {
            name: record.relative_name(&zone.name),
            record_type: "TXT".to_string(),
            data: record.value.clone(),
            ttl: record.ttl,
        };
        if let Some(existing) = self.find_txt(zone, record).await? {
            info!(record = %record.name, "Updating Vultr TXT record");
            let path = format!("/v2/domains/{}/records/{}", zone.name, existing.id);
            self.send(Method::PATCH, &path, Some(&body)).await
        } else {
            info!(record = %record.name, "Creating Vultr TXT record");
            let path = format!("/v2/domains/{}/records", zone.name);
            self.send(Method::POST, &path, Some(&body)).await
        }
    }

    async fn delete_txt_record(
        &self,
        zone: &HostedZone,
        record: &TxtRecord,
    ) -> Result<(), CloudProviderError> {
        if let Some(existing) = self.find_txt(zone, record).await? {
            info!(record = %record.name, "Deleting Vultr TXT record");
            let path = format!("/v2/domains/{}/records/{}", zone.name, existing.id);
            self.send(Method::DELETE, &path, None).await?;
        }
        Ok(())
    }

    async fn create_bucket(&self, name: &str) -> Result<(), CloudProviderError> {
        info!(bucket = %name, "Creating Vultr object storage bucket");
        self.objects()?.create_bucket(name).await
    }

    async fn delete_bucket(&self, name: &str) -> Result<(), CloudProviderError> {
        info!(bucket = %name, "Deleting Vultr object storage bucket");
        self.objects()?.delete_bucket(name).await
    }

    async fn load_balancers(&self, cluster: &str) -> Result<Vec<String>, CloudProviderError> {
        let response: LoadBalancersResponse = self.get("/v2/load-balancers").await?;
        Ok(response
            .load_balancers
            .into_iter()
            .filter(|lb| lb.label.contains(cluster))
            .map(|lb| lb.id)
            .collect())
    }

    fn load_balancer_grace(&self) -> Duration {
        // Vultr LBs are released with the VKE cluster; a short grace is enough.
        Duration::from_secs(60)
    }

    fn terraform_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("VULTR_API_KEY".to_string(), self.api_key.clone());
        env.insert("TF_VAR_vultr_region".to_string(), self.region.clone());
        for key in [
            "VULTR_OBJECT_STORAGE_ACCESS_KEY",
            "VULTR_OBJECT_STORAGE_SECRET_KEY",
        ] {
            if let Ok(value) = std::env::var(key) {
                env.insert(key.to_string(), value);
            }
        }
        env
    }
}
