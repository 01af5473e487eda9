//! DigitalOcean API client implementation.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, info, warn};

use super::models::{
    AccountResponse, DomainRecord, DomainRecordRequest, DomainRecordsResponse, DomainResponse,
    KubernetesClustersResponse, LoadBalancersResponse,
};
use crate::providers::awscli::AwsCli;
use crate::providers::traits::{
    CloudIdentity, CloudKind, CloudProvider, CloudProviderError, HostedZone, TxtRecord,
};

/// Base URL for DigitalOcean API.
const API_BASE_URL: &str = "https://api.digitalocean.com";

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Connect timeout for API requests.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// DigitalOcean rejects TXT records with a lower TTL.
const MIN_RECORD_TTL: u32 = 30;

/// DigitalOcean cloud provider.
#[derive(Clone)]
pub struct DigitalOcean {
    client: Client,
    base_url: String,
    token: String,
    region: String,
    spaces: AwsCli,
    spaces_key: String,
    spaces_secret: String,
}

impl std::fmt::Debug for DigitalOcean {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigitalOcean")
            .field("base_url", &self.base_url)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl DigitalOcean {
    /// Create a new DigitalOcean provider.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(
        token: impl Into<String>,
        region: impl Into<String>,
        spaces_key: impl Into<String>,
        spaces_secret: impl Into<String>,
    ) -> Result<Self, CloudProviderError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;
        let region = region.into();
        let spaces_key = spaces_key.into();
        let spaces_secret = spaces_secret.into();
        let spaces = AwsCli::s3_compatible(
            format!("https://{region}.digitaloceanspaces.com"),
            region.clone(),
            spaces_key.clone(),
            spaces_secret.clone(),
        );

        Ok(Self {
            client,
            base_url: API_BASE_URL.to_string(),
            token: token.into(),
            region,
            spaces,
            spaces_key,
            spaces_secret,
        })
    }

    /// Build from `DO_TOKEN`, `DO_SPACES_KEY` and `DO_SPACES_SECRET`.
    ///
    /// # Errors
    /// Returns [`CloudProviderError::Config`] if `DO_TOKEN` is unset.
    pub fn from_env(region: &str) -> Result<Self, CloudProviderError> {
        let token = std::env::var("DO_TOKEN")
            .map_err(|_| CloudProviderError::Config("DO_TOKEN must be set".to_string()))?;
        let key = std::env::var("DO_SPACES_KEY").unwrap_or_default();
        let secret = std::env::var("DO_SPACES_SECRET").unwrap_or_default();
        Self::new(token, region, key, secret)
    }

    /// Point the client at a different API root (used by tests).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Make an authenticated GET request.
    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, CloudProviderError> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "GET request");
        let response = self.client.get(&url).bearer_auth(&self.token).send().await?;
        self.handle_response(response).await
    }

    /// Make an authenticated request with a JSON body.
    async fn send_json<B: serde::Serialize>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &B,
    ) -> Result<(), CloudProviderError> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, method = %method, "Request");
        let response = self
            .client
            .request(method, &url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        self.handle_empty(response).await
    }

    /// Make an authenticated DELETE request.
    async fn delete(&self, path: &str) -> Result<(), CloudProviderError> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "DELETE request");
        let response = self.client.delete(&url).bearer_auth(&self.token).send().await?;
        self.handle_empty(response).await
    }

    /// Handle API response.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, CloudProviderError> {
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

    async fn handle_empty(&self, response: reqwest::Response) -> Result<(), CloudProviderError> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let text = response.text().await?;
            Err(Self::error_for(status, text))
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
    ) -> Result<Option<DomainRecord>, CloudProviderError> {
        let path = format!(
            "/v2/domains/{}/records?type=TXT&name={}",
            zone.name, record.name
        );
        let response: DomainRecordsResponse = self.get(&path).await?;
        let relative = record.relative_name(&zone.name);
        Ok(response
            .domain_records
            .into_iter()
            .find(|r| r.record_type == "TXT" && r.name == relative))
    }
}

#[async_trait]
impl CloudProvider for DigitalOcean {
    fn kind(&self) -> CloudKind {
        CloudKind::DigitalOcean
    }

    fn region(&self) -> &str {
        &self.region
    }

    async fn identity(&self) -> Result<CloudIdentity, CloudProviderError> {
        let response: AccountResponse = self.get("/v2/account").await?;
        Ok(CloudIdentity {
            account_id: response.account.uuid,
            principal: response.account.email,
        })
    }

    async fn hosted_zone(&self, domain: &str) -> Result<HostedZone, CloudProviderError> {
        match self.get::<DomainResponse>(&format!("/v2/domains/{domain}")).await {
            Ok(response) => Ok(HostedZone {
                id: response.domain.name.clone(),
                name: response.domain.name,
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
        let body = DomainRecordRequest {
            record_type: "TXT".to_string(),
            name: record.relative_name(&zone.name),
            data: record.value.clone(),
            ttl: record.ttl.max(MIN_RECORD_TTL),
        };

        if let Some(existing) = self.find_txt(zone, record).await? {
            info!(record = %record.name, id = existing.id, "Updating DigitalOcean TXT record");
            let path = format!("/v2/domains/{}/records/{}", zone.name, existing.id);
            self.send_json(reqwest::Method::PUT, &path, &body).await
        } else {
            info!(record = %record.name, "Creating DigitalOcean TXT record");
            let path = format!("/v2/domains/{}/records", zone.name);
            self.send_json(reqwest::Method::POST, &path, &body).await
        }
    }

    async fn delete_txt_record(
        &self,
        zone: &HostedZone,
        record: &TxtRecord,
    ) -> Result<(), CloudProviderError> {
        match self.find_txt(zone, record).await? {
            Some(existing) => {
                info!(record = %record.name, "Deleting DigitalOcean TXT record");
                self.delete(&format!("/v2/domains/{}/records/{}", zone.name, existing.id))
                    .await
            }
            None => Ok(()),
        }
    }

    async fn create_bucket(&self, name: &str) -> Result<(), CloudProviderError> {
        if self.spaces_key.is_empty() {
            return Err(CloudProviderError::Config(
                "DO_SPACES_KEY and DO_SPACES_SECRET must be set to create Spaces buckets"
                    .to_string(),
            ));
        }
        info!(bucket = %name, "Creating Spaces bucket");
        self.spaces.create_bucket(name).await
    }

    async fn delete_bucket(&self, name: &str) -> Result<(), CloudProviderError> {
        info!(bucket = %name, "Deleting Spaces bucket");
        self.spaces.delete_bucket(name).await
    }

    async fn load_balancers(&self, cluster: &str) -> Result<Vec<String>, CloudProviderError> {
        let clusters: KubernetesClustersResponse = self.get("/v2/kubernetes/clusters").await?;
        let Some(cluster) = clusters
            .kubernetes_clusters
            .into_iter()
            .find(|c| c.name == cluster)
        else {
            return Ok(Vec::new());
        };
        let tag = format!("k8s:{}", cluster.id);

        let lbs: LoadBalancersResponse = self.get("/v2/load_balancers").await?;
        Ok(lbs
            .load_balancers
            .into_iter()
            .filter(|lb| lb.tag == tag)
            .map(|lb| format!("{} ({})", lb.name, lb.id))
            .collect())
    }

    fn terraform_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("DO_TOKEN".to_string(), self.token.clone());
        env.insert("DIGITALOCEAN_TOKEN".to_string(), self.token.clone());
        env.insert("TF_VAR_do_token".to_string(), self.token.clone());
        env.insert("SPACES_ACCESS_KEY_ID".to_string(), self.spaces_key.clone());
        env.insert("SPACES_SECRET_ACCESS_KEY".to_string(), self.spaces_secret.clone());
        // The Spaces state backend speaks the S3 protocol.
        env.insert("AWS_ACCESS_KEY_ID".to_string(), self.spaces_key.clone());
        env.insert("AWS_SECRET_ACCESS_KEY".to_string(), self.spaces_secret.clone());
        env.insert("TF_VAR_do_region".to_string(), self.region.clone());
        env
    }
}
