//! Vultr API request and response models.

use serde::{Deserialize, Serialize};

/// `GET /v2/account` response.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountResponse {
    /// Account details.
    pub account: Account,
}

/// A Vultr account.
#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    /// Account name.
    #[serde(default)]
    pub name: String,
    /// Owner e-mail.
    pub email: String,
}

/// `GET /v2/domains/{domain}` response.
#[derive(Debug, Clone, Deserialize)]
pub struct DomainResponse {
    /// The domain.
    pub domain: Domain,
}

/// A managed domain.
#[derive(Debug, Clone, Deserialize)]
pub struct Domain {
    /// Domain apex.
    pub domain: String,
}

/// `GET /v2/domains/{domain}/records` response.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordsResponse {
    /// Records in the zone.
    #[serde(default)]
    pub records: Vec<Record>,
}

/// A DNS record.
#[derive(Debug, Clone, Deserialize)]
pub struct Record {
    /// Record id.
    pub id: String,
    /// Record type.
    #[serde(rename = "type")]
    pub record_type: String,
    /// Name relative to the domain.
    pub name: String,
    /// Record value.
    pub data: String,
}

/// Body for creating or updating a record.
#[derive(Debug, Clone, Serialize)]
pub struct RecordRequest {
    /// Name relative to the domain.
    pub name: String,
    /// Record type.
    #[serde(rename = "type")]
    pub record_type: String,
    /// Record value.
    pub data: String,
    /// TTL in seconds.
    pub ttl: u32,
}

/// `GET /v2/load-balancers` response.
#[derive(Debug, Clone, Deserialize)]
pub struct LoadBalancersResponse {
    /// Load balancers on the account.
    #[serde(default)]
    pub load_balancers: Vec<LoadBalancer>,
}

/// A load balancer.
#[derive(Debug, Clone, Deserialize)]
pub struct LoadBalancer {
    /// Load balancer id.
    pub id: String,
    /// Label set by the cloud controller manager.
    #[serde(default)]
    pub label: String,
}
