//! DigitalOcean API request and response models.

use serde::{Deserialize, Serialize};

/// `GET /v2/account` response.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountResponse {
    /// Account details.
    pub account: Account,
}

/// A DigitalOcean account.
#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    /// Account uuid.
    pub uuid: String,
    /// Owner e-mail.
    pub email: String,
}

/// `GET /v2/domains/{name}` response.
#[derive(Debug, Clone, Deserialize)]
pub struct DomainResponse {
    /// The domain.
    pub domain: Domain,
}

/// A managed domain.
#[derive(Debug, Clone, Deserialize)]
pub struct Domain {
    /// Domain apex.
    pub name: String,
}

/// `GET /v2/domains/{name}/records` response.
#[derive(Debug, Clone, Deserialize)]
pub struct DomainRecordsResponse {
    /// Matching records.
    #[serde(default)]
    pub domain_records: Vec<DomainRecord>,
}

/// A DNS record.
#[derive(Debug, Clone, Deserialize)]
pub struct DomainRecord {
    /// Record id.
    pub id: u64,
    /// Record type.
    #[serde(rename = "type")]
    pub record_type: String,
    /// Name relative to the domain (`@` for the apex).
    pub name: String,
    /// Record value.
    pub data: String,
}

/// Body for creating or updating a record.
#[derive(Debug, Clone, Serialize)]
pub struct DomainRecordRequest {
    /// Record type.
    #[serde(rename = "type")]
    pub record_type: String,
    /// Name relative to the domain.
    pub name: String,
    /// Record value.
    pub data: String,
    /// TTL in seconds; DigitalOcean enforces a floor of 30.
    pub ttl: u32,
}

/// `GET /v2/kubernetes/clusters` response.
#[derive(Debug, Clone, Deserialize)]
pub struct KubernetesClustersResponse {
    /// Clusters on the account.
    #[serde(default)]
    pub kubernetes_clusters: Vec<KubernetesCluster>,
}

/// A DOKS cluster.
#[derive(Debug, Clone, Deserialize)]
pub struct KubernetesCluster {
    /// Cluster id.
    pub id: String,
    /// Cluster name.
    pub name: String,
}

/// `GET /v2/load_balancers` response.
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
    /// Name.
    pub name: String,
    /// Tag linking it to a DOKS cluster (`k8s:<cluster-id>`).
    #[serde(default)]
    pub tag: String,
}
