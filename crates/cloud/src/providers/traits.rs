//! Cloud provider trait and common types.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Grace period to let ingress load balancers drain before infrastructure teardown.
pub const DEFAULT_LOAD_BALANCER_GRACE_SECS: u64 = 185;

/// Errors that can occur during cloud provider operations.
#[derive(Error, Debug)]
pub enum CloudProviderError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// A provider CLI invocation failed.
    #[error("`{command}` failed: {stderr}")]
    Cli { command: String, stderr: String },

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// No hosted zone serves the requested domain.
    #[error("hosted zone not found for domain {0}")]
    HostedZoneNotFound(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Authentication error.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Local I/O error (spawning a provider CLI).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Supported cloud targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudKind {
    Aws,
    #[serde(rename = "digitalocean")]
    DigitalOcean,
    Vultr,
    K3d,
}

impl CloudKind {
    /// All supported targets, in display order.
    pub const ALL: [CloudKind; 4] = [Self::Aws, Self::DigitalOcean, Self::Vultr, Self::K3d];

    /// The lowercase tag used in config keys, template drivers and checkpoints.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::DigitalOcean => "digitalocean",
            Self::Vultr => "vultr",
            Self::K3d => "k3d",
        }
    }

    /// Whether the target runs on the operator's machine.
    #[must_use]
    pub fn is_local(self) -> bool {
        matches!(self, Self::K3d)
    }
}

impl fmt::Display for CloudKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CloudKind {
    type Err = CloudProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aws" => Ok(Self::Aws),
            "digitalocean" | "do" => Ok(Self::DigitalOcean),
            "vultr" => Ok(Self::Vultr),
            "k3d" => Ok(Self::K3d),
            other => Err(CloudProviderError::Config(format!(
                "unsupported cloud provider '{other}' (expected one of aws, digitalocean, vultr, k3d)"
            ))),
        }
    }
}

/// The account the provider credentials resolve to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudIdentity {
    /// Account identifier (AWS account id, DigitalOcean account uuid, ...).
    pub account_id: String,
    /// Principal ARN or e-mail, provider dependent.
    pub principal: String,
}

/// A DNS zone hosted by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostedZone {
    /// Provider zone id; the domain itself for providers keyed by name.
    pub id: String,
    /// Zone apex without a trailing dot.
    pub name: String,
}

/// A TXT record at a fully-qualified name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxtRecord {
    /// Fully-qualified record name without a trailing dot.
    pub name: String,
    /// Unquoted record value.
    pub value: String,
    /// Time to live in seconds.
    pub ttl: u32,
}

impl TxtRecord {
    /// The record name relative to `zone`.
    #[must_use]
    pub fn relative_name(&self, zone: &str) -> String {
        self.name
            .strip_suffix(zone)
            .map_or_else(|| self.name.clone(), |n| n.trim_end_matches('.').to_string())
    }
}

/// Trait for cloud providers.
///
/// Implementations are thin: every method maps onto one provider API call or
/// CLI invocation. Orchestration (retries, polling, checkpoints) lives in the
/// installer.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Which target this provider drives.
    fn kind(&self) -> CloudKind;

    /// Region the provider operates in.
    fn region(&self) -> &str;

    /// Resolve the account behind the configured credentials.
    async fn identity(&self) -> Result<CloudIdentity, CloudProviderError>;

    // ========================================================================
    // DNS
    // ========================================================================

    /// Find the hosted zone that serves `domain`.
    async fn hosted_zone(&self, domain: &str) -> Result<HostedZone, CloudProviderError>;

    /// Create or replace a TXT record.
    async fn upsert_txt_record(
        &self,
        zone: &HostedZone,
        record: &TxtRecord,
    ) -> Result<(), CloudProviderError>;

    /// Delete a TXT record. Deleting a missing record succeeds.
    async fn delete_txt_record(
        &self,
        zone: &HostedZone,
        record: &TxtRecord,
    ) -> Result<(), CloudProviderError>;

    // ========================================================================
    // Object storage
    // ========================================================================

    /// Create a bucket. Creating a bucket the caller already owns succeeds.
    async fn create_bucket(&self, name: &str) -> Result<(), CloudProviderError>;

    /// Delete a bucket and everything in it.
    async fn delete_bucket(&self, name: &str) -> Result<(), CloudProviderError>;

    // ========================================================================
    // Teardown support
    // ========================================================================

    /// Identifiers of load balancers still owned by `cluster`.
    async fn load_balancers(&self, cluster: &str) -> Result<Vec<String>, CloudProviderError>;

    /// How long destroy waits for ingress load balancers to drain.
    fn load_balancer_grace(&self) -> Duration {
        Duration::from_secs(DEFAULT_LOAD_BALANCER_GRACE_SECS)
    }

    /// Credentials and backend settings Terraform needs for this provider.
    fn terraform_env(&self) -> BTreeMap<String, String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cloud_kind_parse() {
        assert_eq!("aws".parse::<CloudKind>().unwrap(), CloudKind::Aws);
        assert_eq!(
            "DigitalOcean".parse::<CloudKind>().unwrap(),
            CloudKind::DigitalOcean
        );
        assert_eq!("k3d".parse::<CloudKind>().unwrap(), CloudKind::K3d);
        assert!("civo".parse::<CloudKind>().is_err());
    }

    #[test]
    fn test_cloud_kind_roundtrip_display() {
        for kind in CloudKind::ALL {
            assert_eq!(kind.as_str().parse::<CloudKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_relative_name() {
        let record = TxtRecord {
            name: "kubefirst-liveness.example.com".into(),
            value: "v".into(),
            ttl: 10,
        };
        assert_eq!(record.relative_name("example.com"), "kubefirst-liveness");
        assert_eq!(record.relative_name("other.org"), record.name);
    }
}
