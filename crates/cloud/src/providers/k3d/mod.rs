//! Local k3d target.
//!
//! Nothing billable exists outside the operator's machine, so every cloud
//! operation succeeds without side effects. DNS is served by mkcert-issued
//! certificates and `/etc/hosts`, object storage by in-cluster MinIO.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::providers::traits::{
    CloudIdentity, CloudKind, CloudProvider, CloudProviderError, HostedZone, TxtRecord,
};

/// Local k3d provider.
#[derive(Debug, Clone, Default)]
pub struct K3d;

impl K3d {
    /// Create the local provider.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CloudProvider for K3d {
    fn kind(&self) -> CloudKind {
        CloudKind::K3d
    }

    fn region(&self) -> &str {
        "local"
    }

    async fn identity(&self) -> Result<CloudIdentity, CloudProviderError> {
        Ok(CloudIdentity {
            account_id: "local".to_string(),
            principal: "local".to_string(),
        })
    }

    async fn hosted_zone(&self, domain: &str) -> Result<HostedZone, CloudProviderError> {
        Ok(HostedZone {
            id: domain.to_string(),
            name: domain.to_string(),
        })
    }

    async fn upsert_txt_record(
        &self,
        _zone: &HostedZone,
        record: &TxtRecord,
    ) -> Result<(), CloudProviderError> {
        debug!(record = %record.name, "k3d has no public DNS; skipping TXT record");
        Ok(())
    }

    async fn delete_txt_record(
        &self,
        _zone: &HostedZone,
        _record: &TxtRecord,
    ) -> Result<(), CloudProviderError> {
        Ok(())
    }

    async fn create_bucket(&self, name: &str) -> Result<(), CloudProviderError> {
        debug!(bucket = %name, "k3d buckets live in MinIO; skipping");
        Ok(())
    }

    async fn delete_bucket(&self, _name: &str) -> Result<(), CloudProviderError> {
        Ok(())
    }

    async fn load_balancers(&self, _cluster: &str) -> Result<Vec<String>, CloudProviderError> {
        Ok(Vec::new())
    }

    fn load_balancer_grace(&self) -> Duration {
        Duration::ZERO
    }

    fn terraform_env(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_k3d_is_side_effect_free() {
        let k3d = K3d::new();
        let zone = k3d.hosted_zone("kubefirst.dev").await.unwrap();
        assert_eq!(zone.name, "kubefirst.dev");
        assert!(k3d.load_balancers("mgmt").await.unwrap().is_empty());
        assert_eq!(k3d.load_balancer_grace(), Duration::ZERO);
        assert_eq!(k3d.identity().await.unwrap().account_id, "local");
    }
}
