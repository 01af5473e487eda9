//! AWS provider backed by the `aws` CLI.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{debug, info};

use super::models::{
    CallerIdentity, Change, ChangeBatch, GetResourcesResponse, ListHostedZonesResponse,
    ResourceRecord, ResourceRecordSet,
};
use crate::providers::awscli::AwsCli;
use crate::providers::traits::{
    CloudIdentity, CloudKind, CloudProvider, CloudProviderError, HostedZone, TxtRecord,
};

/// AWS cloud provider.
#[derive(Clone, Debug)]
pub struct Aws {
    cli: AwsCli,
    profile: Option<String>,
}

impl Aws {
    /// Create a new AWS provider.
    ///
    /// # Arguments
    /// * `profile` - named profile from `~/.aws/config`, or the default chain
    /// * `region` - AWS region (e.g., "us-east-1")
    pub fn new(profile: Option<String>, region: impl Into<String>) -> Self {
        Self {
            cli: AwsCli::new(profile.clone(), region),
            profile,
        }
    }

    /// Build from `AWS_PROFILE` and `AWS_REGION`, falling back to `region`.
    #[must_use]
    pub fn from_env(region: &str) -> Self {
        let profile = std::env::var("AWS_PROFILE").ok().filter(|p| !p.is_empty());
        let region = std::env::var("AWS_REGION")
            .ok()
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| region.to_string());
        Self::new(profile, region)
    }

    async fn change_txt(
        &self,
        action: &str,
        zone: &HostedZone,
        record: &TxtRecord,
    ) -> Result<(), CloudProviderError> {
        let batch = ChangeBatch {
            changes: vec![Change {
                action: action.to_string(),
                resource_record_set: ResourceRecordSet {
                    name: record.name.clone(),
                    record_type: "TXT".to_string(),
                    ttl: record.ttl,
                    resource_records: vec![ResourceRecord {
                        value: format!("\"{}\"", record.value),
                    }],
                },
            }],
        };
        let batch = serde_json::to_string(&batch)?;
        self.cli
            .run(&[
                "route53",
                "change-resource-record-sets",
                "--hosted-zone-id",
                &zone.id,
                "--change-batch",
                &batch,
            ])
            .await
            .map(|_| ())
    }
}

/// Strip the `/hostedzone/` prefix Route53 puts on ids.
fn bare_zone_id(id: &str) -> &str {
    id.rsplit('/').next().unwrap_or(id)
}

#[async_trait]
impl CloudProvider for Aws {
    fn kind(&self) -> CloudKind {
        CloudKind::Aws
    }

    fn region(&self) -> &str {
        self.cli.region()
    }

    async fn identity(&self) -> Result<CloudIdentity, CloudProviderError> {
        let caller: CallerIdentity = self
            .cli
            .run_json(&["sts", "get-caller-identity"])
            .await
            .map_err(|e| match e {
                CloudProviderError::Cli { stderr, .. } => CloudProviderError::Auth(stderr),
                other => other,
            })?;
        debug!(account = %caller.account, "Resolved AWS caller identity");
        Ok(CloudIdentity {
            account_id: caller.account,
            principal: caller.arn,
        })
    }

    async fn hosted_zone(&self, domain: &str) -> Result<HostedZone, CloudProviderError> {
        let response: ListHostedZonesResponse = self
            .cli
            .run_json(&["route53", "list-hosted-zones-by-name", "--dns-name", domain])
            .await?;

        response
            .hosted_zones
            .into_iter()
            .find(|zone| zone.name.trim_end_matches('.') == domain)
            .map(|zone| HostedZone {
                id: bare_zone_id(&zone.id).to_string(),
                name: domain.to_string(),
            })
            .ok_or_else(|| CloudProviderError::HostedZoneNotFound(domain.to_string()))
    }

    async fn upsert_txt_record(
        &self,
        zone: &HostedZone,
        record: &TxtRecord,
    ) -> Result<(), CloudProviderError> {
        info!(record = %record.name, zone = %zone.id, "Upserting Route53 TXT record");
        self.change_txt("UPSERT", zone, record).await
    }

    async fn delete_txt_record(
        &self,
        zone: &HostedZone,
        record: &TxtRecord,
    ) -> Result<(), CloudProviderError> {
        match self.change_txt("DELETE", zone, record).await {
            Ok(()) => Ok(()),
            Err(CloudProviderError::Cli { stderr, .. }) if stderr.contains("not found") => {
                debug!(record = %record.name, "TXT record already absent");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn create_bucket(&self, name: &str) -> Result<(), CloudProviderError> {
        info!(bucket = %name, "Creating S3 bucket");
        self.cli.create_bucket(name).await?;
        self.cli.enable_versioning(name).await
    }

    async fn delete_bucket(&self, name: &str) -> Result<(), CloudProviderError> {
        info!(bucket = %name, "Deleting S3 bucket");
        self.cli.delete_bucket(name).await
    }

    async fn load_balancers(&self, cluster: &str) -> Result<Vec<String>, CloudProviderError> {
        let filter = format!("Key=kubernetes.io/cluster/{cluster},Values=owned");
        let response: GetResourcesResponse = self
            .cli
            .run_json(&[
                "resourcegroupstaggingapi",
                "get-resources",
                "--resource-type-filters",
                "elasticloadbalancing:loadbalancer",
                "--tag-filters",
                &filter,
            ])
            .await?;
        Ok(response
            .resource_tag_mapping_list
            .into_iter()
            .map(|r| r.resource_arn)
            .collect())
    }

    fn terraform_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("AWS_REGION".to_string(), self.cli.region().to_string());
        env.insert("TF_VAR_aws_region".to_string(), self.cli.region().to_string());
        if let Some(profile) = &self.profile {
            env.insert("AWS_PROFILE".to_string(), profile.clone());
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_zone_id() {
        assert_eq!(bare_zone_id("/hostedzone/Z123ABC"), "Z123ABC");
        assert_eq!(bare_zone_id("Z123ABC"), "Z123ABC");
    }

    #[test]
    fn test_terraform_env_carries_region_and_profile() {
        let aws = Aws::new(Some("k1".into()), "us-east-2");
        let env = aws.terraform_env();
        assert_eq!(env.get("AWS_REGION").map(String::as_str), Some("us-east-2"));
        assert_eq!(env.get("AWS_PROFILE").map(String::as_str), Some("k1"));
    }

    #[test]
    fn test_txt_change_batch_shape() {
        let batch = ChangeBatch {
            changes: vec![Change {
                action: "UPSERT".into(),
                resource_record_set: ResourceRecordSet {
                    name: "kubefirst-liveness.example.com".into(),
                    record_type: "TXT".into(),
                    ttl: 10,
                    resource_records: vec![ResourceRecord {
                        value: "\"domain record propagated\"".into(),
                    }],
                },
            }],
        };
        let json = serde_json::to_value(&batch).unwrap();
        let set = &json["Changes"][0]["ResourceRecordSet"];
        assert_eq!(set["Type"], "TXT");
        assert_eq!(set["TTL"], 10);
        assert_eq!(set["ResourceRecords"][0]["Value"], "\"domain record propagated\"");
    }
}
