//! AWS CLI response models.

use serde::{Deserialize, Serialize};

// ============================================================================
// STS
// ============================================================================

/// `sts get-caller-identity` output.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CallerIdentity {
    /// Account id.
    pub account: String,
    /// Caller ARN.
    pub arn: String,
    /// Unique principal id.
    #[serde(default)]
    pub user_id: String,
}

// ============================================================================
// Route53
// ============================================================================

/// `route53 list-hosted-zones-by-name` output.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListHostedZonesResponse {
    /// Zones sorted by name starting at the requested one.
    #[serde(default)]
    pub hosted_zones: Vec<Route53Zone>,
}

/// A Route53 hosted zone.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Route53Zone {
    /// Zone id in `/hostedzone/<ID>` form.
    pub id: String,
    /// Zone name with trailing dot.
    pub name: String,
}

/// Change batch for `route53 change-resource-record-sets`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChangeBatch {
    /// Changes to apply atomically.
    pub changes: Vec<Change>,
}

/// A single record change.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Change {
    /// `UPSERT` or `DELETE`.
    pub action: String,
    /// Target record set.
    pub resource_record_set: ResourceRecordSet,
}

/// A Route53 record set.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceRecordSet {
    /// Fully-qualified name.
    pub name: String,
    /// Record type.
    #[serde(rename = "Type")]
    pub record_type: String,
    /// TTL in seconds.
    #[serde(rename = "TTL")]
    pub ttl: u32,
    /// Record values.
    pub resource_records: Vec<ResourceRecord>,
}

/// A record value.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceRecord {
    /// Value; TXT values carry their own quotes.
    pub value: String,
}

// ============================================================================
// Resource Groups Tagging
// ============================================================================

/// `resourcegroupstaggingapi get-resources` output.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetResourcesResponse {
    /// Matching resources.
    #[serde(default)]
    pub resource_tag_mapping_list: Vec<ResourceTagMapping>,
}

/// A tagged resource.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceTagMapping {
    /// Resource ARN.
    #[serde(rename = "ResourceARN")]
    pub resource_arn: String,
}
