//! Cloud provider integrations for kubefirst installations.
//!
//! This crate provides the thin cloud surface the installer needs:
//!
//! - **AWS** - via the `aws` CLI (STS, Route53, S3, tagging API)
//! - **DigitalOcean** - REST API plus Spaces
//! - **Vultr** - REST API plus Object Storage
//! - **k3d** - local clusters, no cloud side effects
//!
//! ## Surface
//!
//! Every provider answers the same questions: who am I, which zone serves
//! this domain, write/remove a TXT record, create/remove a bucket, which load
//! balancers does this cluster still own, and what does Terraform need in its
//! environment.

pub mod providers;

pub use providers::{
    aws, digitalocean, k3d, vultr, AwsCli, CloudIdentity, CloudKind, CloudProvider,
    CloudProviderError, HostedZone, TxtRecord, DEFAULT_LOAD_BALANCER_GRACE_SECS,
};

/// Build the provider for `kind` from its conventional environment variables.
///
/// # Errors
/// Returns [`CloudProviderError::Config`] when required credentials are missing.
pub fn provider_from_env(
    kind: CloudKind,
    region: &str,
) -> Result<Box<dyn CloudProvider>, CloudProviderError> {
    Ok(match kind {
        CloudKind::Aws => Box::new(providers::Aws::from_env(region)),
        CloudKind::DigitalOcean => Box::new(providers::DigitalOcean::from_env(region)?),
        CloudKind::Vultr => Box::new(providers::Vultr::from_env(region)?),
        CloudKind::K3d => Box::new(providers::K3d::new()),
    })
}
