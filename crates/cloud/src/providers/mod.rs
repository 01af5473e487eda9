//! Cloud provider abstractions.
//!
//! This module defines the common trait and types for cloud providers.

pub mod aws;
mod awscli;
pub mod digitalocean;
pub mod k3d;
mod traits;
pub mod vultr;

pub use awscli::AwsCli;
pub use traits::{
    CloudIdentity, CloudKind, CloudProvider, CloudProviderError, HostedZone, TxtRecord,
    DEFAULT_LOAD_BALANCER_GRACE_SECS,
};

// Re-export provider clients
pub use aws::Aws;
pub use digitalocean::DigitalOcean;
pub use k3d::K3d;
pub use vultr::Vultr;
