//! AWS (Amazon Web Services) cloud provider.
//!
//! Implements the [`CloudProvider`](crate::CloudProvider) trait by driving
//! the `aws` CLI with the ambient credential chain (`AWS_PROFILE`,
//! `AWS_REGION`, instance metadata, ...).
//!
//! ## Services
//!
//! - **STS** - caller identity
//! - **Route53** - hosted zone lookup and TXT records
//! - **S3** - Terraform state and artifact buckets
//! - **Resource Groups Tagging** - ELBs owned by the cluster

mod client;
mod models;

pub use client::Aws;
pub use models::*;
