//! Vultr cloud provider.
//!
//! API Documentation: <https://www.vultr.com/api/>
//!
//! Object storage buckets use the S3-compatible endpoint named by
//! `VULTR_OBJECT_STORAGE_HOSTNAME`.

mod client;
mod models;

pub use client::Vultr;
pub use models::*;
