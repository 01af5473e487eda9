//! DigitalOcean cloud provider.
//!
//! API Documentation: <https://docs.digitalocean.com/reference/api/>
//!
//! DNS, account and load balancer calls use the REST API with `DO_TOKEN`;
//! Spaces buckets go through the S3-compatible endpoint with
//! `DO_SPACES_KEY` / `DO_SPACES_SECRET`.

mod client;
mod models;

pub use client::DigitalOcean;
pub use models::*;
