//! GitHub driver.
//!
//! API Documentation: <https://docs.github.com/en/rest>
//!
//! Tokens come from `KUBEFIRST_GITHUB_AUTH_TOKEN`; when none is present the
//! installer runs the OAuth [device flow](device_flow) and stores the result.

mod client;
pub mod device_flow;
mod models;

pub use client::{GitHub, REQUIRED_SCOPES};
pub use models::*;
