//! GitLab driver.
//!
//! API Documentation: <https://docs.gitlab.com/ee/api/rest/>
//!
//! Repositories live under the owner group; the token comes from
//! `GITLAB_TOKEN` (or, for an in-cluster GitLab, is minted by the installer
//! inside the webservice pod).

mod client;
mod models;

pub use client::GitLab;
pub use models::*;
