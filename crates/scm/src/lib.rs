//! Git host drivers for kubefirst installations.
//!
//! One trait, [`GitHost`], covers everything the installer does against a git
//! host:
//!
//! - verify credentials (and, on GitHub, their scopes)
//! - create the private `gitops` and `metaphor` repositories
//! - push the seeded working trees
//! - register and remove the automation bot's SSH key
//! - open pull requests, comment on them and poll for CI comments
//!
//! ## Drivers
//!
//! - [`github::GitHub`] - REST API, OAuth device flow fallback
//! - [`gitlab::GitLab`] - REST v4 under an owner group
//! - [`softserve::SoftServe`] - in-cluster soft-serve over a forwarded SSH port

pub mod git;
pub mod github;
pub mod gitlab;
pub mod softserve;
mod traits;

pub use traits::{
    GitHost, GitProviderKind, GitRepoIntent, GitUser, PollPolicy, PushAuth, RepoUrls, ScmError,
};
