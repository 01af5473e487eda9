//! Git host trait and common types.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by git host drivers.
#[derive(Error, Debug)]
pub enum ScmError {
    /// Credentials are missing, invalid or under-scoped.
    #[error("git host authentication failed: {0}")]
    Auth(String),

    /// The repository already exists on the host.
    #[error("repository {0} already exists")]
    RepoExists(String),

    /// `git push` (or another git command) failed.
    #[error("git {command} failed for {target}: {stderr}")]
    Push {
        command: String,
        target: String,
        stderr: String,
    },

    /// A bounded poll ran out of attempts.
    #[error("timed out waiting for {what} after {attempts} attempts")]
    Timeout { what: String, attempts: u32 },

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Local I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The driver does not implement this capability.
    #[error("{provider} does not support {operation}")]
    Unsupported {
        provider: GitProviderKind,
        operation: &'static str,
    },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Supported git hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GitProviderKind {
    Github,
    Gitlab,
    SoftServe,
}

impl GitProviderKind {
    /// The tag used in config keys, template drivers and checkpoints.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Gitlab => "gitlab",
            Self::SoftServe => "soft-serve",
        }
    }
}

impl fmt::Display for GitProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GitProviderKind {
    type Err = ScmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "github" => Ok(Self::Github),
            "gitlab" => Ok(Self::Gitlab),
            "soft-serve" | "softserve" | "local" => Ok(Self::SoftServe),
            other => Err(ScmError::Config(format!(
                "unsupported git provider '{other}' (expected one of github, gitlab, soft-serve)"
            ))),
        }
    }
}

/// The identity behind the configured credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitUser {
    /// Login / username.
    pub login: String,
}

/// Clone URLs of a hosted repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoUrls {
    /// HTTPS clone URL.
    pub https: String,
    /// SSH clone URL.
    pub ssh: String,
}

/// How `git push` authenticates.
#[derive(Clone)]
pub enum PushAuth {
    /// HTTPS with a personal access token.
    Token { username: String, token: String },
    /// SSH with a private key file.
    SshKey { private_key_path: PathBuf },
}

impl fmt::Debug for PushAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Token { username, .. } => f
                .debug_struct("Token")
                .field("username", username)
                .field("token", &"<redacted>")
                .finish(),
            Self::SshKey { private_key_path } => f
                .debug_struct("SshKey")
                .field("private_key_path", private_key_path)
                .finish(),
        }
    }
}

/// A local repository ready to be pushed to its destination.
#[derive(Debug, Clone)]
pub struct GitRepoIntent {
    /// Working tree on disk.
    pub local_path: PathBuf,
    /// Remote name registered in the working tree.
    pub remote_name: String,
    /// Destination URL.
    pub remote_url: String,
    /// Branch to push.
    pub branch: String,
    /// Message of the single seed commit.
    pub initial_commit_message: String,
    /// Push credentials.
    pub auth: PushAuth,
}

/// Polling bounds for pull request comment checks.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    /// Maximum number of checks.
    pub attempts: u32,
    /// Delay between checks.
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            attempts: 30,
            interval: Duration::from_secs(10),
        }
    }
}

/// Git host capabilities the installer relies on.
#[async_trait]
pub trait GitHost: Send + Sync {
    /// Which host this driver talks to.
    fn kind(&self) -> GitProviderKind;

    /// Clone URLs for `repo` under the configured owner.
    fn repo_urls(&self, repo: &str) -> RepoUrls;

    /// Verify the credentials and return the authenticated user.
    async fn authenticate(&self) -> Result<GitUser, ScmError>;

    /// Create a private repository under the configured owner.
    ///
    /// Fails with [`ScmError::RepoExists`] if it already exists.
    async fn create_private_repo(&self, name: &str, description: &str)
        -> Result<RepoUrls, ScmError>;

    /// Push the seeded working tree.
    async fn push_initial_content(&self, intent: &GitRepoIntent) -> Result<(), ScmError> {
        crate::git::push(intent).await
    }

    /// Register the automation bot's public key.
    async fn upload_ssh_key(&self, title: &str, public_key: &str) -> Result<(), ScmError>;

    /// Remove every SSH key carrying `title`, returning how many were removed.
    async fn delete_ssh_keys(&self, title: &str) -> Result<usize, ScmError>;

    /// Open a pull (merge) request and return its number.
    async fn create_pull_request(
        &self,
        repo: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<u64, ScmError>;

    /// Post a comment on a pull request.
    async fn comment_on_pull_request(
        &self,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<(), ScmError>;

    /// Wait until a comment containing `needle` appears on a pull request.
    ///
    /// Fails with [`ScmError::Timeout`] once `policy.attempts` are spent.
    async fn poll_pull_request_comments(
        &self,
        repo: &str,
        number: u64,
        needle: &str,
        policy: PollPolicy,
    ) -> Result<(), ScmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_parse() {
        assert_eq!("GitHub".parse::<GitProviderKind>().unwrap(), GitProviderKind::Github);
        assert_eq!(
            "soft-serve".parse::<GitProviderKind>().unwrap(),
            GitProviderKind::SoftServe
        );
        assert!("bitbucket".parse::<GitProviderKind>().is_err());
    }

    #[test]
    fn test_push_auth_debug_redacts_token() {
        let auth = PushAuth::Token {
            username: "kbot".into(),
            token: "ghp_secret".into(),
        };
        let rendered = format!("{auth:?}");
        assert!(rendered.contains("kbot"));
        assert!(!rendered.contains("ghp_secret"));
    }
}
