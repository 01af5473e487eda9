//! Local soft-serve driver.
//!
//! soft-serve runs inside the cluster and is reached through a port-forward
//! on `127.0.0.1:8022`. Repositories are created implicitly by the first
//! push; access is configured by editing the `config` repository.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_yaml::Value;
use tracing::{debug, info};

use crate::git;
use crate::traits::{
    GitHost, GitProviderKind, GitUser, PollPolicy, PushAuth, RepoUrls, ScmError,
};

/// Local port soft-serve is forwarded to.
pub const DEFAULT_PORT: u16 = 8022;

/// soft-serve driver.
#[derive(Debug, Clone)]
pub struct SoftServe {
    host: String,
    port: u16,
    private_key_path: PathBuf,
}

impl SoftServe {
    /// Create a driver pushing with the bot key at `private_key_path`.
    pub fn new(private_key_path: impl Into<PathBuf>) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            private_key_path: private_key_path.into(),
        }
    }

    /// Override the forwarded port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    fn auth_env(&self) -> Vec<(String, String)> {
        git::auth_env(&PushAuth::SshKey {
            private_key_path: self.private_key_path.clone(),
        })
    }

    fn unsupported(operation: &'static str) -> ScmError {
        ScmError::Unsupported {
            provider: GitProviderKind::SoftServe,
            operation,
        }
    }
}

/// Enable keyless access and register `public_key` as an admin key.
///
/// # Errors
/// Returns [`ScmError::Config`] if `config.yaml` is not valid YAML.
pub fn enable_keyless(config_yaml: &str, public_key: &str) -> Result<String, ScmError> {
    let rewritten = config_yaml.replace("allow-keyless: false", "allow-keyless: true");
    let mut doc: Value = serde_yaml::from_str(&rewritten)
        .map_err(|e| ScmError::Config(format!("invalid soft-serve config.yaml: {e}")))?;

    let key = Value::String(public_key.trim().to_string());
    if let Some(users) = doc.get_mut("users").and_then(Value::as_sequence_mut) {
        let admin = users
            .iter_mut()
            .find(|u| u.get("admin").and_then(Value::as_bool).unwrap_or(false));
        if let Some(admin) = admin {
            if let Some(mapping) = admin.as_mapping_mut() {
                let keys = mapping
                    .entry(Value::String("public-keys".to_string()))
                    .or_insert_with(|| Value::Sequence(Vec::new()));
                if let Some(keys) = keys.as_sequence_mut() {
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                }
            }
        }
    }

    serde_yaml::to_string(&doc)
        .map_err(|e| ScmError::Config(format!("cannot render soft-serve config.yaml: {e}")))
}

#[async_trait]
impl GitHost for SoftServe {
    fn kind(&self) -> GitProviderKind {
        GitProviderKind::SoftServe
    }

    fn repo_urls(&self, repo: &str) -> RepoUrls {
        let ssh = format!("ssh://{}:{}/{repo}", self.host, self.port);
        RepoUrls {
            https: ssh.clone(),
            ssh,
        }
    }

    async fn authenticate(&self) -> Result<GitUser, ScmError> {
        let cwd = std::env::temp_dir();
        let url = self.repo_urls("config").ssh;
        git::run(&cwd, &["ls-remote", &url], &self.auth_env())
            .await
            .map_err(|e| ScmError::Auth(e.to_string()))?;
        Ok(GitUser {
            login: "admin".to_string(),
        })
    }

    async fn create_private_repo(
        &self,
        name: &str,
        _description: &str,
    ) -> Result<RepoUrls, ScmError> {
        debug!(repo = %name, "soft-serve creates repositories on first push");
        Ok(self.repo_urls(name))
    }

    async fn upload_ssh_key(&self, title: &str, public_key: &str) -> Result<(), ScmError> {
        let workdir = tempfile::tempdir()?;
        let url = self.repo_urls("config").ssh;
        git::run(
            workdir.path(),
            &["clone", &url, "config"],
            &self.auth_env(),
        )
        .await?;

        let repo = workdir.path().join("config");
        let config_path = repo.join("config.yaml");
        let current = tokio::fs::read_to_string(&config_path).await?;
        let updated = enable_keyless(&current, public_key)?;
        if updated == current {
            debug!("soft-serve config already up to date");
            return Ok(());
        }
        tokio::fs::write(&config_path, updated).await?;

        git::commit_all(&repo, &format!("allow keyless access for {title}")).await?;
        git::run(&repo, &["push", "origin", "HEAD"], &self.auth_env()).await?;
        info!(title = %title, "Enabled keyless soft-serve access");
        Ok(())
    }

    async fn delete_ssh_keys(&self, _title: &str) -> Result<usize, ScmError> {
        Ok(0)
    }

    async fn create_pull_request(
        &self,
        _repo: &str,
        _head: &str,
        _base: &str,
        _title: &str,
        _body: &str,
    ) -> Result<u64, ScmError> {
        Err(Self::unsupported("pull requests"))
    }

    async fn comment_on_pull_request(
        &self,
        _repo: &str,
        _number: u64,
        _body: &str,
    ) -> Result<(), ScmError> {
        Err(Self::unsupported("pull request comments"))
    }

    async fn poll_pull_request_comments(
        &self,
        _repo: &str,
        _number: u64,
        _needle: &str,
        _policy: PollPolicy,
    ) -> Result<(), ScmError> {
        Err(Self::unsupported("pull request comments"))
    }
}
