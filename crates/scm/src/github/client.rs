//! GitHub REST client implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, info, warn};

use super::models::{
    Comment, CommentRequest, CreateKeyRequest, CreatePullRequest, CreateRepoRequest, PullRequest,
    Repository, SshKey, User,
};
use crate::traits::{GitHost, GitProviderKind, GitUser, PollPolicy, RepoUrls, ScmError};

/// Base URL for the GitHub API.
const API_BASE_URL: &str = "https://api.github.com";

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Connect timeout for API requests.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Token scopes the installer needs.
pub const REQUIRED_SCOPES: [&str; 8] = [
    "admin:org",
    "admin:public_key",
    "admin:repo_hook",
    "delete_repo",
    "repo",
    "user",
    "workflow",
    "write:packages",
];

/// GitHub driver.
#[derive(Clone)]
pub struct GitHub {
    client: Client,
    base_url: String,
    host: String,
    owner: String,
    token: String,
}

impl std::fmt::Debug for GitHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHub")
            .field("base_url", &self.base_url)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

impl GitHub {
    /// Create a driver acting for `owner` (an organization or the token's user).
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(owner: impl Into<String>, token: impl Into<String>) -> Result<Self, ScmError> {
        let client = Client::builder()
            .user_agent("kubefirst")
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: API_BASE_URL.to_string(),
            host: "github.com".to_string(),
            owner: owner.into(),
            token: token.into(),
        })
    }

    /// Point the client at a different API root (used by tests).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// The configured owner.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, method = %method, "GitHub request");
        self.client
            .request(method, url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ScmError> {
        let status = response.status();
        let text = response.text().await?;
        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, "Failed to parse GitHub response");
                ScmError::Serialization(e)
            })
        } else {
            Err(Self::error_for(status, text))
        }
    }

    async fn handle_empty(response: reqwest::Response) -> Result<(), ScmError> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Self::error_for(status, response.text().await?))
        }
    }

    fn error_for(status: StatusCode, text: String) -> ScmError {
        match status {
            StatusCode::UNAUTHORIZED => ScmError::Auth(text),
            _ => ScmError::Api {
                status: status.as_u16(),
                message: text,
            },
        }
    }

    /// Scopes from the `X-OAuth-Scopes` header that are missing.
    fn missing_scopes(header: &str) -> Vec<&'static str> {
        let granted: Vec<&str> = header.split(',').map(str::trim).collect();
        REQUIRED_SCOPES
            .iter()
            .copied()
            .filter(|scope| !granted.contains(scope))
            .collect()
    }

    async fn owner_is_org(&self) -> Result<bool, ScmError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/orgs/{}", self.owner))
            .send()
            .await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(Self::error_for(s, response.text().await?)),
        }
    }
}

#[async_trait]
impl GitHost for GitHub {
    fn kind(&self) -> GitProviderKind {
        GitProviderKind::Github
    }

    fn repo_urls(&self, repo: &str) -> RepoUrls {
        RepoUrls {
            https: format!("https://{}/{}/{repo}.git", self.host, self.owner),
            ssh: format!("git@{}:{}/{repo}.git", self.host, self.owner),
        }
    }

    async fn authenticate(&self) -> Result<GitUser, ScmError> {
        let response = self.request(reqwest::Method::GET, "/user").send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ScmError::Auth("GitHub rejected the token".to_string()));
        }
        let scopes = response
            .headers()
            .get("X-OAuth-Scopes")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let user: User = Self::handle_response(response).await?;

        let missing = Self::missing_scopes(&scopes);
        if !missing.is_empty() {
            return Err(ScmError::Auth(format!(
                "token for {} is missing scopes: {}",
                user.login,
                missing.join(", ")
            )));
        }

        info!(login = %user.login, "Authenticated with GitHub");
        Ok(GitUser { login: user.login })
    }

    async fn create_private_repo(
        &self,
        name: &str,
        description: &str,
    ) -> Result<RepoUrls, ScmError> {
        let path = if self.owner_is_org().await? {
            format!("/orgs/{}/repos", self.owner)
        } else {
            "/user/repos".to_string()
        };
        let body = CreateRepoRequest {
            name: name.to_string(),
            description: description.to_string(),
            private: true,
            auto_init: false,
        };

        info!(owner = %self.owner, repo = %name, "Creating GitHub repository");
        let response = self
            .request(reqwest::Method::POST, &path)
            .json(&body)
            .send()
            .await?;
        if response.status() == StatusCode::UNPROCESSABLE_ENTITY {
            let text = response.text().await?;
            if text.contains("already exists") {
                return Err(ScmError::RepoExists(format!("{}/{name}", self.owner)));
            }
            return Err(Self::error_for(StatusCode::UNPROCESSABLE_ENTITY, text));
        }
        let repo: Repository = Self::handle_response(response).await?;
        Ok(RepoUrls {
            https: repo.clone_url,
            ssh: repo.ssh_url,
        })
    }

    async fn upload_ssh_key(&self, title: &str, public_key: &str) -> Result<(), ScmError> {
        let body = CreateKeyRequest {
            title: title.to_string(),
            key: public_key.trim().to_string(),
        };
        let response = self
            .request(reqwest::Method::POST, "/user/keys")
            .json(&body)
            .send()
            .await?;
        if response.status() == StatusCode::UNPROCESSABLE_ENTITY {
            let text = response.text().await?;
            if text.contains("already in use") {
                debug!(title = %title, "SSH key already registered");
                return Ok(());
            }
            return Err(Self::error_for(StatusCode::UNPROCESSABLE_ENTITY, text));
        }
        Self::handle_empty(response).await
    }

    async fn delete_ssh_keys(&self, title: &str) -> Result<usize, ScmError> {
        let response = self.request(reqwest::Method::GET, "/user/keys").send().await?;
        let keys: Vec<SshKey> = Self::handle_response(response).await?;

        let mut removed = 0;
        for key in keys.into_iter().filter(|k| k.title == title) {
            let response = self
                .request(reqwest::Method::DELETE, &format!("/user/keys/{}", key.id))
                .send()
                .await?;
            Self::handle_empty(response).await?;
            removed += 1;
        }
        info!(title = %title, removed, "Removed GitHub SSH keys");
        Ok(removed)
    }

    async fn create_pull_request(
        &self,
        repo: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<u64, ScmError> {
        let request = CreatePullRequest {
            title: title.to_string(),
            head: head.to_string(),
            base: base.to_string(),
            body: body.to_string(),
        };
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/repos/{}/{repo}/pulls", self.owner),
            )
            .json(&request)
            .send()
            .await?;
        let pr: PullRequest = Self::handle_response(response).await?;
        Ok(pr.number)
    }

    async fn comment_on_pull_request(
        &self,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<(), ScmError> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/repos/{}/{repo}/issues/{number}/comments", self.owner),
            )
            .json(&CommentRequest {
                body: body.to_string(),
            })
            .send()
            .await?;
        Self::handle_empty(response).await
    }

    async fn poll_pull_request_comments(
        &self,
        repo: &str,
        number: u64,
        needle: &str,
        policy: PollPolicy,
    ) -> Result<(), ScmError> {
        let path = format!("/repos/{}/{repo}/issues/{number}/comments", self.owner);
        for attempt in 1..=policy.attempts {
            let response = self.request(reqwest::Method::GET, &path).send().await?;
            let comments: Vec<Comment> = Self::handle_response(response).await?;
            if comments.iter().any(|c| c.body.contains(needle)) {
                return Ok(());
            }
            debug!(repo = %repo, number, attempt, "Comment not found yet");
            tokio::time::sleep(policy.interval).await;
        }
        Err(ScmError::Timeout {
            what: format!("comment '{needle}' on {repo}#{number}"),
            attempts: policy.attempts,
        })
    }
}
