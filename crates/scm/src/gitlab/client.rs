//! GitLab REST client implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::models::{
    CreateKeyRequest, CreateMergeRequest, CreateProjectRequest, Group, Key, MergeRequest, Note,
    NoteRequest, Project, User,
};
use crate::traits::{GitHost, GitProviderKind, GitUser, PollPolicy, RepoUrls, ScmError};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Connect timeout for API requests.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// GitLab driver.
pub struct GitLab {
    client: Client,
    host: String,
    base_url: String,
    group: String,
    token: String,
    group_id: OnceCell<u64>,
}

impl std::fmt::Debug for GitLab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitLab")
            .field("base_url", &self.base_url)
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}

impl GitLab {
    /// Create a driver for repositories under `group` on `host`.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(
        host: impl Into<String>,
        group: impl Into<String>,
        token: impl Into<String>,
    ) -> Result<Self, ScmError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;
        let host = host.into();
        Ok(Self {
            client,
            base_url: format!("https://{host}/api/v4"),
            host,
            group: group.into(),
            token: token.into(),
            group_id: OnceCell::new(),
        })
    }

    /// Point the client at a different API root (used by tests).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, method = %method, "GitLab request");
        self.client
            .request(method, url)
            .header("PRIVATE-TOKEN", &self.token)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ScmError> {
        let status = response.status();
        let text = response.text().await?;
        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, "Failed to parse GitLab response");
                ScmError::Serialization(e)
            })
        } else if status == StatusCode::UNAUTHORIZED {
            Err(ScmError::Auth(text))
        } else {
            Err(ScmError::Api {
                status: status.as_u16(),
                message: text,
            })
        }
    }

    async fn handle_empty(response: reqwest::Response) -> Result<(), ScmError> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ScmError::Api {
                status: status.as_u16(),
                message: response.text().await?,
            })
        }
    }

    /// Numeric id of the owner group, resolved once.
    ///
    /// # Errors
    /// Returns error if the group does not exist or is not visible.
    pub async fn group_id(&self) -> Result<u64, ScmError> {
        self.group_id
            .get_or_try_init(|| async {
                let path = format!("/groups/{}", urlencoding::encode(&self.group));
                let response = self.request(Method::GET, &path).send().await?;
                let group: Group = Self::handle_response(response).await?;
                debug!(group = %group.full_path, id = group.id, "Resolved GitLab group");
                Ok::<u64, ScmError>(group.id)
            })
            .await
            .copied()
    }

    fn project_path(&self, repo: &str) -> String {
        urlencoding::encode(&format!("{}/{repo}", self.group)).into_owned()
    }
}

#[async_trait]
impl GitHost for GitLab {
    fn kind(&self) -> GitProviderKind {
        GitProviderKind::Gitlab
    }

    fn repo_urls(&self, repo: &str) -> RepoUrls {
        RepoUrls {
            https: format!("https://{}/{}/{repo}.git", self.host, self.group),
            ssh: format!("git@{}:{}/{repo}.git", self.host, self.group),
        }
    }

    async fn authenticate(&self) -> Result<GitUser, ScmError> {
        let response = self.request(Method::GET, "/user").send().await?;
        let user: User = Self::handle_response(response).await?;
        info!(username = %user.username, "Authenticated with GitLab");
        Ok(GitUser {
            login: user.username,
        })
    }

    async fn create_private_repo(
        &self,
        name: &str,
        description: &str,
    ) -> Result<RepoUrls, ScmError> {
        let body = CreateProjectRequest {
            name: name.to_string(),
            path: name.to_string(),
            namespace_id: self.group_id().await?,
            description: description.to_string(),
            visibility: "private".to_string(),
        };
        info!(group = %self.group, repo = %name, "Creating GitLab project");
        let response = self
            .request(Method::POST, "/projects")
            .json(&body)
            .send()
            .await?;
        if response.status() == StatusCode::BAD_REQUEST {
            let text = response.text().await?;
            if text.contains("has already been taken") {
                return Err(ScmError::RepoExists(format!("{}/{name}", self.group)));
            }
            return Err(ScmError::Api {
                status: StatusCode::BAD_REQUEST.as_u16(),
                message: text,
            });
        }
        let project: Project = Self::handle_response(response).await?;
        debug!(id = project.id, "Created GitLab project");
        Ok(RepoUrls {
            https: project.http_url_to_repo,
            ssh: project.ssh_url_to_repo,
        })
    }

    async fn upload_ssh_key(&self, title: &str, public_key: &str) -> Result<(), ScmError> {
        let response = self
            .request(Method::POST, "/user/keys")
            .json(&CreateKeyRequest {
                title: title.to_string(),
                key: public_key.trim().to_string(),
            })
            .send()
            .await?;
        if response.status() == StatusCode::BAD_REQUEST {
            let text = response.text().await?;
            if text.contains("has already been taken") {
                debug!(title = %title, "SSH key already registered");
                return Ok(());
            }
            return Err(ScmError::Api {
                status: StatusCode::BAD_REQUEST.as_u16(),
                message: text,
            });
        }
        Self::handle_empty(response).await
    }

    async fn delete_ssh_keys(&self, title: &str) -> Result<usize, ScmError> {
        let response = self.request(Method::GET, "/user/keys").send().await?;
        let keys: Vec<Key> = Self::handle_response(response).await?;
        let mut removed = 0;
        for key in keys.into_iter().filter(|k| k.title == title) {
            let response = self
                .request(Method::DELETE, &format!("/user/keys/{}", key.id))
                .send()
                .await?;
            Self::handle_empty(response).await?;
            removed += 1;
        }
        info!(title = %title, removed, "Removed GitLab SSH keys");
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
        let path = format!("/projects/{}/merge_requests", self.project_path(repo));
        let response = self
            .request(Method::POST, &path)
            .json(&CreateMergeRequest {
                source_branch: head.to_string(),
                target_branch: base.to_string(),
                title: title.to_string(),
                description: body.to_string(),
            })
            .send()
            .await?;
        let mr: MergeRequest = Self::handle_response(response).await?;
        Ok(mr.iid)
    }

    async fn comment_on_pull_request(
        &self,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<(), ScmError> {
        let path = format!(
            "/projects/{}/merge_requests/{number}/notes",
            self.project_path(repo)
        );
        let response = self
            .request(Method::POST, &path)
            .json(&NoteRequest {
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
        let path = format!(
            "/projects/{}/merge_requests/{number}/notes",
            self.project_path(repo)
        );
        for attempt in 1..=policy.attempts {
            let response = self.request(Method::GET, &path).send().await?;
            let notes: Vec<Note> = Self::handle_response(response).await?;
            if notes.iter().any(|n| n.body.contains(needle)) {
                return Ok(());
            }
            debug!(repo = %repo, number, attempt, "Note not found yet");
            tokio::time::sleep(policy.interval).await;
        }
        Err(ScmError::Timeout {
            what: format!("note '{needle}' on {repo}!{number}"),
            attempts: policy.attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_path_is_url_encoded() {
        let gl = GitLab::new("gitlab.com", "acme/platform", "t").unwrap();
        assert_eq!(gl.project_path("gitops"), "acme%2Fplatform%2Fgitops");
    }

    #[test]
    fn test_repo_urls() {
        let gl = GitLab::new("gitlab.com", "acme", "t").unwrap();
        let urls = gl.repo_urls("metaphor");
        assert_eq!(urls.https, "https://gitlab.com/acme/metaphor.git");
        assert_eq!(urls.ssh, "git@gitlab.com:acme/metaphor.git");
    }
}
