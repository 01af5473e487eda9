//! GitHub API request and response models.

use serde::{Deserialize, Serialize};

/// `GET /user` response.
#[derive(Debug, Clone, Deserialize)]
pub struct User {
    /// Login.
    pub login: String,
}

/// `POST /orgs/{org}/repos` and `POST /user/repos` body.
#[derive(Debug, Clone, Serialize)]
pub struct CreateRepoRequest {
    /// Repository name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Always true for installer-managed repositories.
    pub private: bool,
    /// Do not seed a README; content is pushed afterwards.
    pub auto_init: bool,
}

/// A repository.
#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    /// HTTPS clone URL.
    pub clone_url: String,
    /// SSH clone URL.
    pub ssh_url: String,
}

/// `POST /user/keys` body.
#[derive(Debug, Clone, Serialize)]
pub struct CreateKeyRequest {
    /// Key title.
    pub title: String,
    /// OpenSSH public key.
    pub key: String,
}

/// An SSH key registered on the account.
#[derive(Debug, Clone, Deserialize)]
pub struct SshKey {
    /// Key id.
    pub id: u64,
    /// Key title.
    #[serde(default)]
    pub title: String,
}

/// `POST /repos/{owner}/{repo}/pulls` body.
#[derive(Debug, Clone, Serialize)]
pub struct CreatePullRequest {
    /// Title.
    pub title: String,
    /// Source branch.
    pub head: String,
    /// Target branch.
    pub base: String,
    /// Description.
    pub body: String,
}

/// A pull request.
#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    /// Pull request number.
    pub number: u64,
}

/// Body for issue comments.
#[derive(Debug, Clone, Serialize)]
pub struct CommentRequest {
    /// Markdown body.
    pub body: String,
}

/// An issue comment.
#[derive(Debug, Clone, Deserialize)]
pub struct Comment {
    /// Markdown body.
    #[serde(default)]
    pub body: String,
}

/// `POST /login/device/code` response.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCodeResponse {
    /// Code exchanged for the token.
    pub device_code: String,
    /// Code the operator types in the browser.
    pub user_code: String,
    /// Where the operator types it.
    pub verification_uri: String,
    /// Lifetime of the device code.
    pub expires_in: u64,
    /// Minimum polling interval in seconds.
    pub interval: u64,
}

/// `POST /login/oauth/access_token` response.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessTokenResponse {
    /// Issued token, once the operator approved.
    #[serde(default)]
    pub access_token: Option<String>,
    /// `authorization_pending`, `slow_down`, `expired_token`, `access_denied`.
    #[serde(default)]
    pub error: Option<String>,
    /// Updated interval on `slow_down`.
    #[serde(default)]
    pub interval: Option<u64>,
}
