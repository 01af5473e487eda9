//! GitLab API request and response models.

use serde::{Deserialize, Serialize};

/// `GET /user` response.
#[derive(Debug, Clone, Deserialize)]
pub struct User {
    /// Username.
    pub username: String,
}

/// A group (namespace).
#[derive(Debug, Clone, Deserialize)]
pub struct Group {
    /// Numeric id.
    pub id: u64,
    /// Full path, e.g. `my-org/platform`.
    pub full_path: String,
}

/// `POST /projects` body.
#[derive(Debug, Clone, Serialize)]
pub struct CreateProjectRequest {
    /// Project name.
    pub name: String,
    /// URL path.
    pub path: String,
    /// Owning group id.
    pub namespace_id: u64,
    /// Project description.
    pub description: String,
    /// Always `private`.
    pub visibility: String,
}

/// A project.
#[derive(Debug, Clone, Deserialize)]
pub struct Project {
    /// Numeric id.
    pub id: u64,
    /// HTTPS clone URL.
    pub http_url_to_repo: String,
    /// SSH clone URL.
    pub ssh_url_to_repo: String,
}

/// `POST /user/keys` body.
#[derive(Debug, Clone, Serialize)]
pub struct CreateKeyRequest {
    /// Key title.
    pub title: String,
    /// OpenSSH public key.
    pub key: String,
}

/// A registered SSH key.
#[derive(Debug, Clone, Deserialize)]
pub struct Key {
    /// Key id.
    pub id: u64,
    /// Key title.
    #[serde(default)]
    pub title: String,
}

/// `POST /projects/{id}/merge_requests` body.
#[derive(Debug, Clone, Serialize)]
pub struct CreateMergeRequest {
    /// Source branch.
    pub source_branch: String,
    /// Target branch.
    pub target_branch: String,
    /// Title.
    pub title: String,
    /// Description.
    pub description: String,
}

/// A merge request.
#[derive(Debug, Clone, Deserialize)]
pub struct MergeRequest {
    /// Project-scoped id.
    pub iid: u64,
}

/// Body for notes.
#[derive(Debug, Clone, Serialize)]
pub struct NoteRequest {
    /// Markdown body.
    pub body: String,
}

/// A merge request note.
#[derive(Debug, Clone, Deserialize)]
pub struct Note {
    /// Markdown body.
    #[serde(default)]
    pub body: String,
}
