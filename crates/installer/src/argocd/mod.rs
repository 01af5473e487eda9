//! ArgoCD integration: session, sync with retry, and application removal.

pub mod client;
pub mod models;
pub mod reaper;

use std::time::Duration;

use thiserror::Error;

pub use client::{ArgoCdClient, SyncOutcome, LOCAL_BASE_URL};
pub use reaper::{select_reaper, ApplicationReaper, HttpReaper, NativeReaper};

/// Application that bootstraps every other app.
pub const REGISTRY_APP: &str = "registry";

#[derive(Error, Debug)]
pub enum ArgoCdError {
    #[error("ArgoCD API error {status}: {message}")]
    Api { status: u16, message: String },

    /// `last_status` is 0 when the last attempt never got a response.
    #[error("sync of '{app}' failed (last status {last_status}): {message}")]
    SyncFailed {
        app: String,
        last_status: u16,
        message: String,
    },

    #[error("application '{app}' still present after {}s", elapsed.as_secs())]
    RemovalTimeout { app: String, elapsed: Duration },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ArgoCdError {
    /// Transport failures, 5xx responses and stalled syncs may clear up.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::SyncFailed { last_status, .. } => *last_status == 0 || *last_status >= 500,
            Self::Api { status, .. } => *status >= 500,
            Self::Http(_) => true,
            _ => false,
        }
    }
}
