//! ArgoCD API payloads.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct SessionRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionResponse {
    pub token: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncRequest {
    pub prune: bool,
}

/// The subset of an `Application` the installer reads.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Application {
    pub metadata: ApplicationMetadata,
    pub status: ApplicationStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ApplicationMetadata {
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ApplicationStatus {
    pub sync: SyncStatus,
    pub health: HealthStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SyncStatus {
    pub status: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HealthStatus {
    pub status: String,
}

impl Application {
    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.status.sync.status == "Synced"
    }

    /// Health reports the resources are gone.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        matches!(self.status.health.status.as_str(), "Unknown" | "Missing")
    }
}
