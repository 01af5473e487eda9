//! Vault bootstrap: health-driven init, unseal and HA raft join.

pub mod client;
pub mod initializer;
pub mod models;

use std::time::Duration;

use k1_cloud::CloudKind;
use thiserror::Error;

pub use client::{Health, VaultClient, LOCAL_BASE_URL};
pub use initializer::{KubeUnsealSecretStore, UnsealMaterial, UnsealSecretStore, VaultInitializer};

use crate::kube::KubeError;

#[derive(Error, Debug)]
pub enum VaultError {
    /// Unrecoverable initialization state.
    #[error("Vault initialization failed: {0}")]
    Init(String),

    /// Vault answered a `sys` call with a non-success status.
    #[error("{op} returned {status}: {body}")]
    Rejected {
        op: &'static str,
        status: u16,
        body: String,
    },

    #[error("Vault not ready after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Kube(#[from] KubeError),
}

impl VaultError {
    /// Transport failures and 5xx answers; Vault restarting or the tunnel
    /// reconnecting look like this.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            Self::Rejected { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Cluster topology Vault runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultMode {
    SingleNode,
    HaRaft { replicas: u32, autounseal: bool },
}

impl VaultMode {
    /// k3d runs one node; AWS unseals through KMS.
    #[must_use]
    pub fn for_cloud(cloud: CloudKind) -> Self {
        match cloud {
            CloudKind::K3d => Self::SingleNode,
            CloudKind::Aws => Self::HaRaft {
                replicas: 3,
                autounseal: true,
            },
            _ => Self::HaRaft {
                replicas: 3,
                autounseal: false,
            },
        }
    }

    #[must_use]
    pub fn autounseal(self) -> bool {
        matches!(self, Self::HaRaft { autounseal: true, .. })
    }
}
