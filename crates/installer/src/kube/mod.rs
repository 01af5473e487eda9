//! Kubernetes access for the installer.
//!
//! - [`KubeClients`] - lazily built clients, cached per kubeconfig path
//! - [`portforward`] - supervised `pod|service -> localhost` tunnels
//! - [`readiness`] - waits for namespaces, pods, workloads and jobs
//! - [`apply`] - server-side apply of multi-document manifests
//! - [`pod_exec`] - commands inside running pods
//! - [`secrets`] - reading and writing Secrets

pub mod apply;
pub mod pod_exec;
pub mod portforward;
pub mod readiness;
pub mod secrets;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// Field manager for every server-side apply.
pub const FIELD_MANAGER: &str = "kubefirst";

/// Errors raised by Kubernetes helpers.
#[derive(Error, Debug)]
pub enum KubeError {
    /// The kubeconfig cannot be loaded.
    #[error("kubeconfig {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    /// A manifest cannot be parsed or mapped to an API resource.
    #[error("invalid manifest: {0}")]
    Manifest(String),

    /// A command run inside a pod failed.
    #[error("command in {namespace}/{pod} failed: {message}")]
    Exec {
        namespace: String,
        pod: String,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// ArgoCD `Application` custom resource.
#[must_use]
pub fn application_resource() -> ApiResource {
    ApiResource {
        group: "argoproj.io".to_string(),
        version: "v1alpha1".to_string(),
        api_version: "argoproj.io/v1alpha1".to_string(),
        kind: "Application".to_string(),
        plural: "applications".to_string(),
    }
}

/// Clients keyed by kubeconfig path, built on first use.
#[derive(Clone, Default)]
pub struct KubeClients {
    cache: Arc<Mutex<HashMap<PathBuf, Client>>>,
}

impl KubeClients {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Client for the cluster in `kubeconfig`.
    ///
    /// # Errors
    /// Returns [`KubeError::Config`] if the file cannot be read or the client
    /// cannot be created.
    pub async fn get(&self, kubeconfig: &Path) -> Result<Client, KubeError> {
        let mut cache = self.cache.lock().await;
        if let Some(client) = cache.get(kubeconfig) {
            return Ok(client.clone());
        }

        let config_err = |reason: String| KubeError::Config {
            path: kubeconfig.to_path_buf(),
            reason,
        };
        let parsed = Kubeconfig::read_from(kubeconfig).map_err(|e| config_err(e.to_string()))?;
        let config = Config::from_custom_kubeconfig(parsed, &KubeConfigOptions::default())
            .await
            .map_err(|e| config_err(e.to_string()))?;
        let client = Client::try_from(config).map_err(|e| config_err(e.to_string()))?;

        debug!(kubeconfig = %kubeconfig.display(), "Created Kubernetes client");
        cache.insert(kubeconfig.to_path_buf(), client.clone());
        Ok(client)
    }
}
