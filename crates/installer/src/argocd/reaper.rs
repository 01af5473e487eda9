//! Application removal ahead of teardown.
//!
//! Two paths exist. The HTTP path deletes through the ArgoCD API without
//! cascading and needs a live tunnel. The native path talks to the cluster
//! directly: it strips the sync policy and the resources finalizer so ArgoCD
//! neither reconciles nor prunes, deletes the `Application` with orphan
//! propagation, then polls until the object is gone.

use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info};

use super::client::ArgoCdClient;
use super::models::Application;
use super::ArgoCdError;
use crate::kube::application_resource;

/// Namespace ArgoCD applications live in.
pub const ARGOCD_NAMESPACE: &str = "argocd";

/// Finalizer that makes ArgoCD cascade-delete an application's resources.
pub const RESOURCES_FINALIZER: &str = "resources-finalizer.argocd.argoproj.io";

/// Removes one ArgoCD application.
#[async_trait]
pub trait ApplicationReaper: Send + Sync {
    fn name(&self) -> &'static str;

    async fn remove(&self, app: &str) -> Result<(), ArgoCdError>;
}

/// Deletes through the ArgoCD API.
pub struct HttpReaper {
    client: ArgoCdClient,
}

impl HttpReaper {
    #[must_use]
    pub fn new(client: ArgoCdClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ApplicationReaper for HttpReaper {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn remove(&self, app: &str) -> Result<(), ArgoCdError> {
        self.client.delete_no_cascade(app).await
    }
}

/// Deletes through the Kubernetes API.
pub struct NativeReaper {
    client: Client,
    namespace: String,
    timeout: Duration,
    interval: Duration,
}

impl NativeReaper {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            namespace: ARGOCD_NAMESPACE.to_string(),
            timeout: Duration::from_secs(120),
            interval: Duration::from_secs(5),
        }
    }

    #[must_use]
    pub fn with_polling(mut self, timeout: Duration, interval: Duration) -> Self {
        self.timeout = timeout;
        self.interval = interval;
        self
    }
}

/// Merge patch that stops reconciliation and cascading deletion.
fn detach_patch(object: &DynamicObject) -> serde_json::Value {
    let finalizers: Vec<&str> = object
        .metadata
        .finalizers
        .iter()
        .flatten()
        .map(String::as_str)
        .filter(|f| *f != RESOURCES_FINALIZER)
        .collect();
    json!({
        "metadata": { "finalizers": finalizers },
        "spec": { "syncPolicy": null }
    })
}

#[async_trait]
impl ApplicationReaper for NativeReaper {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn remove(&self, app: &str) -> Result<(), ArgoCdError> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &self.namespace, &application_resource());

        let Some(current) = api.get_opt(app).await? else {
            debug!(app = %app, "Application already gone");
            return Ok(());
        };

        let patch = detach_patch(&current);
        api.patch(app, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(app = %app, "Removed sync policy and resources finalizer");

        api.delete(app, &DeleteParams::orphan()).await?;

        let started = Instant::now();
        loop {
            let Some(object) = api.get_opt(app).await? else {
                break;
            };
            let drained = serde_json::from_value::<Application>(serde_json::to_value(&object)?)
                .is_ok_and(|a| a.is_drained());
            if drained {
                break;
            }
            if started.elapsed() >= self.timeout {
                return Err(ArgoCdError::RemovalTimeout {
                    app: app.to_string(),
                    elapsed: started.elapsed(),
                });
            }
            tokio::time::sleep(self.interval).await;
        }

        info!(app = %app, "Removed ArgoCD application");
        Ok(())
    }
}

/// Prefer the HTTP path whenever the ArgoCD tunnel is live.
#[must_use]
pub fn select_reaper(
    tunnel_live: bool,
    http: Option<HttpReaper>,
    native: NativeReaper,
) -> Box<dyn ApplicationReaper> {
    match http {
        Some(http) if tunnel_live => Box::new(http),
        _ => Box::new(native),
    }
}
