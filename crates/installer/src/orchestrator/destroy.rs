//! Destroy step implementations.
//!
//! Teardown runs in reverse dependency order. Steps whose install
//! counterpart never completed are no-ops, so destroying a half-built
//! installation only removes what exists.

use std::time::Duration;

use async_trait::async_trait;
use k1_cloud::CloudProviderError;
use tokio::time::Instant;
use tracing::{info, warn};

use super::pipeline::StepExecutor;
use super::plan::StepId;
use super::session::{Session, ARGOCD_LOCAL_PORT, VAULT_LOCAL_PORT};
use crate::argocd::{select_reaper, HttpReaper, NativeReaper, REGISTRY_APP};
use crate::error::InstallError;
use crate::exec::{Executor, Invocation};
use crate::kube::portforward::TunnelTarget;
use crate::ssh::BOT_KEY_TITLE;
use crate::store::ConfigStore;
use crate::terraform::{checkpoint_key, TerraformAction};
use crate::tools::Tool;
use crate::ui;

const LOAD_BALANCER_POLL: Duration = Duration::from_secs(10);

/// Executes destroy steps.
pub struct DestroyExecutor {
    session: Session,
}

impl DestroyExecutor {
    #[must_use]
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    /// Release tunnels opened during the run.
    pub async fn shutdown(&mut self) {
        self.session.shutdown().await;
    }

    fn applied(store: &ConfigStore, entrypoint: &str) -> bool {
        store.checkpoint(&checkpoint_key(entrypoint, TerraformAction::Apply))
    }

    async fn argocd_tunnel(&mut self) {
        if !self.session.paths.kubeconfig().exists() {
            return;
        }
        let opened = self
            .session
            .open_tunnel(
                TunnelTarget::service("argocd", "argocd-server"),
                ARGOCD_LOCAL_PORT,
                80,
            )
            .await;
        if let Err(e) = opened {
            warn!(error = %e, "ArgoCD tunnel unavailable, falling back to the Kubernetes API");
        }
    }

    async fn remove_registry(&mut self, store: &mut ConfigStore) -> Result<(), InstallError> {
        if !self.session.paths.kubeconfig().exists() {
            warn!("No kubeconfig on disk, skipping registry removal");
            return Ok(());
        }
        let tunnel_live = self.session.tunnel_live(ARGOCD_LOCAL_PORT);
        let http = if tunnel_live {
            match self.session.argocd(store).await {
                Ok(client) => Some(HttpReaper::new(client)),
                Err(e) => {
                    warn!(error = %e, "ArgoCD login failed, falling back to the Kubernetes API");
                    None
                }
            }
        } else {
            None
        };
        let native = NativeReaper::new(self.session.client().await?);
        let reaper = select_reaper(tunnel_live, http, native);
        info!(via = reaper.name(), "Removing registry application");
        reaper.remove(REGISTRY_APP).await?;
        Ok(())
    }

    async fn drain_load_balancers(&self) -> Result<(), InstallError> {
        let cloud = &self.session.deps.cloud;
        let cluster = &self.session.state.cluster_name;
        let grace = cloud.load_balancer_grace();
        let deadline = Instant::now() + grace;
        let spinner = ui::spinner("Waiting for load balancers to drain");

        let remaining = loop {
            let remaining = cloud.load_balancers(cluster).await?;
            if remaining.is_empty() || Instant::now() >= deadline {
                break remaining;
            }
            tokio::time::sleep(LOAD_BALANCER_POLL).await;
        };
        spinner.finish_and_clear();

        if !remaining.is_empty() {
            warn!(
                load_balancers = ?remaining,
                grace_secs = grace.as_secs(),
                "Load balancers still present, continuing"
            );
            ui::print_warning(&format!(
                "{} load balancer(s) remain after {}s: {}",
                remaining.len(),
                grace.as_secs(),
                remaining.join(", ")
            ));
        }
        Ok(())
    }

    async fn vault_tunnel(&mut self, store: &ConfigStore) -> Result<(), InstallError> {
        if !Self::applied(store, "vault") && !Self::applied(store, "users") {
            return Ok(());
        }
        self.session
            .open_tunnel(
                TunnelTarget::pod("vault", "vault-0"),
                VAULT_LOCAL_PORT,
                8200,
            )
            .await
    }

    async fn destroy(&self, store: &ConfigStore, entrypoint: &str) -> Result<(), InstallError> {
        if !Self::applied(store, entrypoint) {
            info!(entrypoint = %entrypoint, "Never applied, nothing to destroy");
            return Ok(());
        }
        self.session
            .terraform(store, entrypoint, TerraformAction::Destroy)
            .await
    }

    async fn delete_local_cluster(&self) -> Result<(), InstallError> {
        let k3d = self.session.tools.get(Tool::K3d);
        let name = self.session.state.cluster_name.as_str();
        let delete = Invocation::new(k3d)
            .args(["cluster", "delete", name])
            .timeout(Duration::from_secs(300));
        Executor.run_streaming(&delete).await?;
        let kubeconfig = self.session.paths.kubeconfig();
        if kubeconfig.exists() {
            std::fs::remove_file(kubeconfig)?;
        }
        Ok(())
    }

    async fn delete_bot_key(&self) -> Result<(), InstallError> {
        let removed = self.session.deps.git.delete_ssh_keys(BOT_KEY_TITLE).await?;
        info!(removed, title = BOT_KEY_TITLE, "Deleted bot SSH keys");
        Ok(())
    }

    async fn delete_buckets(&self) -> Result<(), InstallError> {
        for bucket in [
            self.session.state.state_store_bucket(),
            self.session.state.artifacts_bucket(),
        ] {
            match self.session.deps.cloud.delete_bucket(&bucket).await {
                Ok(()) => info!(bucket = %bucket, "Deleted bucket"),
                Err(CloudProviderError::NotFound(_)) => {
                    info!(bucket = %bucket, "Bucket already gone");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StepExecutor for DestroyExecutor {
    async fn execute(&mut self, step: StepId, store: &mut ConfigStore) -> Result<(), InstallError> {
        match step {
            StepId::Validate => Ok(()),
            StepId::ArgoCdTunnel => {
                self.argocd_tunnel().await;
                Ok(())
            }
            StepId::RemoveRegistry => self.remove_registry(store).await,
            StepId::DrainLoadBalancers => self.drain_load_balancers().await,
            StepId::VaultTunnel => self.vault_tunnel(store).await,
            StepId::DestroyUsers => self.destroy(store, "users").await,
            StepId::DestroyVault => self.destroy(store, "vault").await,
            StepId::DestroyBase => self.destroy(store, "base").await,
            StepId::DeleteLocalCluster => self.delete_local_cluster().await,
            StepId::DeleteBotKey => self.delete_bot_key().await,
            StepId::DeleteBuckets => self.delete_buckets().await,
            StepId::DeleteLivenessRecord => {
                let domain = self.session.state.domain.clone();
                Ok(self.session.prober().delete_record(&domain).await?)
            }
            other => Err(InstallError::step(
                other.to_string(),
                "not part of the destroy pipeline",
            )),
        }
    }
}
