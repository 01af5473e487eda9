//! Per-run context shared by the install and destroy executors.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use k1_cloud::CloudProvider;
use k1_scm::{GitHost, GitProviderKind, GitRepoIntent, PushAuth};
use kube::Client;
use tracing::{debug, info};

use crate::argocd::{ArgoCdClient, LOCAL_BASE_URL};
use crate::dns::{LivenessProber, TxtResolver};
use crate::error::InstallError;
use crate::kube::portforward::{KubeForwarder, PortForwardSupervisor, TunnelSpec, TunnelTarget};
use crate::kube::KubeClients;
use crate::state::{keys, InstallationState, K1Paths};
use crate::store::ConfigStore;
use crate::terraform::{TerraformAction, TerraformRun, TerraformRunner};
use crate::tools::{Tool, ToolPaths, ToolVersions};

pub const ARGOCD_LOCAL_PORT: u16 = 8080;
pub const VAULT_LOCAL_PORT: u16 = 8200;
pub const SOFT_SERVE_LOCAL_PORT: u16 = 8022;

/// ArgoCD user the installer logs in as.
pub const ARGOCD_ADMIN_USER: &str = "admin";

/// External systems an installation talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub cloud: Arc<dyn CloudProvider>,
    pub git: Arc<dyn GitHost>,
    pub resolver: Arc<dyn TxtResolver>,
    pub kube: KubeClients,
}

/// Everything a step needs besides the store.
pub struct Session {
    pub state: InstallationState,
    pub paths: K1Paths,
    pub tools: ToolPaths,
    pub tool_versions: ToolVersions,
    pub deps: Collaborators,
    supervisor: Option<PortForwardSupervisor>,
    argocd: Option<ArgoCdClient>,
}

impl Session {
    pub fn new(state: InstallationState, paths: K1Paths, deps: Collaborators) -> Self {
        let tools = ToolPaths::new(paths.tools());
        Self {
            state,
            paths,
            tools,
            tool_versions: ToolVersions::default(),
            deps,
            supervisor: None,
            argocd: None,
        }
    }

    /// Client for the management cluster.
    ///
    /// # Errors
    /// Returns error if the kubeconfig is missing or invalid.
    pub async fn client(&self) -> Result<Client, InstallError> {
        Ok(self.deps.kube.get(&self.paths.kubeconfig()).await?)
    }

    #[must_use]
    pub fn prober(&self) -> LivenessProber {
        LivenessProber::new(
            Arc::clone(&self.deps.cloud),
            Arc::clone(&self.deps.resolver),
            self.state.dry_run,
        )
    }

    // ========================================================================
    // Tunnels
    // ========================================================================

    /// Open a tunnel unless one is already live on the local port.
    ///
    /// # Errors
    /// Returns [`InstallError::Tunnel`] if the port is busy or the tunnel
    /// never becomes ready.
    pub async fn open_tunnel(
        &mut self,
        target: TunnelTarget,
        local_port: u16,
        remote_port: u16,
    ) -> Result<(), InstallError> {
        if self.tunnel_live(local_port) {
            debug!(port = local_port, "Tunnel already live");
            return Ok(());
        }
        if self.supervisor.is_none() {
            let forwarder = KubeForwarder::new(self.client().await?);
            self.supervisor = Some(PortForwardSupervisor::new(Arc::new(forwarder)));
        }
        if let Some(supervisor) = self.supervisor.as_mut() {
            supervisor
                .open_ready(TunnelSpec::new(target.clone(), local_port, remote_port))
                .await?;
        }
        info!(target = %target, port = local_port, "Tunnel open");
        Ok(())
    }

    #[must_use]
    pub fn tunnel_live(&self, port: u16) -> bool {
        self.supervisor.as_ref().is_some_and(|s| s.is_live(port))
    }

    /// Stop every tunnel and release the local ports.
    pub async fn shutdown(&mut self) {
        if let Some(supervisor) = self.supervisor.as_mut() {
            supervisor.stop_all().await;
        }
        self.supervisor = None;
    }

    // ========================================================================
    // ArgoCD
    // ========================================================================

    /// Authenticated ArgoCD client through the local tunnel.
    ///
    /// Logs in with the stored admin password when there is one, otherwise
    /// uses the cached token.
    ///
    /// # Errors
    /// Returns error if neither credential is stored or login fails.
    pub async fn argocd(&mut self, store: &mut ConfigStore) -> Result<ArgoCdClient, InstallError> {
        if let Some(client) = &self.argocd {
            return Ok(client.clone());
        }
        let mut client = ArgoCdClient::new(LOCAL_BASE_URL)?;
        if let Some(password) = store.get_string(keys::ARGOCD_PASSWORD) {
            let token = client.login(ARGOCD_ADMIN_USER, &password).await?;
            store.set(keys::ARGOCD_TOKEN, token);
        } else {
            client = client.with_token(store.require_string(keys::ARGOCD_TOKEN)?);
        }
        self.argocd = Some(client.clone());
        Ok(client)
    }

    // ========================================================================
    // Git
    // ========================================================================

    /// URL the working trees are pushed to.
    #[must_use]
    pub fn push_url(&self, repo: &str) -> String {
        let urls = self.deps.git.repo_urls(repo);
        match self.state.git {
            GitProviderKind::SoftServe => urls.ssh,
            _ => urls.https,
        }
    }

    /// Push credentials for the configured host.
    ///
    /// # Errors
    /// Returns [`InstallError::Config`] if the token or key is missing.
    pub fn push_auth(&self, store: &ConfigStore) -> Result<PushAuth, InstallError> {
        match self.state.git {
            GitProviderKind::SoftServe => {
                self.ensure_bot_key_file(store)?;
                Ok(PushAuth::SshKey {
                    private_key_path: self.paths.bot_private_key(),
                })
            }
            _ => Ok(PushAuth::Token {
                username: self
                    .state
                    .git_user
                    .clone()
                    .unwrap_or_else(|| self.state.git_owner.clone()),
                token: store.require_string(keys::GIT_TOKEN)?,
            }),
        }
    }

    #[must_use]
    pub fn repo_intent(&self, repo: &str, auth: PushAuth) -> GitRepoIntent {
        GitRepoIntent {
            local_path: self.paths.root().join(repo),
            remote_name: "origin".to_string(),
            remote_url: self.push_url(repo),
            branch: "main".to_string(),
            initial_commit_message: format!("initial {repo} commit"),
            auth,
        }
    }

    /// Write the stored bot key to disk if a previous run's file is gone.
    ///
    /// # Errors
    /// Returns error if the key is not stored or cannot be written.
    pub fn ensure_bot_key_file(&self, store: &ConfigStore) -> Result<PathBuf, InstallError> {
        let path = self.paths.bot_private_key();
        if !path.exists() {
            let pair = crate::ssh::SshKeyPair {
                private_key: store.require_string(keys::SSH_PRIVATE_KEY)?,
                public_key: store.require_string(keys::SSH_PUBLIC_KEY)?,
            };
            pair.write_private_key(&path)?;
        }
        Ok(path)
    }

    // ========================================================================
    // Terraform
    // ========================================================================

    /// Module directory of `entrypoint` in the gitops tree.
    #[must_use]
    pub fn terraform_dir(&self, entrypoint: &str) -> PathBuf {
        let module = if entrypoint == "base" {
            self.state.cloud.as_str()
        } else {
            entrypoint
        };
        self.paths.gitops().join("terraform").join(module)
    }

    /// Environment for `entrypoint` and the keys it must carry.
    #[must_use]
    pub fn terraform_env(
        &self,
        store: &ConfigStore,
        entrypoint: &str,
    ) -> (BTreeMap<String, String>, Vec<String>) {
        let mut env = self.deps.cloud.terraform_env();
        let mut required = Vec::new();

        let mut put = |key: &str, value: Option<String>| {
            if let Some(value) = value {
                env.insert(key.to_string(), value);
            }
        };
        put("TF_VAR_cluster_name", Some(self.state.cluster_name.clone()));
        put(
            "TF_VAR_atlantis_repo_webhook_secret",
            store.get_string(keys::ATLANTIS_WEBHOOK_SECRET),
        );
        put(
            "TF_VAR_kbot_ssh_public_key",
            store.get_string(keys::SSH_PUBLIC_KEY),
        );
        put(
            "TF_VAR_kbot_ssh_private_key",
            store.get_string(keys::SSH_PRIVATE_KEY),
        );

        let token = store.get_string(keys::GIT_TOKEN);
        match self.state.git {
            GitProviderKind::Github => {
                put("GITHUB_TOKEN", token);
                put("GITHUB_OWNER", Some(self.state.git_owner.clone()));
                required.push("GITHUB_TOKEN".to_string());
            }
            GitProviderKind::Gitlab => {
                put("GITLAB_TOKEN", token);
                put("GITLAB_OWNER", Some(self.state.git_owner.clone()));
                required.push("GITLAB_TOKEN".to_string());
            }
            GitProviderKind::SoftServe => {}
        }

        if entrypoint == "base" {
            required.push("TF_VAR_atlantis_repo_webhook_secret".to_string());
        } else {
            put(
                "VAULT_ADDR",
                Some(format!("http://127.0.0.1:{VAULT_LOCAL_PORT}")),
            );
            put("VAULT_TOKEN", store.get_string(keys::VAULT_ROOT_TOKEN));
            required.extend(["VAULT_ADDR".to_string(), "VAULT_TOKEN".to_string()]);
        }

        (env, required)
    }

    /// Run `entrypoint` with `action`.
    ///
    /// # Errors
    /// Returns [`InstallError::Terraform`] on missing env or a failed run.
    pub async fn terraform(
        &self,
        store: &ConfigStore,
        entrypoint: &str,
        action: TerraformAction,
    ) -> Result<(), InstallError> {
        let (env, required_env) = self.terraform_env(store, entrypoint);
        let run = TerraformRun {
            entrypoint: entrypoint.to_string(),
            dir: self.terraform_dir(entrypoint),
            action,
            env,
            required_env,
        };
        TerraformRunner::new(self.tools.get(Tool::Terraform), self.state.dry_run)
            .run(&run)
            .await?;
        Ok(())
    }
}

/// Poll `check` every `interval` until it reports true or `attempts` run out.
pub(crate) async fn poll_until<F, Fut>(attempts: u32, interval: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for attempt in 1..=attempts {
        if check().await {
            return true;
        }
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    false
}
