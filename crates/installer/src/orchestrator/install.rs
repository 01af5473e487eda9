//! Install step implementations.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k1_scm::{GitProviderKind, ScmError};
use tracing::{info, warn};

use super::pipeline::StepExecutor;
use super::plan::StepId;
use super::session::{
    poll_until, Session, ARGOCD_ADMIN_USER, ARGOCD_LOCAL_PORT, SOFT_SERVE_LOCAL_PORT,
    VAULT_LOCAL_PORT,
};
use crate::argocd::{ArgoCdError, REGISTRY_APP};
use crate::error::InstallError;
use crate::exec::{Executor, Invocation};
use crate::kube::apply::apply_manifests;
use crate::kube::pod_exec::KubePodExec;
use crate::kube::portforward::TunnelTarget;
use crate::kube::readiness::Readiness;
use crate::kube::secrets;
use crate::ssh::{random_hex, SshKeyPair, BOT_KEY_TITLE};
use crate::state::keys;
use crate::store::ConfigStore;
use crate::template::{self, Hydration, TemplateTokens};
use crate::terraform::TerraformAction;
use crate::tools::{Tool, ToolProvisioner};
use crate::ui;
use crate::vault::{
    KubeUnsealSecretStore, UnsealMaterial, VaultClient, VaultInitializer, VaultMode,
};

/// Applications that make up a ready platform.
pub const K1_READY_APPS: [&str; 6] = [
    "registry",
    "argocd",
    "atlantis",
    "cert-manager",
    "chartmuseum",
    "argo-components",
];

const METAPHOR_APP: &str = "metaphor-development";
const REPOSITORY_SECRET_LABEL: &str = "argocd.argoproj.io/secret-type";
const ARGOCD_NAMESPACE: &str = "argocd";
const VAULT_NAMESPACE: &str = "vault";

const SYNC_ATTEMPTS: u32 = 20;
const SYNC_INTERVAL: Duration = Duration::from_secs(5);
const ARGOCD_READY_TIMEOUT: Duration = Duration::from_secs(300);
const VAULT_READY_TIMEOUT: Duration = Duration::from_secs(600);

/// Executes install steps.
pub struct InstallExecutor {
    session: Session,
}

impl InstallExecutor {
    #[must_use]
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    /// Release tunnels opened during the run.
    pub async fn shutdown(&mut self) {
        self.session.shutdown().await;
    }

    // ========================================================================
    // Preparation
    // ========================================================================

    async fn validate(&mut self, store: &mut ConfigStore) -> Result<(), InstallError> {
        self.session.paths.ensure()?;
        let mut required = vec!["git"];
        if matches!(self.session.state.cloud, k1_cloud::CloudKind::Aws) {
            required.push("aws");
        }
        for binary in required {
            which::which(binary).map_err(|_| {
                InstallError::step("validate", format!("`{binary}` was not found on PATH"))
            })?;
        }
        if matches!(self.session.state.git, GitProviderKind::SoftServe) || self.session.state.dry_run {
            return Ok(());
        }
        let user = self.session.deps.git.authenticate().await?;
        info!(user = %user.login, "Git host credentials verified");
        store.set(keys::GIT_USER, user.login.as_str());
        self.session.state.git_user = Some(user.login);
        Ok(())
    }

    async fn download_tools(&mut self) -> Result<(), InstallError> {
        let provisioner =
            ToolProvisioner::new(self.session.paths.tools(), self.session.tool_versions.clone())?;
        let tools = Tool::required_for(self.session.state.cloud.is_local());
        let spinner = ui::spinner("Downloading kubectl, terraform and friends");
        let result = provisioner.provision(&tools).await;
        spinner.finish_and_clear();
        self.session.tools = result?;
        Ok(())
    }

    async fn cloud_identity(&mut self, store: &mut ConfigStore) -> Result<(), InstallError> {
        let identity = self.session.deps.cloud.identity().await?;
        info!(account = %identity.account_id, "Cloud identity");
        store.set(keys::ACCOUNT_ID, identity.account_id.as_str());
        self.session.state.account_id = Some(identity.account_id);
        Ok(())
    }

    async fn hydrate(&self, repo: &str) -> Result<(), InstallError> {
        let state = &self.session.state;
        let paths = &self.session.paths;
        let tokens = TemplateTokens::from_state(state, paths);
        let remote_url = self.session.push_url(repo);

        if repo == "gitops" {
            let local_path = paths.gitops();
            let h = Hydration {
                template_url: &state.gitops_template_url,
                template_ref: &state.gitops_template_ref,
                local_path: &local_path,
                remote_url: &remote_url,
                tokens: &tokens,
            };
            template::hydrate_gitops(&h, &state.driver(), &state.cluster_type, &state.cluster_name)
                .await?;
        } else {
            let local_path = paths.metaphor();
            let h = Hydration {
                template_url: &state.metaphor_template_url,
                template_ref: &state.metaphor_template_ref,
                local_path: &local_path,
                remote_url: &remote_url,
                tokens: &tokens,
            };
            template::hydrate_metaphor(&h, &paths.gitops()).await?;
        }
        Ok(())
    }

    fn bot_keys(&self, store: &mut ConfigStore) -> Result<(), InstallError> {
        let pair = SshKeyPair::generate()?;
        pair.write_private_key(&self.session.paths.bot_private_key())?;
        store.set(keys::SSH_PRIVATE_KEY, pair.private_key.as_str());
        store.set(keys::SSH_PUBLIC_KEY, pair.public_key.as_str());
        if store.get_string(keys::ATLANTIS_WEBHOOK_SECRET).is_none() {
            store.set(keys::ATLANTIS_WEBHOOK_SECRET, random_hex(20));
        }
        Ok(())
    }

    // ========================================================================
    // Git host
    // ========================================================================

    async fn create_repos(&self, store: &mut ConfigStore) -> Result<(), InstallError> {
        let tag = self.session.state.git_tag();
        for (repo, description) in [
            ("gitops", "kubefirst gitops repository"),
            ("metaphor", "kubefirst metaphor example application"),
        ] {
            let created = format!("{tag}.{repo}.created");
            if store.checkpoint(&created) {
                continue;
            }
            self.session
                .deps
                .git
                .create_private_repo(repo, description)
                .await?;
            store.mark(&created);
            store.flush()?;
        }
        Ok(())
    }

    async fn push(&self, store: &ConfigStore, repo: &str) -> Result<(), InstallError> {
        let auth = self.session.push_auth(store)?;
        let intent = self.session.repo_intent(repo, auth);
        self.session.deps.git.push_initial_content(&intent).await?;
        info!(repo = %repo, "Pushed repository");
        Ok(())
    }

    async fn upload_bot_key(&self, store: &ConfigStore) -> Result<(), InstallError> {
        let public_key = store.require_string(keys::SSH_PUBLIC_KEY)?;
        match self
            .session
            .deps
            .git
            .upload_ssh_key(BOT_KEY_TITLE, &public_key)
            .await
        {
            Err(ScmError::Api { status: 422, .. }) => {
                warn!("Bot key already registered");
                Ok(())
            }
            other => Ok(other?),
        }
    }

    // ========================================================================
    // Cluster
    // ========================================================================

    async fn terraform_base(&self, store: &ConfigStore) -> Result<(), InstallError> {
        self.session
            .terraform(store, "base", TerraformAction::Apply)
            .await?;
        let kubeconfig = self.session.paths.kubeconfig();
        if !self.session.state.dry_run && !kubeconfig.exists() {
            return Err(InstallError::step(
                "terraform base",
                format!("no kubeconfig written to {}", kubeconfig.display()),
            ));
        }
        Ok(())
    }

    async fn local_tls(&self) -> Result<(), InstallError> {
        let domain = &self.session.state.domain;
        let ssl = self.session.paths.ssl(domain);
        std::fs::create_dir_all(&ssl)?;
        let cert = ssl.join("cert.pem");
        let key = ssl.join("key.pem");
        let invocation = Invocation::new(self.session.tools.get(Tool::Mkcert))
            .args([
                "-cert-file".to_string(),
                cert.display().to_string(),
                "-key-file".to_string(),
                key.display().to_string(),
                format!("*.{domain}"),
                domain.clone(),
            ])
            .env("CAROOT", ssl.join("ca").display().to_string());
        Executor.run(&invocation).await?;
        info!(dir = %ssl.display(), "Issued wildcard certificate");
        Ok(())
    }

    async fn local_cluster(&self) -> Result<(), InstallError> {
        let k3d = self.session.tools.get(Tool::K3d);
        let name = &self.session.state.cluster_name;
        let create = Invocation::new(&k3d)
            .args([
                "cluster",
                "create",
                name.as_str(),
                "--agents",
                "3",
                "--k3s-arg",
                "--disable=traefik@server:0",
                "--port",
                "443:443@loadbalancer",
                "--port",
                "80:80@loadbalancer",
                "--kubeconfig-update-default=false",
                "--kubeconfig-switch-context=false",
                "--wait",
            ])
            .timeout(Duration::from_secs(900));
        Executor.run_streaming(&create).await?;

        let kubeconfig = Executor
            .run(&Invocation::new(&k3d).args(["kubeconfig", "get", name.as_str()]))
            .await?;
        let path = self.session.paths.kubeconfig();
        std::fs::write(&path, kubeconfig.stdout)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }
        info!(cluster = %name, "k3d cluster created");
        Ok(())
    }

    async fn install_argocd(&self) -> Result<(), InstallError> {
        let helm = self.session.tools.get(Tool::Helm);
        let kubeconfig = self.session.paths.kubeconfig().display().to_string();
        Executor
            .run(&Invocation::new(&helm).args([
                "repo",
                "add",
                "argo",
                "https://argoproj.github.io/argo-helm",
                "--force-update",
            ]))
            .await?;
        let install = Invocation::new(&helm)
            .args([
                "upgrade",
                "--install",
                "argocd",
                "argo/argo-cd",
                "--namespace",
                ARGOCD_NAMESPACE,
                "--create-namespace",
                "--kubeconfig",
                kubeconfig.as_str(),
                "--wait",
                "--timeout",
                "10m",
            ])
            .timeout(Duration::from_secs(900));
        Executor.run_streaming(&install).await?;
        Ok(())
    }

    async fn install_soft_serve(&self) -> Result<(), InstallError> {
        let manifest = self
            .session
            .paths
            .gitops()
            .join("components/soft-serve/manifests.yaml");
        let yaml = std::fs::read_to_string(&manifest)?;
        let client = self.session.client().await?;
        apply_manifests(&client, &yaml, "soft-serve").await?;
        Readiness::new(client)
            .pod_by_label("soft-serve", "app", "soft-serve", false, ARGOCD_READY_TIMEOUT)
            .await?;
        Ok(())
    }

    // ========================================================================
    // ArgoCD
    // ========================================================================

    async fn argocd_tunnel(&mut self) -> Result<(), InstallError> {
        let readiness = Readiness::new(self.session.client().await?);
        readiness
            .namespace(ARGOCD_NAMESPACE, ARGOCD_READY_TIMEOUT)
            .await?;
        readiness
            .deployment(ARGOCD_NAMESPACE, "argocd-server", ARGOCD_READY_TIMEOUT)
            .await?;
        self.session
            .open_tunnel(
                TunnelTarget::service(ARGOCD_NAMESPACE, "argocd-server"),
                ARGOCD_LOCAL_PORT,
                80,
            )
            .await
    }

    async fn initial_repository(&self, store: &ConfigStore) -> Result<(), InstallError> {
        let client = self.session.client().await?;
        let labels = BTreeMap::from([(REPOSITORY_SECRET_LABEL.to_string(), "repository".to_string())]);
        let data = BTreeMap::from([
            ("type".to_string(), "git".to_string()),
            ("name".to_string(), "gitops".to_string()),
            ("url".to_string(), self.session.state.gitops_repo_url()),
            (
                "sshPrivateKey".to_string(),
                store.require_string(keys::SSH_PRIVATE_KEY)?,
            ),
        ]);
        secrets::apply(&client, ARGOCD_NAMESPACE, "repo-gitops", labels, data).await?;
        Ok(())
    }

    async fn apply_registry(&self) -> Result<(), InstallError> {
        let path = self
            .session
            .paths
            .gitops()
            .join("registry")
            .join(&self.session.state.cluster_name)
            .join("registry.yaml");
        let yaml = std::fs::read_to_string(&path)?;
        let client = self.session.client().await?;
        let applied = apply_manifests(&client, &yaml, ARGOCD_NAMESPACE).await?;
        info!(objects = ?applied, "Registry applied");
        Ok(())
    }

    async fn argocd_credentials(&mut self, store: &mut ConfigStore) -> Result<(), InstallError> {
        let client = self.session.client().await?;
        let readiness = Readiness::new(client.clone());
        let spinner = ui::spinner("Waiting for ArgoCD");
        let waited = async {
            readiness
                .statefulset(ARGOCD_NAMESPACE, "argocd-application-controller", ARGOCD_READY_TIMEOUT)
                .await?;
            readiness
                .deployment(ARGOCD_NAMESPACE, "argocd-server", ARGOCD_READY_TIMEOUT)
                .await?;
            readiness
                .deployment(ARGOCD_NAMESPACE, "argocd-repo-server", ARGOCD_READY_TIMEOUT)
                .await
        }
        .await;
        spinner.finish_and_clear();
        waited?;

        let password = secrets::read(&client, ARGOCD_NAMESPACE, "argocd-initial-admin-secret")
            .await?
            .and_then(|data| data.get("password").cloned())
            .ok_or_else(|| {
                InstallError::step("argocd credentials", "argocd-initial-admin-secret has no password")
            })?;
        store.set(keys::ARGOCD_PASSWORD, password);
        self.session.argocd(store).await?;
        info!(user = ARGOCD_ADMIN_USER, "Logged in to ArgoCD");
        Ok(())
    }

    async fn sync(&mut self, store: &mut ConfigStore, app: &str) -> Result<(), InstallError> {
        let argocd = self.session.argocd(store).await?;
        if argocd.sync_retry(app, SYNC_ATTEMPTS, SYNC_INTERVAL).await? {
            return Ok(());
        }
        Err(ArgoCdError::SyncFailed {
            app: app.to_string(),
            last_status: 0,
            message: format!("not synced after {SYNC_ATTEMPTS} attempts"),
        }
        .into())
    }

    // ========================================================================
    // Vault
    // ========================================================================

    async fn vault_tunnel(&mut self) -> Result<(), InstallError> {
        let readiness = Readiness::new(self.session.client().await?);
        readiness.namespace(VAULT_NAMESPACE, VAULT_READY_TIMEOUT).await?;
        // k3d charts do not carry the vault-initialized label
        let (key, value) = if self.session.state.cloud.is_local() {
            ("app.kubernetes.io/instance", "vault")
        } else {
            ("vault-initialized", "true")
        };
        readiness
            .pod_by_label(VAULT_NAMESPACE, key, value, false, VAULT_READY_TIMEOUT)
            .await?;
        self.session
            .open_tunnel(
                TunnelTarget::pod(VAULT_NAMESPACE, "vault-0"),
                VAULT_LOCAL_PORT,
                8200,
            )
            .await
    }

    async fn vault_unseal(&self, store: &mut ConfigStore) -> Result<(), InstallError> {
        let client = self.session.client().await?;
        let initializer = VaultInitializer::new(
            VaultClient::new(format!("http://127.0.0.1:{VAULT_LOCAL_PORT}"))?,
            Arc::new(KubeUnsealSecretStore::new(client.clone())),
            Arc::new(KubePodExec::new(client)),
            VaultMode::for_cloud(self.session.state.cloud),
        );
        let spinner = ui::spinner("Initializing Vault");
        let material = initializer.initialize_and_unseal().await;
        spinner.finish_and_clear();
        record_vault_material(store, &material?);
        Ok(())
    }

    // ========================================================================
    // Platform
    // ========================================================================

    async fn k1_ready(&mut self, store: &mut ConfigStore) -> Result<(), InstallError> {
        for app in K1_READY_APPS {
            self.sync(store, app).await?;
        }
        Ok(())
    }

    async fn deploy_metaphor(&mut self, store: &mut ConfigStore) -> Result<(), InstallError> {
        self.sync(store, METAPHOR_APP).await?;

        let url = self.session.state.ingress_url(METAPHOR_APP);
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(self.session.state.cloud.is_local())
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| InstallError::step("metaphor", e.to_string()))?;
        let healthy = poll_until(30, Duration::from_secs(10), || {
            let request = http.get(&url);
            async move { request.send().await.is_ok() }
        })
        .await;
        if !healthy {
            return Err(InstallError::step(
                "metaphor",
                format!("{url} did not answer over TLS"),
            ));
        }
        info!(url = %url, "Metaphor is serving");
        Ok(())
    }

    fn complete(&self, store: &mut ConfigStore) {
        store.set(keys::COMPLETED_AT, chrono::Utc::now().to_rfc3339());
        if self.session.state.use_telemetry {
            info!(
                event = "install-complete",
                cloud = %self.session.state.cloud,
                git = %self.session.state.git,
                cluster_id = %self.session.state.cluster_id,
                "Installation complete"
            );
        }
    }

    fn handoff(&self, store: &ConfigStore) {
        let state = &self.session.state;
        ui::print_section("kubefirst platform ready");
        ui::print_kv("ArgoCD", &state.ingress_url("argocd"));
        ui::print_kv("ArgoCD user", ARGOCD_ADMIN_USER);
        if let Some(password) = store.get_string(keys::ARGOCD_PASSWORD) {
            ui::print_kv("ArgoCD password", &password);
        }
        ui::print_kv("Vault", &state.ingress_url("vault"));
        ui::print_kv(
            "Vault root token",
            &format!("{} (key {})", store.path().display(), keys::VAULT_ROOT_TOKEN),
        );
        ui::print_kv("Atlantis", &state.ingress_url("atlantis"));
        ui::print_kv("gitops repository", &state.gitops_repo_url());
        ui::print_kv("kubeconfig", &self.session.paths.kubeconfig().display().to_string());
    }
}

#[async_trait]
impl StepExecutor for InstallExecutor {
    async fn execute(&mut self, step: StepId, store: &mut ConfigStore) -> Result<(), InstallError> {
        match step {
            StepId::Validate => self.validate(store).await,
            StepId::DownloadTools => self.download_tools().await,
            StepId::LivenessRecord => {
                let domain = self.session.state.domain.clone();
                Ok(self.session.prober().create_record(&domain).await?)
            }
            StepId::LivenessVerify => {
                let domain = self.session.state.domain.clone();
                self.session.prober().verify(&domain).await?;
                Ok(())
            }
            StepId::CloudIdentity => self.cloud_identity(store).await,
            StepId::StateStoreBucket => {
                let bucket = self.session.state.state_store_bucket();
                Ok(self.session.deps.cloud.create_bucket(&bucket).await?)
            }
            StepId::ArtifactsBucket => {
                let bucket = self.session.state.artifacts_bucket();
                Ok(self.session.deps.cloud.create_bucket(&bucket).await?)
            }
            StepId::HydrateGitops => self.hydrate("gitops").await,
            StepId::HydrateMetaphor => self.hydrate("metaphor").await,
            StepId::BotKeys => self.bot_keys(store),
            StepId::CreateRepos => self.create_repos(store).await,
            StepId::PushGitops => self.push(store, "gitops").await,
            StepId::PushMetaphor => self.push(store, "metaphor").await,
            StepId::UploadBotKey | StepId::ConfigureSoftServe => self.upload_bot_key(store).await,
            StepId::TerraformBase => self.terraform_base(store).await,
            StepId::LocalTls => self.local_tls().await,
            StepId::LocalCluster => self.local_cluster().await,
            StepId::InstallArgoCd => self.install_argocd().await,
            StepId::InstallSoftServe => self.install_soft_serve().await,
            StepId::SoftServeTunnel => {
                self.session
                    .open_tunnel(
                        TunnelTarget::service("soft-serve", "soft-serve"),
                        SOFT_SERVE_LOCAL_PORT,
                        22,
                    )
                    .await
            }
            StepId::ArgoCdTunnel => self.argocd_tunnel().await,
            StepId::InitialRepository => self.initial_repository(store).await,
            StepId::ApplyRegistry => self.apply_registry().await,
            StepId::ArgoCdCredentials => self.argocd_credentials(store).await,
            StepId::SyncRegistry => self.sync(store, REGISTRY_APP).await,
            StepId::VaultTunnel => self.vault_tunnel().await,
            StepId::VaultUnseal => self.vault_unseal(store).await,
            StepId::TerraformVault => {
                self.session
                    .terraform(store, "vault", TerraformAction::Apply)
                    .await
            }
            StepId::TerraformUsers => {
                self.session
                    .terraform(store, "users", TerraformAction::Apply)
                    .await
            }
            StepId::K1Ready => self.k1_ready(store).await,
            StepId::DeployMetaphor => self.deploy_metaphor(store).await,
            StepId::Complete => {
                self.complete(store);
                Ok(())
            }
            StepId::Handoff => {
                self.handoff(store);
                Ok(())
            }
            other => Err(InstallError::step(
                other.to_string(),
                "not part of the install pipeline",
            )),
        }
    }
}

/// Root token and unseal key shares, mirrored from `vault/vault-unseal-secret`.
fn record_vault_material(store: &mut ConfigStore, material: &UnsealMaterial) {
    store.set(keys::VAULT_ROOT_TOKEN, material.root_token.clone());
    for (i, key) in material.keys.iter().enumerate() {
        store.set(&keys::vault_unseal_key(i + 1), key.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vault_material_is_mirrored_into_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ConfigStore::open(dir.path().join(".kubefirst")).unwrap();
        let material = UnsealMaterial {
            root_token: "hvs.root".to_string(),
            keys: (1..=5).map(|n| format!("share-{n}")).collect(),
        };
        record_vault_material(&mut store, &material);

        assert_eq!(store.get_string(keys::VAULT_ROOT_TOKEN).as_deref(), Some("hvs.root"));
        assert_eq!(
            store.get_string("secrets.vault-unseal-key-1").as_deref(),
            Some("share-1")
        );
        assert_eq!(
            store.get_string(&keys::vault_unseal_key(5)).as_deref(),
            Some("share-5")
        );
        assert!(store.get_string(&keys::vault_unseal_key(6)).is_none());
    }
}
