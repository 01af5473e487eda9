//! Installation state.
//!
//! [`InstallationState`] is the validated view of one installation's inputs
//! and derived values, shaped from the [`ConfigStore`] at the start of every
//! run. [`K1Paths`] is the on-disk working layout under `~/.k1`.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use k1_cloud::CloudKind;
use k1_scm::GitProviderKind;
use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;
use tracing::info;

use crate::store::{ConfigError, ConfigStore};

/// Default gitops template repository.
pub const DEFAULT_GITOPS_TEMPLATE_URL: &str = "https://github.com/kubefirst/gitops-template.git";

/// Default metaphor template repository.
pub const DEFAULT_METAPHOR_TEMPLATE_URL: &str =
    "https://github.com/kubefirst/metaphor-frontend-template.git";

/// Default template reference.
pub const DEFAULT_TEMPLATE_REF: &str = "main";

/// Store keys for the installation inputs.
pub mod keys {
    pub const DOMAIN_NAME: &str = "domain-name";
    pub const CLUSTER_NAME: &str = "cluster-name";
    pub const CLUSTER_TYPE: &str = "cluster-type";
    pub const CLOUD_PROVIDER: &str = "cloud-provider";
    pub const CLOUD_REGION: &str = "cloud-region";
    pub const GIT_PROVIDER: &str = "git-provider";
    pub const GIT_OWNER: &str = "git-owner";
    pub const GIT_HOST: &str = "git-host";
    pub const ALERTS_EMAIL: &str = "alerts-email";
    pub const DRY_RUN: &str = "dry-run";
    pub const USE_TELEMETRY: &str = "use-telemetry";
    pub const GITOPS_TEMPLATE_URL: &str = "gitops-template-url";
    pub const GITOPS_TEMPLATE_REF: &str = "gitops-template-ref";
    pub const METAPHOR_TEMPLATE_URL: &str = "metaphor-template-url";
    pub const METAPHOR_TEMPLATE_REF: &str = "metaphor-template-ref";
    pub const NODE_CAPACITY_TYPE: &str = "node-capacity-type";
    pub const BUCKET_SUFFIX: &str = "bucket-suffix";
    pub const CLUSTER_ID: &str = "cluster-id";
    pub const ACCOUNT_ID: &str = "cloud.account-id";
    pub const GIT_USER: &str = "git.user";
    pub const GITLAB_GROUP_ID: &str = "gitlab.owner-group-id";
    pub const COMPLETED_AT: &str = "installation.completed-at";

    pub const GIT_TOKEN: &str = "secrets.git-token";
    pub const SSH_PRIVATE_KEY: &str = "secrets.ssh-bot-private-key";
    pub const SSH_PUBLIC_KEY: &str = "secrets.ssh-bot-public-key";
    pub const ARGOCD_PASSWORD: &str = "secrets.argocd-admin-password";
    pub const ARGOCD_TOKEN: &str = "secrets.argocd-api-token";
    pub const VAULT_ROOT_TOKEN: &str = "secrets.vault-root-token";
    pub const ATLANTIS_WEBHOOK_SECRET: &str = "secrets.atlantis-webhook-secret";

    /// Store key of the `n`th (1-based) Vault unseal key.
    #[must_use]
    pub fn vault_unseal_key(n: usize) -> String {
        format!("secrets.vault-unseal-key-{n}")
    }
}

static CLUSTER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9-]+$").expect("static pattern"));

/// Short lowercase random identifier.
fn random_id(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

/// Validated installation inputs and derived values.
#[derive(Debug, Clone)]
pub struct InstallationState {
    /// Apex domain; never ends with `.`.
    pub domain: String,
    /// Management cluster name, `[a-z0-9-]+`.
    pub cluster_name: String,
    /// Template cluster type copied into `registry/<cluster>`.
    pub cluster_type: String,
    pub cloud: CloudKind,
    pub cloud_region: String,
    pub git: GitProviderKind,
    /// Organisation, group or user owning the repositories.
    pub git_owner: String,
    /// Git host name (`github.com`, `gitlab.com`, ...).
    pub git_host: String,
    pub alerts_email: String,
    pub dry_run: bool,
    pub use_telemetry: bool,
    pub gitops_template_url: String,
    pub gitops_template_ref: String,
    pub metaphor_template_url: String,
    pub metaphor_template_ref: String,
    pub node_capacity_type: String,
    /// Random suffix shared by the installation's buckets.
    pub bucket_suffix: String,
    /// Random cluster identifier.
    pub cluster_id: String,
    /// Cloud account, known once identity has been fetched.
    pub account_id: Option<String>,
    /// Authenticated git user, known once the host has been verified.
    pub git_user: Option<String>,
    /// Numeric GitLab group id.
    pub gitlab_group_id: Option<u64>,
}

impl InstallationState {
    /// Shape and validate the state from `store`.
    ///
    /// Generates and stages the bucket suffix and cluster id on first use.
    ///
    /// # Errors
    /// Returns [`ConfigError`] when a required input is missing or invalid.
    pub fn from_store(store: &mut ConfigStore) -> Result<Self, ConfigError> {
        let cloud: CloudKind = store
            .require_string(keys::CLOUD_PROVIDER)?
            .parse()
            .map_err(|e: k1_cloud::CloudProviderError| ConfigError::Invalid {
                key: keys::CLOUD_PROVIDER.to_string(),
                reason: e.to_string(),
            })?;
        let git: GitProviderKind = store
            .require_string(keys::GIT_PROVIDER)?
            .parse()
            .map_err(|e: k1_scm::ScmError| ConfigError::Invalid {
                key: keys::GIT_PROVIDER.to_string(),
                reason: e.to_string(),
            })?;

        let domain = store
            .require_string(keys::DOMAIN_NAME)?
            .trim()
            .trim_end_matches('.')
            .to_ascii_lowercase();
        if domain.is_empty() || !domain.contains('.') {
            return Err(ConfigError::Invalid {
                key: keys::DOMAIN_NAME.to_string(),
                reason: format!("'{domain}' is not a domain name"),
            });
        }

        let cluster_name = store.require_string(keys::CLUSTER_NAME)?;
        if !CLUSTER_NAME.is_match(&cluster_name) {
            return Err(ConfigError::Invalid {
                key: keys::CLUSTER_NAME.to_string(),
                reason: format!("'{cluster_name}' must match [a-z0-9-]+"),
            });
        }

        let cloud_region = if cloud.is_local() {
            store
                .get_string(keys::CLOUD_REGION)
                .unwrap_or_else(|| "local".to_string())
        } else {
            store.require_string(keys::CLOUD_REGION)?
        };

        let git_host = store.get_string(keys::GIT_HOST).unwrap_or_else(|| {
            match git {
                GitProviderKind::Github => "github.com",
                GitProviderKind::Gitlab => "gitlab.com",
                GitProviderKind::SoftServe => "soft-serve",
            }
            .to_string()
        });
        let git_owner = match git {
            GitProviderKind::SoftServe => store
                .get_string(keys::GIT_OWNER)
                .unwrap_or_else(|| "kubefirst".to_string()),
            _ => store.require_string(keys::GIT_OWNER)?,
        };

        let bucket_suffix = Self::generated(store, keys::BUCKET_SUFFIX, 6);
        let cluster_id = Self::generated(store, keys::CLUSTER_ID, 6);

        let state = Self {
            domain,
            cluster_name,
            cluster_type: store
                .get_string(keys::CLUSTER_TYPE)
                .unwrap_or_else(|| "mgmt".to_string()),
            cloud,
            cloud_region,
            git,
            git_owner,
            git_host,
            alerts_email: store.get_string(keys::ALERTS_EMAIL).unwrap_or_default(),
            dry_run: store.bool(keys::DRY_RUN),
            use_telemetry: store.bool(keys::USE_TELEMETRY),
            gitops_template_url: store
                .get_string(keys::GITOPS_TEMPLATE_URL)
                .unwrap_or_else(|| DEFAULT_GITOPS_TEMPLATE_URL.to_string()),
            gitops_template_ref: store
                .get_string(keys::GITOPS_TEMPLATE_REF)
                .unwrap_or_else(|| DEFAULT_TEMPLATE_REF.to_string()),
            metaphor_template_url: store
                .get_string(keys::METAPHOR_TEMPLATE_URL)
                .unwrap_or_else(|| DEFAULT_METAPHOR_TEMPLATE_URL.to_string()),
            metaphor_template_ref: store
                .get_string(keys::METAPHOR_TEMPLATE_REF)
                .unwrap_or_else(|| DEFAULT_TEMPLATE_REF.to_string()),
            node_capacity_type: store
                .get_string(keys::NODE_CAPACITY_TYPE)
                .unwrap_or_else(|| "ON_DEMAND".to_string()),
            bucket_suffix,
            cluster_id,
            account_id: store.get_string(keys::ACCOUNT_ID),
            git_user: store.get_string(keys::GIT_USER),
            gitlab_group_id: store
                .get_i64(keys::GITLAB_GROUP_ID)
                .and_then(|id| u64::try_from(id).ok()),
        };

        info!(
            cluster = %state.cluster_name,
            domain = %state.domain,
            cloud = %state.cloud,
            git = %state.git,
            dry_run = state.dry_run,
            "Loaded installation state"
        );
        Ok(state)
    }

    fn generated(store: &mut ConfigStore, key: &str, len: usize) -> String {
        if let Some(existing) = store.get_string(key) {
            return existing;
        }
        let value = random_id(len);
        store.set(key, value.as_str());
        value
    }

    /// Terraform state bucket.
    #[must_use]
    pub fn state_store_bucket(&self) -> String {
        format!("k1-state-store-{}-{}", self.cluster_name, self.bucket_suffix)
    }

    /// Artifacts bucket.
    #[must_use]
    pub fn artifacts_bucket(&self) -> String {
        format!("k1-artifacts-{}-{}", self.cluster_name, self.bucket_suffix)
    }

    /// Template driver directory kept by the materializer, e.g. `aws-github`.
    #[must_use]
    pub fn driver(&self) -> String {
        let git = match self.git {
            GitProviderKind::SoftServe => "softserve",
            other => other.as_str(),
        };
        format!("{}-{git}", self.cloud.as_str())
    }

    /// Prefix for git-host scoped checkpoints.
    #[must_use]
    pub fn git_tag(&self) -> &'static str {
        self.git.as_str()
    }

    /// Repository URL ArgoCD pulls the gitops repository from.
    #[must_use]
    pub fn gitops_repo_url(&self) -> String {
        self.repo_git_url("gitops")
    }

    /// SSH URL of `repo` as seen from inside the cluster.
    #[must_use]
    pub fn repo_git_url(&self, repo: &str) -> String {
        match self.git {
            GitProviderKind::SoftServe => {
                format!("ssh://soft-serve.soft-serve.svc.cluster.local:22/{repo}")
            }
            _ => format!("git@{}:{}/{repo}.git", self.git_host, self.git_owner),
        }
    }

    /// Browser URL of `repo` without the scheme.
    #[must_use]
    pub fn repo_no_https_url(&self, repo: &str) -> String {
        format!("{}/{}/{repo}", self.git_host, self.git_owner)
    }

    /// Public URL of an ingress host under the domain.
    #[must_use]
    pub fn ingress_url(&self, host: &str) -> String {
        format!("https://{host}.{}", self.domain)
    }
}

/// On-disk working layout.
#[derive(Debug, Clone)]
pub struct K1Paths {
    root: PathBuf,
}

impl K1Paths {
    /// Layout under `~/.k1`.
    ///
    /// # Errors
    /// Returns [`ConfigError::Missing`] when the home directory is unknown.
    pub fn from_home() -> Result<Self, ConfigError> {
        let home = dirs::home_dir().ok_or_else(|| ConfigError::Missing("HOME".to_string()))?;
        Ok(Self::at(home.join(".k1")))
    }

    /// Layout under an explicit root.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn gitops(&self) -> PathBuf {
        self.root.join("gitops")
    }

    #[must_use]
    pub fn metaphor(&self) -> PathBuf {
        self.root.join("metaphor")
    }

    #[must_use]
    pub fn tools(&self) -> PathBuf {
        self.root.join("tools")
    }

    #[must_use]
    pub fn logs(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Backed-up TLS material for `domain`.
    #[must_use]
    pub fn ssl(&self, domain: &str) -> PathBuf {
        self.root.join("ssl").join(domain)
    }

    /// Kubeconfig of the management cluster.
    #[must_use]
    pub fn kubeconfig(&self) -> PathBuf {
        self.root.join("kubeconfig")
    }

    /// Bot private key file used for SSH pushes.
    #[must_use]
    pub fn bot_private_key(&self) -> PathBuf {
        self.root.join("ssh").join("kbot_ed25519")
    }

    /// Create the working directories.
    ///
    /// # Errors
    /// Returns error if a directory cannot be created.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [self.root.clone(), self.tools(), self.logs(), self.root.join("ssh")] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Retry configuration for transient step failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Backoff multiplier.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(120),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Retry immediately; used by tests.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Calculate the delay for a given attempt number.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.min(10)).unwrap_or(10);
        let multiplier = self.backoff_multiplier.powi(exp);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let capped = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Check if we should retry given the current attempt count.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
