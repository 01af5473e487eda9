//! Installer error aggregate.
//!
//! Every component error converts into [`InstallError`]. The orchestrator
//! uses [`InstallError::kind`] for the structured failure line,
//! [`InstallError::is_retryable`] to decide whether a step is re-attempted
//! and [`InstallError::remedy`] for the hint shown to the user.

use std::time::Duration;

use k1_cloud::CloudProviderError;
use k1_scm::ScmError;
use thiserror::Error;

use crate::argocd::ArgoCdError;
use crate::dns::DnsError;
use crate::exec::ExecError;
use crate::kube::portforward::TunnelError;
use crate::kube::readiness::ReadinessError;
use crate::kube::KubeError;
use crate::ssh::SshError;
use crate::store::ConfigError;
use crate::template::TemplateError;
use crate::terraform::TerraformError;
use crate::tools::ToolError;
use crate::vault::VaultError;

/// Readiness waits given at most this long are worth retrying.
const SHORT_READINESS_BOUND: Duration = Duration::from_secs(300);

#[derive(Error, Debug)]
pub enum InstallError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Git(#[from] ScmError),

    #[error(transparent)]
    Dns(#[from] DnsError),

    #[error(transparent)]
    Terraform(#[from] TerraformError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Readiness(#[from] ReadinessError),

    #[error(transparent)]
    Kube(#[from] KubeError),

    #[error(transparent)]
    ArgoCd(#[from] ArgoCdError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Cloud(#[from] CloudProviderError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Ssh(#[from] SshError),

    /// A step finished but its postcondition does not hold.
    #[error("{step}: {reason}")]
    Step { step: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl InstallError {
    pub fn step(step: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Step {
            step: step.into(),
            reason: reason.into(),
        }
    }

    /// Stable taxonomy name, logged with every failure.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "ConfigError",
            Self::Tool(_) => "ToolDownloadError",
            Self::Template(TemplateError::Token { .. }) => "TemplateTokenError",
            Self::Template(_) => "TemplateFetchError",
            Self::Git(ScmError::Auth(_)) => "GitAuthError",
            Self::Git(ScmError::RepoExists(_)) => "GitRepoExistsError",
            Self::Git(ScmError::Timeout { .. }) => "GitTimeoutError",
            Self::Git(_) => "GitPushError",
            Self::Dns(DnsError::PropagationTimeout { .. }) => "DNSPropagationTimeout",
            Self::Dns(_) | Self::Cloud(_) => "CloudAPIError",
            Self::Terraform(_) => "TerraformExecError",
            Self::Tunnel(TunnelError::PortInUse(_)) => "PortInUse",
            Self::Tunnel(TunnelError::Panic { .. }) => "TunnelPanic",
            Self::Tunnel(_) => "TunnelDead",
            Self::Readiness(_) => "ReadinessTimeout",
            Self::ArgoCd(ArgoCdError::SyncFailed { .. }) => "ArgoCDSyncFailed",
            Self::ArgoCd(_) => "ArgoCDAPIError",
            Self::Vault(_) => "VaultInitError",
            Self::Kube(_) => "KubernetesAPIError",
            Self::Exec(_) => "ExecError",
            Self::Ssh(_) => "SSHKeyError",
            Self::Step { .. } => "StepError",
            Self::Io(_) => "IOError",
        }
    }

    /// Whether re-running the same step may succeed without user action.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Git(ScmError::Timeout { .. }) => true,
            Self::ArgoCd(e) => e.is_transient(),
            Self::Readiness(ReadinessError::Timeout { timeout, .. }) => {
                *timeout <= SHORT_READINESS_BOUND
            }
            _ => false,
        }
    }

    /// One-line suggestion printed after a failure.
    #[must_use]
    pub fn remedy(&self) -> &'static str {
        match self {
            Self::Config(_) => "check the flags and ~/.kubefirst, then re-run the same command",
            Self::Git(ScmError::Auth(_)) => {
                "verify the git host token and its scopes, then re-run the same command"
            }
            Self::Git(ScmError::RepoExists(_)) => {
                "delete the existing gitops/metaphor repositories or choose another owner"
            }
            Self::Template(TemplateError::Token { .. }) => {
                "the template uses a placeholder this installer does not know; pin a compatible template ref"
            }
            Self::Tunnel(TunnelError::PortInUse(_)) => {
                "free the local port (another port-forward may still be running) and re-run"
            }
            Self::Dns(DnsError::PropagationTimeout { .. }) => {
                "make sure the domain's hosted zone is delegated, then re-run the same command"
            }
            _ => "re-run the same command; previously completed steps are cached",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        let err = InstallError::from(ScmError::Auth("bad token".into()));
        assert_eq!(err.kind(), "GitAuthError");
        assert!(!err.is_retryable());

        let err = InstallError::from(TunnelError::PortInUse(8080));
        assert_eq!(err.kind(), "PortInUse");

        let err = InstallError::from(TemplateError::Token {
            path: "a.yaml".into(),
            token: "NOPE_TOKEN".into(),
        });
        assert_eq!(err.kind(), "TemplateTokenError");
    }

    #[test]
    fn test_retryable_classes() {
        let timeout = InstallError::from(ScmError::Timeout {
            what: "atlantis plan".into(),
            attempts: 30,
        });
        assert!(timeout.is_retryable());

        let sync_5xx = InstallError::from(ArgoCdError::SyncFailed {
            app: "registry".into(),
            last_status: 503,
            message: String::new(),
        });
        assert!(sync_5xx.is_retryable());

        let sync_4xx = InstallError::from(ArgoCdError::SyncFailed {
            app: "registry".into(),
            last_status: 403,
            message: String::new(),
        });
        assert!(!sync_4xx.is_retryable());

        let short = InstallError::from(ReadinessError::Timeout {
            kind: "deployment",
            name: "argocd/argocd-server".into(),
            timeout: Duration::from_secs(300),
            elapsed: Duration::from_millis(300_250),
        });
        assert!(short.is_retryable());

        let long = InstallError::from(ReadinessError::Timeout {
            kind: "pod",
            name: "vault/vault-initialized=true".into(),
            timeout: Duration::from_secs(600),
            elapsed: Duration::from_secs(601),
        });
        assert!(!long.is_retryable());

        let vault = InstallError::from(VaultError::Init("sealed".into()));
        assert_eq!(vault.kind(), "VaultInitError");
        assert!(!vault.is_retryable());
    }

    #[test]
    fn test_default_remedy_mentions_resume() {
        let err = InstallError::from(std::io::Error::other("disk full"));
        assert!(err.remedy().contains("re-run"));
    }
}
