//! Template placeholders and their substitution.
//!
//! Placeholders are `<UPPER_SNAKE>` names: an upper-case letter, then upper-case
//! letters and digits in at least two `_`-separated words. The set of names a
//! template may use is closed; [`Token`] enumerates it.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use k1_scm::GitProviderKind;
use regex::Regex;

use crate::state::{InstallationState, K1Paths};

macro_rules! template_tokens {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        /// Closed set of template placeholders.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Token {
            $($variant),+
        }

        impl Token {
            /// Every placeholder.
            pub const ALL: &'static [Token] = &[$(Token::$variant),+];

            /// Name between the angle brackets.
            #[must_use]
            pub fn name(self) -> &'static str {
                match self {
                    $(Token::$variant => $name),+
                }
            }

            /// Look a placeholder up by name.
            #[must_use]
            pub fn from_name(name: &str) -> Option<Token> {
                match name {
                    $($name => Some(Token::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

template_tokens! {
    AlertsEmail => "ALERTS_EMAIL",
    AtlantisAllowList => "ATLANTIS_ALLOW_LIST",
    ClusterName => "CLUSTER_NAME",
    CloudProvider => "CLOUD_PROVIDER",
    CloudRegion => "CLOUD_REGION",
    ClusterId => "CLUSTER_ID",
    ClusterType => "CLUSTER_TYPE",
    DomainName => "DOMAIN_NAME",
    KubeConfigPath => "KUBE_CONFIG_PATH",
    ArtifactsBucket => "KUBEFIRST_ARTIFACTS_BUCKET",
    StateStoreBucket => "KUBEFIRST_STATE_STORE_BUCKET",
    KubefirstTeam => "KUBEFIRST_TEAM",
    KubefirstVersion => "KUBEFIRST_VERSION",
    ArgocdIngressUrl => "ARGOCD_INGRESS_URL",
    ArgocdIngressNoHttpUrl => "ARGOCD_INGRESS_NO_HTTP_URL",
    ArgoWorkflowsIngressUrl => "ARGO_WORKFLOWS_INGRESS_URL",
    ArgoWorkflowsIngressNoHttpsUrl => "ARGO_WORKFLOWS_INGRESS_NO_HTTPS_URL",
    AtlantisIngressUrl => "ATLANTIS_INGRESS_URL",
    AtlantisIngressNoHttpsUrl => "ATLANTIS_INGRESS_NO_HTTPS_URL",
    ChartmuseumIngressUrl => "CHARTMUSEUM_INGRESS_URL",
    VaultIngressUrl => "VAULT_INGRESS_URL",
    VaultIngressNoHttpsUrl => "VAULT_INGRESS_NO_HTTPS_URL",
    VouchIngressUrl => "VOUCH_INGRESS_URL",
    AwsAccountId => "AWS_ACCOUNT_ID",
    AwsIamArnAccountRoot => "AWS_IAM_ARN_ACCOUNT_ROOT",
    AwsNodeCapacityType => "AWS_NODE_CAPACITY_TYPE",
    GitDescription => "GIT_DESCRIPTION",
    GitNamespace => "GIT_NAMESPACE",
    GitProvider => "GIT_PROVIDER",
    GitRunner => "GIT_RUNNER",
    GitRunnerDescription => "GIT_RUNNER_DESCRIPTION",
    GitRunnerNs => "GIT_RUNNER_NS",
    GitUrl => "GIT_URL",
    GithubHost => "GITHUB_HOST",
    GithubOwner => "GITHUB_OWNER",
    GithubUser => "GITHUB_USER",
    GitlabHost => "GITLAB_HOST",
    GitlabOwner => "GITLAB_OWNER",
    GitlabOwnerGroupId => "GITLAB_OWNER_GROUP_ID",
    GitlabUser => "GITLAB_USER",
    GitopsRepoAtlantisWebhookUrl => "GITOPS_REPO_ATLANTIS_WEBHOOK_URL",
    GitopsRepoGitUrl => "GITOPS_REPO_GIT_URL",
    GitopsRepoNoHttpsUrl => "GITOPS_REPO_NO_HTTPS_URL",
    MetaphorDevelopmentIngressUrl => "METAPHOR_DEVELOPMENT_INGRESS_URL",
    MetaphorStagingIngressUrl => "METAPHOR_STAGING_INGRESS_URL",
    MetaphorProductionIngressUrl => "METAPHOR_PRODUCTION_INGRESS_URL",
    ContainerRegistryUrl => "CONTAINER_REGISTRY_URL",
    UseTelemetry => "USE_TELEMETRY",
    K3dDomain => "K3D_DOMAIN",
}

/// Placeholder syntax used by the pre-write check.
pub(crate) static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<([A-Z][A-Z0-9]*(?:_[A-Z0-9]+)+)>").expect("static pattern")
});

/// Runtime values for every placeholder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateTokens {
    values: BTreeMap<Token, String>,
}

impl TemplateTokens {
    /// Empty map; unset placeholders are left untouched.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a single value.
    #[must_use]
    pub fn with(mut self, token: Token, value: impl Into<String>) -> Self {
        self.values.insert(token, value.into());
        self
    }

    #[must_use]
    pub fn get(&self, token: Token) -> Option<&str> {
        self.values.get(&token).map(String::as_str)
    }

    /// Values derived from the installation.
    #[must_use]
    pub fn from_state(state: &InstallationState, paths: &K1Paths) -> Self {
        let domain = &state.domain;
        let host = |name: &str| format!("{name}.{domain}");
        let account = state.account_id.clone().unwrap_or_default();
        let git_user = state.git_user.clone().unwrap_or_default();
        let (github, gitlab) = match state.git {
            GitProviderKind::Github => (true, false),
            GitProviderKind::Gitlab => (false, true),
            GitProviderKind::SoftServe => (false, false),
        };
        let pick = |on: bool, v: &str| if on { v.to_string() } else { String::new() };

        let (git_provider, git_description, git_runner, git_runner_description, git_runner_ns) =
            match state.git {
                GitProviderKind::Github => (
                    "GitHub",
                    "GitHub hosted git",
                    "GitHub Action Runner",
                    "Self Hosted GitHub Action Runner",
                    "github-runner",
                ),
                GitProviderKind::Gitlab => (
                    "GitLab",
                    "GitLab hosted git",
                    "GitLab Runner",
                    "Self Hosted GitLab Runner",
                    "gitlab-runner",
                ),
                GitProviderKind::SoftServe => (
                    "soft-serve",
                    "In-cluster soft-serve git",
                    "Argo Workflows",
                    "In-cluster Argo Workflows runner",
                    "argo",
                ),
            };
        let registry = match state.git {
            GitProviderKind::Gitlab => format!("registry.{}/{}", state.git_host, state.git_owner),
            _ => format!("ghcr.io/{}", state.git_owner.to_lowercase()),
        };

        Self::new()
            .with(Token::AlertsEmail, &state.alerts_email)
            .with(
                Token::AtlantisAllowList,
                format!("{}/{}/*", state.git_host, state.git_owner),
            )
            .with(Token::ClusterName, &state.cluster_name)
            .with(Token::CloudProvider, state.cloud.as_str())
            .with(Token::CloudRegion, &state.cloud_region)
            .with(Token::ClusterId, &state.cluster_id)
            .with(Token::ClusterType, &state.cluster_type)
            .with(Token::DomainName, domain)
            .with(Token::KubeConfigPath, paths.kubeconfig().display().to_string())
            .with(Token::ArtifactsBucket, state.artifacts_bucket())
            .with(Token::StateStoreBucket, state.state_store_bucket())
            .with(Token::KubefirstTeam, "admins")
            .with(Token::KubefirstVersion, env!("CARGO_PKG_VERSION"))
            .with(Token::ArgocdIngressUrl, state.ingress_url("argocd"))
            .with(Token::ArgocdIngressNoHttpUrl, host("argocd"))
            .with(Token::ArgoWorkflowsIngressUrl, state.ingress_url("argo"))
            .with(Token::ArgoWorkflowsIngressNoHttpsUrl, host("argo"))
            .with(Token::AtlantisIngressUrl, state.ingress_url("atlantis"))
            .with(Token::AtlantisIngressNoHttpsUrl, host("atlantis"))
            .with(Token::ChartmuseumIngressUrl, state.ingress_url("chartmuseum"))
            .with(Token::VaultIngressUrl, state.ingress_url("vault"))
            .with(Token::VaultIngressNoHttpsUrl, host("vault"))
            .with(Token::VouchIngressUrl, state.ingress_url("vouch"))
            .with(Token::AwsIamArnAccountRoot, format!("arn:aws:iam::{account}:root"))
            .with(Token::AwsAccountId, account)
            .with(Token::AwsNodeCapacityType, &state.node_capacity_type)
            .with(Token::GitDescription, git_description)
            .with(Token::GitNamespace, git_runner_ns)
            .with(Token::GitProvider, git_provider)
            .with(Token::GitRunner, git_runner)
            .with(Token::GitRunnerDescription, git_runner_description)
            .with(Token::GitRunnerNs, git_runner_ns)
            .with(Token::GitUrl, state.gitops_repo_url())
            .with(Token::GithubHost, pick(github, &state.git_host))
            .with(Token::GithubOwner, pick(github, &state.git_owner.to_lowercase()))
            .with(Token::GithubUser, pick(github, &git_user))
            .with(Token::GitlabHost, pick(gitlab, &state.git_host))
            .with(Token::GitlabOwner, pick(gitlab, &state.git_owner))
            .with(
                Token::GitlabOwnerGroupId,
                state
                    .gitlab_group_id
                    .map(|id| id.to_string())
                    .unwrap_or_default(),
            )
            .with(Token::GitlabUser, pick(gitlab, &git_user))
            .with(
                Token::GitopsRepoAtlantisWebhookUrl,
                format!("{}/events", state.ingress_url("atlantis")),
            )
            .with(Token::GitopsRepoGitUrl, state.gitops_repo_url())
            .with(Token::GitopsRepoNoHttpsUrl, state.repo_no_https_url("gitops"))
            .with(
                Token::MetaphorDevelopmentIngressUrl,
                state.ingress_url("metaphor-development"),
            )
            .with(Token::MetaphorStagingIngressUrl, state.ingress_url("metaphor-staging"))
            .with(
                Token::MetaphorProductionIngressUrl,
                state.ingress_url("metaphor-production"),
            )
            .with(Token::ContainerRegistryUrl, registry)
            .with(Token::UseTelemetry, state.use_telemetry.to_string())
            .with(Token::K3dDomain, domain)
    }

    /// Substitute every known placeholder in one pass.
    ///
    /// Substituted values are never rescanned, so a value that itself looks
    /// like a placeholder stays as written. Unknown names are left untouched.
    #[must_use]
    pub fn detokenize<'a>(&self, input: &'a str) -> Cow<'a, str> {
        let mut out = String::new();
        let mut copied = 0;
        let mut rest = 0;

        while let Some(open) = input[rest..].find('<').map(|i| rest + i) {
            let name_start = open + 1;
            let name_len = input[name_start..]
                .bytes()
                .take_while(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || *b == b'_')
                .count();
            let close = name_start + name_len;

            let value = (name_len > 0 && input.as_bytes().get(close) == Some(&b'>'))
                .then(|| Token::from_name(&input[name_start..close]))
                .flatten()
                .and_then(|t| self.values.get(&t));

            match value {
                Some(value) => {
                    out.push_str(&input[copied..open]);
                    out.push_str(value);
                    copied = close + 1;
                    rest = copied;
                }
                None => rest = name_start,
            }
        }

        if copied == 0 {
            Cow::Borrowed(input)
        } else {
            out.push_str(&input[copied..]);
            Cow::Owned(out)
        }
    }
}

/// Placeholder names in `text` that are outside the closed set.
pub(crate) fn unknown_placeholders(text: &str) -> impl Iterator<Item = &str> {
    PLACEHOLDER
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .filter(|name| Token::from_name(name).is_none())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detokenize_replaces_known_tokens() {
        let tokens = TemplateTokens::new()
            .with(Token::ClusterName, "mgmt")
            .with(Token::CloudRegion, "us-east-1");
        let out = tokens.detokenize("cluster: <CLUSTER_NAME>\nregion: <CLOUD_REGION>\n");
        assert_eq!(out, "cluster: mgmt\nregion: us-east-1\n");
    }

    #[test]
    fn test_values_are_not_rescanned() {
        let tokens = TemplateTokens::new()
            .with(Token::ClusterName, "<DOMAIN_NAME>")
            .with(Token::DomainName, "example.com");
        assert_eq!(tokens.detokenize("<CLUSTER_NAME>"), "<DOMAIN_NAME>");
    }

    #[test]
    fn test_detokenize_is_idempotent() {
        let tokens = TemplateTokens::new()
            .with(Token::ClusterName, "mgmt")
            .with(Token::DomainName, "example.com");
        let input = "a <CLUSTER_NAME> b <<DOMAIN_NAME>> <UNKNOWN_NAME> <T> <";
        let once = tokens.detokenize(input).into_owned();
        let twice = tokens.detokenize(&once).into_owned();
        assert_eq!(once, "a mgmt b <example.com> <UNKNOWN_NAME> <T> <");
        assert_eq!(once, twice);
    }

    #[test]
    fn test_untouched_input_is_borrowed() {
        let tokens = TemplateTokens::new().with(Token::ClusterName, "mgmt");
        assert!(matches!(tokens.detokenize("nothing here"), Cow::Borrowed(_)));
    }

    #[test]
    fn test_unknown_placeholders() {
        let found: Vec<_> =
            unknown_placeholders("<CLUSTER_NAME> <NOT_A_TOKEN> List<T> <HTML>").collect();
        assert_eq!(found, vec!["NOT_A_TOKEN"]);
    }

    #[test]
    fn test_token_names_round_trip() {
        for token in Token::ALL {
            assert_eq!(Token::from_name(token.name()), Some(*token));
            assert!(PLACEHOLDER.is_match(&format!("<{}>", token.name())));
        }
        assert_eq!(Token::ALL.len(), 49);
    }
}
