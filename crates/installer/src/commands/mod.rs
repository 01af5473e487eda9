//! CLI subcommands.
//!
//! Commands translate flags into store keys, build the collaborators for the
//! configured cloud and git host, and hand a plan to the pipeline.

pub mod destroy;
pub mod install;
pub mod reset;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use k1_scm::github::device_flow::DeviceFlow;
use k1_scm::github::GitHub;
use k1_scm::gitlab::GitLab;
use k1_scm::softserve::SoftServe;
use k1_scm::{GitHost, GitProviderKind};

use crate::dns::HickoryResolver;
use crate::kube::KubeClients;
use crate::orchestrator::session::SOFT_SERVE_LOCAL_PORT;
use crate::orchestrator::Collaborators;
use crate::state::{keys, InstallationState, K1Paths};
use crate::store::ConfigStore;
use crate::ui;

/// OAuth app used for the GitHub device flow.
const GITHUB_OAUTH_CLIENT_ID: &str = "2ced340927e0a6c49a45";

/// Environment variables checked for a git host token, in order.
const GITHUB_TOKEN_VARS: [&str; 2] = ["KUBEFIRST_GITHUB_AUTH_TOKEN", "GITHUB_TOKEN"];
const GITLAB_TOKEN_VARS: [&str; 2] = ["KUBEFIRST_GITLAB_AUTH_TOKEN", "GITLAB_TOKEN"];

/// Options every command shares.
#[derive(Debug, Clone)]
pub struct GlobalArgs {
    pub config: PathBuf,
}

impl GlobalArgs {
    /// Open the configuration store.
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be parsed.
    pub fn open_store(&self) -> Result<ConfigStore> {
        ConfigStore::open(&self.config)
            .with_context(|| format!("Failed to open {}", self.config.display()))
    }
}

fn env_token(vars: &[&str]) -> Option<String> {
    vars.iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|value| !value.trim().is_empty())
}

/// Resolve the git host token from the store, the environment or, for
/// GitHub in interactive sessions, the device flow. The token is staged in
/// the store so a resumed run does not ask again.
async fn resolve_git_token(
    store: &mut ConfigStore,
    git: GitProviderKind,
    interactive: bool,
) -> Result<Option<String>> {
    if let Some(token) = store.get_string(keys::GIT_TOKEN) {
        return Ok(Some(token));
    }
    let token = match git {
        GitProviderKind::SoftServe => return Ok(None),
        GitProviderKind::Gitlab => env_token(&GITLAB_TOKEN_VARS),
        GitProviderKind::Github => match env_token(&GITHUB_TOKEN_VARS) {
            Some(token) => Some(token),
            None if interactive => {
                let flow = DeviceFlow::new(GITHUB_OAUTH_CLIENT_ID)?;
                let token = flow
                    .authorize(|code| {
                        ui::print_info(&format!(
                            "Open {} and enter the code {}",
                            code.verification_uri, code.code
                        ));
                    })
                    .await
                    .context("GitHub device authorization failed")?;
                Some(token)
            }
            None => None,
        },
    };
    let Some(token) = token else {
        bail!(
            "No {git} token found; set {} or run interactively",
            match git {
                GitProviderKind::Gitlab => GITLAB_TOKEN_VARS[1],
                _ => GITHUB_TOKEN_VARS[0],
            }
        );
    };
    store.set(keys::GIT_TOKEN, token.as_str());
    Ok(Some(token))
}

/// Build the cloud, git host, resolver and cluster clients for `state`.
///
/// GitLab owner groups are resolved to their numeric id here and staged in
/// the store, since templates and Terraform need the id.
///
/// # Errors
/// Returns error if credentials are missing or the git host rejects them.
pub async fn collaborators(
    store: &mut ConfigStore,
    state: &mut InstallationState,
    paths: &K1Paths,
    interactive: bool,
) -> Result<Collaborators> {
    let cloud = k1_cloud::provider_from_env(state.cloud, &state.cloud_region)
        .context("Cloud credentials are not configured")?;

    let token = resolve_git_token(store, state.git, interactive).await?;
    let git: Arc<dyn GitHost> = match (state.git, token) {
        (GitProviderKind::Github, Some(token)) => Arc::new(GitHub::new(&state.git_owner, token)?),
        (GitProviderKind::Gitlab, Some(token)) => {
            let gitlab = GitLab::new(&state.git_host, &state.git_owner, token)?;
            if state.gitlab_group_id.is_none() {
                let id = gitlab
                    .group_id()
                    .await
                    .with_context(|| format!("GitLab group '{}' not found", state.git_owner))?;
                store.set(keys::GITLAB_GROUP_ID, i64::try_from(id).unwrap_or(i64::MAX));
                state.gitlab_group_id = Some(id);
            }
            Arc::new(gitlab)
        }
        (GitProviderKind::SoftServe, _) => {
            Arc::new(SoftServe::new(paths.bot_private_key()).with_port(SOFT_SERVE_LOCAL_PORT))
        }
        (git, None) => bail!("No {git} token available"),
    };

    Ok(Collaborators {
        cloud: Arc::from(cloud),
        git,
        resolver: Arc::new(HickoryResolver::new()),
        kube: KubeClients::new(),
    })
}
