use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use super::{collaborators, GlobalArgs};
use crate::orchestrator::{install_plan, InstallExecutor, Pipeline, PlanShape, Session};
use crate::state::{keys, InstallationState, K1Paths};
use crate::store::ConfigStore;
use crate::ui;

/// Install a kubefirst management cluster
#[derive(Args, Debug)]
pub struct InstallCommand {
    /// Cloud to provision on (aws, digitalocean, vultr, k3d)
    #[arg(long, value_name = "CLOUD")]
    cloud_provider: Option<String>,

    /// Cloud region
    #[arg(long, value_name = "REGION")]
    cloud_region: Option<String>,

    /// Name of the cluster to create
    #[arg(long, value_name = "NAME")]
    cluster_name: Option<String>,

    /// Cluster type (mgmt or workload)
    #[arg(long, value_name = "TYPE")]
    cluster_type: Option<String>,

    /// Domain served by the cloud's DNS (e.g. example.com)
    #[arg(long, value_name = "DOMAIN")]
    domain_name: Option<String>,

    /// Git host (github, gitlab, soft-serve)
    #[arg(long, value_name = "PROVIDER")]
    git_provider: Option<String>,

    /// Organization, user or group owning the new repositories
    #[arg(long, value_name = "OWNER", visible_aliases = ["github-owner", "gitlab-owner"])]
    git_owner: Option<String>,

    /// Git host name for self-managed GitLab
    #[arg(long, value_name = "HOST")]
    git_host: Option<String>,

    /// Email for certificate notifications
    #[arg(long, value_name = "EMAIL")]
    alerts_email: Option<String>,

    /// GitOps template repository
    #[arg(long, value_name = "URL")]
    gitops_template_url: Option<String>,

    /// GitOps template branch or tag
    #[arg(long, value_name = "REF", alias = "gitops-template-branch")]
    gitops_template_ref: Option<String>,

    /// Metaphor template repository
    #[arg(long, value_name = "URL")]
    metaphor_template_url: Option<String>,

    /// Metaphor template branch or tag
    #[arg(long, value_name = "REF", alias = "metaphor-template-branch")]
    metaphor_template_ref: Option<String>,

    /// Node capacity type for AWS node groups (ON_DEMAND or SPOT)
    #[arg(long, value_name = "TYPE")]
    node_capacity_type: Option<String>,

    /// Plan and render everything without touching cloud, git host or cluster
    #[arg(long)]
    dry_run: bool,

    /// Emit a completion event
    #[arg(long)]
    use_telemetry: bool,

    /// Disable interactive features (device flow, prompts)
    #[arg(long)]
    ci: bool,
}

impl InstallCommand {
    fn apply_flags(&self, store: &mut ConfigStore) {
        let strings = [
            (keys::CLOUD_PROVIDER, &self.cloud_provider),
            (keys::CLOUD_REGION, &self.cloud_region),
            (keys::CLUSTER_NAME, &self.cluster_name),
            (keys::CLUSTER_TYPE, &self.cluster_type),
            (keys::DOMAIN_NAME, &self.domain_name),
            (keys::GIT_PROVIDER, &self.git_provider),
            (keys::GIT_OWNER, &self.git_owner),
            (keys::GIT_HOST, &self.git_host),
            (keys::ALERTS_EMAIL, &self.alerts_email),
            (keys::GITOPS_TEMPLATE_URL, &self.gitops_template_url),
            (keys::GITOPS_TEMPLATE_REF, &self.gitops_template_ref),
            (keys::METAPHOR_TEMPLATE_URL, &self.metaphor_template_url),
            (keys::METAPHOR_TEMPLATE_REF, &self.metaphor_template_ref),
            (keys::NODE_CAPACITY_TYPE, &self.node_capacity_type),
        ];
        for (key, value) in strings {
            if let Some(value) = value {
                store.set_flag(key, value.as_str());
            }
        }
        if self.dry_run {
            store.set_flag(keys::DRY_RUN, true);
        }
        if self.use_telemetry {
            store.set_flag(keys::USE_TELEMETRY, true);
        }
    }

    pub async fn run(&self, global: &GlobalArgs) -> Result<()> {
        ui::print_banner();
        let mut store = global.open_store()?;
        self.apply_flags(&mut store);

        let mut state =
            InstallationState::from_store(&mut store).context("Invalid installation settings")?;
        let paths = K1Paths::from_home()?;
        paths.ensure().context("Failed to create ~/.k1")?;

        ui::print_section("Installation");
        ui::print_kv("Cluster", &state.cluster_name);
        ui::print_kv("Domain", &state.domain);
        ui::print_kv("Cloud", state.cloud.as_str());
        ui::print_kv("Git", state.git.as_str());
        if state.dry_run {
            ui::print_warning("Dry run: cloud, git host and cluster changes are skipped");
        }

        let deps = collaborators(&mut store, &mut state, &paths, !self.ci).await?;
        store.flush()?;

        let shape = PlanShape {
            cloud: state.cloud,
            git: state.git,
        };
        let pipeline = Pipeline::new("Installation", install_plan(shape)).dry_run(state.dry_run);
        let mut executor = InstallExecutor::new(Session::new(state, paths, deps));

        let result = pipeline.run(&mut executor, &mut store).await;
        executor.shutdown().await;
        let report = result?;

        info!(
            executed = report.executed.len(),
            skipped = report.skipped.len(),
            "Installation finished"
        );
        ui::print_success("Installation complete");
        Ok(())
    }
}
