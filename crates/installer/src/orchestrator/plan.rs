//! Install and destroy plans.
//!
//! A plan is the ordered list of steps for one installation shape (cloud,
//! git host, destroy options). Steps that do not apply to the shape are left
//! out when the plan is built, so the order of the remaining steps is the
//! execution order.

use std::fmt;

use k1_cloud::CloudKind;
use k1_scm::GitProviderKind;

use crate::terraform::{checkpoint_key, TerraformAction};

/// Every step either pipeline can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepId {
    // Install
    Validate,
    DownloadTools,
    LivenessRecord,
    LivenessVerify,
    CloudIdentity,
    StateStoreBucket,
    ArtifactsBucket,
    HydrateGitops,
    HydrateMetaphor,
    BotKeys,
    CreateRepos,
    PushGitops,
    PushMetaphor,
    UploadBotKey,
    TerraformBase,
    LocalTls,
    LocalCluster,
    InstallArgoCd,
    InstallSoftServe,
    SoftServeTunnel,
    ConfigureSoftServe,
    ArgoCdTunnel,
    InitialRepository,
    ApplyRegistry,
    ArgoCdCredentials,
    SyncRegistry,
    VaultTunnel,
    VaultUnseal,
    TerraformVault,
    TerraformUsers,
    K1Ready,
    DeployMetaphor,
    Complete,
    Handoff,

    // Destroy
    RemoveRegistry,
    DrainLoadBalancers,
    DestroyUsers,
    DestroyVault,
    DestroyBase,
    DeleteLocalCluster,
    DeleteBotKey,
    DeleteBuckets,
    DeleteLivenessRecord,
}

impl StepId {
    /// Human-readable description for progress output.
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::Validate => "Validating configuration",
            Self::DownloadTools => "Downloading tools",
            Self::LivenessRecord => "Creating DNS liveness record",
            Self::LivenessVerify => "Verifying DNS propagation",
            Self::CloudIdentity => "Identifying cloud account",
            Self::StateStoreBucket => "Creating Terraform state bucket",
            Self::ArtifactsBucket => "Creating artifacts bucket",
            Self::HydrateGitops => "Preparing gitops repository",
            Self::HydrateMetaphor => "Preparing metaphor repository",
            Self::BotKeys => "Generating bot SSH keys",
            Self::CreateRepos => "Creating git repositories",
            Self::PushGitops => "Pushing gitops repository",
            Self::PushMetaphor => "Pushing metaphor repository",
            Self::UploadBotKey => "Uploading bot SSH key",
            Self::TerraformBase => "Provisioning cloud infrastructure",
            Self::LocalTls => "Issuing local TLS certificate",
            Self::LocalCluster => "Creating k3d cluster",
            Self::InstallArgoCd => "Installing ArgoCD",
            Self::InstallSoftServe => "Installing soft-serve",
            Self::SoftServeTunnel => "Connecting to soft-serve",
            Self::ConfigureSoftServe => "Configuring soft-serve access",
            Self::ArgoCdTunnel => "Connecting to ArgoCD",
            Self::InitialRepository => "Registering gitops repository with ArgoCD",
            Self::ApplyRegistry => "Applying registry application",
            Self::ArgoCdCredentials => "Waiting for ArgoCD and logging in",
            Self::SyncRegistry => "Syncing registry application",
            Self::VaultTunnel => "Connecting to Vault",
            Self::VaultUnseal => "Initializing and unsealing Vault",
            Self::TerraformVault => "Configuring Vault",
            Self::TerraformUsers => "Creating users",
            Self::K1Ready => "Waiting for platform applications",
            Self::DeployMetaphor => "Deploying metaphor",
            Self::Complete => "Recording completion",
            Self::Handoff => "Summary",
            Self::RemoveRegistry => "Removing ArgoCD registry application",
            Self::DrainLoadBalancers => "Waiting for load balancers to drain",
            Self::DestroyUsers => "Destroying users",
            Self::DestroyVault => "Destroying Vault configuration",
            Self::DestroyBase => "Destroying cloud infrastructure",
            Self::DeleteLocalCluster => "Deleting k3d cluster",
            Self::DeleteBotKey => "Removing bot SSH key",
            Self::DeleteBuckets => "Deleting buckets",
            Self::DeleteLivenessRecord => "Removing DNS liveness record",
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How a step relates to the configuration store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKind {
    /// Runs once; completion is recorded under the key.
    Checkpointed(String),
    /// Re-established on every run while a later checkpointed step is pending.
    Session,
    /// Runs on every invocation.
    Always,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub id: StepId,
    pub kind: StepKind,
    /// Mutates a cloud, git host or cluster; skipped under dry-run.
    pub external: bool,
}

impl Step {
    fn checkpointed(id: StepId, checkpoint: impl Into<String>, external: bool) -> Self {
        Self {
            id,
            kind: StepKind::Checkpointed(checkpoint.into()),
            external,
        }
    }

    fn session(id: StepId) -> Self {
        Self {
            id,
            kind: StepKind::Session,
            external: false,
        }
    }

    fn always(id: StepId) -> Self {
        Self {
            id,
            kind: StepKind::Always,
            external: false,
        }
    }

    #[must_use]
    pub fn checkpoint(&self) -> Option<&str> {
        match &self.kind {
            StepKind::Checkpointed(key) => Some(key),
            _ => None,
        }
    }
}

/// Installation shape a plan is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanShape {
    pub cloud: CloudKind,
    pub git: GitProviderKind,
}

impl PlanShape {
    fn local(self) -> bool {
        self.cloud.is_local()
    }

    fn hosted_git(self) -> bool {
        self.git != GitProviderKind::SoftServe
    }

    fn git_tag(self) -> &'static str {
        self.git.as_str()
    }
}

/// Install steps in execution order.
#[must_use]
pub fn install_plan(shape: PlanShape) -> Vec<Step> {
    use StepId as S;

    let git = shape.git_tag();
    let mut steps = vec![
        Step::session(S::Validate),
        Step::checkpointed(S::DownloadTools, "tools.downloaded", false),
    ];

    if !shape.local() {
        steps.extend([
            Step::checkpointed(S::LivenessRecord, "dns.liveness-record.created", true),
            Step::checkpointed(S::LivenessVerify, "dns.liveness.verified", true),
            Step::checkpointed(S::CloudIdentity, "cloud.identity.fetched", true),
            Step::checkpointed(S::StateStoreBucket, "bucket.state-store.created", true),
            Step::checkpointed(S::ArtifactsBucket, "bucket.artifacts.created", true),
        ]);
    }

    steps.extend([
        Step::checkpointed(S::HydrateGitops, format!("{git}.gitops.hydrated"), false),
        Step::checkpointed(S::HydrateMetaphor, format!("{git}.metaphor.hydrated"), false),
        Step::checkpointed(S::BotKeys, "ssh.bot-keys.created", false),
    ]);

    if shape.hosted_git() {
        steps.extend([
            Step::checkpointed(S::CreateRepos, format!("{git}.repos.created"), true),
            Step::checkpointed(S::PushGitops, format!("{git}.gitops.pushed"), true),
            Step::checkpointed(S::PushMetaphor, format!("{git}.metaphor.pushed"), true),
            Step::checkpointed(S::UploadBotKey, format!("{git}.bot-key.uploaded"), true),
        ]);
    }

    if shape.local() {
        steps.extend([
            Step::checkpointed(S::LocalTls, "k3d.ssl.created", false),
            Step::checkpointed(S::LocalCluster, "k3d.cluster.created", true),
            Step::checkpointed(S::InstallArgoCd, "argocd.helm.installed", true),
        ]);
    } else {
        steps.push(Step::checkpointed(
            S::TerraformBase,
            checkpoint_key("base", TerraformAction::Apply),
            true,
        ));
    }

    if !shape.hosted_git() {
        steps.extend([
            Step::checkpointed(S::InstallSoftServe, "soft-serve.created", true),
            Step::session(S::SoftServeTunnel),
            Step::checkpointed(S::ConfigureSoftServe, "soft-serve.configured", true),
            Step::checkpointed(S::PushGitops, format!("{git}.gitops.pushed"), true),
            Step::checkpointed(S::PushMetaphor, format!("{git}.metaphor.pushed"), true),
        ]);
    }

    steps.extend([
        Step::session(S::ArgoCdTunnel),
        Step::checkpointed(S::InitialRepository, "argocd.initial-repository.created", true),
        Step::checkpointed(S::ApplyRegistry, "argocd.registry.applied", true),
        Step::checkpointed(S::ArgoCdCredentials, "argocd.credentials.set", true),
        Step::checkpointed(S::SyncRegistry, "argocd.registry.synced", true),
        Step::session(S::VaultTunnel),
        Step::checkpointed(S::VaultUnseal, "vault.unsealed", true),
        Step::checkpointed(
            S::TerraformVault,
            checkpoint_key("vault", TerraformAction::Apply),
            true,
        ),
        Step::checkpointed(
            S::TerraformUsers,
            checkpoint_key("users", TerraformAction::Apply),
            true,
        ),
        Step::checkpointed(S::K1Ready, "argocd.k1-ready.synced", true),
        Step::checkpointed(S::DeployMetaphor, "metaphor.deployed", true),
        Step::checkpointed(S::Complete, "installation.complete", false),
        Step::always(S::Handoff),
    ]);

    steps
}

/// Destroy options that shape the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestroyOptions {
    pub purge_buckets: bool,
}

/// Destroy steps in execution order.
#[must_use]
pub fn destroy_plan(shape: PlanShape, options: DestroyOptions) -> Vec<Step> {
    use StepId as S;

    let mut steps = vec![
        Step::session(S::Validate),
        Step::session(S::ArgoCdTunnel),
        Step::checkpointed(S::RemoveRegistry, "destroy.registry.removed", true),
    ];

    if !shape.local() {
        steps.push(Step::checkpointed(
            S::DrainLoadBalancers,
            "destroy.load-balancers.drained",
            true,
        ));
    }

    steps.extend([
        Step::session(S::VaultTunnel),
        Step::checkpointed(
            S::DestroyUsers,
            checkpoint_key("users", TerraformAction::Destroy),
            true,
        ),
        Step::checkpointed(
            S::DestroyVault,
            checkpoint_key("vault", TerraformAction::Destroy),
            true,
        ),
    ]);

    if shape.local() {
        steps.push(Step::checkpointed(
            S::DeleteLocalCluster,
            "k3d.cluster.deleted",
            true,
        ));
    } else {
        steps.push(Step::checkpointed(
            S::DestroyBase,
            checkpoint_key("base", TerraformAction::Destroy),
            true,
        ));
    }

    if shape.hosted_git() {
        steps.push(Step::checkpointed(
            S::DeleteBotKey,
            format!("{}.bot-key.deleted", shape.git_tag()),
            true,
        ));
    }

    if !shape.local() {
        if options.purge_buckets {
            steps.push(Step::checkpointed(
                S::DeleteBuckets,
                "destroy.buckets.deleted",
                true,
            ));
        }
        steps.push(Step::checkpointed(
            S::DeleteLivenessRecord,
            "destroy.liveness-record.deleted",
            true,
        ));
    }

    steps
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(steps: &[Step]) -> Vec<StepId> {
        steps.iter().map(|s| s.id).collect()
    }

    fn position(steps: &[Step], id: StepId) -> usize {
        steps.iter().position(|s| s.id == id).unwrap()
    }

    const AWS_GITHUB: PlanShape = PlanShape {
        cloud: CloudKind::Aws,
        git: GitProviderKind::Github,
    };

    #[test]
    fn test_cloud_plan_follows_bring_up_order() {
        let plan = install_plan(AWS_GITHUB);
        let order = [
            StepId::DownloadTools,
            StepId::LivenessRecord,
            StepId::CloudIdentity,
            StepId::HydrateGitops,
            StepId::BotKeys,
            StepId::PushGitops,
            StepId::TerraformBase,
            StepId::ArgoCdTunnel,
            StepId::InitialRepository,
            StepId::SyncRegistry,
            StepId::VaultUnseal,
            StepId::TerraformVault,
            StepId::TerraformUsers,
            StepId::K1Ready,
            StepId::DeployMetaphor,
        ];
        let positions: Vec<usize> = order.iter().map(|id| position(&plan, *id)).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{positions:?}");
        assert!(!ids(&plan).contains(&StepId::LocalCluster));
    }

    #[test]
    fn test_checkpoint_names() {
        let plan = install_plan(AWS_GITHUB);
        let checkpoints: Vec<&str> = plan.iter().filter_map(Step::checkpoint).collect();
        assert!(checkpoints.contains(&"terraform.base.apply.complete"));
        assert!(checkpoints.contains(&"github.gitops.pushed"));
        assert!(checkpoints.contains(&"argocd.initial-repository.created"));

        let mut unique = checkpoints.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), checkpoints.len());
    }

    #[test]
    fn test_local_soft_serve_pushes_after_cluster() {
        let plan = install_plan(PlanShape {
            cloud: CloudKind::K3d,
            git: GitProviderKind::SoftServe,
        });
        assert!(position(&plan, StepId::LocalCluster) < position(&plan, StepId::PushGitops));
        assert!(
            position(&plan, StepId::ConfigureSoftServe) < position(&plan, StepId::PushGitops)
        );
        let ids = ids(&plan);
        assert!(!ids.contains(&StepId::LivenessRecord));
        assert!(!ids.contains(&StepId::CreateRepos));
        assert!(!ids.contains(&StepId::TerraformBase));
    }

    #[test]
    fn test_destroy_plan_order_and_options() {
        let plan = destroy_plan(AWS_GITHUB, DestroyOptions { purge_buckets: false });
        assert!(position(&plan, StepId::RemoveRegistry) < position(&plan, StepId::DestroyUsers));
        assert!(position(&plan, StepId::DestroyUsers) < position(&plan, StepId::DestroyVault));
        assert!(position(&plan, StepId::DestroyVault) < position(&plan, StepId::DestroyBase));
        assert!(!ids(&plan).contains(&StepId::DeleteBuckets));
        assert_eq!(plan.last().unwrap().id, StepId::DeleteLivenessRecord);

        let purge = destroy_plan(AWS_GITHUB, DestroyOptions { purge_buckets: true });
        assert!(ids(&purge).contains(&StepId::DeleteBuckets));
    }
}
