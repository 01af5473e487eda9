//! Resume, retry and dry-run behavior of the checkpointed pipeline.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use k1_cli::orchestrator::{
    destroy_plan, install_plan, DestroyOptions, Pipeline, PlanShape, StepExecutor, StepId,
};
use k1_cli::kube::readiness::ReadinessError;
use k1_cli::{ConfigStore, InstallError, RetryConfig};
use k1_cloud::CloudKind;
use k1_scm::{GitProviderKind, ScmError};

const AWS_GITHUB: PlanShape = PlanShape {
    cloud: CloudKind::Aws,
    git: GitProviderKind::Github,
};

/// Records every step; fails `fail_at` with a fixed error `failures` times.
#[derive(Default)]
struct Recorder {
    calls: Vec<StepId>,
    fail_at: Option<StepId>,
    failures: u32,
    retryable: bool,
}

impl Recorder {
    fn failing(step: StepId, failures: u32, retryable: bool) -> Self {
        Self {
            fail_at: Some(step),
            failures,
            retryable,
            ..Self::default()
        }
    }
}

#[async_trait]
impl StepExecutor for Recorder {
    async fn execute(&mut self, step: StepId, _store: &mut ConfigStore) -> Result<(), InstallError> {
        self.calls.push(step);
        if self.fail_at == Some(step) && self.failures > 0 {
            self.failures -= 1;
            return Err(if self.retryable {
                ScmError::Timeout {
                    what: "repository creation".to_string(),
                    attempts: 1,
                }
                .into()
            } else {
                InstallError::step(step.to_string(), "boom")
            });
        }
        Ok(())
    }
}

/// Executor that must never be reached.
struct Unreachable;

#[async_trait]
impl StepExecutor for Unreachable {
    async fn execute(&mut self, step: StepId, _store: &mut ConfigStore) -> Result<(), InstallError> {
        match step {
            StepId::Validate | StepId::ArgoCdTunnel | StepId::VaultTunnel | StepId::Handoff => Ok(()),
            other => panic!("external step {other} executed during dry run"),
        }
    }
}

/// Times out waiting for ArgoCD `timeouts` times, the way a real wait does:
/// the elapsed time overshoots the deadline it was given.
struct SlowArgoCd {
    calls: Vec<StepId>,
    timeouts: u32,
    deadline: Duration,
}

#[async_trait]
impl StepExecutor for SlowArgoCd {
    async fn execute(&mut self, step: StepId, _store: &mut ConfigStore) -> Result<(), InstallError> {
        self.calls.push(step);
        if step == StepId::ArgoCdCredentials && self.timeouts > 0 {
            self.timeouts -= 1;
            return Err(ReadinessError::Timeout {
                kind: "deployment",
                name: "argocd/argocd-server".to_string(),
                timeout: self.deadline,
                elapsed: self.deadline + Duration::from_millis(412),
            }
            .into());
        }
        Ok(())
    }
}

fn open(path: &Path) -> ConfigStore {
    ConfigStore::open(path).unwrap()
}

#[tokio::test]
async fn test_failed_run_resumes_at_failed_step() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".kubefirst");
    let pipeline = Pipeline::new("Installation", install_plan(AWS_GITHUB));

    let mut first = Recorder::failing(StepId::TerraformBase, 1, false);
    let err = pipeline
        .run(&mut first, &mut open(&path))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "StepError");
    assert_eq!(first.calls.last(), Some(&StepId::TerraformBase));

    let store = open(&path);
    for step in pipeline.steps() {
        if step.id == StepId::TerraformBase {
            break;
        }
        if let Some(cp) = step.checkpoint() {
            assert!(store.checkpoint(cp), "{cp} not persisted");
        }
    }
    assert!(!store.checkpoint("terraform.base.apply.complete"));

    let mut second = Recorder::default();
    let report = pipeline.run(&mut second, &mut open(&path)).await.unwrap();
    assert_eq!(second.calls[0], StepId::Validate);
    assert_eq!(second.calls[1], StepId::TerraformBase);
    assert!(!second.calls.contains(&StepId::CreateRepos));
    assert!(!second.calls.contains(&StepId::LivenessRecord));
    assert!(report.skipped.contains(&StepId::PushGitops));
    assert!(open(&path).checkpoint("installation.complete"));
}

#[tokio::test]
async fn test_completed_install_only_prints_handoff() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".kubefirst");
    let pipeline = Pipeline::new("Installation", install_plan(AWS_GITHUB));

    pipeline
        .run(&mut Recorder::default(), &mut open(&path))
        .await
        .unwrap();

    let mut again = Recorder::default();
    pipeline.run(&mut again, &mut open(&path)).await.unwrap();
    assert_eq!(again.calls, vec![StepId::Handoff]);
}

#[tokio::test]
async fn test_retryable_error_is_retried_within_budget() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".kubefirst");
    let pipeline = Pipeline::new("Installation", install_plan(AWS_GITHUB))
        .with_retry(RetryConfig::immediate(2));

    let mut executor = Recorder::failing(StepId::CreateRepos, 2, true);
    pipeline.run(&mut executor, &mut open(&path)).await.unwrap();
    let attempts = executor
        .calls
        .iter()
        .filter(|s| **s == StepId::CreateRepos)
        .count();
    assert_eq!(attempts, 3);
}

#[tokio::test]
async fn test_retry_budget_exhausted_aborts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".kubefirst");
    let pipeline = Pipeline::new("Installation", install_plan(AWS_GITHUB))
        .with_retry(RetryConfig::immediate(1));

    let mut executor = Recorder::failing(StepId::CreateRepos, 5, true);
    let err = pipeline
        .run(&mut executor, &mut open(&path))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "GitTimeoutError");
    assert!(!open(&path).checkpoint("github.repos.created"));
    assert!(open(&path).checkpoint("ssh.bot-keys.created"));
}

#[tokio::test]
async fn test_non_retryable_error_is_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".kubefirst");
    let pipeline = Pipeline::new("Installation", install_plan(AWS_GITHUB))
        .with_retry(RetryConfig::immediate(5));

    let mut executor = Recorder::failing(StepId::HydrateGitops, 1, false);
    pipeline
        .run(&mut executor, &mut open(&path))
        .await
        .unwrap_err();
    let attempts = executor
        .calls
        .iter()
        .filter(|s| **s == StepId::HydrateGitops)
        .count();
    assert_eq!(attempts, 1);
}

#[tokio::test]
async fn test_dry_run_marks_external_steps_without_running_them() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".kubefirst");
    let plan: Vec<_> = install_plan(AWS_GITHUB)
        .into_iter()
        .filter(|step| step.external || step.checkpoint().is_none())
        .collect();
    let pipeline = Pipeline::new("Installation", plan).dry_run(true);

    pipeline.run(&mut Unreachable, &mut open(&path)).await.unwrap();

    let store = open(&path);
    for cp in pipeline.steps().iter().filter_map(|s| s.checkpoint()) {
        assert!(store.checkpoint(cp), "{cp} not marked");
    }
}

#[tokio::test]
async fn test_destroy_after_partial_install_resumes_independently() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".kubefirst");
    let options = DestroyOptions {
        purge_buckets: true,
    };
    let pipeline = Pipeline::new("Destroy", destroy_plan(AWS_GITHUB, options));

    let mut first = Recorder::failing(StepId::DestroyBase, 1, false);
    pipeline
        .run(&mut first, &mut open(&path))
        .await
        .unwrap_err();
    assert!(open(&path).checkpoint("destroy.registry.removed"));

    let mut second = Recorder::default();
    pipeline.run(&mut second, &mut open(&path)).await.unwrap();
    assert!(!second.calls.contains(&StepId::RemoveRegistry));
    assert!(second.calls.contains(&StepId::DestroyBase));
    assert_eq!(second.calls.last(), Some(&StepId::DeleteLivenessRecord));
}

#[tokio::test]
async fn test_crash_after_base_reopens_tunnel_before_registry() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".kubefirst");
    let pipeline = Pipeline::new("Installation", install_plan(AWS_GITHUB));

    let mut first = Recorder::failing(StepId::InitialRepository, 1, false);
    pipeline
        .run(&mut first, &mut open(&path))
        .await
        .unwrap_err();

    let store = open(&path);
    assert!(store.checkpoint("terraform.base.apply.complete"));
    assert!(!store.checkpoint("argocd.initial-repository.created"));

    let mut resumed = Recorder::default();
    pipeline.run(&mut resumed, &mut open(&path)).await.unwrap();
    assert_eq!(
        &resumed.calls[..3],
        &[
            StepId::Validate,
            StepId::ArgoCdTunnel,
            StepId::InitialRepository
        ]
    );
    assert!(!resumed.calls.contains(&StepId::TerraformBase));
}

#[tokio::test]
async fn test_local_crash_after_argocd_install_reopens_tunnel() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".kubefirst");
    let shape = PlanShape {
        cloud: CloudKind::K3d,
        git: GitProviderKind::Github,
    };
    let pipeline = Pipeline::new("Installation", install_plan(shape));

    let mut first = Recorder::failing(StepId::InitialRepository, 1, false);
    pipeline
        .run(&mut first, &mut open(&path))
        .await
        .unwrap_err();
    assert!(open(&path).checkpoint("argocd.helm.installed"));

    let mut resumed = Recorder::default();
    pipeline.run(&mut resumed, &mut open(&path)).await.unwrap();
    assert_eq!(
        &resumed.calls[..3],
        &[
            StepId::Validate,
            StepId::ArgoCdTunnel,
            StepId::InitialRepository
        ]
    );
    assert!(!resumed.calls.contains(&StepId::InstallArgoCd));
}

#[tokio::test]
async fn test_argocd_readiness_timeout_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".kubefirst");
    let pipeline = Pipeline::new("Installation", install_plan(AWS_GITHUB))
        .with_retry(RetryConfig::immediate(2));

    let mut executor = SlowArgoCd {
        calls: Vec::new(),
        timeouts: 1,
        deadline: Duration::from_secs(300),
    };
    pipeline.run(&mut executor, &mut open(&path)).await.unwrap();
    let attempts = executor
        .calls
        .iter()
        .filter(|s| **s == StepId::ArgoCdCredentials)
        .count();
    assert_eq!(attempts, 2);
    assert!(open(&path).checkpoint("argocd.credentials.set"));
}

#[tokio::test]
async fn test_long_readiness_timeout_is_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".kubefirst");
    let pipeline = Pipeline::new("Installation", install_plan(AWS_GITHUB))
        .with_retry(RetryConfig::immediate(2));

    let mut executor = SlowArgoCd {
        calls: Vec::new(),
        timeouts: 1,
        deadline: Duration::from_secs(900),
    };
    let err = pipeline
        .run(&mut executor, &mut open(&path))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "ReadinessTimeout");
    let attempts = executor
        .calls
        .iter()
        .filter(|s| **s == StepId::ArgoCdCredentials)
        .count();
    assert_eq!(attempts, 1);
}
