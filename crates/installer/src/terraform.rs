//! Terraform runner.
//!
//! Runs `terraform init` and `terraform <apply|destroy> -auto-approve` in an
//! entrypoint directory of the gitops repository with an injected
//! environment. The runner holds no state; the caller checkpoints on success
//! under [`checkpoint_key`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::exec::{ExecError, Executor, Invocation};

/// Deadline for `terraform init`.
const INIT_TIMEOUT: Duration = Duration::from_secs(600);

/// Deadline for `terraform apply` / `destroy`.
const ACTION_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Errors raised by the runner.
#[derive(Error, Debug)]
pub enum TerraformError {
    /// Terraform exited non-zero or timed out.
    #[error("terraform {action} failed for {entrypoint}: {stderr_tail}")]
    Exec {
        entrypoint: String,
        action: TerraformAction,
        stderr_tail: String,
    },

    /// The caller did not supply a variable the module needs.
    #[error("terraform {entrypoint} is missing environment variable {key}")]
    MissingEnv { entrypoint: String, key: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Terraform verbs the installer uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerraformAction {
    Apply,
    Destroy,
}

impl TerraformAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        }
    }
}

impl fmt::Display for TerraformAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checkpoint written when `action` completes for `entrypoint`.
#[must_use]
pub fn checkpoint_key(entrypoint: &str, action: TerraformAction) -> String {
    format!("terraform.{entrypoint}.{action}.complete")
}

/// One module run.
#[derive(Debug, Clone)]
pub struct TerraformRun {
    /// Short name (`base`, `vault`, `users`).
    pub entrypoint: String,
    /// Module directory.
    pub dir: PathBuf,
    pub action: TerraformAction,
    /// Extra environment merged over the ambient one.
    pub env: BTreeMap<String, String>,
    /// Keys `env` must contain.
    pub required_env: Vec<String>,
}

/// Wraps the terraform binary.
#[derive(Debug, Clone)]
pub struct TerraformRunner {
    binary: PathBuf,
    dry_run: bool,
}

impl TerraformRunner {
    pub fn new(binary: impl Into<PathBuf>, dry_run: bool) -> Self {
        Self {
            binary: binary.into(),
            dry_run,
        }
    }

    /// Run `init` then the action, streaming output.
    ///
    /// # Errors
    /// Returns [`TerraformError::Exec`] carrying the stderr tail on failure.
    pub async fn run(&self, run: &TerraformRun) -> Result<(), TerraformError> {
        if let Some(key) = run.required_env.iter().find(|k| !run.env.contains_key(*k)) {
            return Err(TerraformError::MissingEnv {
                entrypoint: run.entrypoint.clone(),
                key: key.clone(),
            });
        }

        if self.dry_run {
            info!(entrypoint = %run.entrypoint, action = %run.action, "[dry-run] skipping terraform");
            return Ok(());
        }

        info!(entrypoint = %run.entrypoint, action = %run.action, dir = %run.dir.display(), "Running terraform");

        let init = Invocation::new(&self.binary)
            .args(["init", "-force-copy", "-input=false"])
            .envs(&run.env)
            .current_dir(&run.dir)
            .timeout(INIT_TIMEOUT);
        Executor
            .run_streaming(&init)
            .await
            .map_err(|e| Self::exec_error(run, &e))?;

        let action = Invocation::new(&self.binary)
            .args([run.action.as_str(), "-auto-approve", "-input=false"])
            .envs(&run.env)
            .current_dir(&run.dir)
            .timeout(ACTION_TIMEOUT);
        Executor
            .run_streaming(&action)
            .await
            .map_err(|e| Self::exec_error(run, &e))?;

        Self::clean(&run.dir).await?;
        info!(entrypoint = %run.entrypoint, action = %run.action, "Terraform complete");
        Ok(())
    }

    fn exec_error(run: &TerraformRun, e: &ExecError) -> TerraformError {
        TerraformError::Exec {
            entrypoint: run.entrypoint.clone(),
            action: run.action,
            stderr_tail: e
                .output()
                .map_or_else(|| e.to_string(), |o| o.stderr.clone()),
        }
    }

    /// Drop provider caches so the pushed repository stays small.
    async fn clean(dir: &Path) -> Result<(), TerraformError> {
        for name in [".terraform", ".terraform.lock.hcl"] {
            let path = dir.join(name);
            let result = if path.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            match result {
                Ok(()) => debug!(path = %path.display(), "Removed terraform cache"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_terraform(dir: &Path, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("terraform");
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn run_in(dir: &Path, env: &[(&str, &str)], required: &[&str]) -> TerraformRun {
        TerraformRun {
            entrypoint: "base".into(),
            dir: dir.to_path_buf(),
            action: TerraformAction::Apply,
            env: env
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            required_env: required.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn test_checkpoint_key() {
        assert_eq!(
            checkpoint_key("base", TerraformAction::Apply),
            "terraform.base.apply.complete"
        );
        assert_eq!(
            checkpoint_key("users", TerraformAction::Destroy),
            "terraform.users.destroy.complete"
        );
    }

    #[tokio::test]
    async fn test_missing_env_fails_before_running() {
        let dir = tempfile::tempdir().unwrap();
        let runner = TerraformRunner::new("/nonexistent/terraform", false);
        let err = runner
            .run(&run_in(dir.path(), &[], &["TF_VAR_aws_account_id"]))
            .await
            .unwrap_err();
        assert!(matches!(err, TerraformError::MissingEnv { ref key, .. } if key == "TF_VAR_aws_account_id"));
    }

    #[tokio::test]
    async fn test_apply_runs_init_then_action_and_cleans() {
        let bin = tempfile::tempdir().unwrap();
        let module = tempfile::tempdir().unwrap();
        std::fs::create_dir(module.path().join(".terraform")).unwrap();
        std::fs::write(module.path().join(".terraform.lock.hcl"), "").unwrap();
        let tf = fake_terraform(bin.path(), "echo \"$1 $K1_MARK\" >> calls.log");

        TerraformRunner::new(&tf, false)
            .run(&run_in(module.path(), &[("K1_MARK", "x")], &["K1_MARK"]))
            .await
            .unwrap();

        let calls = std::fs::read_to_string(module.path().join("calls.log")).unwrap();
        assert_eq!(calls, "init x\napply x\n");
        assert!(!module.path().join(".terraform").exists());
        assert!(!module.path().join(".terraform.lock.hcl").exists());
    }

    #[tokio::test]
    async fn test_failure_carries_stderr_tail() {
        let bin = tempfile::tempdir().unwrap();
        let module = tempfile::tempdir().unwrap();
        let tf = fake_terraform(
            bin.path(),
            "if [ \"$1\" = apply ]; then echo 'Error: quota exceeded' >&2; exit 1; fi",
        );

        let err = TerraformRunner::new(&tf, false)
            .run(&run_in(module.path(), &[], &[]))
            .await
            .unwrap_err();
        match err {
            TerraformError::Exec {
                entrypoint,
                action,
                stderr_tail,
            } => {
                assert_eq!(entrypoint, "base");
                assert_eq!(action, TerraformAction::Apply);
                assert!(stderr_tail.contains("quota exceeded"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_dry_run_does_not_execute() {
        let module = tempfile::tempdir().unwrap();
        TerraformRunner::new("/nonexistent/terraform", true)
            .run(&run_in(module.path(), &[], &[]))
            .await
            .unwrap();
    }
}
