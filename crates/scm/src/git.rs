//! `git` command line helpers shared by the drivers.
//!
//! Credentials never appear in argv or logs: HTTPS tokens travel in an
//! `http.extraHeader` passed through `GIT_CONFIG_*` environment variables and
//! SSH keys through `GIT_SSH_COMMAND`.

use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio::process::Command;
use tracing::{debug, info};

use crate::traits::{GitRepoIntent, PushAuth, ScmError};

/// Upper bound for a single git invocation.
const GIT_TIMEOUT_SECS: u64 = 300;

/// Author identity used for automation commits.
pub const BOT_NAME: &str = "kbot";

/// E-mail of the automation identity.
pub const BOT_EMAIL: &str = "kbot@kubefirst.com";

/// Environment that makes git authenticate as `auth`.
#[must_use]
pub fn auth_env(auth: &PushAuth) -> Vec<(String, String)> {
    match auth {
        PushAuth::Token { username, token } => {
            let basic = STANDARD.encode(format!("{username}:{token}"));
            vec![
                ("GIT_CONFIG_COUNT".to_string(), "1".to_string()),
                ("GIT_CONFIG_KEY_0".to_string(), "http.extraHeader".to_string()),
                (
                    "GIT_CONFIG_VALUE_0".to_string(),
                    format!("Authorization: Basic {basic}"),
                ),
                ("GIT_TERMINAL_PROMPT".to_string(), "0".to_string()),
            ]
        }
        PushAuth::SshKey { private_key_path } => vec![(
            "GIT_SSH_COMMAND".to_string(),
            format!(
                "ssh -i {} -o IdentitiesOnly=yes -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null",
                private_key_path.display()
            ),
        )],
    }
}

/// Run `git` in `cwd` and return stdout.
///
/// # Errors
/// Returns [`ScmError::Push`] carrying stderr on non-zero exit or timeout.
pub async fn run(cwd: &Path, args: &[&str], env: &[(String, String)]) -> Result<String, ScmError> {
    let mut cmd = Command::new("git");
    cmd.current_dir(cwd)
        .args(args)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .kill_on_drop(true);

    debug!(args = ?args, cwd = %cwd.display(), "Running git");
    let command = args.first().copied().unwrap_or_default().to_string();

    let output = tokio::time::timeout(Duration::from_secs(GIT_TIMEOUT_SECS), cmd.output())
        .await
        .map_err(|_| ScmError::Push {
            command: command.clone(),
            target: cwd.display().to_string(),
            stderr: format!("timed out after {GIT_TIMEOUT_SECS}s"),
        })??;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(ScmError::Push {
            command,
            target: cwd.display().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Commit everything in the working tree as the automation bot.
///
/// # Errors
/// Returns error if staging or committing fails.
pub async fn commit_all(cwd: &Path, message: &str) -> Result<(), ScmError> {
    run(cwd, &["add", "-A"], &[]).await?;
    let author = format!("user.name={BOT_NAME}");
    let email = format!("user.email={BOT_EMAIL}");
    run(
        cwd,
        &["-c", &author, "-c", &email, "commit", "--allow-empty", "-m", message],
        &[],
    )
    .await
    .map(|_| ())
}

/// Point `name` at `url`, replacing a previous definition.
///
/// # Errors
/// Returns error if the remote cannot be added.
pub async fn set_remote(cwd: &Path, name: &str, url: &str) -> Result<(), ScmError> {
    let existing = run(cwd, &["remote"], &[]).await?;
    if existing.lines().any(|r| r.trim() == name) {
        run(cwd, &["remote", "set-url", name, url], &[]).await?;
    } else {
        run(cwd, &["remote", "add", name, url], &[]).await?;
    }
    Ok(())
}

/// Push the intent's branch to its remote.
///
/// # Errors
/// Returns [`ScmError::Push`] if git rejects the push.
pub async fn push(intent: &GitRepoIntent) -> Result<(), ScmError> {
    set_remote(&intent.local_path, &intent.remote_name, &intent.remote_url).await?;
    info!(
        remote = %intent.remote_name,
        branch = %intent.branch,
        path = %intent.local_path.display(),
        "Pushing repository"
    );
    run(
        &intent.local_path,
        &["push", "-u", &intent.remote_name, &intent.branch],
        &auth_env(&intent.auth),
    )
    .await
    .map(|_| ())
    .map_err(|e| match e {
        ScmError::Push { stderr, .. } => ScmError::Push {
            command: "push".to_string(),
            target: intent.remote_url.clone(),
            stderr,
        },
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_token_auth_uses_header_not_url() {
        let env = auth_env(&PushAuth::Token {
            username: "kbot".into(),
            token: "t0k3n".into(),
        });
        let header = env
            .iter()
            .find(|(k, _)| k == "GIT_CONFIG_VALUE_0")
            .map(|(_, v)| v.clone())
            .unwrap();
        assert_eq!(
            header,
            format!("Authorization: Basic {}", STANDARD.encode("kbot:t0k3n"))
        );
    }

    #[test]
    fn test_ssh_auth_sets_identity() {
        let env = auth_env(&PushAuth::SshKey {
            private_key_path: PathBuf::from("/tmp/id_ed25519"),
        });
        assert_eq!(env.len(), 1);
        assert!(env[0].1.contains("-i /tmp/id_ed25519"));
    }
}
