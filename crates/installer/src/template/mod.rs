//! Template materializer.
//!
//! Turns the upstream gitops and metaphor template repositories into the
//! installation's own repositories:
//! 1. clone the pinned branch or tag into a clean directory
//! 2. keep only the `<cloud>-<git>` driver and lift it to the root
//! 3. check for unknown placeholders, then detokenize
//! 4. commit as the automation bot and point `origin` at the destination

mod tokens;

use std::path::{Path, PathBuf};

use k1_scm::git;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub use tokens::{TemplateTokens, Token};

/// Root entries of the template replaced by the retained driver.
const ROOT_CLUTTER: [&str; 9] = [
    "atlantis.yaml",
    ".gitignore",
    "LICENSE",
    "README.md",
    "logo.png",
    "components",
    "registry",
    "terraform",
    "validation",
];

/// Git host suffixes that mark a driver directory.
const DRIVER_SUFFIXES: [&str; 3] = ["-github", "-gitlab", "-softserve"];

/// CI definitions copied from gitops into metaphor.
const CI_DIRS: [&str; 2] = [".github", ".argo"];

/// Directories never walked by detokenize.
const SKIPPED_DIRS: [&str; 2] = [".git", ".terraform"];

/// Errors raised while materializing templates.
#[derive(Error, Debug)]
pub enum TemplateError {
    /// Neither the branch nor the tag could be cloned.
    #[error("failed to fetch template {url}@{reference}: {stderr}")]
    Fetch {
        url: String,
        reference: String,
        stderr: String,
    },

    /// The template uses a placeholder outside the closed set.
    #[error("unknown template token <{token}> in {}", path.display())]
    Token { path: PathBuf, token: String },

    /// The template does not have the expected layout.
    #[error("template layout error: {0}")]
    Layout(String),

    #[error("git error: {0}")]
    Git(#[from] k1_scm::ScmError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

/// How a template reference is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Branch,
    Tag,
}

/// Fetch order for `reference`: release versions are tried as tags first.
#[must_use]
pub fn fetch_order(reference: &str) -> [RefKind; 2] {
    if semver::Version::parse(reference.trim_start_matches('v')).is_ok() {
        [RefKind::Tag, RefKind::Branch]
    } else {
        [RefKind::Branch, RefKind::Tag]
    }
}

/// Clone `url` at `reference` into a clean `dst` with fresh history on `main`.
///
/// # Errors
/// Returns [`TemplateError::Fetch`] if neither a branch nor a tag named
/// `reference` can be cloned.
pub async fn clone(url: &str, reference: &str, dst: &Path) -> Result<(), TemplateError> {
    let mut last_err = String::new();

    for kind in fetch_order(reference) {
        clean(dst).await?;
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        match clone_ref(url, reference, kind, dst).await {
            Ok(()) => {
                info!(url = %url, reference = %reference, kind = ?kind, "Cloned template");
                tokio::fs::remove_dir_all(dst.join(".git")).await?;
                git::run(dst, &["init", "--initial-branch=main"], &[]).await?;
                return Ok(());
            }
            Err(e) => {
                debug!(url = %url, reference = %reference, kind = ?kind, error = %e, "Template clone attempt failed");
                last_err = e.to_string();
            }
        }
    }

    clean(dst).await?;
    Err(TemplateError::Fetch {
        url: url.to_string(),
        reference: reference.to_string(),
        stderr: last_err,
    })
}

async fn clone_ref(
    url: &str,
    reference: &str,
    kind: RefKind,
    dst: &Path,
) -> Result<(), k1_scm::ScmError> {
    let cwd = dst.parent().unwrap_or_else(|| Path::new("."));
    let target = dst.to_string_lossy().into_owned();
    match kind {
        RefKind::Branch => {
            git::run(
                cwd,
                &[
                    "clone",
                    "--depth",
                    "1",
                    "--single-branch",
                    "--branch",
                    reference,
                    url,
                    target.as_str(),
                ],
                &[],
            )
            .await?;
        }
        RefKind::Tag => {
            git::run(
                cwd,
                &["clone", "--depth", "1", "--no-checkout", url, target.as_str()],
                &[],
            )
            .await?;
            let refspec = format!("refs/tags/{reference}:refs/tags/{reference}");
            git::run(dst, &["fetch", "--depth", "1", "origin", refspec.as_str()], &[]).await?;
            let tag = format!("tags/{reference}");
            git::run(dst, &["checkout", "--force", tag.as_str()], &[]).await?;
        }
    }
    Ok(())
}

async fn clean(dst: &Path) -> Result<(), TemplateError> {
    match tokio::fs::remove_dir_all(dst).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn is_driver_dir(name: &str) -> bool {
    DRIVER_SUFFIXES.iter().any(|s| name.ends_with(s))
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else if path.exists() {
        std::fs::remove_file(path)
    } else {
        Ok(())
    }
}

/// Recursively copy the contents of `src` into `dst`, overwriting files.
fn copy_tree(src: &Path, dst: &Path) -> Result<(), TemplateError> {
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| TemplateError::Layout(e.to_string()))?;
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Keep only `driver`, lift it to the root, and seed `registry/<cluster>`.
///
/// # Errors
/// Returns [`TemplateError::Layout`] if the template has no `driver` directory.
pub fn adjust(
    repo: &Path,
    driver: &str,
    cluster_type: &str,
    cluster_name: &str,
) -> Result<(), TemplateError> {
    let retained = repo.join(driver);
    if !retained.is_dir() {
        return Err(TemplateError::Layout(format!(
            "template has no '{driver}' driver directory"
        )));
    }

    for name in ROOT_CLUTTER {
        remove_path(&repo.join(name))?;
    }
    copy_tree(&retained, repo)?;

    for entry in std::fs::read_dir(repo)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type()?.is_dir() && is_driver_dir(&name) {
            debug!(driver = %name, "Removing template driver");
            std::fs::remove_dir_all(entry.path())?;
        }
    }

    let cluster_types = repo.join("cluster-types");
    let source = cluster_types.join(cluster_type);
    if source.is_dir() {
        copy_tree(&source, &repo.join("registry").join(cluster_name))?;
    } else {
        warn!(cluster_type = %cluster_type, "Template has no cluster type directory");
    }
    remove_path(&cluster_types)?;

    info!(driver = %driver, cluster = %cluster_name, "Adjusted template");
    Ok(())
}

/// Text content of `path`, or `None` for binary files.
fn read_text(path: &Path) -> Result<Option<String>, TemplateError> {
    let bytes = std::fs::read(path)?;
    if bytes.contains(&0) {
        return Ok(None);
    }
    Ok(String::from_utf8(bytes).ok())
}

/// Regular files under `repo` outside `.git` and `.terraform`.
fn text_candidates(repo: &Path) -> impl Iterator<Item = Result<PathBuf, walkdir::Error>> {
    WalkDir::new(repo)
        .into_iter()
        .filter_entry(|e| {
            !(e.file_type().is_dir()
                && e.file_name()
                    .to_str()
                    .is_some_and(|name| SKIPPED_DIRS.contains(&name)))
        })
        .filter_map(|entry| match entry {
            Ok(e) if e.file_type().is_file() => Some(Ok(e.into_path())),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        })
}

/// Fail on the first placeholder outside the closed token set.
///
/// # Errors
/// Returns [`TemplateError::Token`] naming the file and placeholder.
pub fn validate_tokens(repo: &Path) -> Result<(), TemplateError> {
    for path in text_candidates(repo) {
        let path = path?;
        let Some(text) = read_text(&path)? else {
            continue;
        };
        if let Some(token) = tokens::unknown_placeholders(&text).next() {
            return Err(TemplateError::Token {
                token: token.to_string(),
                path,
            });
        };
    }
    Ok(())
}

/// Substitute placeholders in every text file; returns how many files changed.
///
/// # Errors
/// Returns error if a file cannot be read or rewritten.
pub fn detokenize(repo: &Path, tokens: &TemplateTokens) -> Result<usize, TemplateError> {
    let mut changed = 0;
    for path in text_candidates(repo) {
        let path = path?;
        let Some(text) = read_text(&path)? else {
            continue;
        };
        if let std::borrow::Cow::Owned(rewritten) = tokens.detokenize(&text) {
            std::fs::write(&path, rewritten)?;
            changed += 1;
        }
    }
    info!(repo = %repo.display(), files = changed, "Detokenized repository");
    Ok(changed)
}

/// Copy the gitops CI definitions into metaphor.
///
/// # Errors
/// Returns error if a directory cannot be copied.
pub fn copy_ci(gitops: &Path, metaphor: &Path) -> Result<(), TemplateError> {
    for dir in CI_DIRS {
        let source = gitops.join(dir);
        if source.is_dir() {
            let target = metaphor.join(dir);
            remove_path(&target)?;
            copy_tree(&source, &target)?;
        }
    }
    Ok(())
}

/// Commit the whole working tree as the automation bot.
///
/// # Errors
/// Returns error if git fails.
pub async fn commit(repo: &Path, message: &str) -> Result<(), TemplateError> {
    git::commit_all(repo, message).await?;
    Ok(())
}

/// Point remote `name` at `url`.
///
/// # Errors
/// Returns error if git fails.
pub async fn add_remote(repo: &Path, name: &str, url: &str) -> Result<(), TemplateError> {
    git::set_remote(repo, name, url).await?;
    Ok(())
}

/// Where a template comes from and where it goes.
#[derive(Debug, Clone)]
pub struct Hydration<'a> {
    pub template_url: &'a str,
    pub template_ref: &'a str,
    pub local_path: &'a Path,
    pub remote_url: &'a str,
    pub tokens: &'a TemplateTokens,
}

/// Full gitops pipeline: clone, adjust, validate, detokenize, commit, remote.
///
/// # Errors
/// Returns the first failing stage's error.
pub async fn hydrate_gitops(
    h: &Hydration<'_>,
    driver: &str,
    cluster_type: &str,
    cluster_name: &str,
) -> Result<(), TemplateError> {
    clone(h.template_url, h.template_ref, h.local_path).await?;
    adjust(h.local_path, driver, cluster_type, cluster_name)?;
    finish(h, "initial gitops commit").await
}

/// Metaphor pipeline: clone, copy CI from `gitops`, validate, detokenize,
/// commit, remote.
///
/// # Errors
/// Returns the first failing stage's error.
pub async fn hydrate_metaphor(h: &Hydration<'_>, gitops: &Path) -> Result<(), TemplateError> {
    clone(h.template_url, h.template_ref, h.local_path).await?;
    copy_ci(gitops, h.local_path)?;
    finish(h, "initial metaphor commit").await
}

async fn finish(h: &Hydration<'_>, message: &str) -> Result<(), TemplateError> {
    validate_tokens(h.local_path)?;
    detokenize(h.local_path, h.tokens)?;
    commit(h.local_path, message).await?;
    add_remote(h.local_path, "origin", h.remote_url).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_fetch_order() {
        assert_eq!(fetch_order("v2.3.0"), [RefKind::Tag, RefKind::Branch]);
        assert_eq!(fetch_order("2.3.0"), [RefKind::Tag, RefKind::Branch]);
        assert_eq!(fetch_order("main"), [RefKind::Branch, RefKind::Tag]);
    }

    #[test]
    fn test_adjust_keeps_only_matching_driver() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path();
        write(repo, "README.md", "template readme");
        write(repo, "aws-github/terraform/base/main.tf", "cluster = \"<CLUSTER_NAME>\"");
        write(repo, "aws-github/README.md", "driver readme");
        write(repo, "aws-gitlab/terraform/base/main.tf", "gitlab");
        write(repo, "k3d-github/terraform/base/main.tf", "k3d");
        write(repo, "cluster-types/mgmt/registry.yaml", "kind: Application");

        adjust(repo, "aws-github", "mgmt", "kubefirst").unwrap();

        assert!(repo.join("terraform/base/main.tf").exists());
        assert_eq!(std::fs::read_to_string(repo.join("README.md")).unwrap(), "driver readme");
        assert!(!repo.join("aws-github").exists());
        assert!(!repo.join("aws-gitlab").exists());
        assert!(!repo.join("k3d-github").exists());
        assert!(!repo.join("cluster-types").exists());
        assert!(repo.join("registry/kubefirst/registry.yaml").exists());
    }

    #[test]
    fn test_adjust_requires_driver() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "aws-gitlab/main.tf", "");
        let err = adjust(dir.path(), "aws-github", "mgmt", "c").unwrap_err();
        assert!(matches!(err, TemplateError::Layout(_)));
    }

    #[test]
    fn test_detokenize_tree_skips_binary_and_git() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path();
        write(repo, "values.yaml", "cluster: <CLUSTER_NAME>\nregion: <CLOUD_REGION>\n");
        write(repo, ".git/config", "<CLUSTER_NAME>");
        write(repo, "nested/.terraform/state", "<CLUSTER_NAME>");
        std::fs::write(repo.join("logo.png"), b"\x89PNG\0<CLUSTER_NAME>").unwrap();

        let tokens = TemplateTokens::new()
            .with(Token::ClusterName, "mgmt")
            .with(Token::CloudRegion, "us-east-1");
        assert_eq!(detokenize(repo, &tokens).unwrap(), 1);

        assert_eq!(
            std::fs::read_to_string(repo.join("values.yaml")).unwrap(),
            "cluster: mgmt\nregion: us-east-1\n"
        );
        assert_eq!(std::fs::read_to_string(repo.join(".git/config")).unwrap(), "<CLUSTER_NAME>");
        assert_eq!(
            std::fs::read_to_string(repo.join("nested/.terraform/state")).unwrap(),
            "<CLUSTER_NAME>"
        );

        assert_eq!(detokenize(repo, &tokens).unwrap(), 0);
    }

    #[test]
    fn test_validate_tokens_rejects_unknown() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "ok.yaml", "name: <CLUSTER_NAME>");
        validate_tokens(dir.path()).unwrap();

        write(dir.path(), "deep/bad.yaml", "name: <CLUSTER_NAME_TYPO>");
        let err = validate_tokens(dir.path()).unwrap_err();
        match err {
            TemplateError::Token { path, token } => {
                assert_eq!(token, "CLUSTER_NAME_TYPO");
                assert!(path.ends_with("deep/bad.yaml"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_copy_ci() {
        let gitops = tempfile::tempdir().unwrap();
        let metaphor = tempfile::tempdir().unwrap();
        write(gitops.path(), ".github/workflows/main.yml", "on: push");
        write(gitops.path(), ".argo/ci.yaml", "kind: Workflow");
        write(metaphor.path(), ".github/stale.yml", "stale");

        copy_ci(gitops.path(), metaphor.path()).unwrap();

        assert!(metaphor.path().join(".github/workflows/main.yml").exists());
        assert!(metaphor.path().join(".argo/ci.yaml").exists());
        assert!(!metaphor.path().join(".github/stale.yml").exists());
    }
}
