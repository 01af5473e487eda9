//! Tool provisioner.
//!
//! Downloads the pinned external binaries into `~/.k1/tools`:
//! - `kubectl` and `terraform` for every installation
//! - `helm`, `mkcert` and `k3d` for local k3d installations
//!
//! Downloads run in parallel; the first failure aborts the rest. A binary
//! already present that reports the pinned version is kept as is.

use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Client;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::exec::{Executor, Invocation};

/// Timeout for a single binary download.
const DOWNLOAD_TIMEOUT_SECS: u64 = 300;

/// Connect timeout for downloads.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Errors raised while provisioning tools.
#[derive(Error, Debug)]
pub enum ToolError {
    /// A binary could not be fetched, unpacked or installed.
    #[error("failed to download {tool}: {cause}")]
    Download { tool: Tool, cause: String },

    /// The tools directory cannot be prepared.
    #[error("tools directory error: {0}")]
    Io(#[from] std::io::Error),
}

impl ToolError {
    fn download(tool: Tool, cause: impl fmt::Display) -> Self {
        Self::Download {
            tool,
            cause: cause.to_string(),
        }
    }
}

/// External binaries the installer drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    Kubectl,
    Terraform,
    Helm,
    Mkcert,
    K3d,
}

impl Tool {
    /// File name inside the tools directory.
    #[must_use]
    pub fn binary_name(self) -> &'static str {
        match self {
            Self::Kubectl => "kubectl",
            Self::Terraform => "terraform",
            Self::Helm => "helm",
            Self::Mkcert => "mkcert",
            Self::K3d => "k3d",
        }
    }

    /// Tools needed for a cloud target.
    #[must_use]
    pub fn required_for(local: bool) -> Vec<Tool> {
        if local {
            vec![Self::Kubectl, Self::Terraform, Self::Helm, Self::Mkcert, Self::K3d]
        } else {
            vec![Self::Kubectl, Self::Terraform]
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary_name())
    }
}

/// Pinned tool versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolVersions {
    pub kubectl: String,
    pub terraform: String,
    pub helm: String,
    pub mkcert: String,
    pub k3d: String,
}

impl Default for ToolVersions {
    fn default() -> Self {
        Self {
            kubectl: "v1.25.7".to_string(),
            terraform: "1.3.8".to_string(),
            helm: "v3.11.1".to_string(),
            mkcert: "v1.4.4".to_string(),
            k3d: "v5.4.6".to_string(),
        }
    }
}

impl ToolVersions {
    #[must_use]
    pub fn get(&self, tool: Tool) -> &str {
        match tool {
            Tool::Kubectl => &self.kubectl,
            Tool::Terraform => &self.terraform,
            Tool::Helm => &self.helm,
            Tool::Mkcert => &self.mkcert,
            Tool::K3d => &self.k3d,
        }
    }
}

/// How a release artifact is packaged.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Packaging {
    Raw,
    Zip { entry: String },
    TarGz { entry: String },
}

/// Operating system / architecture pair in release naming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    /// The platform this binary runs on.
    #[must_use]
    pub fn current() -> Self {
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            other => other,
        };
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        };
        Self {
            os: os.to_string(),
            arch: arch.to_string(),
        }
    }
}

/// Where a tool comes from.
#[derive(Debug, Clone)]
struct Release {
    url: String,
    packaging: Packaging,
}

fn release(tool: Tool, version: &str, p: &Platform) -> Release {
    let (os, arch) = (&p.os, &p.arch);
    match tool {
        Tool::Kubectl => Release {
            url: format!("https://dl.k8s.io/release/{version}/bin/{os}/{arch}/kubectl"),
            packaging: Packaging::Raw,
        },
        Tool::Terraform => Release {
            url: format!(
                "https://releases.hashicorp.com/terraform/{version}/terraform_{version}_{os}_{arch}.zip"
            ),
            packaging: Packaging::Zip {
                entry: "terraform".to_string(),
            },
        },
        Tool::Helm => Release {
            url: format!("https://get.helm.sh/helm-{version}-{os}-{arch}.tar.gz"),
            packaging: Packaging::TarGz {
                entry: format!("{os}-{arch}/helm"),
            },
        },
        Tool::Mkcert => Release {
            url: format!(
                "https://github.com/FiloSottile/mkcert/releases/download/{version}/mkcert-{version}-{os}-{arch}"
            ),
            packaging: Packaging::Raw,
        },
        Tool::K3d => Release {
            url: format!("https://github.com/k3d-io/k3d/releases/download/{version}/k3d-{os}-{arch}"),
            packaging: Packaging::Raw,
        },
    }
}

/// Arguments that make `tool` print its version.
fn version_probe(tool: Tool) -> &'static [&'static str] {
    match tool {
        Tool::Kubectl => &["version", "--client=true", "-oyaml"],
        Tool::Terraform => &["version", "-json"],
        Tool::Helm => &["version", "--template", "{{.Version}}"],
        Tool::Mkcert => &["-version"],
        Tool::K3d => &["version"],
    }
}

/// Whether probe output reports `version`.
fn reports_version(tool: Tool, output: &str, version: &str) -> bool {
    match tool {
        Tool::Kubectl => output
            .lines()
            .any(|l| l.trim() == format!("gitVersion: {version}")),
        Tool::Terraform => serde_json::from_str::<serde_json::Value>(output)
            .ok()
            .and_then(|v| v["terraform_version"].as_str().map(|v| v == version))
            .unwrap_or(false),
        _ => output.split_whitespace().any(|w| w == version),
    }
}

/// Absolute paths of provisioned binaries.
#[derive(Debug, Clone)]
pub struct ToolPaths {
    dir: PathBuf,
}

impl ToolPaths {
    /// Paths under `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn get(&self, tool: Tool) -> PathBuf {
        self.dir.join(tool.binary_name())
    }
}

/// Downloads pinned tools.
#[derive(Debug, Clone)]
pub struct ToolProvisioner {
    client: Client,
    dir: PathBuf,
    versions: ToolVersions,
    platform: Platform,
    url_overrides: HashMap<Tool, String>,
}

impl ToolProvisioner {
    /// Create a provisioner writing into `dir`.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created.
    pub fn new(dir: impl Into<PathBuf>, versions: ToolVersions) -> Result<Self, ToolError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
            .build()
            .map_err(|e| ToolError::download(Tool::Kubectl, e))?;
        Ok(Self {
            client,
            dir: dir.into(),
            versions,
            platform: Platform::current(),
            url_overrides: HashMap::new(),
        })
    }

    /// Fetch `tool` from `url` instead of its upstream release location.
    #[must_use]
    pub fn with_url(mut self, tool: Tool, url: impl Into<String>) -> Self {
        self.url_overrides.insert(tool, url.into());
        self
    }

    /// Paths of the binaries in this provisioner's directory.
    #[must_use]
    pub fn paths(&self) -> ToolPaths {
        ToolPaths::new(&self.dir)
    }

    /// Make every tool in `tools` available at its pinned version.
    ///
    /// # Errors
    /// Returns [`ToolError::Download`] for the first tool that fails; the
    /// remaining downloads are cancelled.
    pub async fn provision(&self, tools: &[Tool]) -> Result<ToolPaths, ToolError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut set = JoinSet::new();
        let mut owners = HashMap::new();
        for &tool in tools {
            let this = self.clone();
            let handle = set.spawn(async move { this.ensure(tool).await });
            owners.insert(handle.id(), tool);
        }

        while let Some(joined) = set.join_next_with_id().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((_, Err(e))) => {
                    set.abort_all();
                    return Err(e);
                }
                Err(join_err) => {
                    set.abort_all();
                    let tool = owners.get(&join_err.id()).copied().unwrap_or(Tool::Kubectl);
                    let cause = if join_err.is_panic() {
                        "download task panicked".to_string()
                    } else {
                        join_err.to_string()
                    };
                    return Err(ToolError::download(tool, cause));
                }
            }
        }

        info!(dir = %self.dir.display(), count = tools.len(), "Tools ready");
        Ok(self.paths())
    }

    async fn ensure(&self, tool: Tool) -> Result<(), ToolError> {
        let version = self.versions.get(tool).to_string();
        let path = self.paths().get(tool);

        if self.is_current(tool, &path, &version).await {
            debug!(tool = %tool, version = %version, "Tool already present");
            return Ok(());
        }

        let mut release = release(tool, &version, &self.platform);
        if let Some(url) = self.url_overrides.get(&tool) {
            release.url.clone_from(url);
        }

        info!(tool = %tool, version = %version, url = %release.url, "Downloading tool");
        let response = self
            .client
            .get(&release.url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ToolError::download(tool, e))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ToolError::download(tool, e))?;

        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || install(tool, &release.packaging, &bytes, &dir))
            .await
            .map_err(|e| ToolError::download(tool, e))??;

        if !self.is_current(tool, &path, &version).await {
            return Err(ToolError::download(
                tool,
                format!("downloaded binary does not report version {version}"),
            ));
        }
        Ok(())
    }

    async fn is_current(&self, tool: Tool, path: &Path, version: &str) -> bool {
        if !path.exists() {
            return false;
        }
        let probe = Invocation::new(path)
            .args(version_probe(tool).iter().copied())
            .timeout(Duration::from_secs(30));
        match Executor.run(&probe).await {
            Ok(out) => reports_version(tool, &out.stdout, version),
            Err(e) => {
                warn!(tool = %tool, error = %e, "Version probe failed");
                false
            }
        }
    }
}

/// Unpack `bytes` and place the executable in `dir`.
fn install(tool: Tool, packaging: &Packaging, bytes: &[u8], dir: &Path) -> Result<(), ToolError> {
    let binary = match packaging {
        Packaging::Raw => bytes.to_vec(),
        Packaging::Zip { entry } => {
            let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
                .map_err(|e| ToolError::download(tool, e))?;
            let mut file = archive
                .by_name(entry)
                .map_err(|e| ToolError::download(tool, format!("{entry}: {e}")))?;
            let mut out = Vec::new();
            file.read_to_end(&mut out)?;
            out
        }
        Packaging::TarGz { entry } => {
            let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(bytes));
            let mut found = None;
            for item in archive.entries()? {
                let mut item = item?;
                if item.path()?.as_ref() == Path::new(entry) {
                    let mut out = Vec::new();
                    item.read_to_end(&mut out)?;
                    found = Some(out);
                    break;
                }
            }
            found.ok_or_else(|| ToolError::download(tool, format!("{entry} not in archive")))?
        }
    };

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    std::io::Write::write_all(&mut tmp, &binary)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o755))?;
    }
    tmp.persist(dir.join(tool.binary_name()))
        .map_err(|e| ToolError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_urls() {
        let p = Platform {
            os: "linux".into(),
            arch: "amd64".into(),
        };
        assert_eq!(
            release(Tool::Kubectl, "v1.25.7", &p).url,
            "https://dl.k8s.io/release/v1.25.7/bin/linux/amd64/kubectl"
        );
        assert_eq!(
            release(Tool::Terraform, "1.3.8", &p).url,
            "https://releases.hashicorp.com/terraform/1.3.8/terraform_1.3.8_linux_amd64.zip"
        );
        assert_eq!(
            release(Tool::Helm, "v3.11.1", &p).packaging,
            Packaging::TarGz {
                entry: "linux-amd64/helm".into()
            }
        );
    }

    #[test]
    fn test_reports_version() {
        let kubectl = "clientVersion:\n  gitVersion: v1.25.7\n  platform: linux/amd64\n";
        assert!(reports_version(Tool::Kubectl, kubectl, "v1.25.7"));
        assert!(!reports_version(Tool::Kubectl, kubectl, "v1.26.0"));
        let terraform = r#"{"terraform_version":"1.3.8","platform":"linux_amd64"}"#;
        assert!(reports_version(Tool::Terraform, terraform, "1.3.8"));
        assert!(reports_version(Tool::K3d, "k3d version v5.4.6\nk3s version v1.24", "v5.4.6"));
    }

    #[test]
    fn test_local_mode_needs_more_tools() {
        assert_eq!(Tool::required_for(false).len(), 2);
        assert!(Tool::required_for(true).contains(&Tool::Mkcert));
    }
}
