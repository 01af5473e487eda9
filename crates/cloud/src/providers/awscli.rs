//! Thin runner for the `aws` command line.
//!
//! Used directly by the AWS provider and, pointed at an S3-compatible
//! endpoint, for DigitalOcean Spaces and Vultr Object Storage buckets.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::process::Command;
use tracing::debug;

use super::traits::CloudProviderError;

/// Upper bound for a single CLI call.
const CLI_TIMEOUT_SECS: u64 = 120;

/// `aws` invocation context.
#[derive(Clone, Default)]
pub struct AwsCli {
    profile: Option<String>,
    region: String,
    endpoint_url: Option<String>,
    /// Static credentials for S3-compatible stores.
    env: BTreeMap<String, String>,
}

impl std::fmt::Debug for AwsCli {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCli")
            .field("profile", &self.profile)
            .field("region", &self.region)
            .field("endpoint_url", &self.endpoint_url)
            .finish_non_exhaustive()
    }
}

impl AwsCli {
    /// Runner using the ambient AWS credential chain.
    pub fn new(profile: Option<String>, region: impl Into<String>) -> Self {
        Self {
            profile,
            region: region.into(),
            ..Self::default()
        }
    }

    /// Runner for an S3-compatible endpoint with static keys.
    pub fn s3_compatible(
        endpoint_url: impl Into<String>,
        region: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        let mut env = BTreeMap::new();
        env.insert("AWS_ACCESS_KEY_ID".to_string(), access_key.into());
        env.insert("AWS_SECRET_ACCESS_KEY".to_string(), secret_key.into());
        Self {
            profile: None,
            region: region.into(),
            endpoint_url: Some(endpoint_url.into()),
            env,
        }
    }

    /// Region passed to every call.
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Run a command and return raw stdout.
    ///
    /// # Errors
    /// Returns [`CloudProviderError::Cli`] on non-zero exit or timeout.
    pub async fn run(&self, args: &[&str]) -> Result<String, CloudProviderError> {
        let mut cmd = Command::new("aws");
        cmd.args(args)
            .args(["--region", &self.region, "--output", "json"])
            .envs(&self.env)
            .kill_on_drop(true);
        if let Some(profile) = &self.profile {
            cmd.args(["--profile", profile]);
        }
        if let Some(endpoint) = &self.endpoint_url {
            cmd.args(["--endpoint-url", endpoint]);
        }

        let command = format!("aws {}", args.join(" "));
        debug!(command = %command, "Running aws CLI");

        let output = tokio::time::timeout(Duration::from_secs(CLI_TIMEOUT_SECS), cmd.output())
            .await
            .map_err(|_| CloudProviderError::Cli {
                command: command.clone(),
                stderr: format!("timed out after {CLI_TIMEOUT_SECS}s"),
            })??;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(CloudProviderError::Cli {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    /// Run a command and parse its JSON output.
    ///
    /// # Errors
    /// Returns error if the command fails or prints malformed JSON.
    pub async fn run_json<T: DeserializeOwned>(&self, args: &[&str]) -> Result<T, CloudProviderError> {
        let stdout = self.run(args).await?;
        Ok(serde_json::from_str(&stdout)?)
    }

    /// Create a bucket, treating "already owned" as success.
    ///
    /// # Errors
    /// Returns error if the bucket cannot be created.
    pub async fn create_bucket(&self, name: &str) -> Result<(), CloudProviderError> {
        let constraint = format!("LocationConstraint={}", self.region);
        let mut args = vec!["s3api", "create-bucket", "--bucket", name];
        if self.endpoint_url.is_none() && self.region != "us-east-1" {
            args.extend(["--create-bucket-configuration", constraint.as_str()]);
        }
        match self.run(&args).await {
            Ok(_) => Ok(()),
            Err(CloudProviderError::Cli { stderr, .. })
                if stderr.contains("BucketAlreadyOwnedByYou") =>
            {
                debug!(bucket = %name, "Bucket already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Enable object versioning on a bucket.
    ///
    /// # Errors
    /// Returns error if the call fails.
    pub async fn enable_versioning(&self, name: &str) -> Result<(), CloudProviderError> {
        self.run(&[
            "s3api",
            "put-bucket-versioning",
            "--bucket",
            name,
            "--versioning-configuration",
            "Status=Enabled",
        ])
        .await
        .map(|_| ())
    }

    /// Force-remove a bucket, treating a missing bucket as success.
    ///
    /// # Errors
    /// Returns error if the bucket exists and cannot be removed.
    pub async fn delete_bucket(&self, name: &str) -> Result<(), CloudProviderError> {
        let target = format!("s3://{name}");
        match self.run(&["s3", "rb", &target, "--force"]).await {
            Ok(_) => Ok(()),
            Err(CloudProviderError::Cli { stderr, .. }) if stderr.contains("NoSuchBucket") => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
