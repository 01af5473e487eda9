//! Commands inside running pods.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams};
use kube::Client;
use tokio::io::AsyncReadExt;
use tracing::debug;

use super::KubeError;

/// Runs commands in pods.
#[async_trait]
pub trait PodExec: Send + Sync {
    /// Run `command` in `namespace/pod` and return stdout.
    ///
    /// Arguments may carry secrets; implementations must not log them.
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        command: &[String],
    ) -> Result<String, KubeError>;
}

/// [`PodExec`] over the Kubernetes exec subresource.
#[derive(Clone)]
pub struct KubePodExec {
    client: Client,
}

impl KubePodExec {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodExec for KubePodExec {
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        command: &[String],
    ) -> Result<String, KubeError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut params = AttachParams::default().stdout(true).stderr(true);
        if let Some(container) = container {
            params = params.container(container);
        }

        debug!(
            namespace = %namespace,
            pod = %pod,
            program = %command.first().map_or("", String::as_str),
            "Executing in pod"
        );
        let mut attached = api.exec(pod, command.iter().map(String::as_str), &params).await?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        let out_reader = attached.stdout();
        let err_reader = attached.stderr();
        let read_out = async {
            if let Some(mut r) = out_reader {
                r.read_to_string(&mut stdout).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let read_err = async {
            if let Some(mut r) = err_reader {
                r.read_to_string(&mut stderr).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (out_res, err_res) = tokio::join!(read_out, read_err);
        out_res?;
        err_res?;

        let status = match attached.take_status() {
            Some(status) => status.await,
            None => None,
        };
        attached.join().await.map_err(|e| KubeError::Exec {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            message: e.to_string(),
        })?;

        match status {
            Some(s) if s.status.as_deref() != Some("Success") => Err(KubeError::Exec {
                namespace: namespace.to_string(),
                pod: pod.to_string(),
                message: s
                    .message
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| stderr.trim().to_string()),
            }),
            _ => Ok(stdout),
        }
    }
}
