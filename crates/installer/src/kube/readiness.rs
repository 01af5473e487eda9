//! Readiness waits.
//!
//! Every wait has its own deadline. Watches are owned by the wait and are
//! closed when it returns, on success or timeout.

use std::time::Duration;

use futures::TryStreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::runtime::wait::await_condition;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

/// Poll interval for namespace existence.
pub const NAMESPACE_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ReadinessError {
    #[error("{kind} '{name}' not ready after {}s", elapsed.as_secs())]
    Timeout {
        kind: &'static str,
        name: String,
        /// Deadline the wait was given.
        timeout: Duration,
        elapsed: Duration,
    },

    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    #[error("watch failed: {0}")]
    Watch(String),
}

/// Waits bound to one cluster.
#[derive(Clone)]
pub struct Readiness {
    client: Client,
    namespace_poll: Duration,
}

impl Readiness {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            namespace_poll: NAMESPACE_POLL_INTERVAL,
        }
    }

    /// Wait until `name` exists.
    ///
    /// # Errors
    /// Returns [`ReadinessError::Timeout`] if it never appears.
    pub async fn namespace(&self, name: &str, timeout: Duration) -> Result<(), ReadinessError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let started = Instant::now();
        loop {
            if api.get_opt(name).await?.is_some() {
                info!(namespace = %name, "Namespace exists");
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(ReadinessError::Timeout {
                    kind: "namespace",
                    name: name.to_string(),
                    timeout,
                    elapsed: started.elapsed(),
                });
            }
            debug!(namespace = %name, "Waiting for namespace");
            tokio::time::sleep(self.namespace_poll).await;
        }
    }

    /// Wait for a pod labelled `key=value` in `namespace` to be `Running`.
    ///
    /// With `allow_pending`, a `Pending` pod is accepted too (used before a
    /// workload has anything to schedule on). Returns the pod name.
    ///
    /// # Errors
    /// Returns [`ReadinessError::Timeout`] if no matching pod shows up.
    pub async fn pod_by_label(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
        allow_pending: bool,
        timeout: Duration,
    ) -> Result<String, ReadinessError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let selector = format!("{key}={value}");
        let config = watcher::Config::default().labels(&selector);
        let started = Instant::now();

        let wait = async {
            let mut pods = Box::pin(watcher(api, config).applied_objects());
            while let Some(pod) = pods
                .try_next()
                .await
                .map_err(|e| ReadinessError::Watch(e.to_string()))?
            {
                if pod_is_ready(&pod, allow_pending) {
                    return Ok(pod.metadata.name.unwrap_or_default());
                }
            }
            Err(ReadinessError::Watch(format!("watch on {selector} ended")))
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => {
                if let Ok(pod) = &result {
                    info!(namespace = %namespace, pod = %pod, "Pod ready");
                }
                result
            }
            Err(_) => Err(ReadinessError::Timeout {
                kind: "pod",
                name: format!("{namespace}/{key}={value}"),
                timeout,
                elapsed: started.elapsed(),
            }),
        }
    }

    /// Wait until every replica of a StatefulSet is ready.
    ///
    /// # Errors
    /// Returns [`ReadinessError::Timeout`] if it never converges.
    pub async fn statefulset(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<(), ReadinessError> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        self.until("statefulset", namespace, name, timeout, async {
            await_condition(api, name, |s: Option<&StatefulSet>| {
                s.is_some_and(statefulset_ready)
            })
            .await
        })
        .await
    }

    /// Wait until every replica of a Deployment is available.
    ///
    /// # Errors
    /// Returns [`ReadinessError::Timeout`] if it never converges.
    pub async fn deployment(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<(), ReadinessError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        self.until("deployment", namespace, name, timeout, async {
            await_condition(api, name, |d: Option<&Deployment>| {
                d.is_some_and(deployment_ready)
            })
            .await
        })
        .await
    }

    /// Wait until a Job reports a succeeded pod.
    ///
    /// # Errors
    /// Returns [`ReadinessError::Timeout`] if it never completes.
    pub async fn job(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<(), ReadinessError> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        self.until("job", namespace, name, timeout, async {
            await_condition(api, name, |j: Option<&Job>| j.is_some_and(job_succeeded)).await
        })
        .await
    }

    async fn until<T, F>(
        &self,
        kind: &'static str,
        namespace: &str,
        name: &str,
        timeout: Duration,
        wait: F,
    ) -> Result<(), ReadinessError>
    where
        F: std::future::Future<Output = Result<T, kube::runtime::wait::Error>>,
    {
        let started = Instant::now();
        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(_)) => {
                info!(kind, namespace = %namespace, name = %name, "Ready");
                Ok(())
            }
            Ok(Err(e)) => Err(ReadinessError::Watch(e.to_string())),
            Err(_) => Err(ReadinessError::Timeout {
                kind,
                name: format!("{namespace}/{name}"),
                timeout,
                elapsed: started.elapsed(),
            }),
        }
    }
}

fn pod_is_ready(pod: &Pod, allow_pending: bool) -> bool {
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or_default();
    phase == "Running" || (allow_pending && phase == "Pending")
}

/// Same rule as `kubectl rollout status statefulset`: the controller has
/// seen the latest spec and every replica is updated and ready.
fn statefulset_ready(sts: &StatefulSet) -> bool {
    let Some(status) = sts.status.as_ref() else {
        return false;
    };
    let desired = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let generation = sts.metadata.generation.unwrap_or(0);
    if desired == 0 || status.observed_generation.unwrap_or(0) < generation {
        return false;
    }
    let on_delete = sts
        .spec
        .as_ref()
        .and_then(|s| s.update_strategy.as_ref())
        .and_then(|u| u.type_.as_deref())
        == Some("OnDelete");
    let updated = on_delete || status.updated_replicas.unwrap_or(0) == desired;
    let revision_settled = on_delete
        || status.update_revision.is_none()
        || status.current_revision == status.update_revision;
    status.replicas == desired
        && status.ready_replicas.unwrap_or(0) == desired
        && updated
        && revision_settled
}

/// Same rule as `kubectl rollout status deployment`.
fn deployment_ready(deploy: &Deployment) -> bool {
    let Some(status) = deploy.status.as_ref() else {
        return false;
    };
    let desired = deploy.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let generation = deploy.metadata.generation.unwrap_or(0);
    let updated = status.updated_replicas.unwrap_or(0);
    desired > 0
        && status.observed_generation.unwrap_or(0) >= generation
        && updated == desired
        && status.replicas.unwrap_or(0) == updated
        && status.available_replicas.unwrap_or(0) == updated
}

fn job_succeeded(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.succeeded)
        .is_some_and(|n| n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{
        DeploymentSpec, DeploymentStatus, StatefulSetSpec, StatefulSetStatus,
    };
    use k8s_openapi::api::batch::v1::JobStatus;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(phase: &str) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..PodStatus::default()
            }),
            ..Pod::default()
        }
    }

    fn sts(desired: i32, ready: Option<i32>) -> StatefulSet {
        StatefulSet {
            metadata: ObjectMeta {
                generation: Some(2),
                ..ObjectMeta::default()
            },
            spec: Some(StatefulSetSpec {
                replicas: Some(desired),
                ..StatefulSetSpec::default()
            }),
            status: Some(StatefulSetStatus {
                observed_generation: Some(2),
                replicas: desired,
                ready_replicas: ready,
                updated_replicas: Some(desired),
                current_revision: Some("argocd-application-controller-7d9".into()),
                update_revision: Some("argocd-application-controller-7d9".into()),
                ..StatefulSetStatus::default()
            }),
            ..StatefulSet::default()
        }
    }

    #[test]
    fn test_pod_phase() {
        assert!(pod_is_ready(&pod("Running"), false));
        assert!(!pod_is_ready(&pod("Pending"), false));
        assert!(pod_is_ready(&pod("Pending"), true));
        assert!(!pod_is_ready(&pod("Failed"), true));
        assert!(!pod_is_ready(&Pod::default(), true));
    }

    #[test]
    fn test_statefulset_needs_all_replicas() {
        assert!(statefulset_ready(&sts(3, Some(3))));
        assert!(!statefulset_ready(&sts(3, Some(2))));
        assert!(!statefulset_ready(&sts(1, None)));
        assert!(!statefulset_ready(&sts(0, Some(0))));
    }

    #[test]
    fn test_statefulset_mid_rollout_is_not_ready() {
        let mut rolling = sts(3, Some(3));
        if let Some(status) = rolling.status.as_mut() {
            status.updated_replicas = Some(1);
            status.update_revision = Some("argocd-application-controller-8f1".into());
        }
        assert!(!statefulset_ready(&rolling));

        let mut stale = sts(3, Some(3));
        stale.metadata.generation = Some(3);
        assert!(!statefulset_ready(&stale));

        let mut scaling = sts(3, Some(3));
        if let Some(status) = scaling.status.as_mut() {
            status.replicas = 4;
        }
        assert!(!statefulset_ready(&scaling));
    }

    #[test]
    fn test_deployment_uses_available_replicas() {
        let deploy = |desired, available| Deployment {
            spec: Some(DeploymentSpec {
                replicas: Some(desired),
                ..DeploymentSpec::default()
            }),
            status: Some(DeploymentStatus {
                available_replicas: available,
                ready_replicas: Some(desired),
                updated_replicas: Some(desired),
                replicas: Some(desired),
                ..DeploymentStatus::default()
            }),
            ..Deployment::default()
        };
        assert!(deployment_ready(&deploy(2, Some(2))));
        assert!(!deployment_ready(&deploy(2, Some(1))));
        assert!(!deployment_ready(&deploy(2, None)));
    }

    #[test]
    fn test_job_succeeded() {
        let job = |succeeded| Job {
            status: Some(JobStatus {
                succeeded,
                ..JobStatus::default()
            }),
            ..Job::default()
        };
        assert!(job_succeeded(&job(Some(1))));
        assert!(!job_succeeded(&job(Some(0))));
        assert!(!job_succeeded(&job(None)));
    }
}
