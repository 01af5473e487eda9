//! Supervised port-forward tunnels.
//!
//! A tunnel binds `127.0.0.1:<local_port>` and carries every accepted
//! connection to a port on the pod backing a target. The listener is bound
//! synchronously in [`PortForwardSupervisor::open`], so a busy port is
//! reported before anything is spawned and an existing tunnel on that port
//! keeps working.
//!
//! A Service target is resolved the way `kubectl port-forward svc/...` does
//! it: the first running pod behind the selector, and the container port the
//! Service port maps to through its `targetPort`.
//!
//! Lifecycle is published on a watch channel:
//! `Starting -> Ready -> (Restarting -> Ready)* -> Stopped | Dead`.
//! A failed connection is logged and the tunnel keeps serving. Repeated
//! consecutive failures, or a listener error, re-resolve the target and
//! restart up to [`RestartPolicy::max_restarts`] times; the budget is
//! refilled after a stable ready period. A panic inside the tunnel task is
//! caught and surfaced as [`TunnelError::Panic`].

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ListParams};
use kube::Client;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("local port {0} is already in use")]
    PortInUse(u16),

    #[error("tunnel on port {port} died after {restarts} restarts: {reason}")]
    Dead {
        port: u16,
        restarts: u32,
        reason: String,
    },

    #[error("tunnel on port {port} panicked: {message}")]
    Panic { port: u16, message: String },

    #[error("no running pod backs {0}")]
    NoPod(String),

    #[error("{target} does not expose port {port}")]
    NoPort { target: String, port: u16 },

    #[error("port-forward stream error: {0}")]
    Stream(String),

    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What a tunnel points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelTarget {
    Pod { namespace: String, name: String },
    /// Resolved to the lexicographically first running pod matching the
    /// service selector.
    Service { namespace: String, name: String },
}

impl TunnelTarget {
    pub fn pod(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Pod {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn service(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Service {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        match self {
            Self::Pod { namespace, .. } | Self::Service { namespace, .. } => namespace,
        }
    }
}

impl std::fmt::Display for TunnelTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pod { namespace, name } => write!(f, "pod/{namespace}/{name}"),
            Self::Service { namespace, name } => write!(f, "svc/{namespace}/{name}"),
        }
    }
}

/// One tunnel request.
#[derive(Debug, Clone)]
pub struct TunnelSpec {
    pub target: TunnelTarget,
    pub remote_port: u16,
    pub local_port: u16,
    pub restart_on_failure: bool,
}

impl TunnelSpec {
    #[must_use]
    pub fn new(target: TunnelTarget, local_port: u16, remote_port: u16) -> Self {
        Self {
            target,
            remote_port,
            local_port,
            restart_on_failure: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub backoff: Duration,
    /// Consecutive failed connections that force a re-resolve.
    pub failed_connections: u32,
    /// Time in `Ready` after which the restart budget is refilled.
    pub stable_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            backoff: Duration::from_secs(5),
            failed_connections: 3,
            stable_after: Duration::from_secs(60),
        }
    }
}

/// Pod and container port a tunnel carries connections to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub pod: String,
    pub port: u16,
}

/// Container port behind `service_port` on `pod`.
///
/// A missing `targetPort` means the same number; a named one is looked up in
/// the pod's container ports. Returns `None` if the Service has no such port.
#[must_use]
pub fn service_target_port(service: &Service, pod: &Pod, service_port: u16) -> Option<u16> {
    let entry = service
        .spec
        .as_ref()?
        .ports
        .as_ref()?
        .iter()
        .find(|p| p.port == i32::from(service_port))?;
    match &entry.target_port {
        None => Some(service_port),
        Some(IntOrString::Int(port)) => u16::try_from(*port).ok(),
        Some(IntOrString::String(name)) => pod
            .spec
            .as_ref()?
            .containers
            .iter()
            .flat_map(|c| c.ports.iter().flatten())
            .find(|p| p.name.as_deref() == Some(name.as_str()))
            .and_then(|p| u16::try_from(p.container_port).ok()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    Starting,
    Ready { pod: String },
    Restarting { attempt: u32 },
    Stopped,
    Dead { restarts: u32, reason: String },
    Panicked { message: String },
}

/// Moves bytes between local connections and pods.
#[async_trait]
pub trait Forwarder: Send + Sync + 'static {
    /// Pod currently backing `target` and the pod port `remote_port` maps to.
    async fn resolve(
        &self,
        target: &TunnelTarget,
        remote_port: u16,
    ) -> Result<Endpoint, TunnelError>;

    /// Carry `conn` to `namespace/pod:port` until either side closes.
    async fn bridge(
        &self,
        namespace: &str,
        pod: &str,
        port: u16,
        conn: TcpStream,
    ) -> Result<(), TunnelError>;
}

/// [`Forwarder`] over the Kubernetes port-forward subresource.
#[derive(Clone)]
pub struct KubeForwarder {
    client: Client,
}

impl KubeForwarder {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Forwarder for KubeForwarder {
    async fn resolve(
        &self,
        target: &TunnelTarget,
        remote_port: u16,
    ) -> Result<Endpoint, TunnelError> {
        match target {
            TunnelTarget::Pod { name, .. } => Ok(Endpoint {
                pod: name.clone(),
                port: remote_port,
            }),
            TunnelTarget::Service { namespace, name } => {
                let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
                let service = services.get(name).await?;
                let selector = service
                    .spec
                    .as_ref()
                    .and_then(|s| s.selector.as_ref())
                    .cloned()
                    .unwrap_or_default();
                if selector.is_empty() {
                    return Err(TunnelError::NoPod(target.to_string()));
                }
                let labels = selector
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(",");

                let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
                let pod = pods
                    .list(&ListParams::default().labels(&labels))
                    .await?
                    .items
                    .into_iter()
                    .filter(|p| {
                        p.metadata.name.is_some()
                            && p.status.as_ref().and_then(|s| s.phase.as_deref())
                                == Some("Running")
                    })
                    .min_by(|a, b| a.metadata.name.cmp(&b.metadata.name))
                    .ok_or_else(|| TunnelError::NoPod(target.to_string()))?;

                let port = service_target_port(&service, &pod, remote_port).ok_or_else(|| {
                    TunnelError::NoPort {
                        target: target.to_string(),
                        port: remote_port,
                    }
                })?;
                Ok(Endpoint {
                    pod: pod.metadata.name.unwrap_or_default(),
                    port,
                })
            }
        }
    }

    async fn bridge(
        &self,
        namespace: &str,
        pod: &str,
        port: u16,
        mut conn: TcpStream,
    ) -> Result<(), TunnelError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut forwarder = pods.portforward(pod, &[port]).await?;
        let mut upstream = forwarder
            .take_stream(port)
            .ok_or_else(|| TunnelError::Stream(format!("no stream for port {port}")))?;
        tokio::io::copy_bidirectional(&mut conn, &mut upstream).await?;
        drop(upstream);
        forwarder
            .join()
            .await
            .map_err(|e| TunnelError::Stream(e.to_string()))
    }
}

/// Caller's view of one tunnel.
#[derive(Clone)]
pub struct TunnelHandle {
    local_port: u16,
    state: watch::Receiver<TunnelState>,
    stop: CancellationToken,
}

impl TunnelHandle {
    #[must_use]
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    #[must_use]
    pub fn state(&self) -> TunnelState {
        self.state.borrow().clone()
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        matches!(*self.state.borrow(), TunnelState::Ready { .. })
    }

    /// Resolve once the tunnel accepts connections.
    ///
    /// # Errors
    /// Returns [`TunnelError::Dead`] or [`TunnelError::Panic`] if the tunnel
    /// gives up before becoming ready.
    pub async fn ready(&mut self) -> Result<(), TunnelError> {
        let port = self.local_port;
        let state = self
            .state
            .wait_for(|s| {
                !matches!(s, TunnelState::Starting | TunnelState::Restarting { .. })
            })
            .await
            .map_err(|_| TunnelError::Dead {
                port,
                restarts: 0,
                reason: "tunnel task exited".to_string(),
            })?
            .clone();
        match state {
            TunnelState::Ready { .. } => Ok(()),
            TunnelState::Dead { restarts, reason } => Err(TunnelError::Dead {
                port,
                restarts,
                reason,
            }),
            TunnelState::Panicked { message } => Err(TunnelError::Panic { port, message }),
            _ => Err(TunnelError::Dead {
                port,
                restarts: 0,
                reason: "stopped before ready".to_string(),
            }),
        }
    }

    /// Signal the tunnel to stop. Idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

struct Tunnel {
    handle: TunnelHandle,
    task: JoinHandle<()>,
}

/// Owns every tunnel opened during a run. Dropping it cancels them all.
pub struct PortForwardSupervisor {
    forwarder: Arc<dyn Forwarder>,
    policy: RestartPolicy,
    root: CancellationToken,
    tunnels: HashMap<u16, Tunnel>,
}

impl PortForwardSupervisor {
    pub fn new(forwarder: Arc<dyn Forwarder>) -> Self {
        Self {
            forwarder,
            policy: RestartPolicy::default(),
            root: CancellationToken::new(),
            tunnels: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: RestartPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Bind the local port and start the tunnel.
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    /// Returns [`TunnelError::PortInUse`] if the port is held by a live
    /// tunnel or by another process.
    pub fn open(&mut self, spec: TunnelSpec) -> Result<TunnelHandle, TunnelError> {
        let port = spec.local_port;
        if let Some(existing) = self.tunnels.get(&port) {
            if !existing.task.is_finished() {
                return Err(TunnelError::PortInUse(port));
            }
            self.tunnels.remove(&port);
        }

        let listener = bind_local(port)?;
        let (state_tx, state_rx) = watch::channel(TunnelState::Starting);
        let stop = self.root.child_token();
        let handle = TunnelHandle {
            local_port: port,
            state: state_rx,
            stop: stop.clone(),
        };

        let forwarder = Arc::clone(&self.forwarder);
        let policy = self.policy;
        let task = tokio::spawn(async move {
            let run = AssertUnwindSafe(run_tunnel(
                listener,
                spec,
                forwarder,
                policy,
                stop,
                state_tx.clone(),
            ))
            .catch_unwind()
            .await;
            if let Err(panic) = run {
                let message = panic_message(panic.as_ref());
                error!(port, message = %message, "Tunnel panicked");
                state_tx.send_replace(TunnelState::Panicked { message });
            }
        });

        self.tunnels.insert(
            port,
            Tunnel {
                handle: handle.clone(),
                task,
            },
        );
        Ok(handle)
    }

    /// [`open`](Self::open) and wait for readiness.
    ///
    /// # Errors
    /// Returns error if the port is busy or the tunnel dies before ready.
    pub async fn open_ready(&mut self, spec: TunnelSpec) -> Result<TunnelHandle, TunnelError> {
        let mut handle = self.open(spec)?;
        handle.ready().await?;
        Ok(handle)
    }

    /// Whether a tunnel on `port` is currently accepting connections.
    #[must_use]
    pub fn is_live(&self, port: u16) -> bool {
        self.tunnels.get(&port).is_some_and(|t| t.handle.is_live())
    }

    /// Stop the tunnel on `port` and wait until the port is released.
    pub async fn stop(&mut self, port: u16) {
        if let Some(tunnel) = self.tunnels.remove(&port) {
            tunnel.handle.stop();
            if let Err(e) = tunnel.task.await {
                warn!(port, error = %e, "Tunnel task ended abnormally");
            }
        }
    }

    /// Stop every tunnel.
    pub async fn stop_all(&mut self) {
        let ports: Vec<u16> = self.tunnels.keys().copied().collect();
        for port in ports {
            self.stop(port).await;
        }
    }
}

impl Drop for PortForwardSupervisor {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

fn bind_local(port: u16) -> Result<TcpListener, TunnelError> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let listener = std::net::TcpListener::bind(addr).map_err(|e| {
        if e.kind() == std::io::ErrorKind::AddrInUse {
            TunnelError::PortInUse(port)
        } else {
            TunnelError::Io(e)
        }
    })?;
    listener.set_nonblocking(true)?;
    Ok(TcpListener::from_std(listener)?)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

enum ServeEnd {
    Cancelled,
    Failed(TunnelError),
}

async fn run_tunnel(
    listener: TcpListener,
    spec: TunnelSpec,
    forwarder: Arc<dyn Forwarder>,
    policy: RestartPolicy,
    stop: CancellationToken,
    state: watch::Sender<TunnelState>,
) {
    let port = spec.local_port;
    let mut restarts = 0;

    loop {
        let (end, stable) = match forwarder.resolve(&spec.target, spec.remote_port).await {
            Ok(endpoint) => {
                info!(
                    port,
                    target = %spec.target,
                    pod = %endpoint.pod,
                    pod_port = endpoint.port,
                    "Tunnel ready"
                );
                state.send_replace(TunnelState::Ready {
                    pod: endpoint.pod.clone(),
                });
                let ready_at = Instant::now();
                let end = serve(&listener, &spec, &endpoint, &forwarder, policy, &stop).await;
                (end, ready_at.elapsed() >= policy.stable_after)
            }
            Err(e) => (ServeEnd::Failed(e), false),
        };

        let failure = match end {
            ServeEnd::Cancelled => {
                debug!(port, "Tunnel stopped");
                state.send_replace(TunnelState::Stopped);
                return;
            }
            ServeEnd::Failed(e) => e,
        };

        if stable && restarts > 0 {
            debug!(port, restarts, "Tunnel was stable, restart budget refilled");
            restarts = 0;
        }

        if !spec.restart_on_failure || restarts >= policy.max_restarts {
            error!(port, restarts, error = %failure, "Tunnel dead");
            state.send_replace(TunnelState::Dead {
                restarts,
                reason: failure.to_string(),
            });
            return;
        }

        restarts += 1;
        warn!(port, attempt = restarts, error = %failure, "Restarting tunnel");
        state.send_replace(TunnelState::Restarting { attempt: restarts });
        tokio::select! {
            () = stop.cancelled() => {
                state.send_replace(TunnelState::Stopped);
                return;
            }
            () = tokio::time::sleep(policy.backoff) => {}
        }
    }
}

/// Accept and bridge connections until stopped or the endpoint looks gone.
///
/// Connections still in flight when the endpoint is given up on are left to
/// finish on their own.
async fn serve(
    listener: &TcpListener,
    spec: &TunnelSpec,
    endpoint: &Endpoint,
    forwarder: &Arc<dyn Forwarder>,
    policy: RestartPolicy,
    stop: &CancellationToken,
) -> ServeEnd {
    let namespace = spec.target.namespace().to_string();
    let mut connections = JoinSet::new();
    let mut consecutive_failures = 0;

    loop {
        tokio::select! {
            () = stop.cancelled() => return ServeEnd::Cancelled,
            accepted = listener.accept() => {
                let conn = match accepted {
                    Ok((conn, _)) => conn,
                    Err(e) => {
                        connections.detach_all();
                        return ServeEnd::Failed(TunnelError::Io(e));
                    }
                };
                let forwarder = Arc::clone(forwarder);
                let namespace = namespace.clone();
                let pod = endpoint.pod.clone();
                let remote = endpoint.port;
                connections.spawn(async move {
                    forwarder.bridge(&namespace, &pod, remote, conn).await
                });
            }
            Some(finished) = connections.join_next() => {
                match finished {
                    Ok(Ok(())) => consecutive_failures = 0,
                    Ok(Err(e)) => {
                        consecutive_failures += 1;
                        warn!(
                            port = spec.local_port,
                            pod = %endpoint.pod,
                            consecutive_failures,
                            error = %e,
                            "Tunnel connection failed"
                        );
                        if consecutive_failures >= policy.failed_connections {
                            connections.detach_all();
                            return ServeEnd::Failed(e);
                        }
                    }
                    Err(join) if join.is_panic() => std::panic::resume_unwind(join.into_panic()),
                    Err(_) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn echo_endpoint() -> Endpoint {
        Endpoint {
            pod: "echo-0".to_string(),
            port: 8080,
        }
    }

    async fn echo(conn: TcpStream) -> Result<(), TunnelError> {
        let (mut rd, mut wr) = conn.into_split();
        tokio::io::copy(&mut rd, &mut wr).await?;
        Ok(())
    }

    /// Echoes every byte back.
    struct EchoForwarder;

    #[async_trait]
    impl Forwarder for EchoForwarder {
        async fn resolve(&self, _: &TunnelTarget, _: u16) -> Result<Endpoint, TunnelError> {
            Ok(echo_endpoint())
        }

        async fn bridge(
            &self,
            _namespace: &str,
            _pod: &str,
            _port: u16,
            conn: TcpStream,
        ) -> Result<(), TunnelError> {
            echo(conn).await
        }
    }

    /// Fails the first `failures` connections, then echoes.
    struct Flaky {
        resolves: AtomicU32,
        failures: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32) -> Self {
            Self {
                resolves: AtomicU32::new(0),
                failures: AtomicU32::new(failures),
            }
        }

        fn resolves(&self) -> u32 {
            self.resolves.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Forwarder for Flaky {
        async fn resolve(&self, _: &TunnelTarget, _: u16) -> Result<Endpoint, TunnelError> {
            self.resolves.fetch_add(1, Ordering::SeqCst);
            Ok(echo_endpoint())
        }

        async fn bridge(&self, _: &str, _: &str, _: u16, conn: TcpStream) -> Result<(), TunnelError> {
            let failed = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                drop(conn);
                return Err(TunnelError::Stream("connection reset by pod".to_string()));
            }
            echo(conn).await
        }
    }

    struct Unreachable(AtomicU32);

    #[async_trait]
    impl Forwarder for Unreachable {
        async fn resolve(&self, target: &TunnelTarget, _: u16) -> Result<Endpoint, TunnelError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(TunnelError::NoPod(target.to_string()))
        }

        async fn bridge(&self, _: &str, _: &str, _: u16, _: TcpStream) -> Result<(), TunnelError> {
            unreachable!()
        }
    }

    struct Panicky;

    #[async_trait]
    impl Forwarder for Panicky {
        async fn resolve(&self, _: &TunnelTarget, _: u16) -> Result<Endpoint, TunnelError> {
            panic!("resolver exploded");
        }

        async fn bridge(&self, _: &str, _: &str, _: u16, _: TcpStream) -> Result<(), TunnelError> {
            unreachable!()
        }
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn fast() -> RestartPolicy {
        RestartPolicy {
            max_restarts: 3,
            backoff: Duration::from_millis(1),
            failed_connections: 3,
            stable_after: Duration::from_secs(3600),
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    /// Connect and wait for the tunnel to hang up without echoing.
    async fn rejected_connection(port: u16) {
        let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        conn.write_all(b"x").await.ok();
        let mut buf = [0u8; 1];
        assert_eq!(conn.read(&mut buf).await.unwrap_or(0), 0);
    }

    async fn echoed_connection(port: u16) {
        let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        conn.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    fn spec(port: u16) -> TunnelSpec {
        TunnelSpec::new(TunnelTarget::service("argocd", "argocd-server"), port, 80)
    }

    #[tokio::test]
    async fn test_ready_tunnel_carries_traffic() {
        let port = free_port();
        let mut supervisor = PortForwardSupervisor::new(Arc::new(EchoForwarder));
        let handle = supervisor.open_ready(spec(port)).await.unwrap();
        assert!(handle.is_live());
        assert!(supervisor.is_live(port));

        let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_second_open_on_same_port_is_rejected() {
        let port = free_port();
        let mut supervisor = PortForwardSupervisor::new(Arc::new(EchoForwarder));
        supervisor.open_ready(spec(port)).await.unwrap();

        let err = supervisor.open(spec(port)).err().unwrap();
        assert!(matches!(err, TunnelError::PortInUse(p) if p == port));

        let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        conn.write_all(b"ok").await.unwrap();
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
    }

    #[tokio::test]
    async fn test_port_held_by_other_process() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = holder.local_addr().unwrap().port();
        let mut supervisor = PortForwardSupervisor::new(Arc::new(EchoForwarder));
        assert!(matches!(
            supervisor.open(spec(port)),
            Err(TunnelError::PortInUse(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_releases_port() {
        let port = free_port();
        let mut supervisor = PortForwardSupervisor::new(Arc::new(EchoForwarder));
        supervisor.open_ready(spec(port)).await.unwrap();

        supervisor.stop(port).await;
        assert!(!supervisor.is_live(port));
        std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
    }

    #[tokio::test]
    async fn test_gives_up_after_max_restarts() {
        let forwarder = Arc::new(Unreachable(AtomicU32::new(0)));
        let mut supervisor =
            PortForwardSupervisor::new(forwarder.clone()).with_policy(fast());
        let err = supervisor.open_ready(spec(free_port())).await.err().unwrap();
        assert!(matches!(err, TunnelError::Dead { restarts: 3, .. }));
        assert_eq!(forwarder.0.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_panic_is_surfaced() {
        let mut supervisor = PortForwardSupervisor::new(Arc::new(Panicky)).with_policy(fast());
        let err = supervisor.open_ready(spec(free_port())).await.err().unwrap();
        assert!(matches!(err, TunnelError::Panic { ref message, .. } if message.contains("exploded")));
    }

    #[tokio::test]
    async fn test_failed_connection_keeps_tunnel_serving() {
        let port = free_port();
        let forwarder = Arc::new(Flaky::new(1));
        let mut supervisor =
            PortForwardSupervisor::new(forwarder.clone()).with_policy(fast());
        let handle = supervisor.open_ready(spec(port)).await.unwrap();

        rejected_connection(port).await;
        echoed_connection(port).await;

        assert!(handle.is_live());
        assert_eq!(forwarder.resolves(), 1);
    }

    #[tokio::test]
    async fn test_consecutive_failures_re_resolve_target() {
        let port = free_port();
        let forwarder = Arc::new(Flaky::new(2));
        let policy = RestartPolicy {
            failed_connections: 2,
            ..fast()
        };
        let mut supervisor = PortForwardSupervisor::new(forwarder.clone()).with_policy(policy);
        let handle = supervisor.open_ready(spec(port)).await.unwrap();

        rejected_connection(port).await;
        rejected_connection(port).await;
        eventually(|| forwarder.resolves() == 2 && handle.is_live()).await;

        echoed_connection(port).await;
    }

    #[tokio::test]
    async fn test_restart_budget_refills_after_stable_period() {
        let port = free_port();
        let forwarder = Arc::new(Flaky::new(3));
        let policy = RestartPolicy {
            max_restarts: 1,
            failed_connections: 1,
            stable_after: Duration::ZERO,
            ..fast()
        };
        let mut supervisor = PortForwardSupervisor::new(forwarder.clone()).with_policy(policy);
        let handle = supervisor.open_ready(spec(port)).await.unwrap();

        for expected in 2..=4 {
            rejected_connection(port).await;
            eventually(|| forwarder.resolves() == expected && handle.is_live()).await;
        }

        echoed_connection(port).await;
        assert!(!matches!(handle.state(), TunnelState::Dead { .. }));
    }
}
