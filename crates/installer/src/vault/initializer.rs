//! Vault initialization and unsealing.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::Client;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::client::{Health, VaultClient};
use super::models::InitRequest;
use super::{VaultError, VaultMode};
use crate::kube::pod_exec::PodExec;
use crate::kube::secrets;

pub const VAULT_NAMESPACE: &str = "vault";
pub const UNSEAL_SECRET_NAME: &str = "vault-unseal-secret";
pub const ROOT_TOKEN_KEY: &str = "root-token";

const SECRET_SHARES: u8 = 5;
const SECRET_THRESHOLD: u8 = 3;
const LEADER_ADDR: &str = "http://vault-0.vault-internal:8200";

#[must_use]
pub fn unseal_key_name(n: usize) -> String {
    format!("root-unseal-key-{n}")
}

/// Root token and unseal key shares.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct UnsealMaterial {
    pub root_token: String,
    pub keys: Vec<String>,
}

impl fmt::Debug for UnsealMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnsealMaterial")
            .field("root_token", &"<redacted>")
            .field("keys", &self.keys.len())
            .finish()
    }
}

impl UnsealMaterial {
    /// Secret data: `root-token` plus `root-unseal-key-1..N`.
    #[must_use]
    pub fn to_secret_data(&self) -> BTreeMap<String, String> {
        let mut data = BTreeMap::new();
        data.insert(ROOT_TOKEN_KEY.to_string(), self.root_token.clone());
        for (i, key) in self.keys.iter().enumerate() {
            data.insert(unseal_key_name(i + 1), key.clone());
        }
        data
    }

    /// Rebuild from secret data; keys are read in index order until one is missing.
    #[must_use]
    pub fn from_secret_data(data: &BTreeMap<String, String>) -> Option<Self> {
        let root_token = data.get(ROOT_TOKEN_KEY)?.clone();
        let keys = (1..)
            .map_while(|n| data.get(&unseal_key_name(n)).cloned())
            .collect();
        Some(Self { root_token, keys })
    }
}

/// Durable home of the unseal material.
#[async_trait]
pub trait UnsealSecretStore: Send + Sync {
    async fn load(&self) -> Result<Option<UnsealMaterial>, VaultError>;

    async fn save(&self, material: &UnsealMaterial) -> Result<(), VaultError>;
}

/// Secret `vault/vault-unseal-secret`.
pub struct KubeUnsealSecretStore {
    client: Client,
}

impl KubeUnsealSecretStore {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl UnsealSecretStore for KubeUnsealSecretStore {
    async fn load(&self) -> Result<Option<UnsealMaterial>, VaultError> {
        let data = secrets::read(&self.client, VAULT_NAMESPACE, UNSEAL_SECRET_NAME).await?;
        Ok(data.as_ref().and_then(UnsealMaterial::from_secret_data))
    }

    async fn save(&self, material: &UnsealMaterial) -> Result<(), VaultError> {
        secrets::apply(
            &self.client,
            VAULT_NAMESPACE,
            UNSEAL_SECRET_NAME,
            BTreeMap::new(),
            material.to_secret_data(),
        )
        .await?;
        Ok(())
    }
}

/// Brings Vault from any state to initialized and unsealed.
pub struct VaultInitializer {
    client: VaultClient,
    store: Arc<dyn UnsealSecretStore>,
    exec: Arc<dyn PodExec>,
    mode: VaultMode,
    check_interval: Duration,
    timeout: Duration,
}

impl VaultInitializer {
    pub fn new(
        client: VaultClient,
        store: Arc<dyn UnsealSecretStore>,
        exec: Arc<dyn PodExec>,
        mode: VaultMode,
    ) -> Self {
        Self {
            client,
            store,
            exec,
            mode,
            check_interval: Duration::from_secs(10),
            timeout: Duration::from_secs(15 * 60),
        }
    }

    #[must_use]
    pub fn with_timing(mut self, check_interval: Duration, timeout: Duration) -> Self {
        self.check_interval = check_interval;
        self.timeout = timeout;
        self
    }

    /// Initialize (or reuse stored material) and unseal the leader, then
    /// join and unseal followers in HA mode.
    ///
    /// Transient failures of health, init and unseal calls are retried every
    /// check interval until the deadline.
    ///
    /// # Errors
    /// Returns [`VaultError::Timeout`] when the outer deadline passes and
    /// [`VaultError::Init`] for unrecoverable states.
    pub async fn initialize_and_unseal(&self) -> Result<UnsealMaterial, VaultError> {
        let started = Instant::now();
        let mut material = self.store.load().await?;
        if material.is_some() {
            info!("Reusing stored Vault unseal material");
        }

        loop {
            if started.elapsed() >= self.timeout {
                return Err(VaultError::Timeout(started.elapsed()));
            }

            let health = match self.client.health().await {
                Ok(health) => health,
                Err(e) if e.is_transient() => {
                    debug!(error = %e, "Vault not reachable yet");
                    tokio::time::sleep(self.check_interval).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match health {
                Health::Active => break,
                Health::Standby => {
                    debug!("Vault is standby, waiting");
                    tokio::time::sleep(self.check_interval).await;
                }
                Health::Uninitialized => {
                    if material.is_some() {
                        return Err(VaultError::Init(
                            "unseal material exists but Vault is not initialized".to_string(),
                        ));
                    }
                    match self.init().await {
                        Ok(initialized) => material = Some(initialized),
                        Err(e) if e.is_transient() => {
                            warn!(error = %e, "Vault init failed, retrying");
                            tokio::time::sleep(self.check_interval).await;
                        }
                        Err(e) => return Err(e),
                    }
                }
                Health::Sealed => {
                    if self.mode.autounseal() {
                        debug!("Waiting for KMS autounseal");
                        tokio::time::sleep(self.check_interval).await;
                        continue;
                    }
                    let Some(material) = material.as_ref() else {
                        return Err(VaultError::Init(
                            "Vault is sealed and no unseal keys are stored".to_string(),
                        ));
                    };
                    match self.unseal_leader(material).await {
                        Ok(()) => {}
                        Err(e) if e.is_transient() => {
                            warn!(error = %e, "Vault unseal failed, retrying");
                            tokio::time::sleep(self.check_interval).await;
                        }
                        Err(e) => return Err(e),
                    }
                }
                Health::Other(code) => {
                    warn!(code, "Unexpected Vault health status");
                    tokio::time::sleep(self.check_interval).await;
                }
            }
        }

        let material = material.ok_or_else(|| {
            VaultError::Init("Vault is active but no unseal material is stored".to_string())
        })?;
        info!("Vault leader initialized and unsealed");

        if let VaultMode::HaRaft { replicas, .. } = self.mode {
            for ordinal in 1..replicas {
                self.join_follower(ordinal, &material).await?;
            }
        }
        Ok(material)
    }

    async fn init(&self) -> Result<UnsealMaterial, VaultError> {
        let request = if self.mode.autounseal() {
            InitRequest::recovery(SECRET_SHARES, SECRET_THRESHOLD)
        } else {
            InitRequest::shamir(SECRET_SHARES, SECRET_THRESHOLD)
        };
        let response = self.client.init(&request).await?;
        let keys = if response.keys.is_empty() {
            response.recovery_keys
        } else {
            response.keys
        };
        let material = UnsealMaterial {
            root_token: response.root_token,
            keys,
        };
        self.store.save(&material).await?;
        info!(shares = material.keys.len(), "Vault initialized, unseal material stored");
        Ok(material)
    }

    async fn unseal_leader(&self, material: &UnsealMaterial) -> Result<(), VaultError> {
        for (i, key) in material
            .keys
            .iter()
            .take(usize::from(SECRET_THRESHOLD))
            .enumerate()
        {
            let response = self.client.unseal(key).await?;
            debug!(share = i + 1, progress = response.progress, "Submitted unseal share");
            if !response.sealed {
                info!("Vault unsealed");
                return Ok(());
            }
        }
        Err(VaultError::Init(
            "Vault still sealed after threshold key shares".to_string(),
        ))
    }

    async fn join_follower(&self, ordinal: u32, material: &UnsealMaterial) -> Result<(), VaultError> {
        let pod = format!("vault-{ordinal}");
        let join = ["vault", "operator", "raft", "join", LEADER_ADDR].map(String::from);
        match self.exec.exec(VAULT_NAMESPACE, &pod, None, &join).await {
            Ok(_) => info!(pod = %pod, "Joined raft cluster"),
            Err(e) if e.to_string().contains("already") => {
                debug!(pod = %pod, "Already part of the raft cluster");
            }
            Err(e) => return Err(e.into()),
        }

        if self.mode.autounseal() {
            return Ok(());
        }
        for key in material.keys.iter().take(usize::from(SECRET_THRESHOLD)) {
            let unseal = vec![
                "vault".to_string(),
                "operator".to_string(),
                "unseal".to_string(),
                key.clone(),
            ];
            self.exec.exec(VAULT_NAMESPACE, &pod, None, &unseal).await?;
        }
        info!(pod = %pod, "Follower unsealed");
        Ok(())
    }
}
