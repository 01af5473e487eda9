//! Vault initialization against a stubbed `sys` API.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k1_cli::kube::pod_exec::PodExec;
use k1_cli::kube::KubeError;
use k1_cli::vault::{
    UnsealMaterial, UnsealSecretStore, VaultClient, VaultError, VaultInitializer, VaultMode,
};
use serde_json::json;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Default)]
struct MemoryStore {
    material: Mutex<Option<UnsealMaterial>>,
    saves: Mutex<u32>,
}

impl MemoryStore {
    fn with(material: UnsealMaterial) -> Self {
        Self {
            material: Mutex::new(Some(material)),
            saves: Mutex::new(0),
        }
    }
}

#[async_trait]
impl UnsealSecretStore for MemoryStore {
    async fn load(&self) -> Result<Option<UnsealMaterial>, VaultError> {
        Ok(self.material.lock().unwrap().clone())
    }

    async fn save(&self, material: &UnsealMaterial) -> Result<(), VaultError> {
        *self.material.lock().unwrap() = Some(material.clone());
        *self.saves.lock().unwrap() += 1;
        Ok(())
    }
}

#[derive(Default)]
struct RecordingExec {
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

#[async_trait]
impl PodExec for RecordingExec {
    async fn exec(
        &self,
        _namespace: &str,
        pod: &str,
        _container: Option<&str>,
        command: &[String],
    ) -> Result<String, KubeError> {
        self.calls
            .lock()
            .unwrap()
            .push((pod.to_string(), command.to_vec()));
        Ok(String::new())
    }
}

fn material() -> UnsealMaterial {
    UnsealMaterial {
        root_token: "hvs.root".to_string(),
        keys: (1..=5).map(|n| format!("key-{n}")).collect(),
    }
}

async fn mount_health_sequence(server: &MockServer, codes: &[u16]) {
    for (i, code) in codes.iter().enumerate() {
        let priority = u8::try_from(i + 1).unwrap();
        let mock = Mock::given(method("GET"))
            .and(path("/v1/sys/health"))
            .respond_with(ResponseTemplate::new(*code))
            .with_priority(priority);
        if i + 1 < codes.len() {
            mock.up_to_n_times(1).mount(server).await;
        } else {
            mock.mount(server).await;
        }
    }
}

async fn mount_unseal(server: &MockServer, sealed_responses: u64) {
    Mock::given(method("PUT"))
        .and(path("/v1/sys/unseal"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sealed": true, "t": 3, "n": 5, "progress": 1
        })))
        .up_to_n_times(sealed_responses)
        .with_priority(1)
        .mount(server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/unseal"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sealed": false, "t": 3, "n": 5, "progress": 0
        })))
        .with_priority(2)
        .mount(server)
        .await;
}

fn initializer(
    server: &MockServer,
    store: Arc<MemoryStore>,
    exec: Arc<RecordingExec>,
    mode: VaultMode,
) -> VaultInitializer {
    VaultInitializer::new(VaultClient::new(server.uri()).unwrap(), store, exec, mode)
        .with_timing(Duration::from_millis(10), Duration::from_secs(5))
}

#[tokio::test]
async fn test_fresh_vault_is_initialized_stored_and_unsealed() {
    let server = MockServer::start().await;
    mount_health_sequence(&server, &[501, 503, 200]).await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/init"))
        .and(body_json(json!({"secret_shares": 5, "secret_threshold": 3})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "keys": ["k1", "k2", "k3", "k4", "k5"],
            "keys_base64": ["a", "b", "c", "d", "e"],
            "root_token": "hvs.fresh"
        })))
        .expect(1)
        .mount(&server)
        .await;
    mount_unseal(&server, 2).await;

    let store = Arc::new(MemoryStore::default());
    let exec = Arc::new(RecordingExec::default());
    let material = initializer(&server, Arc::clone(&store), Arc::clone(&exec), VaultMode::SingleNode)
        .initialize_and_unseal()
        .await
        .unwrap();

    assert_eq!(material.root_token, "hvs.fresh");
    assert_eq!(material.keys.len(), 5);
    assert_eq!(*store.saves.lock().unwrap(), 1);
    assert_eq!(store.material.lock().unwrap().as_ref(), Some(&material));
    assert!(exec.calls.lock().unwrap().is_empty());

    let data = material.to_secret_data();
    assert_eq!(data["root-token"], "hvs.fresh");
    assert_eq!(data["root-unseal-key-3"], "k3");
}

#[tokio::test]
async fn test_stored_material_is_reused_and_followers_join() {
    let server = MockServer::start().await;
    mount_health_sequence(&server, &[503, 200]).await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/init"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    mount_unseal(&server, 2).await;

    let store = Arc::new(MemoryStore::with(material()));
    let exec = Arc::new(RecordingExec::default());
    let mode = VaultMode::HaRaft {
        replicas: 3,
        autounseal: false,
    };
    let unsealed = initializer(&server, Arc::clone(&store), Arc::clone(&exec), mode)
        .initialize_and_unseal()
        .await
        .unwrap();

    assert_eq!(unsealed, material());
    assert_eq!(*store.saves.lock().unwrap(), 0);

    let calls = exec.calls.lock().unwrap();
    assert_eq!(calls.len(), 8, "join plus three unseal shares per follower");
    assert_eq!(calls[0].0, "vault-1");
    assert_eq!(calls[0].1[..4], ["vault", "operator", "raft", "join"]);
    assert_eq!(calls[1].1, ["vault", "operator", "unseal", "key-1"]);
    assert_eq!(calls[4].0, "vault-2");
    assert!(calls.iter().all(|(_, cmd)| !cmd.contains(&"key-4".to_string())));
}

#[tokio::test]
async fn test_autounseal_followers_only_join() {
    let server = MockServer::start().await;
    mount_health_sequence(&server, &[503, 503, 200]).await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/unseal"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::with(material()));
    let exec = Arc::new(RecordingExec::default());
    let mode = VaultMode::HaRaft {
        replicas: 3,
        autounseal: true,
    };
    initializer(&server, store, Arc::clone(&exec), mode)
        .initialize_and_unseal()
        .await
        .unwrap();

    let calls = exec.calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|(_, cmd)| cmd[2] == "raft"));
}

#[tokio::test]
async fn test_uninitialized_vault_with_stored_material_is_an_error() {
    let server = MockServer::start().await;
    mount_health_sequence(&server, &[501]).await;

    let store = Arc::new(MemoryStore::with(material()));
    let err = initializer(&server, store, Arc::default(), VaultMode::SingleNode)
        .initialize_and_unseal()
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::Init(_)));
}

#[tokio::test]
async fn test_sealed_forever_times_out() {
    let server = MockServer::start().await;
    mount_health_sequence(&server, &[503]).await;

    let mode = VaultMode::HaRaft {
        replicas: 3,
        autounseal: true,
    };
    let err = VaultInitializer::new(
        VaultClient::new(server.uri()).unwrap(),
        Arc::new(MemoryStore::with(material())),
        Arc::new(RecordingExec::default()),
        mode,
    )
    .with_timing(Duration::from_millis(10), Duration::from_millis(200))
    .initialize_and_unseal()
    .await
    .unwrap_err();
    assert!(matches!(err, VaultError::Timeout(_)));
}

#[tokio::test]
async fn test_unseal_server_error_is_retried() {
    let server = MockServer::start().await;
    mount_health_sequence(&server, &[503, 503, 200]).await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/unseal"))
        .respond_with(ResponseTemplate::new(503).set_body_string("Vault is sealed"))
        .up_to_n_times(1)
        .expect(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/unseal"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sealed": false, "t": 3, "n": 5, "progress": 0
        })))
        .expect(1)
        .with_priority(2)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::with(material()));
    let unsealed = initializer(&server, store, Arc::default(), VaultMode::SingleNode)
        .initialize_and_unseal()
        .await
        .unwrap();
    assert_eq!(unsealed, material());
}

#[tokio::test]
async fn test_init_server_error_is_retried() {
    let server = MockServer::start().await;
    mount_health_sequence(&server, &[501, 501, 503, 200]).await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/init"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/init"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "keys": ["k1", "k2", "k3", "k4", "k5"],
            "root_token": "hvs.second"
        })))
        .with_priority(2)
        .mount(&server)
        .await;
    mount_unseal(&server, 2).await;

    let store = Arc::new(MemoryStore::default());
    let material = initializer(&server, Arc::clone(&store), Arc::default(), VaultMode::SingleNode)
        .initialize_and_unseal()
        .await
        .unwrap();

    assert_eq!(material.root_token, "hvs.second");
    assert_eq!(*store.saves.lock().unwrap(), 1);
    let inits = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/v1/sys/init")
        .count();
    assert_eq!(inits, 2);
}

#[tokio::test]
async fn test_rejected_init_is_not_retried() {
    let server = MockServer::start().await;
    mount_health_sequence(&server, &[501]).await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/init"))
        .respond_with(ResponseTemplate::new(400).set_body_string("Vault is already initialized"))
        .expect(1)
        .mount(&server)
        .await;

    let err = initializer(&server, Arc::default(), Arc::default(), VaultMode::SingleNode)
        .initialize_and_unseal()
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::Rejected { op: "init", status: 400, .. }));
    assert!(!err.is_transient());
}
