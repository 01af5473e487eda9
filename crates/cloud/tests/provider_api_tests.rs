//! HTTP-level tests for the REST-backed providers.

use k1_cloud::{digitalocean::DigitalOcean, vultr::Vultr, CloudProvider, CloudProviderError, TxtRecord};
use serde_json::json;
use wiremock::matchers::{bearer_token, body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn liveness_record() -> TxtRecord {
    TxtRecord {
        name: "kubefirst-liveness.example.com".to_string(),
        value: "domain record propagated".to_string(),
        ttl: 10,
    }
}

async fn digitalocean(server: &MockServer) -> DigitalOcean {
    DigitalOcean::new("do-token", "nyc3", "key", "secret")
        .unwrap()
        .with_base_url(server.uri())
}

async fn vultr(server: &MockServer) -> Vultr {
    Vultr::new("vultr-key", "ewr", None)
        .unwrap()
        .with_base_url(server.uri())
}

// =============================================================================
// DigitalOcean
// =============================================================================

#[tokio::test]
async fn test_digitalocean_identity() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/account"))
        .and(bearer_token("do-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "account": {"uuid": "abc-123", "email": "ops@example.com"}
        })))
        .mount(&server)
        .await;

    let identity = digitalocean(&server).await.identity().await.unwrap();
    assert_eq!(identity.account_id, "abc-123");
    assert_eq!(identity.principal, "ops@example.com");
}

#[tokio::test]
async fn test_digitalocean_missing_zone() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/domains/example.com"))
        .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
        .mount(&server)
        .await;

    let err = digitalocean(&server)
        .await
        .hosted_zone("example.com")
        .await
        .unwrap_err();
    assert!(matches!(err, CloudProviderError::HostedZoneNotFound(d) if d == "example.com"));
}

#[tokio::test]
async fn test_digitalocean_upsert_creates_with_ttl_floor() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/domains/example.com"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"domain": {"name": "example.com"}})),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/domains/example.com/records"))
        .and(query_param("type", "TXT"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"domain_records": []})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/domains/example.com/records"))
        .and(body_partial_json(json!({
            "type": "TXT",
            "name": "kubefirst-liveness",
            "data": "domain record propagated",
            "ttl": 30
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let provider = digitalocean(&server).await;
    let zone = provider.hosted_zone("example.com").await.unwrap();
    provider
        .upsert_txt_record(&zone, &liveness_record())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_digitalocean_load_balancers_filtered_by_cluster_tag() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/kubernetes/clusters"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "kubernetes_clusters": [
                {"id": "c-1", "name": "mgmt"},
                {"id": "c-2", "name": "other"}
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/load_balancers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "load_balancers": [
                {"id": "lb-1", "name": "ingress", "tag": "k8s:c-1"},
                {"id": "lb-2", "name": "foreign", "tag": "k8s:c-2"}
            ]
        })))
        .mount(&server)
        .await;

    let lbs = digitalocean(&server)
        .await
        .load_balancers("mgmt")
        .await
        .unwrap();
    assert_eq!(lbs, vec!["ingress (lb-1)".to_string()]);
}

// =============================================================================
// Vultr
// =============================================================================

#[tokio::test]
async fn test_vultr_upsert_updates_existing_record() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/domains/example.com/records"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "records": [
                {"id": "r-1", "type": "TXT", "name": "kubefirst-liveness", "data": "old"},
                {"id": "r-2", "type": "A", "name": "www", "data": "1.2.3.4"}
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/v2/domains/example.com/records/r-1"))
        .and(body_partial_json(json!({"data": "domain record propagated"})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let zone = k1_cloud::HostedZone {
        id: "example.com".into(),
        name: "example.com".into(),
    };
    vultr(&server)
        .await
        .upsert_txt_record(&zone, &liveness_record())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_vultr_delete_missing_record_is_ok() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/domains/example.com/records"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"records": []})))
        .mount(&server)
        .await;

    let zone = k1_cloud::HostedZone {
        id: "example.com".into(),
        name: "example.com".into(),
    };
    vultr(&server)
        .await
        .delete_txt_record(&zone, &liveness_record())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_vultr_auth_failure_maps_to_auth_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/account"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .mount(&server)
        .await;

    let err = vultr(&server).await.identity().await.unwrap_err();
    assert!(matches!(err, CloudProviderError::Auth(_)));
}

#[tokio::test]
async fn test_vultr_buckets_need_object_storage_keys() {
    let server = MockServer::start().await;
    let err = vultr(&server)
        .await
        .create_bucket("k1-state-store")
        .await
        .unwrap_err();
    assert!(matches!(err, CloudProviderError::Config(_)));
}
