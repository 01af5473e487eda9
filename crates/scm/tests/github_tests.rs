//! GitHub and GitLab driver tests against stubbed APIs.

use std::time::Duration;

use k1_scm::github::{device_flow::DeviceFlow, GitHub, REQUIRED_SCOPES};
use k1_scm::gitlab::GitLab;
use k1_scm::{GitHost, PollPolicy, ScmError};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn github(server: &MockServer) -> GitHub {
    GitHub::new("acme", "ghp_test")
        .unwrap()
        .with_base_url(server.uri())
}

#[tokio::test]
async fn test_authenticate_accepts_fully_scoped_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/user"))
        .and(header("Authorization", "Bearer ghp_test"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-OAuth-Scopes", REQUIRED_SCOPES.join(", ").as_str())
                .set_body_json(json!({"login": "octocat"})),
        )
        .mount(&server)
        .await;

    let user = github(&server).authenticate().await.unwrap();
    assert_eq!(user.login, "octocat");
}

#[tokio::test]
async fn test_authenticate_rejects_missing_scopes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/user"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-OAuth-Scopes", "repo")
                .set_body_json(json!({"login": "octocat"})),
        )
        .mount(&server)
        .await;

    let err = github(&server).authenticate().await.unwrap_err();
    match err {
        ScmError::Auth(message) => assert!(message.contains("delete_repo")),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_create_repo_in_org_reports_existing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/orgs/acme"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"login": "acme"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/orgs/acme/repos"))
        .and(body_partial_json(json!({"name": "gitops", "private": true})))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({
            "message": "Repository creation failed.",
            "errors": [{"message": "name already exists on this account"}]
        })))
        .mount(&server)
        .await;

    let err = github(&server)
        .create_private_repo("gitops", "kubefirst gitops")
        .await
        .unwrap_err();
    assert!(matches!(err, ScmError::RepoExists(name) if name == "acme/gitops"));
}

#[tokio::test]
async fn test_create_repo_for_user_account() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/orgs/acme"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/user/repos"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "clone_url": "https://github.com/acme/metaphor.git",
            "ssh_url": "git@github.com:acme/metaphor.git"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let urls = github(&server)
        .create_private_repo("metaphor", "example app")
        .await
        .unwrap();
    assert_eq!(urls.ssh, "git@github.com:acme/metaphor.git");
}

#[tokio::test]
async fn test_delete_ssh_keys_only_removes_matching_title() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/user/keys"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": 1, "title": "kbot-mgmt"},
            {"id": 2, "title": "laptop"},
            {"id": 3, "title": "kbot-mgmt"}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/user/keys/1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/user/keys/3"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let removed = github(&server).delete_ssh_keys("kbot-mgmt").await.unwrap();
    assert_eq!(removed, 2);
}

#[tokio::test]
async fn test_poll_comments_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/gitops/issues/7/comments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"body": "working"}])))
        .mount(&server)
        .await;

    let err = github(&server)
        .poll_pull_request_comments(
            "gitops",
            7,
            "Ran Plan",
            PollPolicy {
                attempts: 2,
                interval: Duration::from_millis(10),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ScmError::Timeout { attempts: 2, .. }));
}

#[tokio::test]
async fn test_poll_comments_finds_needle() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/gitops/issues/7/comments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"body": "Ran Plan for dir: `terraform/users`"}
        ])))
        .mount(&server)
        .await;

    github(&server)
        .poll_pull_request_comments("gitops", 7, "Ran Plan", PollPolicy::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_device_flow_handles_pending_then_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login/device/code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "device_code": "dev-123",
            "user_code": "ABCD-1234",
            "verification_uri": "https://github.com/login/device",
            "expires_in": 60,
            "interval": 1
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/login/oauth/access_token"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"error": "authorization_pending"})),
        )
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/login/oauth/access_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "gho_issued",
            "token_type": "bearer"
        })))
        .with_priority(2)
        .mount(&server)
        .await;

    let mut shown = None;
    let token = DeviceFlow::new("client-id")
        .unwrap()
        .with_base_url(server.uri())
        .authorize(|code| shown = Some(code.code.clone()))
        .await
        .unwrap();
    assert_eq!(token, "gho_issued");
    assert_eq!(shown.as_deref(), Some("ABCD-1234"));
}

#[tokio::test]
async fn test_gitlab_creates_project_in_group_namespace() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/groups/acme"))
        .and(header("PRIVATE-TOKEN", "glpat"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"id": 42, "full_path": "acme"})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/projects"))
        .and(body_partial_json(json!({
            "name": "gitops",
            "namespace_id": 42,
            "visibility": "private"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": 7,
            "http_url_to_repo": "https://gitlab.com/acme/gitops.git",
            "ssh_url_to_repo": "git@gitlab.com:acme/gitops.git"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let gitlab = GitLab::new("gitlab.com", "acme", "glpat")
        .unwrap()
        .with_base_url(server.uri());
    let urls = gitlab.create_private_repo("gitops", "gitops").await.unwrap();
    assert_eq!(urls.https, "https://gitlab.com/acme/gitops.git");
    assert_eq!(gitlab.group_id().await.unwrap(), 42);
}
