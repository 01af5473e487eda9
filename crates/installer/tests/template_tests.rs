//! Placeholder coverage of the k3d gitops template.

use std::path::Path;

use k1_cli::state::keys;
use k1_cli::template::{detokenize, validate_tokens, TemplateTokens};
use k1_cli::{ConfigStore, InstallationState, K1Paths};

/// Every placeholder the k3d gitops template carries.
const K3D_TEMPLATE_TOKENS: &[&str] = &[
    "ALERTS_EMAIL",
    "ARGOCD_INGRESS_URL",
    "ARGO_WORKFLOWS_INGRESS_URL",
    "ATLANTIS_ALLOW_LIST",
    "ATLANTIS_INGRESS_URL",
    "CLUSTER_NAME",
    "CLOUD_PROVIDER",
    "CLUSTER_ID",
    "CLUSTER_TYPE",
    "DOMAIN_NAME",
    "KUBEFIRST_TEAM",
    "KUBEFIRST_VERSION",
    "KUBE_CONFIG_PATH",
    "METAPHOR_DEVELOPMENT_INGRESS_URL",
    "METAPHOR_STAGING_INGRESS_URL",
    "METAPHOR_PRODUCTION_INGRESS_URL",
    "GITHUB_HOST",
    "GITHUB_OWNER",
    "GITHUB_USER",
    "GIT_PROVIDER",
    "GITOPS_REPO_GIT_URL",
    "GITLAB_HOST",
    "GITLAB_OWNER",
    "GITLAB_USER",
    "GITLAB_OWNER_GROUP_ID",
    "VAULT_INGRESS_URL",
    "USE_TELEMETRY",
    "K3D_DOMAIN",
];

fn k3d_state(dir: &Path) -> InstallationState {
    let mut store = ConfigStore::open(dir.join(".kubefirst")).unwrap();
    store.set_flag(keys::CLOUD_PROVIDER, "k3d");
    store.set_flag(keys::GIT_PROVIDER, "github");
    store.set_flag(keys::GIT_OWNER, "Kubefirst-Labs");
    store.set_flag(keys::DOMAIN_NAME, "kubefirst.dev");
    store.set_flag(keys::CLUSTER_NAME, "kubefirst");
    InstallationState::from_store(&mut store).unwrap()
}

#[test]
fn test_k3d_template_placeholders_are_known() {
    let dir = tempfile::tempdir().unwrap();
    let repo = dir.path().join("gitops");
    std::fs::create_dir_all(&repo).unwrap();
    std::fs::write(repo.join("values.yaml"), "host: gitops.<K3D_DOMAIN>\n").unwrap();

    validate_tokens(&repo).unwrap();
}

#[test]
fn test_k3d_template_is_fully_detokenized() {
    let dir = tempfile::tempdir().unwrap();
    let repo = dir.path().join("gitops");
    std::fs::create_dir_all(repo.join("registry")).unwrap();
    let body: String = K3D_TEMPLATE_TOKENS
        .iter()
        .map(|name| format!("{}: <{name}>\n", name.to_lowercase()))
        .collect();
    std::fs::write(repo.join("registry/values.yaml"), &body).unwrap();

    validate_tokens(&repo).unwrap();

    let state = k3d_state(dir.path());
    let tokens = TemplateTokens::from_state(&state, &K1Paths::at(dir.path().join(".k1")));
    assert_eq!(detokenize(&repo, &tokens).unwrap(), 1);

    let out = std::fs::read_to_string(repo.join("registry/values.yaml")).unwrap();
    assert!(!out.contains('<'), "placeholder left behind:\n{out}");
    assert!(out.contains("k3d_domain: kubefirst.dev\n"));
    assert!(out.contains("domain_name: kubefirst.dev\n"));
    assert!(out.contains("github_owner: kubefirst-labs\n"));
    assert!(out.contains("cloud_provider: k3d\n"));
}
