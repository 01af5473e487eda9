//! Server-side apply of YAML manifests.

use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::core::GroupVersionKind;
use kube::discovery::{self, Scope};
use kube::Client;
use serde::Deserialize;
use tracing::{debug, info};

use super::{KubeError, FIELD_MANAGER};

/// Parse every non-empty document of a multi-document YAML stream.
///
/// # Errors
/// Returns [`KubeError::Manifest`] for documents that are not Kubernetes objects.
pub fn parse_documents(yaml: &str) -> Result<Vec<DynamicObject>, KubeError> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(yaml) {
        let value = serde_yaml::Value::deserialize(document)
            .map_err(|e| KubeError::Manifest(e.to_string()))?;
        if value.is_null() {
            continue;
        }
        let object: DynamicObject =
            serde_yaml::from_value(value).map_err(|e| KubeError::Manifest(e.to_string()))?;
        if object.types.is_none() {
            return Err(KubeError::Manifest(format!(
                "document '{}' has no apiVersion/kind",
                object.metadata.name.as_deref().unwrap_or("<unnamed>")
            )));
        }
        objects.push(object);
    }
    Ok(objects)
}

/// Apply every document in `yaml`, resolving kinds through discovery.
///
/// Namespaced objects without a namespace land in `default_namespace`.
/// Returns `kind/name` of each applied object.
///
/// # Errors
/// Returns error on parse failures, unknown kinds or API rejections.
pub async fn apply_manifests(
    client: &Client,
    yaml: &str,
    default_namespace: &str,
) -> Result<Vec<String>, KubeError> {
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let mut applied = Vec::new();

    for object in parse_documents(yaml)? {
        let types = object
            .types
            .as_ref()
            .ok_or_else(|| KubeError::Manifest("missing type metadata".to_string()))?;
        let gvk = GroupVersionKind::try_from(types)
            .map_err(|e| KubeError::Manifest(e.to_string()))?;
        let name = object
            .metadata
            .name
            .clone()
            .ok_or_else(|| KubeError::Manifest(format!("{} without metadata.name", gvk.kind)))?;

        let (resource, caps) = discovery::pinned_kind(client, &gvk).await?;
        let api: Api<DynamicObject> = if caps.scope == Scope::Namespaced {
            let namespace = object
                .metadata
                .namespace
                .as_deref()
                .unwrap_or(default_namespace);
            Api::namespaced_with(client.clone(), namespace, &resource)
        } else {
            Api::all_with(client.clone(), &resource)
        };

        debug!(kind = %gvk.kind, name = %name, "Applying object");
        api.patch(&name, &params, &Patch::Apply(&object)).await?;
        applied.push(format!("{}/{name}", gvk.kind));
    }

    info!(count = applied.len(), "Applied manifests");
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_skips_empty_documents() {
        let yaml = "---\napiVersion: argoproj.io/v1alpha1\nkind: Application\nmetadata:\n  name: registry\n  namespace: argocd\n---\n---\napiVersion: v1\nkind: Namespace\nmetadata:\n  name: vault\n";
        let objects = parse_documents(yaml).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].metadata.name.as_deref(), Some("registry"));
        assert_eq!(objects[1].types.as_ref().unwrap().kind, "Namespace");
    }

    #[test]
    fn test_parse_rejects_untyped_documents() {
        let err = parse_documents("metadata:\n  name: orphan\n").unwrap_err();
        assert!(matches!(err, KubeError::Manifest(_)));
    }
}
