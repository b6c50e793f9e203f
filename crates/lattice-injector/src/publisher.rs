//! Artifact publication
//!
//! The synthesized template is stored as the `config` key of a ConfigMap in
//! the mesh namespace, owned by the MeshConfig. The whole ConfigMap is
//! server-side applied on every publish, so the webhook never reads a
//! document that mixes an old template with a new policy.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Client, ResourceExt};
use lattice_common::crd::MeshConfig;
use lattice_common::kube_utils::{apply_namespaced, controller_owner_ref, ObjectMeta};
use tracing::{info, instrument, warn};

use crate::artifact::SynthesizedArtifact;
use crate::composer::synthesize;
use crate::error::SynthesisError;

/// Name of the ConfigMap the webhook reads
pub const CONFIG_MAP_NAME: &str = "istio-sidecar-injector";
/// Data key holding the injector config
pub const CONFIG_KEY: &str = "config";
/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "lattice-sidecar-injector";

/// Labels carried by every injector resource
pub const INJECTOR_LABELS: [(&str, &str); 2] =
    [("app", "istio-sidecar-injector"), ("istio", "sidecar-injector")];

/// Build the ConfigMap holding `artifact` for `mesh`
///
/// The owner reference is only set once the MeshConfig has been persisted.
pub fn build_config_map(
    mesh: &MeshConfig,
    artifact: &SynthesizedArtifact,
) -> Result<ConfigMap, SynthesisError> {
    let envelope = artifact.envelope()?;

    let mut meta =
        ObjectMeta::new(CONFIG_MAP_NAME, mesh.mesh_namespace()).with_labels(INJECTOR_LABELS);
    if let Some(owner) = controller_owner_ref(mesh) {
        meta = meta.with_owner(owner);
    }

    Ok(ConfigMap {
        metadata: meta.into(),
        data: Some(BTreeMap::from([(CONFIG_KEY.to_string(), envelope)])),
        ..Default::default()
    })
}

/// Server-side apply the injector ConfigMap
#[instrument(skip(client, config_map), fields(namespace = ?config_map.metadata.namespace))]
pub async fn apply_injector_config_map(
    client: &Client,
    config_map: &ConfigMap,
    field_manager: &str,
) -> Result<(), lattice_common::Error> {
    if let Err(e) = apply_namespaced(client, config_map, field_manager).await {
        warn!(error = %e, retryable = e.is_retryable(), "failed to publish injector config");
        return Err(e);
    }
    info!(name = CONFIG_MAP_NAME, "published injector config");
    Ok(())
}

/// Synthesize the template for `mesh` and publish it
///
/// Synthesis and publication succeed or fail together; the caller retries
/// both as a unit.
#[instrument(skip(client, mesh), fields(mesh = %mesh.name_any()))]
pub async fn publish(
    client: &Client,
    mesh: &MeshConfig,
    field_manager: &str,
) -> Result<ConfigMap, lattice_common::Error> {
    let artifact = synthesize(mesh)?;
    let config_map = build_config_map(mesh, &artifact)?;
    apply_injector_config_map(client, &config_map, field_manager).await?;
    Ok(config_map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{InjectionPolicy, InjectorConfig};
    use lattice_common::crd::MeshConfigSpec;

    fn mesh(uid: Option<&str>) -> MeshConfig {
        let mut spec = MeshConfigSpec::default();
        spec.sidecar_injector.auto_injection_policy_enabled = Some(true);
        let mut mesh = MeshConfig::new("default", spec);
        mesh.metadata.namespace = Some("mesh-system".to_string());
        mesh.metadata.uid = uid.map(str::to_string);
        mesh
    }

    #[test]
    fn config_map_carries_the_envelope() {
        let mesh = mesh(None);
        let artifact = synthesize(&mesh).unwrap();
        let cm = build_config_map(&mesh, &artifact).unwrap();

        assert_eq!(cm.metadata.name.as_deref(), Some(CONFIG_MAP_NAME));
        assert_eq!(cm.metadata.namespace.as_deref(), Some("mesh-system"));
        let labels = cm.metadata.labels.as_ref().unwrap();
        assert_eq!(labels["app"], "istio-sidecar-injector");
        assert_eq!(labels["istio"], "sidecar-injector");
        assert_eq!(labels[lattice_common::LABEL_MANAGED_BY], "lattice");

        let data = cm.data.as_ref().unwrap();
        assert_eq!(data.len(), 1);
        let config: InjectorConfig = serde_yaml::from_str(&data[CONFIG_KEY]).unwrap();
        assert_eq!(config.policy, InjectionPolicy::Enabled);
        assert_eq!(config.template, artifact.template());
    }

    #[test]
    fn unpersisted_mesh_gets_no_owner_reference() {
        let mesh = mesh(None);
        let cm = build_config_map(&mesh, &synthesize(&mesh).unwrap()).unwrap();
        assert!(cm.metadata.owner_references.is_none());
    }

    #[test]
    fn persisted_mesh_owns_the_config_map() {
        let mesh = mesh(Some("6f1c"));
        let cm = build_config_map(&mesh, &synthesize(&mesh).unwrap()).unwrap();
        let owners = cm.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "MeshConfig");
        assert_eq!(owners[0].api_version, "lattice.dev/v1alpha1");
        assert_eq!(owners[0].name, "default");
        assert_eq!(owners[0].uid, "6f1c");
        assert_eq!(owners[0].controller, Some(true));
    }

    #[test]
    fn mesh_without_namespace_publishes_to_default_namespace() {
        let mut mesh = mesh(None);
        mesh.metadata.namespace = None;
        let cm = build_config_map(&mesh, &synthesize(&mesh).unwrap()).unwrap();
        assert_eq!(
            cm.metadata.namespace.as_deref(),
            Some(lattice_common::DEFAULT_MESH_NAMESPACE)
        );
    }
}
