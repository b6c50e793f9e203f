//! RBAC for the injector webhook
//!
//! Plain field-mapping builders: the webhook reads the published ConfigMap
//! and patches its MutatingWebhookConfiguration, nothing else.

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use kube::Client;
use lattice_common::crd::MeshConfig;
use lattice_common::kube_utils::{
    apply_cluster_scoped, apply_namespaced, controller_owner_ref, ObjectMeta,
};
use tracing::info;

use crate::publisher::INJECTOR_LABELS;

/// Injector service account
pub const SERVICE_ACCOUNT_NAME: &str = "istio-sidecar-injector-service-account";
/// Injector cluster role
pub const CLUSTER_ROLE_NAME: &str = "istio-sidecar-injector-cluster-role";
/// Binding of the cluster role to the service account
pub const CLUSTER_ROLE_BINDING_NAME: &str = "istio-sidecar-injector-admin-role-binding";

fn strings(values: &[&str]) -> Option<Vec<String>> {
    Some(values.iter().map(|v| v.to_string()).collect())
}

/// Service account the webhook runs as, owned by the mesh
pub fn service_account(mesh: &MeshConfig) -> ServiceAccount {
    let mut meta = ObjectMeta::new(SERVICE_ACCOUNT_NAME, mesh.mesh_namespace())
        .with_labels(INJECTOR_LABELS);
    if let Some(owner) = controller_owner_ref(mesh) {
        meta = meta.with_owner(owner);
    }
    ServiceAccount {
        metadata: meta.into(),
        ..Default::default()
    }
}

/// Cluster role granting read access to ConfigMaps and webhook patching
pub fn cluster_role() -> ClusterRole {
    ClusterRole {
        metadata: ObjectMeta::cluster_scoped(CLUSTER_ROLE_NAME)
            .with_labels(INJECTOR_LABELS)
            .into(),
        rules: Some(vec![
            PolicyRule {
                api_groups: strings(&[""]),
                resources: strings(&["configmaps"]),
                verbs: vec!["get".into(), "watch".into(), "list".into()],
                ..Default::default()
            },
            PolicyRule {
                api_groups: strings(&["admissionregistration.k8s.io"]),
                resources: strings(&["mutatingwebhookconfigurations"]),
                verbs: vec!["get".into(), "list".into(), "watch".into(), "patch".into()],
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

/// Binding of [`cluster_role`] to the mesh's injector service account
pub fn cluster_role_binding(mesh: &MeshConfig) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta::cluster_scoped(CLUSTER_ROLE_BINDING_NAME)
            .with_labels(INJECTOR_LABELS)
            .into(),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: CLUSTER_ROLE_NAME.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: SERVICE_ACCOUNT_NAME.to_string(),
            namespace: Some(mesh.mesh_namespace()),
            ..Default::default()
        }]),
    }
}

/// Server-side apply the service account, cluster role, and binding
pub async fn apply_rbac(
    client: &Client,
    mesh: &MeshConfig,
    field_manager: &str,
) -> Result<(), lattice_common::Error> {
    apply_namespaced(client, &service_account(mesh), field_manager).await?;
    apply_cluster_scoped(client, &cluster_role(), field_manager).await?;
    apply_cluster_scoped(client, &cluster_role_binding(mesh), field_manager).await?;
    info!(namespace = %mesh.mesh_namespace(), "applied injector RBAC");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_common::crd::MeshConfigSpec;

    fn mesh() -> MeshConfig {
        let mut mesh = MeshConfig::new("default", MeshConfigSpec::default());
        mesh.metadata.namespace = Some("mesh-system".to_string());
        mesh.metadata.uid = Some("abc".to_string());
        mesh
    }

    #[test]
    fn service_account_lives_in_the_mesh_namespace() {
        let sa = service_account(&mesh());
        assert_eq!(sa.metadata.name.as_deref(), Some(SERVICE_ACCOUNT_NAME));
        assert_eq!(sa.metadata.namespace.as_deref(), Some("mesh-system"));
        assert_eq!(sa.metadata.owner_references.map(|o| o.len()), Some(1));
    }

    #[test]
    fn cluster_role_reads_core_config_maps() {
        let role = cluster_role();
        assert!(role.metadata.namespace.is_none());
        assert!(role.metadata.owner_references.is_none());
        let rules = role.rules.unwrap();
        assert_eq!(rules[0].api_groups.as_deref(), Some(&["".to_string()][..]));
        assert_eq!(
            rules[0].resources.as_deref(),
            Some(&["configmaps".to_string()][..])
        );
        assert!(rules[1].verbs.contains(&"patch".to_string()));
    }

    #[test]
    fn binding_targets_the_mesh_service_account() {
        let binding = cluster_role_binding(&mesh());
        assert_eq!(binding.role_ref.name, CLUSTER_ROLE_NAME);
        let subject = &binding.subjects.unwrap()[0];
        assert_eq!(subject.name, SERVICE_ACCOUNT_NAME);
        assert_eq!(subject.namespace.as_deref(), Some("mesh-system"));
    }
}
