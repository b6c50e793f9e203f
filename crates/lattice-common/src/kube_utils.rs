//! Shared Kubernetes utilities using kube-rs
//!
//! Metadata stamping for generated objects and server-side apply helpers.
//! Generated objects are always applied whole with a single field manager,
//! so a stored object is replaced by the new rendering rather than merged
//! with a stale one.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::Path;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    ObjectMeta as KubeObjectMeta, OwnerReference,
};
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::{Api, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::Error;

// =============================================================================
// ObjectMeta - Canonical Kubernetes metadata for generated resources
// =============================================================================

/// Standard Kubernetes ObjectMeta for generated resources.
///
/// Automatically adds Lattice management labels on construction.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Resource name
    pub name: String,
    /// Resource namespace (`None` for cluster-scoped resources)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Owners whose deletion garbage-collects this resource
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
}

impl ObjectMeta {
    /// Create new namespaced metadata with standard Lattice labels
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        let mut meta = Self::cluster_scoped(name);
        meta.namespace = Some(namespace.into());
        meta
    }

    /// Create new cluster-scoped metadata with standard Lattice labels
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        let name = name.into();
        let mut labels = BTreeMap::new();
        labels.insert(crate::LABEL_NAME.to_string(), name.clone());
        labels.insert(
            crate::LABEL_MANAGED_BY.to_string(),
            crate::LABEL_MANAGED_BY_LATTICE.to_string(),
        );
        Self {
            name,
            namespace: None,
            labels,
            owner_references: Vec::new(),
        }
    }

    /// Add several labels
    pub fn with_labels<K, V>(mut self, labels: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.labels
            .extend(labels.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Add an owner reference
    pub fn with_owner(mut self, owner: OwnerReference) -> Self {
        self.owner_references.push(owner);
        self
    }
}

impl From<ObjectMeta> for KubeObjectMeta {
    fn from(meta: ObjectMeta) -> Self {
        KubeObjectMeta {
            name: Some(meta.name),
            namespace: meta.namespace,
            labels: (!meta.labels.is_empty()).then_some(meta.labels),
            owner_references: (!meta.owner_references.is_empty())
                .then_some(meta.owner_references),
            ..Default::default()
        }
    }
}

/// Build a controller owner reference to `owner`
///
/// Returns `None` when the owner has not been persisted yet (no UID), since
/// the API server rejects owner references without one.
pub fn controller_owner_ref<K>(owner: &K) -> Option<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    owner.uid()?;
    owner.controller_owner_ref(&())
}

// =============================================================================
// Client
// =============================================================================

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from an optional kubeconfig path
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

// =============================================================================
// Server-Side Apply
// =============================================================================

/// Server-side apply a namespaced object, taking ownership of every field.
///
/// The object must carry a name and namespace in its metadata.
pub async fn apply_namespaced<K>(client: &Client, obj: &K, field_manager: &str) -> Result<K, Error>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned,
{
    let name = obj.meta().name.as_deref().ok_or_else(|| {
        Error::validation_for_field("metadata.name", format!("{} has no name", K::kind(&())))
    })?;
    let namespace = obj.meta().namespace.as_deref().ok_or_else(|| {
        Error::validation_for_field(
            "metadata.namespace",
            format!("{} '{}' has no namespace", K::kind(&()), name),
        )
    })?;

    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    let params = PatchParams::apply(field_manager).force();
    debug!(kind = %K::kind(&()), name, namespace, "server-side applying");
    Ok(api.patch(name, &params, &Patch::Apply(obj)).await?)
}

/// Server-side apply a cluster-scoped object, taking ownership of every field.
pub async fn apply_cluster_scoped<K>(
    client: &Client,
    obj: &K,
    field_manager: &str,
) -> Result<K, Error>
where
    K: Resource<Scope = ClusterResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned,
{
    let name = obj.meta().name.as_deref().ok_or_else(|| {
        Error::validation_for_field("metadata.name", format!("{} has no name", K::kind(&())))
    })?;

    let api: Api<K> = Api::all(client.clone());
    let params = PatchParams::apply(field_manager).force();
    debug!(kind = %K::kind(&()), name, "server-side applying");
    Ok(api.patch(name, &params, &Patch::Apply(obj)).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;

    #[test]
    fn new_metadata_carries_management_labels() {
        let meta = ObjectMeta::new("istio-sidecar-injector", "istio-system");
        assert_eq!(meta.namespace.as_deref(), Some("istio-system"));
        assert_eq!(
            meta.labels.get(crate::LABEL_NAME).map(String::as_str),
            Some("istio-sidecar-injector")
        );
        assert_eq!(
            meta.labels.get(crate::LABEL_MANAGED_BY).map(String::as_str),
            Some(crate::LABEL_MANAGED_BY_LATTICE)
        );
    }

    #[test]
    fn cluster_scoped_metadata_has_no_namespace() {
        let meta = ObjectMeta::cluster_scoped("istio-sidecar-injector")
            .with_labels([("app", "sidecar-injector")]);
        assert!(meta.namespace.is_none());
        assert_eq!(meta.labels.get("app").map(String::as_str), Some("sidecar-injector"));
    }

    #[test]
    fn conversion_omits_empty_collections() {
        let meta: KubeObjectMeta = ObjectMeta::new("cm", "ns").into();
        assert_eq!(meta.name.as_deref(), Some("cm"));
        assert!(meta.labels.is_some());
        assert!(meta.annotations.is_none());
        assert!(meta.owner_references.is_none());
    }

    #[test]
    fn owner_reference_requires_a_persisted_owner() {
        let mut owner = ConfigMap::default();
        owner.metadata.name = Some("owner".to_string());
        assert!(controller_owner_ref(&owner).is_none());

        owner.metadata.uid = Some("1234".to_string());
        let oref = controller_owner_ref(&owner).expect("owner has a uid");
        assert_eq!(oref.kind, "ConfigMap");
        assert_eq!(oref.uid, "1234");
        assert_eq!(oref.controller, Some(true));

        let meta: KubeObjectMeta = ObjectMeta::new("cm", "ns").with_owner(oref).into();
        assert_eq!(meta.owner_references.map(|o| o.len()), Some(1));
    }
}
