//! MeshConfig CRD: the mesh-wide configuration snapshot
//!
//! A MeshConfig carries everything the sidecar injector needs to know at
//! build time: proxy images, the tracing backend, secret-distribution mode,
//! resource defaults, and the network topology. Every optional boolean is
//! kept as `Option<bool>` so that "unset" survives a round trip through the
//! API server; callers resolve them to concrete booleans before use.

use std::net::IpAddr;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::resources::{ResolvedResources, ResourceRequirements};
use crate::DEFAULT_MESH_NAMESPACE;

/// Default Envoy proxy image
pub const DEFAULT_PROXY_IMAGE: &str = "docker.io/istio/proxyv2:1.1.0";
/// Default traffic redirection init image
pub const DEFAULT_PROXY_INIT_IMAGE: &str = "docker.io/istio/proxy_init:1.1.0";
/// Default image for the core-dump init container
pub const DEFAULT_CORE_DUMP_IMAGE: &str = "busybox";
/// Default Zipkin collector address
pub const DEFAULT_ZIPKIN_ADDRESS: &str = "zipkin.istio-system:9411";
/// Default Datadog agent address (the node-local agent)
pub const DEFAULT_DATADOG_ADDRESS: &str = "$(HOST_IP):8126";
/// Default Lightstep CA certificate path
pub const DEFAULT_LIGHTSTEP_CACERT_PATH: &str = "/etc/lightstep/cacert.pem";

// =============================================================================
// CRD
// =============================================================================

/// Spec for a MeshConfig
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "lattice.dev",
    version = "v1alpha1",
    kind = "MeshConfig",
    plural = "meshconfigs",
    shortname = "mc",
    namespaced,
    printcolumn = r#"{"name":"Proxy","type":"string","jsonPath":".spec.proxy.image"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MeshConfigSpec {
    /// Envoy sidecar settings
    #[serde(default)]
    pub proxy: ProxySpec,

    /// Traffic redirection init container settings
    #[serde(default)]
    pub proxy_init: ProxyInitSpec,

    /// Pull policy for every injected container
    #[serde(default)]
    pub image_pull_policy: ImagePullPolicy,

    /// Injector behavior
    #[serde(default)]
    pub sidecar_injector: SidecarInjectorSpec,

    /// Tracing backend
    #[serde(default)]
    pub tracing: TracingSpec,

    /// Secret discovery service settings
    #[serde(default)]
    pub sds: SdsSpec,

    /// Whether control plane traffic uses mutual TLS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_security_enabled: Option<bool>,

    /// Whether this mesh is federated with other meshes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_mesh: Option<bool>,

    /// Whether workloads outside the cluster join the mesh
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh_expansion: Option<bool>,

    /// Network this mesh's workloads belong to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_name: Option<String>,

    /// Resources applied to every injected container unless overridden
    #[serde(default)]
    pub default_resources: ResolvedResources,

    /// Outbound IP ranges captured by the proxy ("*" for all)
    #[serde(default = "default_include_ip_ranges")]
    pub include_ip_ranges: Vec<String>,

    /// Outbound IP ranges that bypass the proxy
    #[serde(default)]
    pub exclude_ip_ranges: Vec<String>,
}

fn default_include_ip_ranges() -> Vec<String> {
    vec!["*".to_string()]
}

impl Default for MeshConfigSpec {
    fn default() -> Self {
        Self {
            proxy: ProxySpec::default(),
            proxy_init: ProxyInitSpec::default(),
            image_pull_policy: ImagePullPolicy::default(),
            sidecar_injector: SidecarInjectorSpec::default(),
            tracing: TracingSpec::default(),
            sds: SdsSpec::default(),
            control_plane_security_enabled: None,
            multi_mesh: None,
            mesh_expansion: None,
            network_name: None,
            default_resources: ResolvedResources::default(),
            include_ip_ranges: default_include_ip_ranges(),
            exclude_ip_ranges: Vec::new(),
        }
    }
}

// =============================================================================
// Proxy
// =============================================================================

/// Envoy sidecar settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxySpec {
    /// Proxy image
    #[serde(default = "default_proxy_image")]
    pub image: String,

    /// Image of the core-dump init container
    #[serde(default = "default_core_dump_image")]
    pub core_dump_image: String,

    /// Run the proxy privileged
    #[serde(default)]
    pub privileged: bool,

    /// Add an init container that enables proxy core dumps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_core_dump: Option<bool>,

    /// Proxy resources, merged field by field with the mesh default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Mesh-wide traffic interception mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interception_mode: Option<InterceptionMode>,
}

fn default_proxy_image() -> String {
    DEFAULT_PROXY_IMAGE.to_string()
}

fn default_core_dump_image() -> String {
    DEFAULT_CORE_DUMP_IMAGE.to_string()
}

impl Default for ProxySpec {
    fn default() -> Self {
        Self {
            image: default_proxy_image(),
            core_dump_image: default_core_dump_image(),
            privileged: false,
            enable_core_dump: None,
            resources: None,
            interception_mode: None,
        }
    }
}

/// How the proxy captures application traffic
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum InterceptionMode {
    /// iptables REDIRECT
    Redirect,
    /// iptables TPROXY, preserving source addresses
    Tproxy,
    /// No redirection; the init container is skipped
    None,
}

impl InterceptionMode {
    /// The value the proxy and the init container expect
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Redirect => "REDIRECT",
            Self::Tproxy => "TPROXY",
            Self::None => "NONE",
        }
    }
}

impl std::fmt::Display for InterceptionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Traffic redirection init container settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyInitSpec {
    /// Init image
    #[serde(default = "default_proxy_init_image")]
    pub image: String,
}

fn default_proxy_init_image() -> String {
    DEFAULT_PROXY_INIT_IMAGE.to_string()
}

impl Default for ProxyInitSpec {
    fn default() -> Self {
        Self {
            image: default_proxy_init_image(),
        }
    }
}

/// Kubernetes image pull policy
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ImagePullPolicy {
    /// Always pull
    Always,
    /// Pull only when missing
    #[default]
    IfNotPresent,
    /// Never pull
    Never,
}

impl ImagePullPolicy {
    /// The Kubernetes spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "Always",
            Self::IfNotPresent => "IfNotPresent",
            Self::Never => "Never",
        }
    }
}

// =============================================================================
// Injector
// =============================================================================

/// Injector behavior
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SidecarInjectorSpec {
    /// Inject into every pod of labeled namespaces unless a pod opts out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_injection_policy_enabled: Option<bool>,

    /// Rewrite application HTTP probes to go through the proxy status port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite_app_http_probe: Option<bool>,

    /// Traffic redirection is done by the CNI plugin instead of an init container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_cni_enabled: Option<bool>,

    /// Init container settings
    #[serde(default)]
    pub init: InitContainerSpec,
}

/// Settings shared by the injected init containers
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InitContainerSpec {
    /// Init container resources, merged field by field with the mesh default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

// =============================================================================
// Tracing
// =============================================================================

/// Tracing backend selection
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TracingSpec {
    /// Whether proxies report spans
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// The active backend
    #[serde(default)]
    pub tracer: Tracer,
}

/// Exactly one tracing backend, each carrying its own settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Tracer {
    /// No backend
    #[default]
    None,
    /// Zipkin collector
    Zipkin(ZipkinTracer),
    /// Lightstep satellite
    Lightstep(LightstepTracer),
    /// Datadog agent
    Datadog(DatadogTracer),
}

impl Tracer {
    /// Lowercase backend name, used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Zipkin(_) => "zipkin",
            Self::Lightstep(_) => "lightstep",
            Self::Datadog(_) => "datadog",
        }
    }
}

/// Zipkin backend settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ZipkinTracer {
    /// Collector host:port
    #[serde(default = "default_zipkin_address")]
    pub address: String,
}

fn default_zipkin_address() -> String {
    DEFAULT_ZIPKIN_ADDRESS.to_string()
}

impl Default for ZipkinTracer {
    fn default() -> Self {
        Self {
            address: default_zipkin_address(),
        }
    }
}

/// Lightstep backend settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LightstepTracer {
    /// Satellite host:port
    #[serde(default)]
    pub address: String,

    /// Use TLS to reach the satellite
    #[serde(default = "default_true")]
    pub secure: bool,

    /// CA certificate used when `secure` is set
    #[serde(default = "default_lightstep_cacert_path")]
    pub cacert_path: String,
}

fn default_true() -> bool {
    true
}

fn default_lightstep_cacert_path() -> String {
    DEFAULT_LIGHTSTEP_CACERT_PATH.to_string()
}

impl Default for LightstepTracer {
    fn default() -> Self {
        Self {
            address: String::new(),
            secure: true,
            cacert_path: default_lightstep_cacert_path(),
        }
    }
}

/// Datadog backend settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatadogTracer {
    /// Agent host:port
    #[serde(default = "default_datadog_address")]
    pub address: String,
}

fn default_datadog_address() -> String {
    DEFAULT_DATADOG_ADDRESS.to_string()
}

impl Default for DatadogTracer {
    fn default() -> Self {
        Self {
            address: default_datadog_address(),
        }
    }
}

// =============================================================================
// SDS
// =============================================================================

/// Secret discovery service settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SdsSpec {
    /// Deliver proxy credentials over SDS instead of mounted secrets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Authenticate to SDS with a projected service account token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_trustworthy_jwt: Option<bool>,

    /// Audience of the projected token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_audience: Option<String>,
}

// =============================================================================
// Validation
// =============================================================================

impl MeshConfigSpec {
    /// Validate these settings before any template is built from them
    ///
    /// Rejects values that would otherwise be spliced into the template
    /// verbatim and break it for every pod in the mesh.
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.default_resources.validate("spec.defaultResources")?;
        if let Some(ref resources) = self.proxy.resources {
            resources.validate("spec.proxy.resources")?;
        }
        if let Some(ref resources) = self.sidecar_injector.init.resources {
            resources.validate("spec.sidecarInjector.init.resources")?;
        }

        validate_image(&self.proxy.image, "spec.proxy.image")?;
        validate_image(&self.proxy.core_dump_image, "spec.proxy.coreDumpImage")?;
        validate_image(&self.proxy_init.image, "spec.proxyInit.image")?;

        for range in &self.include_ip_ranges {
            if range != "*" {
                validate_ip_range(range, "spec.includeIpRanges")?;
            }
        }
        for range in &self.exclude_ip_ranges {
            validate_ip_range(range, "spec.excludeIpRanges")?;
        }

        // a selected but disabled tracer is never rendered
        if let (Some(true), Tracer::Lightstep(lightstep)) =
            (self.tracing.enabled, &self.tracing.tracer)
        {
            if lightstep.address.trim().is_empty() {
                return Err(crate::Error::validation_for_field(
                    "spec.tracing.tracer.lightstep.address",
                    "lightstep tracer requires an address",
                ));
            }
        }

        Ok(())
    }
}

impl MeshConfig {
    /// Validate this mesh, tagging errors with its name
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.spec.validate().map_err(|e| e.with_mesh(self.name_any()))
    }

    /// Namespace the mesh lives in, falling back to the default control plane namespace
    pub fn mesh_namespace(&self) -> String {
        self.namespace()
            .unwrap_or_else(|| DEFAULT_MESH_NAMESPACE.to_string())
    }
}

fn validate_image(image: &str, field: &str) -> Result<(), crate::Error> {
    if image.is_empty() {
        return Err(crate::Error::validation_for_field(field, "image is empty"));
    }
    if image
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '`' | '[' | ']'))
    {
        return Err(crate::Error::validation_for_field(
            field,
            format!("image '{}' contains characters not allowed in a reference", image),
        ));
    }
    Ok(())
}

/// Validate a CIDR range (e.g., "10.0.0.0/8", "fd00::/8")
fn validate_ip_range(range: &str, field: &str) -> Result<(), crate::Error> {
    let invalid = || {
        crate::Error::validation_for_field(
            field,
            format!("invalid IP range '{}' (expected CIDR, e.g. '10.0.0.0/8')", range),
        )
    };

    let (addr, prefix) = range.split_once('/').ok_or_else(invalid)?;
    let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return Err(invalid());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ResourceQuantity;

    fn parse(yaml: &str) -> MeshConfigSpec {
        serde_yaml::from_str(yaml).expect("spec should parse")
    }

    #[test]
    fn empty_spec_takes_documented_defaults() {
        let spec = parse("{}");
        assert_eq!(spec, MeshConfigSpec::default());
        assert_eq!(spec.proxy.image, DEFAULT_PROXY_IMAGE);
        assert_eq!(spec.proxy_init.image, DEFAULT_PROXY_INIT_IMAGE);
        assert_eq!(spec.image_pull_policy, ImagePullPolicy::IfNotPresent);
        assert_eq!(spec.include_ip_ranges, vec!["*".to_string()]);
        assert!(spec.sds.enabled.is_none());
        assert_eq!(spec.tracing.tracer, Tracer::None);
    }

    #[test]
    fn tracer_is_a_tagged_variant() {
        let spec = parse(
            r#"
tracing:
  enabled: true
  tracer:
    datadog: {}
"#,
        );
        assert_eq!(spec.tracing.enabled, Some(true));
        match spec.tracing.tracer {
            Tracer::Datadog(ref dd) => assert_eq!(dd.address, DEFAULT_DATADOG_ADDRESS),
            ref other => panic!("expected datadog, got {:?}", other),
        }

        let spec = parse("tracing:\n  tracer:\n    lightstep:\n      address: ls:8080\n");
        match spec.tracing.tracer {
            Tracer::Lightstep(ref ls) => {
                assert_eq!(ls.address, "ls:8080");
                assert!(ls.secure);
                assert_eq!(ls.cacert_path, DEFAULT_LIGHTSTEP_CACERT_PATH);
            }
            ref other => panic!("expected lightstep, got {:?}", other),
        }

        assert_eq!(parse("tracing:\n  tracer: none\n").tracing.tracer, Tracer::None);
    }

    #[test]
    fn interception_mode_uses_uppercase_names() {
        let spec = parse("proxy:\n  interceptionMode: TPROXY\n");
        assert_eq!(spec.proxy.interception_mode, Some(InterceptionMode::Tproxy));
        assert_eq!(InterceptionMode::Tproxy.to_string(), "TPROXY");
    }

    #[test]
    fn default_spec_is_valid() {
        assert!(MeshConfigSpec::default().validate().is_ok());
    }

    #[test]
    fn invalid_proxy_resources_are_rejected() {
        let mut spec = MeshConfigSpec::default();
        spec.proxy.resources = Some(ResourceRequirements {
            requests: None,
            limits: Some(ResourceQuantity {
                cpu: None,
                memory: Some("plenty".to_string()),
            }),
        });
        let err = spec.validate().unwrap_err();
        assert_eq!(err.field(), Some("spec.proxy.resources.limits.memory"));
    }

    #[test]
    fn ip_ranges_must_be_cidrs() {
        let mut spec = MeshConfigSpec::default();
        spec.include_ip_ranges = vec!["10.0.0.0/8".to_string(), "fd00::/8".to_string()];
        spec.exclude_ip_ranges = vec!["192.168.0.0/16".to_string()];
        assert!(spec.validate().is_ok());

        spec.exclude_ip_ranges = vec!["*".to_string()];
        assert!(spec.validate().is_err());

        spec.exclude_ip_ranges = vec!["10.0.0.0/33".to_string()];
        assert!(spec.validate().is_err());

        spec.exclude_ip_ranges = vec!["10.0.0.0/8,10.1.0.0/16".to_string()];
        assert!(spec.validate().is_err());
    }

    #[test]
    fn images_with_template_delimiters_are_rejected() {
        let mut spec = MeshConfigSpec::default();
        spec.proxy.image = "repo/proxy:[[ .Values ]]".to_string();
        let err = spec.validate().unwrap_err();
        assert_eq!(err.field(), Some("spec.proxy.image"));
    }

    #[test]
    fn enabled_lightstep_requires_an_address() {
        let mut spec = MeshConfigSpec::default();
        spec.tracing.enabled = Some(true);
        spec.tracing.tracer = Tracer::Lightstep(LightstepTracer::default());
        let err = spec.validate().unwrap_err();
        assert_eq!(err.field(), Some("spec.tracing.tracer.lightstep.address"));
    }

    #[test]
    fn disabled_lightstep_without_address_is_valid() {
        let mut spec = MeshConfigSpec::default();
        spec.tracing.tracer = Tracer::Lightstep(LightstepTracer::default());
        assert!(spec.validate().is_ok());
        spec.tracing.enabled = Some(false);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn non_finite_and_negative_default_quantities_are_rejected() {
        for cpu in ["NaN", "inf", "-5"] {
            let mut spec = MeshConfigSpec::default();
            spec.default_resources.requests.cpu = cpu.to_string();
            let err = spec.validate().unwrap_err();
            assert_eq!(err.field(), Some("spec.defaultResources.requests.cpu"), "{cpu}");
        }

        let mut spec = MeshConfigSpec::default();
        spec.default_resources.limits.memory = "-1Gi".to_string();
        let err = spec.validate().unwrap_err();
        assert_eq!(err.field(), Some("spec.defaultResources.limits.memory"));
    }

    #[test]
    fn mesh_validation_errors_name_the_mesh() {
        let mut spec = MeshConfigSpec::default();
        spec.proxy_init.image = String::new();
        let mesh = MeshConfig::new("primary", spec);
        let err = mesh.validate().unwrap_err();
        assert_eq!(err.mesh(), Some("primary"));
        assert_eq!(mesh.mesh_namespace(), DEFAULT_MESH_NAMESPACE);
    }
}
