//! Conditional fragments
//!
//! Each fragment pairs a predicate over the resolved configuration with a
//! renderer. Predicates are pure functions of the MeshConfig; a fragment
//! whose predicate is false contributes nothing at all. The composer decides
//! where each fragment goes; fragments never know about each other except
//! where one is nested inside another.

use k8s_openapi::api::core::v1::{Container, SecurityContext};
use lattice_common::crd::{MeshConfigSpec, ResolvedResources, Tracer};
use lattice_common::yaml;
use tracing::debug;

use crate::artifact::Fragment;
use crate::directive::{
    annotations, DirectiveError, Expr, Func, Lookup, DEFAULT_STATUS_PORT, PROXY_UID,
};
use crate::error::SynthesisError;
use crate::flags::{active_tracer, FeatureFlags};
use crate::resources::{merge_resources, resources_block, to_kube_requirements};

/// Name of the core-dump init container
pub const CORE_DUMP_CONTAINER_NAME: &str = "enable-core-dump";
/// Where the proxy writes core files
const CORE_DUMP_COMMAND: &str =
    "sysctl -w kernel.core_pattern=/var/lib/istio/core.proxy && ulimit -c unlimited";

/// Everything fragments read, resolved once per synthesis run
#[derive(Clone, Debug)]
pub struct InjectionContext<'a> {
    /// The MeshConfig being synthesized
    pub spec: &'a MeshConfigSpec,
    /// Resolved flags
    pub flags: FeatureFlags,
    /// Proxy resources merged with the mesh default
    pub proxy_resources: ResolvedResources,
    /// Init container resources merged with the mesh default
    pub init_resources: ResolvedResources,
    /// The interception mode lookup; gates the init containers and selects
    /// the TPROXY security context
    pub interception_mode: Lookup,
    /// The status port lookup; gates the readiness probe and status args
    pub status_port: Lookup,
}

impl<'a> InjectionContext<'a> {
    /// Resolve flags, resources, and shared lookups from `spec`
    pub fn resolve(spec: &'a MeshConfigSpec) -> Result<Self, SynthesisError> {
        let interception_default = match spec.proxy.interception_mode {
            Some(mode) => Expr::str(mode.as_str())?,
            None => Expr::field(".ProxyConfig.InterceptionMode")?,
        };

        Ok(Self {
            spec,
            flags: FeatureFlags::resolve(spec),
            proxy_resources: merge_resources(spec.proxy.resources.as_ref(), &spec.default_resources),
            init_resources: merge_resources(
                spec.sidecar_injector.init.resources.as_ref(),
                &spec.default_resources,
            ),
            interception_mode: Lookup::new(annotations::INTERCEPTION_MODE, interception_default)?,
            status_port: Lookup::new(annotations::STATUS_PORT, Expr::Int(DEFAULT_STATUS_PORT))?,
        })
    }

    /// The shared interception mode lookup as an expression
    pub fn interception(&self) -> Expr {
        Expr::Lookup(self.interception_mode.clone())
    }

    /// The shared status port lookup as an expression
    pub fn status(&self) -> Expr {
        Expr::Lookup(self.status_port.clone())
    }
}

type Predicate = fn(&InjectionContext<'_>) -> bool;
type Render = fn(&InjectionContext<'_>) -> Result<Fragment, SynthesisError>;

/// A named, predicate-gated block of template text
#[derive(Clone, Copy)]
pub struct ConditionalFragment {
    /// Name used in logs and tests
    pub name: &'static str,
    predicate: Predicate,
    render: Render,
}

impl std::fmt::Debug for ConditionalFragment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionalFragment")
            .field("name", &self.name)
            .finish()
    }
}

impl ConditionalFragment {
    /// Whether this fragment is part of the template for `ctx`
    pub fn is_included(&self, ctx: &InjectionContext<'_>) -> bool {
        (self.predicate)(ctx)
    }

    /// Render this fragment, or `None` when its predicate is false
    pub fn render(&self, ctx: &InjectionContext<'_>) -> Result<Option<Fragment>, SynthesisError> {
        if !self.is_included(ctx) {
            debug!(fragment = self.name, "fragment excluded");
            return Ok(None);
        }
        debug!(fragment = self.name, "fragment included");
        (self.render)(ctx).map(Some)
    }

    /// Render into `out` when included
    pub fn render_into(
        &self,
        ctx: &InjectionContext<'_>,
        out: &mut Fragment,
    ) -> Result<(), SynthesisError> {
        if let Some(fragment) = self.render(ctx)? {
            out.append(fragment);
        }
        Ok(())
    }
}

// =============================================================================
// Library
// =============================================================================

/// Traffic redirection init container, unless the CNI plugin redirects
pub const PROXY_INIT: ConditionalFragment = ConditionalFragment {
    name: "proxy-init",
    predicate: without_cni,
    render: render_proxy_init,
};

/// Init container enabling proxy core dumps
pub const CORE_DUMP: ConditionalFragment = ConditionalFragment {
    name: "core-dump",
    predicate: core_dump_enabled,
    render: render_core_dump,
};

/// Multi-mesh DNS search suffixes
pub const DNS_SEARCH: ConditionalFragment = ConditionalFragment {
    name: "dns-search",
    predicate: multi_mesh_enabled,
    render: render_dns_search,
};

/// Tracer arguments for the active backend
pub const TRACING_ARGS: ConditionalFragment = ConditionalFragment {
    name: "tracing-args",
    predicate: tracer_active,
    render: render_tracing_args,
};

/// `HOST_IP` environment entry for the node-local Datadog agent
pub const HOST_IP_ENV: ConditionalFragment = ConditionalFragment {
    name: "host-ip-env",
    predicate: datadog_active,
    render: render_host_ip_env,
};

/// `ISTIO_META_NETWORK` environment entry
pub const NETWORK_NAME_ENV: ConditionalFragment = ConditionalFragment {
    name: "network-name-env",
    predicate: network_name_set,
    render: render_network_name_env,
};

/// SDS socket mount, plus the token mount with trustworthy JWTs
pub const SDS_MOUNTS: ConditionalFragment = ConditionalFragment {
    name: "sds-mounts",
    predicate: sds_enabled,
    render: render_sds_mounts,
};

/// SDS socket volume, plus the projected token volume with trustworthy JWTs
pub const SDS_VOLUMES: ConditionalFragment = ConditionalFragment {
    name: "sds-volumes",
    predicate: sds_enabled,
    render: render_sds_volumes,
};

/// Mounted certificate secret when SDS is off
pub const LEGACY_CERT_MOUNT: ConditionalFragment = ConditionalFragment {
    name: "legacy-cert-mount",
    predicate: sds_disabled,
    render: render_legacy_cert_mount,
};

/// Certificate secret volume when SDS is off
pub const LEGACY_CERT_VOLUME: ConditionalFragment = ConditionalFragment {
    name: "legacy-cert-volume",
    predicate: sds_disabled,
    render: render_legacy_cert_volume,
};

/// `runAsGroup` so the proxy can read the projected token
pub const RUN_AS_GROUP: ConditionalFragment = ConditionalFragment {
    name: "run-as-group",
    predicate: sds_with_jwt,
    render: render_run_as_group,
};

/// Security context branching on the interception mode at admission
pub const TPROXY_SECURITY_CONTEXT: ConditionalFragment = ConditionalFragment {
    name: "tproxy-security-context",
    predicate: always,
    render: render_tproxy_security_context,
};

/// Names of the fragments whose predicates hold for `ctx`, in library order
pub fn included_fragments(ctx: &InjectionContext<'_>) -> Vec<&'static str> {
    LIBRARY
        .iter()
        .filter(|fragment| fragment.is_included(ctx))
        .map(|fragment| fragment.name)
        .collect()
}

/// Every fragment
pub const LIBRARY: &[ConditionalFragment] = &[
    PROXY_INIT,
    CORE_DUMP,
    DNS_SEARCH,
    TRACING_ARGS,
    HOST_IP_ENV,
    NETWORK_NAME_ENV,
    SDS_MOUNTS,
    SDS_VOLUMES,
    LEGACY_CERT_MOUNT,
    LEGACY_CERT_VOLUME,
    RUN_AS_GROUP,
    TPROXY_SECURITY_CONTEXT,
];

// =============================================================================
// Predicates
// =============================================================================

fn always(_: &InjectionContext<'_>) -> bool {
    true
}

fn without_cni(ctx: &InjectionContext<'_>) -> bool {
    !ctx.flags.init_cni
}

fn core_dump_enabled(ctx: &InjectionContext<'_>) -> bool {
    ctx.flags.core_dump
}

fn multi_mesh_enabled(ctx: &InjectionContext<'_>) -> bool {
    ctx.flags.multi_mesh
}

fn tracer_active(ctx: &InjectionContext<'_>) -> bool {
    active_tracer(ctx.spec, &ctx.flags).is_some()
}

fn datadog_active(ctx: &InjectionContext<'_>) -> bool {
    matches!(active_tracer(ctx.spec, &ctx.flags), Some(Tracer::Datadog(_)))
}

fn network_name_set(ctx: &InjectionContext<'_>) -> bool {
    ctx.flags.mesh_expansion && ctx.spec.network_name.as_deref().is_some_and(|n| !n.is_empty())
}

fn sds_enabled(ctx: &InjectionContext<'_>) -> bool {
    ctx.flags.sds
}

fn sds_disabled(ctx: &InjectionContext<'_>) -> bool {
    !ctx.flags.sds
}

fn sds_with_jwt(ctx: &InjectionContext<'_>) -> bool {
    ctx.flags.sds_with_jwt()
}

// =============================================================================
// Renderers
// =============================================================================

fn render_proxy_init(ctx: &InjectionContext<'_>) -> Result<Fragment, SynthesisError> {
    let spec = ctx.spec;
    let uid = PROXY_UID.to_string();
    let mut f = Fragment::new();

    f.text("- name: istio-init\n  image: ")
        .quoted(&spec.proxy_init.image)?
        .text("\n  args:\n  - \"-p\"\n  - \"")
        .emit(Expr::field(".MeshConfig.ProxyListenPort")?)
        .text("\"\n  - \"-u\"\n  - \"")
        .literal(&uid)?
        .text("\"\n  - \"-m\"\n  - \"")
        .emit(ctx.interception())
        .text("\"\n  - \"-i\"\n  - \"")
        .emit(Expr::lookup(
            annotations::INCLUDE_OUTBOUND_IP_RANGES,
            Expr::str(&spec.include_ip_ranges.join(","))?,
        )?)
        .text("\"\n  - \"-x\"\n  - \"")
        .emit(Expr::lookup(
            annotations::EXCLUDE_OUTBOUND_IP_RANGES,
            Expr::str(&spec.exclude_ip_ranges.join(","))?,
        )?)
        .text("\"\n  - \"-b\"\n  - \"")
        .emit(Expr::lookup(
            annotations::INCLUDE_INBOUND_PORTS,
            Expr::call(
                Func::IncludeInboundPorts,
                vec![Expr::field(".Spec.Containers")?],
            ),
        )?)
        .text("\"\n  - \"-d\"\n  - \"")
        .emit(Expr::call(
            Func::ExcludeInboundPort,
            vec![
                ctx.status(),
                Expr::lookup(annotations::EXCLUDE_INBOUND_PORTS, Expr::str("")?)?,
            ],
        ))
        .text("\"\n")
        .open_if(2, Expr::annotation_is_set(annotations::KUBEVIRT_INTERFACES)?)
        .text("  - \"-k\"\n  - \"")
        .emit(Expr::annotation_value(annotations::KUBEVIRT_INTERFACES)?)
        .text("\"\n")
        .close(2)
        .text("  imagePullPolicy: ")
        .literal(spec.image_pull_policy.as_str())?
        .text("\n")
        .yaml_block(
            "init resources",
            &resources_block("init resources", &ctx.init_resources, 2)?,
        )?
        .text("  securityContext:\n    runAsUser: 0\n    capabilities:\n      add:\n      - NET_ADMIN\n    privileged: ")
        .literal(bool_str(spec.proxy.privileged))?
        .text("\n");

    Ok(f)
}

/// The fixed core-dump container descriptor
pub fn core_dump_container(spec: &MeshConfigSpec, resources: &ResolvedResources) -> Container {
    Container {
        name: CORE_DUMP_CONTAINER_NAME.to_string(),
        image: Some(spec.proxy.core_dump_image.clone()),
        image_pull_policy: Some(spec.image_pull_policy.as_str().to_string()),
        command: Some(vec!["/bin/sh".to_string()]),
        args: Some(vec!["-c".to_string(), CORE_DUMP_COMMAND.to_string()]),
        resources: Some(to_kube_requirements(resources)),
        security_context: Some(SecurityContext {
            run_as_user: Some(0),
            privileged: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn render_core_dump(ctx: &InjectionContext<'_>) -> Result<Fragment, SynthesisError> {
    let block = "core dump container";
    let container = core_dump_container(ctx.spec, &ctx.init_resources);
    let rendered =
        yaml::to_yaml(block, &[container]).map_err(|e| SynthesisError::serialization(block, e))?;

    let mut f = Fragment::new();
    f.yaml_block(block, &rendered)?;
    Ok(f)
}

fn render_dns_search(_: &InjectionContext<'_>) -> Result<Fragment, SynthesisError> {
    let mut f = Fragment::new();
    f.text("dnsConfig:\n  searches:\n  - global\n  - \"")
        .emit(Expr::call(
            Func::ValueOrDefault,
            vec![Expr::field(".DeploymentMeta.Namespace")?, Expr::str("default")?],
        ))
        .text(".global\"\n");
    Ok(f)
}

fn tracer_arg(f: &mut Fragment, flag: &'static str, value: Expr) {
    f.text("  - ").text(flag).text("\n  - \"").emit(value).text("\"\n");
}

/// A ProxyConfig tracing field, falling back to the mesh value
fn field_or(field: &str, default: &str) -> Result<Expr, DirectiveError> {
    Ok(Expr::call(
        Func::ValueOrDefault,
        vec![Expr::field(field)?, Expr::str(default)?],
    ))
}

fn render_tracing_args(ctx: &InjectionContext<'_>) -> Result<Fragment, SynthesisError> {
    let mut f = Fragment::new();
    match active_tracer(ctx.spec, &ctx.flags) {
        Some(Tracer::Zipkin(zipkin)) => tracer_arg(
            &mut f,
            "--zipkinAddress",
            field_or(".ProxyConfig.GetTracing.GetZipkin.GetAddress", &zipkin.address)?,
        ),
        Some(Tracer::Lightstep(lightstep)) => {
            tracer_arg(
                &mut f,
                "--lightstepAddress",
                field_or(
                    ".ProxyConfig.GetTracing.GetLightstep.GetAddress",
                    &lightstep.address,
                )?,
            );
            // credentials stay out of the stored template
            tracer_arg(
                &mut f,
                "--lightstepAccessToken",
                Expr::field(".ProxyConfig.GetTracing.GetLightstep.GetAccessToken")?,
            );
            tracer_arg(
                &mut f,
                "--lightstepSecure",
                field_or(
                    ".ProxyConfig.GetTracing.GetLightstep.GetSecure",
                    bool_str(lightstep.secure),
                )?,
            );
            tracer_arg(
                &mut f,
                "--lightstepCacertPath",
                field_or(
                    ".ProxyConfig.GetTracing.GetLightstep.GetCacertPath",
                    &lightstep.cacert_path,
                )?,
            );
        }
        Some(Tracer::Datadog(datadog)) => tracer_arg(
            &mut f,
            "--datadogAgentAddress",
            field_or(".ProxyConfig.GetTracing.GetDatadog.GetAddress", &datadog.address)?,
        ),
        Some(Tracer::None) | None => {}
    }
    Ok(f)
}

fn render_host_ip_env(_: &InjectionContext<'_>) -> Result<Fragment, SynthesisError> {
    let mut f = Fragment::new();
    f.text("  - name: HOST_IP\n    valueFrom:\n      fieldRef:\n        fieldPath: status.hostIP\n");
    Ok(f)
}

fn render_network_name_env(ctx: &InjectionContext<'_>) -> Result<Fragment, SynthesisError> {
    let mut f = Fragment::new();
    f.text("  - name: ISTIO_META_NETWORK\n    value: ")
        .quoted(ctx.spec.network_name.as_deref().unwrap_or_default())?
        .text("\n");
    Ok(f)
}

fn render_sds_mounts(ctx: &InjectionContext<'_>) -> Result<Fragment, SynthesisError> {
    let mut f = Fragment::new();
    f.text("  - mountPath: /var/run/sds\n    name: sds-uds-path\n    readOnly: true\n");
    if ctx.flags.trustworthy_jwt {
        f.text("  - mountPath: /var/run/secrets/tokens\n    name: istio-token\n");
    }
    Ok(f)
}

fn render_sds_volumes(ctx: &InjectionContext<'_>) -> Result<Fragment, SynthesisError> {
    let mut f = Fragment::new();
    f.text("- name: sds-uds-path\n  hostPath:\n    path: /var/run/sds\n");
    if ctx.flags.trustworthy_jwt {
        f.text("- name: istio-token\n  projected:\n    sources:\n    - serviceAccountToken:\n        path: istio-token\n        expirationSeconds: 43200\n        audience: ")
            .quoted(ctx.spec.sds.token_audience.as_deref().unwrap_or_default())?
            .text("\n");
    }
    Ok(f)
}

fn render_legacy_cert_mount(_: &InjectionContext<'_>) -> Result<Fragment, SynthesisError> {
    let mut f = Fragment::new();
    f.text("  - mountPath: /etc/certs/\n    name: istio-certs\n    readOnly: true\n");
    Ok(f)
}

fn render_legacy_cert_volume(_: &InjectionContext<'_>) -> Result<Fragment, SynthesisError> {
    let service_account = Expr::field(".Spec.ServiceAccountName")?;
    let mut f = Fragment::new();
    f.text("- name: istio-certs\n  secret:\n    optional: true\n")
        .open_if(
            4,
            Expr::call(Func::Eq, vec![service_account.clone(), Expr::str("")?]),
        )
        .text("    secretName: istio.default\n")
        .open_else(4)
        .text("    secretName: \"")
        .emit(Expr::call(
            Func::Printf,
            vec![Expr::str("istio.%s")?, service_account],
        ))
        .text("\"\n")
        .close(4);
    Ok(f)
}

fn render_run_as_group(_: &InjectionContext<'_>) -> Result<Fragment, SynthesisError> {
    let mut f = Fragment::new();
    f.text("    runAsGroup: ").literal(&PROXY_UID.to_string())?.text("\n");
    Ok(f)
}

fn render_tproxy_security_context(ctx: &InjectionContext<'_>) -> Result<Fragment, SynthesisError> {
    let uid = PROXY_UID.to_string();
    let mut f = Fragment::new();
    f.open_if(
        4,
        Expr::call(Func::Eq, vec![ctx.interception(), Expr::str("TPROXY")?]),
    )
    .text("    capabilities:\n      add:\n      - NET_ADMIN\n    runAsGroup: ")
    .literal(&uid)?
    .text("\n")
    .open_else(4);
    RUN_AS_GROUP.render_into(ctx, &mut f)?;
    f.text("    runAsUser: ").literal(&uid)?.text("\n").close(4);
    Ok(f)
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}
