//! Template composition
//!
//! The template is built by one fixed pipeline: policy, init containers,
//! the proxy container, then volumes. Inside the proxy container the steps
//! in [`PROXY_CONTAINER_STEPS`] run in order. Optional content only ever
//! enters through the fragments in [`crate::fragments`], so the order of the
//! output does not depend on which flags are set.

use kube::ResourceExt;
use lattice_common::crd::MeshConfig;
use tracing::{debug, info, instrument};

use crate::artifact::{Fragment, InjectionPolicy, SectionKind, SynthesizedArtifact};
use crate::directive::{annotations, DirectiveError, Expr, Func, Var};
use crate::error::SynthesisError;
use crate::fragments::{
    included_fragments, InjectionContext, CORE_DUMP, DNS_SEARCH, HOST_IP_ENV, LEGACY_CERT_MOUNT,
    LEGACY_CERT_VOLUME, NETWORK_NAME_ENV, PROXY_INIT, SDS_MOUNTS, SDS_VOLUMES,
    TPROXY_SECURITY_CONTEXT, TRACING_ARGS,
};
use crate::resources::resources_block;

/// Envoy Prometheus port exposed on the proxy container
const ENVOY_PROM_PORT: u16 = 15090;
/// Where a custom bootstrap ConfigMap is mounted
const CUSTOM_BOOTSTRAP_PATH: &str = "/etc/istio/custom-bootstrap";

/// One step in building the proxy container
#[derive(Clone, Copy)]
pub struct ContainerStep {
    /// Name used in logs and tests
    pub name: &'static str,
    build: fn(&InjectionContext<'_>, &mut Fragment) -> Result<(), SynthesisError>,
}

impl std::fmt::Debug for ContainerStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerStep").field("name", &self.name).finish()
    }
}

/// Proxy container steps, in output order
pub const PROXY_CONTAINER_STEPS: &[ContainerStep] = &[
    ContainerStep {
        name: "ports",
        build: ports,
    },
    ContainerStep {
        name: "args-prefix",
        build: args_prefix,
    },
    ContainerStep {
        name: "tracing-args",
        build: tracing_args,
    },
    ContainerStep {
        name: "args-suffix",
        build: args_suffix,
    },
    ContainerStep {
        name: "env",
        build: env,
    },
    ContainerStep {
        name: "image-pull-policy",
        build: image_pull_policy,
    },
    ContainerStep {
        name: "readiness-probe",
        build: readiness_probe,
    },
    ContainerStep {
        name: "security-context",
        build: security_context,
    },
    ContainerStep {
        name: "resources",
        build: resources,
    },
    ContainerStep {
        name: "volume-mounts",
        build: volume_mounts,
    },
];

/// Synthesize the injection template for `mesh`
///
/// Validates the MeshConfig, resolves it once, and composes every section.
/// Fails without producing any output if a directive cannot be built or an
/// embedded block cannot be serialized.
#[instrument(skip(mesh), fields(name = %mesh.name_any(), namespace = %mesh.mesh_namespace()))]
pub fn synthesize(mesh: &MeshConfig) -> Result<SynthesizedArtifact, SynthesisError> {
    mesh.validate()?;
    let ctx = InjectionContext::resolve(&mesh.spec)?;
    let artifact = compose(&ctx)?;
    info!(
        policy = ?artifact.policy(),
        template_bytes = artifact.template().len(),
        lookups = artifact.lookups().len(),
        "synthesized injection template"
    );
    Ok(artifact)
}

/// Compose every section from a resolved context
pub fn compose(ctx: &InjectionContext<'_>) -> Result<SynthesizedArtifact, SynthesisError> {
    debug!(fragments = ?included_fragments(ctx), "resolved fragment set");
    let sections = vec![
        (SectionKind::Policy, policy_section(ctx)?),
        (SectionKind::InitContainers, init_section(ctx)?),
        (SectionKind::Containers, containers_section(ctx)?),
        (SectionKind::Volumes, volumes_section(ctx)?),
    ];

    if let Some((kind, _)) = sections.iter().find(|(_, f)| !f.is_balanced()) {
        return Err(DirectiveError::UnbalancedBlocks {
            section: format!("{:?}", kind),
        }
        .into());
    }

    Ok(SynthesizedArtifact::new(
        InjectionPolicy::from_flag(ctx.flags.auto_injection),
        sections,
    ))
}

// =============================================================================
// Sections
// =============================================================================

fn policy_section(ctx: &InjectionContext<'_>) -> Result<Fragment, SynthesisError> {
    let mut f = Fragment::new();
    f.text("rewriteAppHTTPProbe: ")
        .literal(if ctx.flags.rewrite_app_http_probe {
            "true"
        } else {
            "false"
        })?
        .text("\n");
    DNS_SEARCH.render_into(ctx, &mut f)?;
    Ok(f)
}

fn init_section(ctx: &InjectionContext<'_>) -> Result<Fragment, SynthesisError> {
    let mut f = Fragment::new();
    f.text("initContainers:\n").open_if(
        0,
        Expr::call(Func::Ne, vec![ctx.interception(), Expr::str("NONE")?]),
    );
    PROXY_INIT.render_into(ctx, &mut f)?;
    CORE_DUMP.render_into(ctx, &mut f)?;
    f.close(0);
    Ok(f)
}

fn containers_section(ctx: &InjectionContext<'_>) -> Result<Fragment, SynthesisError> {
    let mut f = Fragment::new();
    f.text("containers:\n- name: istio-proxy\n  image: \"")
        .emit(Expr::lookup(
            annotations::PROXY_IMAGE,
            Expr::str(&ctx.spec.proxy.image)?,
        )?)
        .text("\"\n");
    for step in PROXY_CONTAINER_STEPS {
        debug!(step = step.name, "building proxy container");
        (step.build)(ctx, &mut f)?;
    }
    Ok(f)
}

fn volumes_section(ctx: &InjectionContext<'_>) -> Result<Fragment, SynthesisError> {
    let mut f = Fragment::new();
    f.text("volumes:\n")
        .open_if(0, Expr::annotation_is_set(annotations::BOOTSTRAP_OVERRIDE)?)
        .text("- name: custom-bootstrap-volume\n  configMap:\n    name: \"")
        .emit(Expr::lookup(annotations::BOOTSTRAP_OVERRIDE, Expr::str("")?)?)
        .text("\"\n")
        .close(0)
        .text("- emptyDir:\n    medium: Memory\n  name: istio-envoy\n");
    SDS_VOLUMES.render_into(ctx, &mut f)?;
    LEGACY_CERT_VOLUME.render_into(ctx, &mut f)?;
    user_entries(&mut f, 0, annotations::USER_VOLUME)?;
    Ok(f)
}

/// Range over a JSON object annotation, emitting one named list entry per key
fn user_entries(f: &mut Fragment, indent: usize, key: &str) -> Result<(), SynthesisError> {
    let source = Expr::call(Func::FromJson, vec![Expr::annotation_value(key)?]);
    let body = Expr::call(Func::ToYaml, vec![Expr::var("$value")?])
        .pipe(Func::Indent, vec![Expr::Int(indent as i64 + 2)]);
    let pad = " ".repeat(indent);

    f.open_if(indent, Expr::annotation_is_set(key)?)
        .open_range(indent, Var::new("$index")?, Var::new("$value")?, source)
        .literal(&pad)?
        .text("- name: \"")
        .emit(Expr::var("$index")?)
        .text("\"\n")
        .literal(&pad)?
        .text("  ")
        .emit(body)
        .text("\n")
        .close(indent)
        .close(indent);
    Ok(())
}

// =============================================================================
// Proxy container steps
// =============================================================================

fn ports(_: &InjectionContext<'_>, f: &mut Fragment) -> Result<(), SynthesisError> {
    f.text("  ports:\n  - containerPort: ")
        .literal(&ENVOY_PROM_PORT.to_string())?
        .text("\n    protocol: TCP\n    name: http-envoy-prom\n");
    Ok(())
}

fn args_prefix(_: &InjectionContext<'_>, f: &mut Fragment) -> Result<(), SynthesisError> {
    let app_label = Expr::call(
        Func::Index,
        vec![Expr::field(".ObjectMeta.Labels")?, Expr::str("app")?],
    );

    f.text("  args:\n  - proxy\n  - sidecar\n  - --domain\n  - $(POD_NAMESPACE).svc.cluster.local\n")
        .text("  - --configPath\n  - \"")
        .emit(Expr::field(".ProxyConfig.ConfigPath")?)
        .text("\"\n  - --binaryPath\n  - \"")
        .emit(Expr::field(".ProxyConfig.BinaryPath")?)
        .text("\"\n  - --serviceCluster\n")
        .open_if(
            2,
            Expr::call(Func::Ne, vec![Expr::str("")?, app_label.clone()]),
        )
        .text("  - \"")
        .emit(app_label)
        .text(".$(POD_NAMESPACE)\"\n")
        .open_else(2)
        .text("  - \"")
        .emit(Expr::call(
            Func::ValueOrDefault,
            vec![Expr::field(".DeploymentMeta.Name")?, Expr::str("istio-proxy")?],
        ))
        .text(".")
        .emit(Expr::call(
            Func::ValueOrDefault,
            vec![Expr::field(".DeploymentMeta.Namespace")?, Expr::str("default")?],
        ))
        .text("\"\n")
        .close(2)
        .text("  - --drainDuration\n  - \"")
        .emit(Expr::call(
            Func::FormatDuration,
            vec![Expr::field(".ProxyConfig.DrainDuration")?],
        ))
        .text("\"\n  - --parentShutdownDuration\n  - \"")
        .emit(Expr::call(
            Func::FormatDuration,
            vec![Expr::field(".ProxyConfig.ParentShutdownDuration")?],
        ))
        .text("\"\n  - --discoveryAddress\n  - \"")
        .emit(Expr::lookup(
            annotations::DISCOVERY_ADDRESS,
            Expr::field(".ProxyConfig.DiscoveryAddress")?,
        )?)
        .text("\"\n");
    Ok(())
}

fn tracing_args(ctx: &InjectionContext<'_>, f: &mut Fragment) -> Result<(), SynthesisError> {
    TRACING_ARGS.render_into(ctx, f)
}

fn args_suffix(ctx: &InjectionContext<'_>, f: &mut Fragment) -> Result<(), SynthesisError> {
    let auth_default = if ctx.flags.control_plane_security {
        "MUTUAL_TLS"
    } else {
        "NONE"
    };

    f.text("  - --connectTimeout\n  - \"")
        .emit(Expr::call(
            Func::FormatDuration,
            vec![Expr::field(".ProxyConfig.ConnectTimeout")?],
        ))
        .text("\"\n  - --proxyAdminPort\n  - \"")
        .emit(Expr::field(".ProxyConfig.ProxyAdminPort")?)
        .text("\"\n")
        .open_if(
            2,
            Expr::call(
                Func::Gt,
                vec![Expr::field(".ProxyConfig.Concurrency")?, Expr::Int(0)],
            ),
        )
        .text("  - --concurrency\n  - \"")
        .emit(Expr::field(".ProxyConfig.Concurrency")?)
        .text("\"\n")
        .close(2)
        .text("  - --controlPlaneAuthPolicy\n  - \"")
        .emit(Expr::lookup(
            annotations::CONTROL_PLANE_AUTH_POLICY,
            Expr::str(auth_default)?,
        )?)
        .text("\"\n")
        .open_if(2, status_port_enabled(ctx)?)
        .text("  - --statusPort\n  - \"")
        .emit(ctx.status())
        .text("\"\n  - --applicationPorts\n  - \"")
        .emit(Expr::lookup(
            annotations::APPLICATION_PORTS,
            Expr::call(Func::ApplicationPorts, vec![Expr::field(".Spec.Containers")?]),
        )?)
        .text("\"\n")
        .close(2);
    Ok(())
}

fn env(ctx: &InjectionContext<'_>, f: &mut Fragment) -> Result<(), SynthesisError> {
    f.text("  env:\n")
        .text("  - name: POD_NAME\n    valueFrom:\n      fieldRef:\n        fieldPath: metadata.name\n")
        .text("  - name: POD_NAMESPACE\n    valueFrom:\n      fieldRef:\n        fieldPath: metadata.namespace\n")
        .text("  - name: INSTANCE_IP\n    valueFrom:\n      fieldRef:\n        fieldPath: status.podIP\n");
    HOST_IP_ENV.render_into(ctx, f)?;
    f.text("  - name: ISTIO_META_POD_NAME\n    valueFrom:\n      fieldRef:\n        fieldPath: metadata.name\n")
        .text("  - name: ISTIO_META_CONFIG_NAMESPACE\n    valueFrom:\n      fieldRef:\n        fieldPath: metadata.namespace\n");
    NETWORK_NAME_ENV.render_into(ctx, f)?;
    f.text("  - name: ISTIO_META_INTERCEPTION_MODE\n    value: \"")
        .emit(ctx.interception())
        .text("\"\n");

    for (name, field) in [
        ("ISTIO_METAJSON_ANNOTATIONS", ".ObjectMeta.Annotations"),
        ("ISTIO_METAJSON_LABELS", ".ObjectMeta.Labels"),
    ] {
        f.open_if(2, Expr::field(field)?)
            .text("  - name: ")
            .literal(name)?
            .text("\n    value: |\n      ")
            .emit(Expr::call(Func::ToJson, vec![Expr::field(field)?]))
            .text("\n")
            .close(2);
    }

    f.open_if(2, Expr::annotation_is_set(annotations::BOOTSTRAP_OVERRIDE)?)
        .text("  - name: ISTIO_BOOTSTRAP_OVERRIDE\n    value: \"")
        .literal(CUSTOM_BOOTSTRAP_PATH)?
        .text("/custom_bootstrap.json\"\n")
        .close(2);
    Ok(())
}

fn image_pull_policy(ctx: &InjectionContext<'_>, f: &mut Fragment) -> Result<(), SynthesisError> {
    f.text("  imagePullPolicy: ")
        .literal(ctx.spec.image_pull_policy.as_str())?
        .text("\n");
    Ok(())
}

fn status_port_enabled(ctx: &InjectionContext<'_>) -> Result<Expr, DirectiveError> {
    Ok(Expr::call(Func::Ne, vec![ctx.status(), Expr::str("0")?]))
}

fn readiness_probe(ctx: &InjectionContext<'_>, f: &mut Fragment) -> Result<(), SynthesisError> {
    f.open_if(2, status_port_enabled(ctx)?)
        .text("  readinessProbe:\n    httpGet:\n      path: /healthz/ready\n      port: ")
        .emit(ctx.status())
        .text("\n    initialDelaySeconds: ")
        .emit(Expr::lookup(
            annotations::READINESS_INITIAL_DELAY,
            Expr::str("1")?,
        )?)
        .text("\n    periodSeconds: ")
        .emit(Expr::lookup(annotations::READINESS_PERIOD, Expr::str("2")?)?)
        .text("\n    failureThreshold: ")
        .emit(Expr::lookup(
            annotations::READINESS_FAILURE_THRESHOLD,
            Expr::str("30")?,
        )?)
        .text("\n")
        .close(2);
    Ok(())
}

fn security_context(ctx: &InjectionContext<'_>, f: &mut Fragment) -> Result<(), SynthesisError> {
    f.text("  securityContext:\n    privileged: ")
        .literal(if ctx.spec.proxy.privileged {
            "true"
        } else {
            "false"
        })?
        .text("\n    readOnlyRootFilesystem: ")
        .literal(if ctx.flags.core_dump { "false" } else { "true" })?
        .text("\n");
    TPROXY_SECURITY_CONTEXT.render_into(ctx, f)
}

fn resources(ctx: &InjectionContext<'_>, f: &mut Fragment) -> Result<(), SynthesisError> {
    let requests = &ctx.proxy_resources.requests;
    f.open_if(
        2,
        Expr::call(
            Func::Or,
            vec![
                Expr::annotation_is_set(annotations::PROXY_CPU)?,
                Expr::annotation_is_set(annotations::PROXY_MEMORY)?,
            ],
        ),
    )
    .text("  resources:\n    requests:\n      cpu: \"")
    .emit(Expr::lookup(annotations::PROXY_CPU, Expr::str(&requests.cpu)?)?)
    .text("\"\n      memory: \"")
    .emit(Expr::lookup(
        annotations::PROXY_MEMORY,
        Expr::str(&requests.memory)?,
    )?)
    .text("\"\n")
    .open_else(2)
    .yaml_block(
        "proxy resources",
        &resources_block("proxy resources", &ctx.proxy_resources, 2)?,
    )?
    .close(2);
    Ok(())
}

fn volume_mounts(ctx: &InjectionContext<'_>, f: &mut Fragment) -> Result<(), SynthesisError> {
    f.text("  volumeMounts:\n")
        .open_if(2, Expr::annotation_is_set(annotations::BOOTSTRAP_OVERRIDE)?)
        .text("  - mountPath: ")
        .literal(CUSTOM_BOOTSTRAP_PATH)?
        .text("\n    name: custom-bootstrap-volume\n")
        .close(2)
        .text("  - mountPath: /etc/istio/proxy\n    name: istio-envoy\n");
    SDS_MOUNTS.render_into(ctx, f)?;
    LEGACY_CERT_MOUNT.render_into(ctx, f)?;
    user_entries(f, 2, annotations::USER_VOLUME_MOUNT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_common::crd::MeshConfigSpec;

    fn compose_spec(spec: &MeshConfigSpec) -> SynthesizedArtifact {
        let ctx = InjectionContext::resolve(spec).unwrap();
        compose(&ctx).unwrap()
    }

    fn section(artifact: &SynthesizedArtifact, kind: SectionKind) -> String {
        artifact.section(kind).unwrap().to_string()
    }

    #[test]
    fn sections_are_emitted_in_order() {
        let template = compose_spec(&MeshConfigSpec::default()).template();
        let policy = template.find("rewriteAppHTTPProbe:").unwrap();
        let init = template.find("initContainers:").unwrap();
        let containers = template.find("containers:\n- name: istio-proxy").unwrap();
        let volumes = template.find("\nvolumes:\n").unwrap();
        assert!(policy < init && init < containers && containers < volumes);
    }

    #[test]
    fn policy_section_reflects_probe_rewriting() {
        let mut spec = MeshConfigSpec::default();
        assert_eq!(
            section(&compose_spec(&spec), SectionKind::Policy),
            "rewriteAppHTTPProbe: false\n"
        );
        spec.sidecar_injector.rewrite_app_http_probe = Some(true);
        assert!(section(&compose_spec(&spec), SectionKind::Policy)
            .starts_with("rewriteAppHTTPProbe: true\n"));
    }

    #[test]
    fn init_section_is_gated_on_interception_mode() {
        let init = section(&compose_spec(&MeshConfigSpec::default()), SectionKind::InitContainers);
        assert!(init.starts_with(
            "initContainers:\n[[- if ne (annotation .ObjectMeta `sidecar.istio.io/interceptionMode` .ProxyConfig.InterceptionMode) \"NONE\" ]]\n- name: istio-init\n"
        ));
        assert!(init.ends_with("[[- end ]]\n"));
    }

    #[test]
    fn cni_with_core_dump_keeps_only_the_core_dump_container() {
        let mut spec = MeshConfigSpec::default();
        spec.sidecar_injector.init_cni_enabled = Some(true);
        spec.proxy.enable_core_dump = Some(true);
        let init = section(&compose_spec(&spec), SectionKind::InitContainers);
        assert!(!init.contains("istio-init"));
        assert!(init.contains("name: enable-core-dump"));
    }

    #[test]
    fn steps_have_unique_names() {
        let mut names: Vec<_> = PROXY_CONTAINER_STEPS.iter().map(|s| s.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), PROXY_CONTAINER_STEPS.len());
    }

    #[test]
    fn control_plane_auth_default_follows_security_flag() {
        let auth = |spec: &MeshConfigSpec| {
            compose_spec(spec)
                .lookups()
                .into_iter()
                .find(|l| l.key().as_str() == annotations::CONTROL_PLANE_AUTH_POLICY)
                .map(|l| l.default_value().to_string())
        };
        let mut spec = MeshConfigSpec::default();
        assert_eq!(auth(&spec).as_deref(), Some("\"NONE\""));
        spec.control_plane_security_enabled = Some(true);
        assert_eq!(auth(&spec).as_deref(), Some("\"MUTUAL_TLS\""));
    }

    #[test]
    fn user_volume_mounts_range_over_the_annotation() {
        let containers = section(&compose_spec(&MeshConfigSpec::default()), SectionKind::Containers);
        assert!(containers.ends_with(
            "  [[- if isset .ObjectMeta.Annotations `sidecar.istio.io/userVolumeMount` ]]\n  [[- range $index, $value := fromJSON (index .ObjectMeta.Annotations `sidecar.istio.io/userVolumeMount`) ]]\n  - name: \"[[ $index ]]\"\n    [[ toYaml $value | indent 4 ]]\n  [[- end ]]\n  [[- end ]]\n"
        ));
    }

    #[test]
    fn user_volumes_follow_sds_volumes_too() {
        let mut spec = MeshConfigSpec::default();
        spec.sds.enabled = Some(true);
        let volumes = section(&compose_spec(&spec), SectionKind::Volumes);
        let sds = volumes.find("sds-uds-path").unwrap();
        let user = volumes.find("sidecar.istio.io/userVolume").unwrap();
        assert!(sds < user);
        assert!(volumes.contains("[[ toYaml $value | indent 2 ]]"));
    }

    #[test]
    fn synthesize_rejects_invalid_mesh() {
        let mut spec = MeshConfigSpec::default();
        spec.exclude_ip_ranges = vec!["not-a-cidr".to_string()];
        let mesh = MeshConfig::new("broken", spec);
        match synthesize(&mesh) {
            Err(SynthesisError::Validation(err)) => assert_eq!(err.mesh(), Some("broken")),
            other => panic!("expected validation error, got {:?}", other),
        }
    }
}
