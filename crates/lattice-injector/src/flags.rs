//! Feature flag resolution
//!
//! MeshConfig keeps optional booleans as `Option<bool>`. Every one of them
//! resolves with the same rule: absent means false.

use lattice_common::crd::{MeshConfigSpec, Tracer};

/// Resolve an optional flag; absent means false
pub fn resolve_flag(value: Option<bool>) -> bool {
    value.unwrap_or(false)
}

/// Every MeshConfig flag the synthesizer branches on, resolved once
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FeatureFlags {
    /// `tracing.enabled`
    pub tracing: bool,
    /// `proxy.enableCoreDump`
    pub core_dump: bool,
    /// `multiMesh`
    pub multi_mesh: bool,
    /// `meshExpansion`
    pub mesh_expansion: bool,
    /// `sds.enabled`
    pub sds: bool,
    /// `sds.useTrustworthyJwt`
    pub trustworthy_jwt: bool,
    /// `sidecarInjector.initCniEnabled`
    pub init_cni: bool,
    /// `sidecarInjector.autoInjectionPolicyEnabled`
    pub auto_injection: bool,
    /// `sidecarInjector.rewriteAppHttpProbe`
    pub rewrite_app_http_probe: bool,
    /// `controlPlaneSecurityEnabled`
    pub control_plane_security: bool,
}

impl FeatureFlags {
    /// Resolve every flag in `spec`
    pub fn resolve(spec: &MeshConfigSpec) -> Self {
        Self {
            tracing: resolve_flag(spec.tracing.enabled),
            core_dump: resolve_flag(spec.proxy.enable_core_dump),
            multi_mesh: resolve_flag(spec.multi_mesh),
            mesh_expansion: resolve_flag(spec.mesh_expansion),
            sds: resolve_flag(spec.sds.enabled),
            trustworthy_jwt: resolve_flag(spec.sds.use_trustworthy_jwt),
            init_cni: resolve_flag(spec.sidecar_injector.init_cni_enabled),
            auto_injection: resolve_flag(spec.sidecar_injector.auto_injection_policy_enabled),
            rewrite_app_http_probe: resolve_flag(spec.sidecar_injector.rewrite_app_http_probe),
            control_plane_security: resolve_flag(spec.control_plane_security_enabled),
        }
    }

    /// SDS is on and authenticates with a projected token
    pub fn sds_with_jwt(&self) -> bool {
        self.sds && self.trustworthy_jwt
    }
}

/// The tracer that is actually in effect: `None` unless tracing is enabled
pub fn active_tracer<'a>(spec: &'a MeshConfigSpec, flags: &FeatureFlags) -> Option<&'a Tracer> {
    if !flags.tracing {
        return None;
    }
    match &spec.tracing.tracer {
        Tracer::None => None,
        tracer => Some(tracer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_common::crd::DatadogTracer;

    #[test]
    fn absent_flags_resolve_false() {
        assert!(!resolve_flag(None));
        assert!(!resolve_flag(Some(false)));
        assert!(resolve_flag(Some(true)));
        assert_eq!(
            FeatureFlags::resolve(&MeshConfigSpec::default()),
            FeatureFlags::default()
        );
    }

    #[test]
    fn each_flag_reads_its_own_field() {
        let mut spec = MeshConfigSpec::default();
        spec.sds.enabled = Some(true);
        spec.multi_mesh = Some(true);
        let flags = FeatureFlags::resolve(&spec);
        assert!(flags.sds);
        assert!(flags.multi_mesh);
        assert!(!flags.trustworthy_jwt);
        assert!(!flags.sds_with_jwt());
        assert!(!flags.mesh_expansion);
    }

    #[test]
    fn trustworthy_jwt_alone_does_not_imply_sds() {
        let mut spec = MeshConfigSpec::default();
        spec.sds.use_trustworthy_jwt = Some(true);
        let flags = FeatureFlags::resolve(&spec);
        assert!(flags.trustworthy_jwt);
        assert!(!flags.sds_with_jwt());
    }

    #[test]
    fn tracer_is_inactive_unless_tracing_enabled() {
        let mut spec = MeshConfigSpec::default();
        spec.tracing.tracer = Tracer::Datadog(DatadogTracer::default());
        assert!(active_tracer(&spec, &FeatureFlags::resolve(&spec)).is_none());

        spec.tracing.enabled = Some(true);
        let flags = FeatureFlags::resolve(&spec);
        assert_eq!(active_tracer(&spec, &flags).map(Tracer::name), Some("datadog"));

        spec.tracing.tracer = Tracer::None;
        assert!(active_tracer(&spec, &flags).is_none());
    }
}
