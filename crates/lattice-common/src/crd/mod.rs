//! Custom Resource Definitions for Lattice meshes

mod mesh_config;
mod resources;

pub use mesh_config::{
    DatadogTracer, ImagePullPolicy, InitContainerSpec, InterceptionMode, LightstepTracer,
    MeshConfig, MeshConfigSpec, ProxyInitSpec, ProxySpec, SdsSpec, SidecarInjectorSpec, Tracer,
    TracingSpec, ZipkinTracer, DEFAULT_CORE_DUMP_IMAGE, DEFAULT_DATADOG_ADDRESS,
    DEFAULT_LIGHTSTEP_CACERT_PATH, DEFAULT_PROXY_IMAGE, DEFAULT_PROXY_INIT_IMAGE,
    DEFAULT_ZIPKIN_ADDRESS,
};
pub use resources::{
    CpuMemory, ResolvedResources, ResourceQuantity, ResourceRequirements, DEFAULT_CPU_LIMIT,
    DEFAULT_CPU_REQUEST, DEFAULT_MEMORY_LIMIT, DEFAULT_MEMORY_REQUEST,
};
