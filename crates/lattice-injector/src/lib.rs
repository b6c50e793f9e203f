//! Sidecar injection template synthesis for Lattice meshes
//!
//! Turns a [`MeshConfig`](lattice_common::crd::MeshConfig) into the template
//! the sidecar injection webhook renders for every pod. Synthesis happens in
//! two phases: this crate resolves everything the mesh configuration decides,
//! and leaves `[[ ]]` directives for everything a pod may override. The
//! result is published as the `config` key of a ConfigMap.
//!
//! ```text
//! MeshConfig -> FeatureFlags -> InjectionContext -> compose -> SynthesizedArtifact -> ConfigMap
//! ```

#![deny(missing_docs)]

pub mod artifact;
pub mod composer;
pub mod directive;
pub mod error;
pub mod flags;
pub mod fragments;
pub mod publisher;
pub mod rbac;
pub mod resources;

pub use artifact::{InjectionPolicy, InjectorConfig, SectionKind, SynthesizedArtifact};
pub use composer::synthesize;
pub use error::SynthesisError;
pub use publisher::{build_config_map, publish};
