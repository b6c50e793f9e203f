//! Common types for Lattice meshes: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod yaml;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace the mesh control plane runs in when a MeshConfig carries none
pub const DEFAULT_MESH_NAMESPACE: &str = "istio-system";

/// Standard label carrying the resource name
pub const LABEL_NAME: &str = "app.kubernetes.io/name";

/// Standard label identifying the managing controller
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`LABEL_MANAGED_BY`] on resources Lattice owns
pub const LABEL_MANAGED_BY_LATTICE: &str = "lattice";
