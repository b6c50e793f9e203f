//! Error types for Lattice mesh components
//!
//! Errors are structured with fields to aid debugging in production.
//! Each error variant includes contextual information like the mesh
//! name, the invalid field path, or the resource kind being serialized.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Lattice operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for CRD specs
    #[error("validation error for {mesh}: {message}")]
    Validation {
        /// Name of the mesh configuration with the invalid value
        mesh: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.proxy.resources")
        field: Option<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind or block being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "synthesis", "publisher")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    ///
    /// For simple validation errors without mesh context.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            mesh: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with a field path but no mesh context
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            mesh: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors are not retryable (require config fix).
    /// Kubernetes errors depend on the error type.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Don't retry on 4xx errors (validation, not found, etc.)
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the mesh name if this error is associated with a specific mesh
    pub fn mesh(&self) -> Option<&str> {
        match self {
            Error::Validation { mesh, .. } => Some(mesh),
            _ => None,
        }
    }

    /// Get the field path if this error points at one
    pub fn field(&self) -> Option<&str> {
        match self {
            Error::Validation { field, .. } => field.as_deref(),
            _ => None,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Attach a mesh name to a validation error that was raised without one
    pub fn with_mesh(self, name: impl Into<String>) -> Self {
        match self {
            Error::Validation {
                mesh,
                message,
                field,
            } if mesh == UNKNOWN_CONTEXT => Error::Validation {
                mesh: name.into(),
                message,
                field,
            },
            other => other,
        }
    }
}
