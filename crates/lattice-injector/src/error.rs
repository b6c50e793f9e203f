//! Synthesis error types

use thiserror::Error;

use crate::directive::DirectiveError;

/// Errors that abort a synthesis run
///
/// None of these are transient: synthesis performs no I/O, so every error
/// points at either the MeshConfig or a defect in template composition.
#[derive(Debug, Error)]
pub enum SynthesisError {
    /// The MeshConfig was rejected before any template text was produced
    #[error("mesh configuration rejected: {0}")]
    Validation(#[from] lattice_common::Error),

    /// A directive could not be constructed
    #[error("malformed directive: {0}")]
    Directive(#[from] DirectiveError),

    /// An embedded structured block could not be serialized
    #[error("failed to serialize {block} block: {message}")]
    Serialization {
        /// The block being serialized (e.g., "proxy resources")
        block: String,
        /// Serializer error message
        message: String,
    },
}

impl SynthesisError {
    /// Create a serialization error for the named block
    pub fn serialization(block: impl Into<String>, message: impl ToString) -> Self {
        Self::Serialization {
            block: block.into(),
            message: message.to_string(),
        }
    }
}

impl From<SynthesisError> for lattice_common::Error {
    fn from(err: SynthesisError) -> Self {
        match err {
            SynthesisError::Validation(inner) => inner,
            SynthesisError::Directive(inner) => {
                lattice_common::Error::internal_with_context("synthesis", inner.to_string())
            }
            SynthesisError::Serialization { block, message } => {
                lattice_common::Error::serialization_for_kind(block, message)
            }
        }
    }
}
