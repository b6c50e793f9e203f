//! Container resource requirement types shared by the MeshConfig CRD.
//!
//! `ResourceRequirements` is the user-facing, partially specified form.
//! `ResolvedResources` is the fully specified form every mesh carries as its
//! default and every emitted template block is built from.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default CPU request applied when neither the component nor the mesh sets one
pub const DEFAULT_CPU_REQUEST: &str = "100m";
/// Default memory request applied when neither the component nor the mesh sets one
pub const DEFAULT_MEMORY_REQUEST: &str = "128Mi";
/// Default CPU limit applied when neither the component nor the mesh sets one
pub const DEFAULT_CPU_LIMIT: &str = "2000m";
/// Default memory limit applied when neither the component nor the mesh sets one
pub const DEFAULT_MEMORY_LIMIT: &str = "1024Mi";

// =============================================================================
// Partial Requirements
// =============================================================================

/// Container resource limits and requests, any of which may be absent
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ResourceRequirements {
    /// Resource requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceQuantity>,

    /// Resource limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceQuantity>,
}

/// Resource quantity for CPU and memory
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ResourceQuantity {
    /// CPU quantity (e.g., "100m", "1")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory quantity (e.g., "128Mi", "1Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

impl ResourceRequirements {
    /// Validate resource requirements
    pub fn validate(&self, component: &str) -> Result<(), crate::Error> {
        if let Some(ref requests) = self.requests {
            requests.validate(component, "requests")?;
        }
        if let Some(ref limits) = self.limits {
            limits.validate(component, "limits")?;
        }
        Ok(())
    }
}

impl ResourceQuantity {
    /// Validate resource quantity values
    pub fn validate(&self, component: &str, field: &str) -> Result<(), crate::Error> {
        if let Some(ref cpu) = self.cpu {
            validate_cpu_quantity(cpu, component, field)?;
        }
        if let Some(ref memory) = self.memory {
            validate_memory_quantity(memory, component, field)?;
        }
        Ok(())
    }
}

// =============================================================================
// Resolved Requirements
// =============================================================================

/// A CPU and memory pair where both quantities are always present
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct CpuMemory {
    /// CPU quantity
    pub cpu: String,
    /// Memory quantity
    pub memory: String,
}

impl CpuMemory {
    /// Build a pair from borrowed quantities
    pub fn new(cpu: impl Into<String>, memory: impl Into<String>) -> Self {
        Self {
            cpu: cpu.into(),
            memory: memory.into(),
        }
    }

    fn validate(&self, component: &str, field: &str) -> Result<(), crate::Error> {
        validate_cpu_quantity(&self.cpu, component, field)?;
        validate_memory_quantity(&self.memory, component, field)
    }
}

/// Fully specified requests and limits
///
/// This is the shape of the mesh-wide default. Nothing downstream ever has to
/// ask whether a quantity is missing.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ResolvedResources {
    /// Resource requests
    pub requests: CpuMemory,
    /// Resource limits
    pub limits: CpuMemory,
}

impl Default for ResolvedResources {
    fn default() -> Self {
        Self {
            requests: CpuMemory::new(DEFAULT_CPU_REQUEST, DEFAULT_MEMORY_REQUEST),
            limits: CpuMemory::new(DEFAULT_CPU_LIMIT, DEFAULT_MEMORY_LIMIT),
        }
    }
}

impl ResolvedResources {
    /// Validate every quantity
    pub fn validate(&self, component: &str) -> Result<(), crate::Error> {
        self.requests.validate(component, "requests")?;
        self.limits.validate(component, "limits")
    }
}

// =============================================================================
// Quantity Validation
// =============================================================================

/// A non-negative, finite decimal number
fn is_decimal(s: &str) -> bool {
    !s.starts_with('-') && s.parse::<f64>().is_ok_and(|v| v.is_finite() && v >= 0.0)
}

/// Validate CPU quantity format (e.g., "100m", "1", "0.5")
pub(crate) fn validate_cpu_quantity(
    qty: &str,
    component: &str,
    field: &str,
) -> Result<(), crate::Error> {
    let is_valid = if let Some(stripped) = qty.strip_suffix('m') {
        stripped.parse::<u64>().is_ok()
    } else {
        is_decimal(qty)
    };

    if !is_valid {
        return Err(crate::Error::validation_for_field(
            format!("{}.{}.cpu", component, field),
            format!("invalid quantity '{}' (expected e.g., '100m', '1', '0.5')", qty),
        ));
    }

    Ok(())
}

/// Validate memory quantity format (e.g., "128Mi", "1Gi", "1000000")
pub(crate) fn validate_memory_quantity(
    qty: &str,
    component: &str,
    field: &str,
) -> Result<(), crate::Error> {
    let suffixes = [
        "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "k", "M", "G", "T", "P", "E",
    ];

    let is_valid = if let Some(suffix) = suffixes.iter().find(|s| qty.ends_with(*s)) {
        let prefix = &qty[..qty.len() - suffix.len()];
        prefix.parse::<u64>().is_ok() || is_decimal(prefix)
    } else {
        qty.parse::<u64>().is_ok()
    };

    if !is_valid {
        return Err(crate::Error::validation_for_field(
            format!("{}.{}.memory", component, field),
            format!("invalid quantity '{}' (expected e.g., '128Mi', '1Gi')", qty),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_cpu_quantities() {
        for qty in ["100m", "1", "0.5", "2000m"] {
            assert!(validate_cpu_quantity(qty, "proxy", "requests").is_ok(), "{qty}");
        }
    }

    #[test]
    fn test_invalid_cpu_quantities() {
        for qty in ["lots", "100x", "m", "", "NaN", "inf", "-5", "-0", "-100m", "infinity"] {
            assert!(validate_cpu_quantity(qty, "proxy", "requests").is_err(), "{qty}");
        }
    }

    #[test]
    fn test_valid_memory_quantities() {
        for qty in ["128Mi", "1Gi", "1000000", "1.5Gi", "512k"] {
            assert!(validate_memory_quantity(qty, "proxy", "limits").is_ok(), "{qty}");
        }
    }

    #[test]
    fn test_invalid_memory_quantities() {
        for qty in ["big", "12XB", "Mi", "-1Gi", "NaNMi", "infGi", "-1", "-0.5Ki"] {
            assert!(validate_memory_quantity(qty, "proxy", "limits").is_err(), "{qty}");
        }
    }

    #[test]
    fn invalid_quantity_error_carries_field_path() {
        let req = ResourceRequirements {
            requests: Some(ResourceQuantity {
                cpu: Some("fast".to_string()),
                memory: None,
            }),
            limits: None,
        };
        let err = req.validate("spec.proxy.resources").unwrap_err();
        assert_eq!(err.field(), Some("spec.proxy.resources.requests.cpu"));
        assert!(err.to_string().contains("fast"));
    }

    #[test]
    fn partial_requirements_validate_present_fields_only() {
        let req = ResourceRequirements {
            requests: Some(ResourceQuantity {
                cpu: Some("250m".to_string()),
                memory: None,
            }),
            limits: None,
        };
        assert!(req.validate("proxy").is_ok());
        assert!(ResourceRequirements::default().validate("proxy").is_ok());
    }

    #[test]
    fn default_resolved_resources_are_valid() {
        let defaults = ResolvedResources::default();
        assert!(defaults.validate("spec.defaultResources").is_ok());
        assert_eq!(defaults.requests.cpu, DEFAULT_CPU_REQUEST);
        assert_eq!(defaults.limits.memory, DEFAULT_MEMORY_LIMIT);
    }

    #[test]
    fn resolved_resources_require_both_quantities_when_parsed() {
        let parsed: Result<ResolvedResources, _> =
            serde_json::from_str(r#"{"requests":{"cpu":"1"},"limits":{"cpu":"1","memory":"1Gi"}}"#);
        assert!(parsed.is_err());
    }
}
