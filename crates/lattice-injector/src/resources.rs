//! Resource requirement merging and rendering
//!
//! Explicit requirements are merged into the mesh default one quantity at a
//! time, so a component that only pins its CPU request still inherits the
//! default memory request and both limits.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements as KubeResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use lattice_common::crd::{CpuMemory, ResolvedResources, ResourceQuantity, ResourceRequirements};
use lattice_common::yaml;
use serde::Serialize;

use crate::error::SynthesisError;

/// Merge optional explicit requirements into the mesh default
///
/// Each of the four quantities comes from `explicit` when present there and
/// from `default` otherwise.
pub fn merge_resources(
    explicit: Option<&ResourceRequirements>,
    default: &ResolvedResources,
) -> ResolvedResources {
    let requests = explicit.and_then(|r| r.requests.as_ref());
    let limits = explicit.and_then(|r| r.limits.as_ref());
    ResolvedResources {
        requests: merge_quantity(requests, &default.requests),
        limits: merge_quantity(limits, &default.limits),
    }
}

fn merge_quantity(explicit: Option<&ResourceQuantity>, default: &CpuMemory) -> CpuMemory {
    CpuMemory {
        cpu: explicit
            .and_then(|q| q.cpu.clone())
            .unwrap_or_else(|| default.cpu.clone()),
        memory: explicit
            .and_then(|q| q.memory.clone())
            .unwrap_or_else(|| default.memory.clone()),
    }
}

/// Convert resolved requirements into the Kubernetes type
pub fn to_kube_requirements(resources: &ResolvedResources) -> KubeResourceRequirements {
    KubeResourceRequirements {
        requests: Some(quantity_map(&resources.requests)),
        limits: Some(quantity_map(&resources.limits)),
        ..Default::default()
    }
}

fn quantity_map(pair: &CpuMemory) -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("cpu".to_string(), Quantity(pair.cpu.clone())),
        ("memory".to_string(), Quantity(pair.memory.clone())),
    ])
}

#[derive(Serialize)]
struct ResourcesBlock<'a> {
    resources: &'a KubeResourceRequirements,
}

/// Render a `resources:` mapping, every line indented by `indent` spaces
pub fn resources_block(
    block: &str,
    resources: &ResolvedResources,
    indent: usize,
) -> Result<String, SynthesisError> {
    let requirements = to_kube_requirements(resources);
    let rendered = yaml::to_yaml(block, &ResourcesBlock {
        resources: &requirements,
    })
    .map_err(|e| SynthesisError::serialization(block, e))?;
    Ok(yaml::indent(&rendered, indent))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_resources() -> ResolvedResources {
        ResolvedResources {
            requests: CpuMemory::new("100m", "128Mi"),
            limits: CpuMemory::new("2000m", "1024Mi"),
        }
    }

    #[test]
    fn absent_requirements_take_the_default() {
        assert_eq!(
            merge_resources(None, &default_resources()),
            default_resources()
        );
        assert_eq!(
            merge_resources(Some(&ResourceRequirements::default()), &default_resources()),
            default_resources()
        );
    }

    /// Story: a proxy pins only its CPU request and inherits everything else
    #[test]
    fn story_cpu_request_only_inherits_memory_and_limits() {
        let explicit = ResourceRequirements {
            requests: Some(ResourceQuantity {
                cpu: Some("500m".to_string()),
                memory: None,
            }),
            limits: None,
        };
        let merged = merge_resources(Some(&explicit), &default_resources());
        assert_eq!(merged.requests.cpu, "500m");
        assert_eq!(merged.requests.memory, "128Mi");
        assert_eq!(merged.limits.cpu, "2000m");
        assert_eq!(merged.limits.memory, "1024Mi");
    }

    #[test]
    fn explicit_limits_override_only_their_fields() {
        let explicit = ResourceRequirements {
            requests: None,
            limits: Some(ResourceQuantity {
                cpu: None,
                memory: Some("2Gi".to_string()),
            }),
        };
        let merged = merge_resources(Some(&explicit), &default_resources());
        assert_eq!(merged.limits, CpuMemory::new("2000m", "2Gi"));
        assert_eq!(merged.requests, default_resources().requests);
    }

    #[test]
    fn kube_requirements_carry_all_four_quantities() {
        let kube = to_kube_requirements(&default_resources());
        let requests = kube.requests.unwrap();
        let limits = kube.limits.unwrap();
        assert_eq!(requests["cpu"], Quantity("100m".to_string()));
        assert_eq!(requests["memory"], Quantity("128Mi".to_string()));
        assert_eq!(limits["cpu"], Quantity("2000m".to_string()));
        assert_eq!(limits["memory"], Quantity("1024Mi".to_string()));
        assert!(kube.claims.is_none());
    }

    #[test]
    fn resources_block_is_indented_yaml() {
        let block = resources_block("proxy resources", &default_resources(), 2).unwrap();
        assert!(block.starts_with("  resources:\n"));
        assert!(block.ends_with('\n'));
        assert!(block.lines().all(|l| l.starts_with("  ")));

        let parsed: serde_json::Value = serde_yaml::from_str(&block).unwrap();
        assert_eq!(parsed["resources"]["requests"]["cpu"], "100m");
        assert_eq!(parsed["resources"]["limits"]["memory"], "1024Mi");
    }
}
