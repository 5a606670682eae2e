//! Replica & Autoscaling Resolution (spec §4.6): the clamp-or-set rule shared by
//! MachineDeployment (`rollout::replace`) and MachineSet (`rollout::inplace`) reconcile.

use crate::crd::capi::{ANNOTATION_AUTOSCALER_MAX, ANNOTATION_AUTOSCALER_MIN};
use crate::crd::NodePool;

/// Resolved replica outcome for a MachineDeployment/MachineSet: either a fixed replica
/// count to write, or autoscaler bounds to annotate while leaving `spec.replicas` as-is
/// (unless it needs clamping into range).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaResolution {
    Autoscaling { replicas: i32, min: i32, max: i32 },
    Fixed { replicas: i32 },
}

impl ReplicaResolution {
    pub fn replicas(&self) -> i32 {
        match self {
            ReplicaResolution::Autoscaling { replicas, .. } => *replicas,
            ReplicaResolution::Fixed { replicas } => *replicas,
        }
    }

    /// Annotations to set on the MachineDeployment/MachineSet (spec §4.6): autoscaler
    /// bounds when enabled, or `"0"`/`"0"` to clear them when disabled.
    pub fn annotations(&self) -> [(&'static str, String); 2] {
        match self {
            ReplicaResolution::Autoscaling { min, max, .. } => [
                (ANNOTATION_AUTOSCALER_MIN, min.to_string()),
                (ANNOTATION_AUTOSCALER_MAX, max.to_string()),
            ],
            ReplicaResolution::Fixed { .. } => [
                (ANNOTATION_AUTOSCALER_MIN, "0".to_string()),
                (ANNOTATION_AUTOSCALER_MAX, "0".to_string()),
            ],
        }
    }
}

/// Resolves the replica count for a downstream MachineDeployment/MachineSet from the
/// NodePool's desired state and the workload's currently observed `spec.replicas`
/// (spec §4.6): when autoscaling is enabled, an in-range current value is left
/// untouched; out-of-range is clamped; unset/zero is seeded at `min`.
pub fn resolve(node_pool: &NodePool, current_replicas: Option<i32>) -> ReplicaResolution {
    match node_pool.autoscaling() {
        Some(bounds) => {
            let replicas = match current_replicas {
                Some(current) if current >= bounds.min && current <= bounds.max => current,
                Some(current) if current < bounds.min => bounds.min,
                Some(_) => bounds.max,
                None => bounds.min,
            };
            ReplicaResolution::Autoscaling {
                replicas,
                min: bounds.min,
                max: bounds.max,
            }
        }
        None => ReplicaResolution::Fixed {
            replicas: node_pool.desired_replicas(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn node_pool(replicas: Option<i32>, auto_scaling: Option<crate::crd::NodePoolAutoScaling>) -> NodePool {
        NodePool::new(
            "workers",
            crate::crd::NodePoolSpec {
                cluster_name: "hc".into(),
                platform: crate::crd::platform::NodePoolPlatform::None,
                replicas,
                auto_scaling,
                release: crate::crd::NodePoolReleaseImage { image: "r1".into() },
                config: vec![],
                tuning_config: vec![],
                management: crate::crd::NodePoolManagement::default(),
                node_labels: BTreeMap::new(),
                taints: vec![],
                arch: None,
                paused_until: None,
                auto_repair: false,
            },
        )
    }

    #[test]
    fn fixed_replicas_default_to_zero_when_unset() {
        let np = node_pool(None, None);
        assert_eq!(resolve(&np, None), ReplicaResolution::Fixed { replicas: 0 });
    }

    #[test]
    fn fixed_replicas_follow_spec() {
        let np = node_pool(Some(5), None);
        assert_eq!(resolve(&np, Some(2)), ReplicaResolution::Fixed { replicas: 5 });
    }

    #[test]
    fn autoscaling_in_range_is_left_untouched() {
        let np = node_pool(None, Some(crate::crd::NodePoolAutoScaling { min: 2, max: 8 }));
        assert_eq!(
            resolve(&np, Some(4)),
            ReplicaResolution::Autoscaling { replicas: 4, min: 2, max: 8 }
        );
    }

    #[test]
    fn autoscaling_clamps_below_min_and_above_max() {
        let np = node_pool(None, Some(crate::crd::NodePoolAutoScaling { min: 2, max: 8 }));
        assert_eq!(
            resolve(&np, Some(1)),
            ReplicaResolution::Autoscaling { replicas: 2, min: 2, max: 8 }
        );
        assert_eq!(
            resolve(&np, Some(20)),
            ReplicaResolution::Autoscaling { replicas: 8, min: 2, max: 8 }
        );
    }

    #[test]
    fn autoscaling_seeds_min_when_unset_or_zero() {
        let np = node_pool(None, Some(crate::crd::NodePoolAutoScaling { min: 3, max: 6 }));
        assert_eq!(
            resolve(&np, None),
            ReplicaResolution::Autoscaling { replicas: 3, min: 3, max: 6 }
        );
        assert_eq!(
            resolve(&np, Some(0)),
            ReplicaResolution::Autoscaling { replicas: 3, min: 3, max: 6 }
        );
    }

    #[test]
    fn invalid_autoscaling_bounds_fall_back_to_fixed() {
        let np = node_pool(Some(4), Some(crate::crd::NodePoolAutoScaling { min: 8, max: 2 }));
        assert_eq!(resolve(&np, Some(1)), ReplicaResolution::Fixed { replicas: 4 });
    }
}
