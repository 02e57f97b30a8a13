//! Node placement.

use k8s_openapi::api::core::v1::{
    Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    PreferredSchedulingTerm,
};

use crate::config::NodePoolConfig;
use crate::models::CapacityType;
use crate::types::{Error, Result};

/// Weight of the soft SPOT preference.
const SPOT_PREFERENCE_WEIGHT: i32 = 100;

fn match_in(key: &str, value: &str) -> NodeSelectorRequirement {
    NodeSelectorRequirement {
        key: key.to_string(),
        operator: "In".to_string(),
        values: Some(vec![value.to_string()]),
    }
}

/// Pod affinity for a deploy.
///
/// An explicit override is used verbatim. Otherwise SPOT capacity yields a
/// preference that can fall back to on-demand nodes, and anything else is a
/// hard requirement, pinned to the static pool for static builds.
pub fn node_affinity(
    override_value: Option<serde_json::Value>,
    capacity: CapacityType,
    is_static: bool,
    pools: &NodePoolConfig,
) -> Result<Affinity> {
    if let Some(value) = override_value {
        return serde_json::from_value(value).map_err(|e| Error::malformed("nodeAffinity", e));
    }

    let capacity_match = match_in(&pools.capacity_type_label, capacity.label_value());

    let node_affinity = match capacity {
        CapacityType::Spot => NodeAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                PreferredSchedulingTerm {
                    weight: SPOT_PREFERENCE_WEIGHT,
                    preference: NodeSelectorTerm {
                        match_expressions: Some(vec![capacity_match]),
                        ..NodeSelectorTerm::default()
                    },
                },
            ]),
            ..NodeAffinity::default()
        },
        CapacityType::OnDemand => {
            let mut expressions = vec![capacity_match];
            if is_static {
                expressions.push(match_in(
                    &pools.static_env_label_key,
                    &pools.static_env_label_value,
                ));
            }
            NodeAffinity {
                required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                    node_selector_terms: vec![NodeSelectorTerm {
                        match_expressions: Some(expressions),
                        ..NodeSelectorTerm::default()
                    }],
                }),
                ..NodeAffinity::default()
            }
        }
    };

    Ok(Affinity {
        node_affinity: Some(node_affinity),
        ..Affinity::default()
    })
}
