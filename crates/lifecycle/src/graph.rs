//! Service dependency graph from `dependsOn`.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::models::{Deploy, DeployType};
use crate::types::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    pub id: String,
    pub service: String,
    pub deploy_type: DeployType,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl DependencyGraph {
    /// Build the graph of `deploys`; edges point from a service to what it
    /// depends on.
    pub fn build(deploys: &[Deploy]) -> Result<Self> {
        let by_service: BTreeMap<&str, &Deploy> = deploys
            .iter()
            .map(|d| (d.service_name.as_str(), d))
            .collect();

        let nodes = deploys
            .iter()
            .map(|d| GraphNode {
                id: d.uuid.clone(),
                service: d.service_name.clone(),
                deploy_type: d.deploy_type,
                active: d.active,
            })
            .collect();

        let mut edges = Vec::new();
        for deploy in deploys {
            let depends_on = deploy
                .deployable
                .as_ref()
                .map(|d| d.depends_on.as_slice())
                .unwrap_or_default();
            for target in depends_on {
                let to = by_service.get(target.as_str()).ok_or_else(|| {
                    Error::GraphError(format!(
                        "{} depends on unknown service {target}",
                        deploy.service_name
                    ))
                })?;
                edges.push(GraphEdge {
                    from: deploy.uuid.clone(),
                    to: to.uuid.clone(),
                });
            }
        }

        let graph = Self { nodes, edges };
        graph.deploy_order()?;
        Ok(graph)
    }

    /// Node ids with dependencies before dependents; errors on a cycle.
    pub fn deploy_order(&self) -> Result<Vec<String>> {
        let mut pending: BTreeMap<&str, usize> =
            self.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

        for edge in &self.edges {
            *pending.entry(edge.from.as_str()).or_default() += 1;
            dependents
                .entry(edge.to.as_str())
                .or_default()
                .push(edge.from.as_str());
        }

        let mut ready: VecDeque<&str> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(pending.len());

        while let Some(id) = ready.pop_front() {
            order.push(id.to_string());
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(count) = pending.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(*dependent);
                    }
                }
            }
        }

        if order.len() < pending.len() {
            let placed: BTreeSet<&str> = order.iter().map(String::as_str).collect();
            let cyclic: Vec<&str> = pending
                .keys()
                .filter(|id| !placed.contains(*id))
                .copied()
                .collect();
            return Err(Error::GraphError(format!(
                "dependency cycle between {}",
                cyclic.join(", ")
            )));
        }

        Ok(order)
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Deployable;

    fn deploy(name: &str, depends_on: &[&str]) -> Deploy {
        let mut d = Deploy::new("b1", name);
        d.deployable = Some(Deployable {
            name: name.into(),
            depends_on: depends_on.iter().map(ToString::to_string).collect(),
            ..Deployable::default()
        });
        d
    }

    #[test]
    fn dependencies_come_first() {
        let graph = DependencyGraph::build(&[
            deploy("web", &["api"]),
            deploy("api", &["db"]),
            deploy("db", &[]),
        ])
        .unwrap();

        assert_eq!(graph.edges.len(), 2);
        assert_eq!(graph.deploy_order().unwrap(), vec!["db-b1", "api-b1", "web-b1"]);
    }

    #[test]
    fn cycles_are_errors() {
        let err = DependencyGraph::build(&[deploy("a", &["b"]), deploy("b", &["a"])]).unwrap_err();
        assert!(matches!(err, Error::GraphError(ref msg) if msg.contains("cycle")));
    }

    #[test]
    fn unknown_targets_are_errors() {
        let err = DependencyGraph::build(&[deploy("a", &["ghost"])]).unwrap_err();
        assert!(matches!(err, Error::GraphError(ref msg) if msg.contains("ghost")));
    }
}
