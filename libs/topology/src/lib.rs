//! Deployment topology model.
//!
//! A deployed system is described as a tree of typed nodes. Each node carries
//! a `specific` map of provider-side attributes, and attributes are inherited
//! downward: a node that does not define an attribute resolves it by walking
//! its ancestor chain. Key concepts:
//!
//! - **Node**: one deployment unit (load balancer, scaling group, instance).
//! - **Containment**: `contained_by` points at the parent; the root points at
//!   itself and terminates every upward walk.
//! - **Resolution**: the nearest ancestor that defines an attribute wins.
//!
//! # Invariants
//!
//! - Exactly one root per topology (`contained_by == id`).
//! - Upward traversal is iterative and bounded by the node count, so a
//!   malformed topology containing a non-root cycle is a detected error
//!   rather than a hang.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Topology errors.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// No node satisfies the root sentinel (`contained_by == id`).
    #[error("topology has no root node")]
    NoRoot,

    /// More than one node satisfies the root sentinel.
    #[error("topology has multiple root nodes: {0} and {1}")]
    MultipleRoots(String, String),

    /// A node references a parent that does not exist.
    #[error("node {node} is contained by unknown node {parent}")]
    UnknownParent { node: String, parent: String },

    /// The requested node does not exist.
    #[error("unknown node: {0}")]
    UnknownNode(String),

    /// The serialized topology could not be parsed.
    #[error("invalid topology: {0}")]
    Invalid(String),

    /// The attribute was not found on any strict ancestor.
    #[error("cannot find param {0} in ancestor nodes")]
    ParamNotFound(String),

    /// Upward traversal revisited a node before reaching the root.
    #[error("containment cycle detected at node {0}")]
    CycleDetected(String),
}

/// One deployment unit in the topology tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyNode {
    /// Unique node identifier.
    pub id: String,

    /// Parent node id. Equal to `id` only at the root.
    pub contained_by: String,

    /// Node kind tag, e.g. "load-balancer", "scaling-group",
    /// "compute-instance".
    #[serde(rename = "type")]
    pub kind: String,

    /// Provider-specific attributes. Mutable; the provisioning flow writes
    /// discovered instance attributes into the relevant child node here.
    #[serde(default)]
    pub specific: serde_json::Map<String, Value>,

    /// Ordered child node ids.
    #[serde(default)]
    pub contains: Vec<String>,
}

impl TopologyNode {
    /// True if this node is the topology root.
    pub fn is_root(&self) -> bool {
        self.contained_by == self.id
    }

    /// Look up an attribute on this node.
    pub fn attr(&self, name: &str) -> Option<&Value> {
        self.specific.get(name)
    }

    /// Look up a string attribute on this node.
    pub fn attr_str(&self, name: &str) -> Option<&str> {
        self.specific.get(name).and_then(Value::as_str)
    }
}

/// An index-addressed table of topology nodes.
///
/// Nodes are stored in an arena and addressed by id through a side index, so
/// traversal never chases owned references and every walk can be bounded by
/// the arena size.
#[derive(Debug, Clone)]
pub struct Topology {
    nodes: Vec<TopologyNode>,
    index: HashMap<String, usize>,
    root: usize,
}

impl Topology {
    /// Build a topology from a flat node list.
    ///
    /// Validates that every parent reference resolves and that exactly one
    /// node is the root. Containment cycles below the root are not rejected
    /// here; traversal detects them.
    pub fn from_nodes(nodes: Vec<TopologyNode>) -> Result<Self, TopologyError> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            index.insert(node.id.clone(), i);
        }

        let mut root = None;
        for node in &nodes {
            if !index.contains_key(&node.contained_by) {
                return Err(TopologyError::UnknownParent {
                    node: node.id.clone(),
                    parent: node.contained_by.clone(),
                });
            }
            if node.is_root() {
                match root {
                    None => root = Some(node.id.clone()),
                    Some(first) => {
                        return Err(TopologyError::MultipleRoots(first, node.id.clone()))
                    }
                }
            }
        }

        let root = root.ok_or(TopologyError::NoRoot)?;
        let root = index[&root];
        Ok(Self { nodes, index, root })
    }

    /// Parse a topology from its serialized node list.
    pub fn from_json(json: &str) -> Result<Self, TopologyError> {
        let nodes: Vec<TopologyNode> =
            serde_json::from_str(json).map_err(|e| TopologyError::Invalid(e.to_string()))?;
        Self::from_nodes(nodes)
    }

    /// The root node.
    pub fn root(&self) -> &TopologyNode {
        &self.nodes[self.root]
    }

    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&TopologyNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// The first declared child of a node, if any.
    pub fn first_child(&self, id: &str) -> Option<&TopologyNode> {
        let node = self.node(id)?;
        node.contains.first().and_then(|child| self.node(child))
    }

    /// Replace the `specific` attribute map of a node.
    pub fn set_specific(
        &mut self,
        id: &str,
        specific: serde_json::Map<String, Value>,
    ) -> Result<(), TopologyError> {
        let &i = self
            .index
            .get(id)
            .ok_or_else(|| TopologyError::UnknownNode(id.to_string()))?;
        self.nodes[i].specific = specific;
        Ok(())
    }

    /// Resolve an attribute by walking the strict ancestors of `id`.
    ///
    /// The node's own `specific` map is not consulted; the walk starts at
    /// the parent and stops at the root. The nearest ancestor that defines
    /// `param` wins. Fails with [`TopologyError::ParamNotFound`] when the
    /// root is reached without a hit.
    pub fn resolve_ancestor_param(&self, id: &str, param: &str) -> Result<&Value, TopologyError> {
        let mut current = self
            .node(id)
            .ok_or_else(|| TopologyError::UnknownNode(id.to_string()))?;

        // The walk visits at most every node once; one more step means a
        // cycle that does not pass through the root sentinel.
        for _ in 0..self.nodes.len() {
            if current.is_root() {
                return Err(TopologyError::ParamNotFound(param.to_string()));
            }
            let parent = self
                .node(&current.contained_by)
                .ok_or_else(|| TopologyError::UnknownNode(current.contained_by.clone()))?;
            if let Some(value) = parent.attr(param) {
                return Ok(value);
            }
            current = parent;
        }

        Err(TopologyError::CycleDetected(current.id.clone()))
    }

    /// Find the nearest node of `kind` on the containment chain of `id`,
    /// starting at the node itself.
    ///
    /// Returns `None` when the root is reached without a match, or when the
    /// chain does not terminate (malformed cycle).
    pub fn ancestor_of_kind(&self, id: &str, kind: &str) -> Option<&TopologyNode> {
        let mut current = self.node(id)?;

        for _ in 0..=self.nodes.len() {
            if current.kind == kind {
                return Some(current);
            }
            if current.is_root() {
                return None;
            }
            current = self.node(&current.contained_by)?;
        }

        None
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if the topology holds no nodes. Unreachable after construction
    /// (a valid topology always has a root), kept for completeness.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterate over all nodes.
    pub fn iter(&self) -> impl Iterator<Item = &TopologyNode> {
        self.nodes.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: &str, parent: &str, kind: &str, specific: serde_json::Value) -> TopologyNode {
        let specific = match specific {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        TopologyNode {
            id: id.to_string(),
            contained_by: parent.to_string(),
            kind: kind.to_string(),
            specific,
            contains: Vec::new(),
        }
    }

    fn sample() -> Topology {
        let mut root = node("root", "root", "system", json!({}));
        root.contains = vec!["vpc".to_string()];
        let vpc = node("vpc", "root", "network", json!({"GroupId": "sg-123"}));
        let elb = node("elb-a", "vpc", "load-balancer", json!({}));
        let mut web = node("web", "elb-a", "scaling-group", json!({}));
        web.contains = vec!["web-instance".to_string()];
        let inst = node("web-instance", "web", "compute-instance", json!({}));
        Topology::from_nodes(vec![root, vpc, elb, web, inst]).unwrap()
    }

    #[test]
    fn test_resolves_param_from_nearest_ancestor() {
        let topo = sample();
        let value = topo.resolve_ancestor_param("web", "GroupId").unwrap();
        assert_eq!(value, "sg-123");
    }

    #[test]
    fn test_own_attributes_are_not_consulted() {
        let mut nodes = vec![
            node("root", "root", "system", json!({})),
            node("leaf", "root", "scaling-group", json!({"GroupId": "sg-own"})),
        ];
        nodes[0].contains = vec!["leaf".to_string()];
        let topo = Topology::from_nodes(nodes).unwrap();

        let err = topo.resolve_ancestor_param("leaf", "GroupId").unwrap_err();
        assert!(matches!(err, TopologyError::ParamNotFound(p) if p == "GroupId"));
    }

    #[test]
    fn test_missing_param_fails_not_found() {
        let topo = sample();
        let err = topo.resolve_ancestor_param("web", "KeyName").unwrap_err();
        assert!(matches!(err, TopologyError::ParamNotFound(_)));
        assert_eq!(
            err.to_string(),
            "cannot find param KeyName in ancestor nodes"
        );
    }

    #[test]
    fn test_cycle_is_detected_not_hung() {
        // a <-> b cycle below a disconnected root
        let topo = Topology::from_nodes(vec![
            node("root", "root", "system", json!({})),
            node("a", "b", "scaling-group", json!({})),
            node("b", "a", "network", json!({})),
        ])
        .unwrap();

        let err = topo.resolve_ancestor_param("a", "GroupId").unwrap_err();
        assert!(matches!(err, TopologyError::CycleDetected(_)));
    }

    #[test]
    fn test_single_root_enforced() {
        let err = Topology::from_nodes(vec![
            node("r1", "r1", "system", json!({})),
            node("r2", "r2", "system", json!({})),
        ])
        .unwrap_err();
        assert!(matches!(err, TopologyError::MultipleRoots(_, _)));

        let err = Topology::from_nodes(vec![node("a", "b", "x", json!({}))]).unwrap_err();
        assert!(matches!(err, TopologyError::UnknownParent { .. }));
    }

    #[test]
    fn test_ancestor_of_kind() {
        let topo = sample();

        let elb = topo.ancestor_of_kind("web", "load-balancer").unwrap();
        assert_eq!(elb.id, "elb-a");

        // Starts at the node itself
        let own = topo.ancestor_of_kind("elb-a", "load-balancer").unwrap();
        assert_eq!(own.id, "elb-a");

        assert!(topo.ancestor_of_kind("vpc", "load-balancer").is_none());
    }

    #[test]
    fn test_first_child_and_set_specific() {
        let mut topo = sample();
        assert_eq!(topo.first_child("web").unwrap().id, "web-instance");
        assert!(topo.first_child("web-instance").is_none());

        let mut attrs = serde_json::Map::new();
        attrs.insert("instanceId".to_string(), json!("i-0abc"));
        topo.set_specific("web-instance", attrs).unwrap();
        assert_eq!(
            topo.node("web-instance").unwrap().attr_str("instanceId"),
            Some("i-0abc")
        );
    }

    #[test]
    fn test_deserializes_camel_case_nodes() {
        let json = r#"[
            {"id": "root", "containedBy": "root", "type": "system",
             "specific": {}, "contains": ["sg"]},
            {"id": "sg", "containedBy": "root", "type": "scaling-group"}
        ]"#;
        let topo = Topology::from_json(json).unwrap();
        assert_eq!(topo.len(), 2);
        assert_eq!(topo.root().id, "root");
        assert_eq!(topo.node("sg").unwrap().kind, "scaling-group");
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        // Build a chain root <- n1 <- n2 <- ... <- n_depth with the param
        // stored at one ancestor level.
        fn chain(depth: usize, param_at: Option<usize>) -> Topology {
            let mut nodes = vec![node("n0", "n0", "system", json!({}))];
            if param_at == Some(0) {
                nodes[0]
                    .specific
                    .insert("GroupId".to_string(), json!("sg-0"));
            }
            for i in 1..=depth {
                let mut n = node(
                    &format!("n{i}"),
                    &format!("n{}", i - 1),
                    "scaling-group",
                    json!({}),
                );
                if param_at == Some(i) {
                    n.specific
                        .insert("GroupId".to_string(), json!(format!("sg-{i}")));
                }
                nodes.push(n);
            }
            Topology::from_nodes(nodes).unwrap()
        }

        proptest! {
            #[test]
            fn resolves_iff_param_on_strict_ancestor(
                depth in 1usize..20,
                at in proptest::option::of(0usize..20),
            ) {
                let at = at.filter(|&a| a <= depth);
                let topo = chain(depth, at);
                let leaf = format!("n{depth}");
                let result = topo.resolve_ancestor_param(&leaf, "GroupId");

                match at {
                    // Strict ancestor: a hit on the leaf itself must not count.
                    Some(a) if a < depth => {
                        prop_assert_eq!(result.unwrap(), &json!(format!("sg-{}", a)));
                    }
                    _ => prop_assert!(matches!(
                        result.unwrap_err(),
                        TopologyError::ParamNotFound(_)
                    )),
                }
            }
        }
    }
}
