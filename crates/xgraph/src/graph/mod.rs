//! Target-annotated IR graph.
//!
//! A [`Graph`] is an ordered, name-unique arena of [`Node`]s. Edges are recorded by name in both
//! directions, which keeps nodes addressable across rewrites that remove and synthesize nodes.
//! A well-formed graph has no dangling `bottoms`, mirrors every edge (`b` in `a.bottoms` exactly
//! when `a` in `b.tops`) and is acyclic.
//!
//! [`Graph::from_nodes`] enforces name uniqueness and resolvable bottoms; [`Graph::validate`]
//! checks well-formedness in full.

mod attrs;
mod io;
mod node;
pub mod topology;

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use attrs::{AttrValue, Attrs};
pub use io::{GraphSerdeError, GRAPH_FORMAT_VERSION};
pub use node::{
    Node, Shapes, TensorShape, DEFAULT_TARGET, INPUT_TYPES, OUTPUT_TAG, TUPLE_GET_ITEM,
};
pub use topology::{sort_topologically, topological_order};

/// Graph-integrity failures and name lookup misses.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("duplicate node name '{name}': node names must be unique")]
    DuplicateNode { name: String },
    #[error("node '{node}' lists bottom '{bottom}' which is not part of the graph")]
    DanglingBottom { node: String, bottom: String },
    #[error("edge {producer} -> {consumer} is not mirrored: {reason}")]
    InconsistentEdge {
        producer: String,
        consumer: String,
        reason: &'static str,
    },
    #[error("graph contains a cycle through node '{node}'")]
    Cycle { node: String },
    #[error("node '{name}' not found")]
    NotFound { name: String },
    #[error("node '{node}' belongs to partition '{partition}' which the partitioner did not report")]
    UnknownPartition { node: String, partition: String },
    #[error("partition '{partition}' is malformed: {reason}")]
    InvalidPartition { partition: String, reason: String },
}

/// Runtime tensor name maps recorded for one compiled partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeArtifact {
    pub in_map: BTreeMap<String, String>,
    pub out_map: BTreeMap<String, String>,
}

/// Deployment artifacts produced by a prior compilation, keyed by partition id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerOutput {
    artifacts: BTreeMap<String, RuntimeArtifact>,
}

impl CompilerOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, partition: impl Into<String>, artifact: RuntimeArtifact) {
        self.artifacts.insert(partition.into(), artifact);
    }

    pub fn get(&self, partition: &str) -> Option<&RuntimeArtifact> {
        self.artifacts.get(partition)
    }

    pub fn in_map(&self, partition: &str) -> Option<&BTreeMap<String, String>> {
        self.get(partition).map(|artifact| &artifact.in_map)
    }

    pub fn out_map(&self, partition: &str) -> Option<&BTreeMap<String, String>> {
        self.get(partition).map(|artifact| &artifact.out_map)
    }
}

/// Ordered, name-unique collection of nodes.
#[derive(Debug, Clone)]
pub struct Graph {
    name: String,
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    compiler_output: Option<CompilerOutput>,
}

impl Graph {
    /// Builds a graph from nodes in the given order, checking name uniqueness and that every bottom resolves.
    pub fn from_nodes(name: impl Into<String>, nodes: Vec<Node>) -> Result<Self, GraphError> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (idx, node) in nodes.iter().enumerate() {
            if index.insert(node.name.clone(), idx).is_some() {
                return Err(GraphError::DuplicateNode {
                    name: node.name.clone(),
                });
            }
        }
        for node in &nodes {
            if let Some(bottom) = node.bottoms.iter().find(|b| !index.contains_key(*b)) {
                return Err(GraphError::DanglingBottom {
                    node: node.name.clone(),
                    bottom: bottom.clone(),
                });
            }
        }
        Ok(Graph {
            name: name.into(),
            nodes,
            index,
            compiler_output: None,
        })
    }

    pub fn with_compiler_output(mut self, output: Option<CompilerOutput>) -> Self {
        self.compiler_output = output;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Node> {
        self.nodes.iter()
    }

    pub fn into_nodes(self) -> Vec<Node> {
        self.nodes
    }

    pub fn names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.index.get(name).map(|&idx| &self.nodes[idx])
    }

    /// Looks up a node, failing with [`GraphError::NotFound`].
    pub fn node(&self, name: &str) -> Result<&Node, GraphError> {
        self.get(name).ok_or_else(|| GraphError::NotFound {
            name: name.to_string(),
        })
    }

    pub fn compiler_output(&self) -> Option<&CompilerOutput> {
        self.compiler_output.as_ref()
    }

    /// Whether a prior compilation recorded deployment artifacts on this graph.
    pub fn is_compiled(&self) -> bool {
        self.compiler_output.is_some()
    }

    pub fn input_names(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.is_input())
            .map(|n| n.name.as_str())
            .collect()
    }

    pub fn output_names(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.is_output())
            .map(|n| n.name.as_str())
            .collect()
    }

    /// Checks that bottoms resolve, edges are mirrored and the graph is acyclic.
    pub fn validate(&self) -> Result<(), GraphError> {
        for node in &self.nodes {
            for bottom in &node.bottoms {
                let producer = self.get(bottom).ok_or_else(|| GraphError::DanglingBottom {
                    node: node.name.clone(),
                    bottom: bottom.clone(),
                })?;
                if !producer.tops.contains(&node.name) {
                    return Err(GraphError::InconsistentEdge {
                        producer: bottom.clone(),
                        consumer: node.name.clone(),
                        reason: "consumer missing from producer tops",
                    });
                }
            }
            for top in &node.tops {
                let consumer = self.get(top).ok_or_else(|| GraphError::NotFound {
                    name: top.clone(),
                })?;
                if !consumer.bottoms.contains(&node.name) {
                    return Err(GraphError::InconsistentEdge {
                        producer: node.name.clone(),
                        consumer: top.clone(),
                        reason: "producer missing from consumer bottoms",
                    });
                }
            }
        }
        topological_order(&self.nodes).map(|_| ())
    }

    /// Whether the stored order is already a valid topological order.
    pub fn is_topologically_ordered(&self) -> bool {
        let mut seen = HashSet::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if !node.bottoms.iter().all(|b| seen.contains(b.as_str())) {
                return false;
            }
            seen.insert(node.name.as_str());
        }
        true
    }
}

impl PartialEq for Graph {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.nodes == other.nodes
            && self.compiler_output == other.compiler_output
    }
}

/// Incremental graph construction for frontends and tests.
///
/// Nodes declare only their `bottoms`; [`GraphBuilder::build`] derives every `tops` list from
/// them, then sorts the nodes topologically and validates the result.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    name: String,
    nodes: Vec<Node>,
    compiler_output: Option<CompilerOutput>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        GraphBuilder {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn push(&mut self, node: Node) -> &mut Self {
        self.nodes.push(node);
        self
    }

    pub fn compiler_output(mut self, output: CompilerOutput) -> Self {
        self.compiler_output = Some(output);
        self
    }

    pub fn build(self) -> Result<Graph, GraphError> {
        let mut nodes = self.nodes;
        let mut position = HashMap::with_capacity(nodes.len());
        for (idx, node) in nodes.iter_mut().enumerate() {
            node.tops.clear();
            if position.insert(node.name.clone(), idx).is_some() {
                return Err(GraphError::DuplicateNode {
                    name: node.name.clone(),
                });
            }
        }
        let mut edges = Vec::new();
        for node in &nodes {
            for bottom in &node.bottoms {
                let producer =
                    *position
                        .get(bottom)
                        .ok_or_else(|| GraphError::DanglingBottom {
                            node: node.name.clone(),
                            bottom: bottom.clone(),
                        })?;
                edges.push((producer, node.name.clone()));
            }
        }
        for (producer, consumer) in edges {
            let tops = &mut nodes[producer].tops;
            if !tops.contains(&consumer) {
                tops.push(consumer);
            }
        }
        let graph = Graph::from_nodes(self.name, sort_topologically(nodes)?)?
            .with_compiler_output(self.compiler_output);
        graph.validate()?;
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> Graph {
        GraphBuilder::new("chain")
            .node(Node::new("x", "Input", Shapes::tensor([1, 4])))
            .node(Node::new("relu", "ReLU", Shapes::tensor([1, 4])).with_bottoms(["x"]))
            .node(
                Node::new("y", "Add", Shapes::tensor([1, 4]))
                    .with_bottoms(["relu", "x"])
                    .as_output(),
            )
            .build()
            .expect("chain graph is valid")
    }

    #[test]
    fn builder_links_tops_from_bottoms() {
        let graph = chain();
        assert_eq!(graph.node("x").unwrap().tops, vec!["relu", "y"]);
        assert_eq!(graph.node("relu").unwrap().tops, vec!["y"]);
        assert!(graph.node("y").unwrap().tops.is_empty());
        assert_eq!(graph.input_names(), ["x"]);
        assert_eq!(graph.output_names(), ["y"]);
    }

    #[test]
    fn from_nodes_rejects_duplicates_and_dangling_bottoms() {
        let dup = Graph::from_nodes(
            "dup",
            vec![
                Node::new("a", "Input", Shapes::tensor([1])),
                Node::new("a", "Input", Shapes::tensor([1])),
            ],
        );
        assert_eq!(
            dup.unwrap_err(),
            GraphError::DuplicateNode { name: "a".into() }
        );

        let dangling = Graph::from_nodes(
            "dangling",
            vec![Node::new("b", "ReLU", Shapes::tensor([1])).with_bottoms(["a"])],
        );
        assert!(matches!(
            dangling.unwrap_err(),
            GraphError::DanglingBottom { .. }
        ));
    }

    #[test]
    fn validate_detects_unmirrored_edges() {
        let mut nodes = chain().into_nodes();
        nodes[0].tops.retain(|t| t != "y");
        let graph = Graph::from_nodes("broken", nodes).unwrap();
        let err = graph.validate().unwrap_err();
        assert_eq!(
            err,
            GraphError::InconsistentEdge {
                producer: "x".into(),
                consumer: "y".into(),
                reason: "consumer missing from producer tops",
            }
        );
        assert!(err.to_string().contains("x -> y"));
    }

    #[test]
    fn node_lookup_reports_missing_name() {
        let graph = chain();
        assert_eq!(
            graph.node("nope").unwrap_err(),
            GraphError::NotFound {
                name: "nope".into()
            }
        );
    }

    #[test]
    fn builder_orders_nodes_topologically() {
        let graph = GraphBuilder::new("reversed")
            .node(Node::new("b", "ReLU", Shapes::tensor([1])).with_bottoms(["a"]))
            .node(Node::new("a", "Input", Shapes::tensor([1])))
            .build()
            .unwrap();
        assert_eq!(graph.names(), ["a", "b"]);
        assert!(graph.is_topologically_ordered());
    }
}
