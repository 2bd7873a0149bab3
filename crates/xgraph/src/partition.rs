//! Partition metadata exchanged with the partitioner.
//!
//! Deciding which nodes form a partition is the partitioner's job; this module only carries the
//! resulting meta-nodes and the [`Partitioner`] seam the build pass calls through.
//! [`TaggedPartitioner`] summarizes partitions from the `subgraph`/`target` tags an upstream
//! partitioning algorithm already wrote onto the nodes.

use std::collections::{BTreeMap, HashSet};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::graph::{Graph, GraphError, Node, Shapes, TensorShape};

pub use crate::passes::layout::Layout;

/// A contiguous single-target region of a graph, as reported by the partitioner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub id: String,
    pub target: String,
    /// External producers feeding the partition.
    pub bottoms: Vec<String>,
    /// External consumers of the partition's outputs.
    pub tops: Vec<String>,
    /// Interior boundary tensors carrying the partition inputs.
    pub input_names: Vec<String>,
    /// Interior nodes whose values leave the partition, in output order.
    pub output_names: Vec<String>,
    /// Serialized snapshot of the interior sub-graph.
    pub subgraph_data: Vec<Node>,
    /// External consumer names of every output.
    pub top_tensors: BTreeMap<String, Vec<String>>,
    /// Declared shape of every output, aligned with `output_names`.
    pub shapes: Vec<TensorShape>,
}

impl Partition {
    /// Rebuilds the interior graph from its snapshot.
    pub fn subgraph(&self) -> Result<Graph, GraphError> {
        Graph::from_nodes(self.id.clone(), self.subgraph_data.clone())
    }
}

/// Reports the partitions of a graph, keyed by partition id.
pub trait Partitioner: Send + Sync {
    fn partitions(&self, graph: &Graph) -> Result<BTreeMap<String, Partition>>;
}

impl<F> Partitioner for F
where
    F: Fn(&Graph) -> Result<BTreeMap<String, Partition>> + Send + Sync,
{
    fn partitions(&self, graph: &Graph) -> Result<BTreeMap<String, Partition>> {
        self(graph)
    }
}

/// Derives partition metadata from the `subgraph` and `target` fields of the nodes.
///
/// Boundary inputs become `Input` nodes of the interior snapshot, named after the external
/// producer they stand for. A member is an output when any consumer lies outside the partition
/// or when it has no consumer at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct TaggedPartitioner;

impl Partitioner for TaggedPartitioner {
    fn partitions(&self, graph: &Graph) -> Result<BTreeMap<String, Partition>> {
        let mut members: BTreeMap<&str, Vec<&Node>> = BTreeMap::new();
        for node in graph.iter() {
            if let Some(id) = node.subgraph.as_deref() {
                members.entry(id).or_default().push(node);
            }
        }

        let mut partitions = BTreeMap::new();
        for (id, nodes) in members {
            partitions.insert(id.to_string(), summarize(graph, id, &nodes)?);
        }
        Ok(partitions)
    }
}

fn push_unique(list: &mut Vec<String>, name: &str) {
    if !list.iter().any(|existing| existing == name) {
        list.push(name.to_string());
    }
}

fn summarize(graph: &Graph, id: &str, nodes: &[&Node]) -> Result<Partition> {
    let inside: HashSet<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
    let target = nodes[0].target.clone();
    if let Some(other) = nodes.iter().find(|n| n.target != target) {
        bail!(
            "partition '{id}' mixes targets '{target}' and '{}' (node '{}')",
            other.target,
            other.name
        );
    }

    let mut bottoms = Vec::new();
    for node in nodes {
        for bottom in &node.bottoms {
            if !inside.contains(bottom.as_str()) {
                push_unique(&mut bottoms, bottom);
            }
        }
    }

    let mut tops = Vec::new();
    let mut output_names = Vec::new();
    let mut top_tensors = BTreeMap::new();
    let mut shapes = Vec::new();
    for node in nodes {
        let external: Vec<String> = node
            .tops
            .iter()
            .filter(|t| !inside.contains(t.as_str()))
            .cloned()
            .collect();
        if external.is_empty() && !node.tops.is_empty() {
            continue;
        }
        let Shapes::Tensor(shape) = &node.shapes else {
            bail!(
                "partition '{id}' output '{}' has multiple outputs itself",
                node.name
            );
        };
        for top in &external {
            push_unique(&mut tops, top);
        }
        output_names.push(node.name.clone());
        top_tensors.insert(node.name.clone(), external);
        shapes.push(shape.clone());
    }

    let mut subgraph_data = Vec::with_capacity(bottoms.len() + nodes.len());
    for bottom in &bottoms {
        let producer = graph.node(bottom)?;
        let consumers: Vec<String> = producer
            .tops
            .iter()
            .filter(|t| inside.contains(t.as_str()))
            .cloned()
            .collect();
        let shape = producer
            .shapes
            .get(0)
            .cloned()
            .unwrap_or_else(|| TensorShape::new(Vec::<i64>::new()));
        let mut input = Node::new(bottom.clone(), "Input", shape).with_tops(consumers);
        input.layer = producer.layer.clone();
        input.target = target.clone();
        input.subgraph = Some(id.to_string());
        subgraph_data.push(input);
    }
    for node in nodes {
        let mut interior = (*node).clone();
        interior.tops.retain(|t| inside.contains(t.as_str()));
        subgraph_data.push(interior);
    }

    Ok(Partition {
        id: id.to_string(),
        target,
        input_names: bottoms.clone(),
        bottoms,
        tops,
        output_names,
        subgraph_data,
        top_tensors,
        shapes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;

    fn two_op_partition() -> Graph {
        GraphBuilder::new("g")
            .node(Node::new("a", "Input", Shapes::tensor([1, 3, 4, 4])))
            .node(
                Node::new("conv", "Convolution", Shapes::tensor([1, 8, 4, 4]))
                    .with_bottoms(["a"])
                    .in_partition("xp0", "dpu"),
            )
            .node(
                Node::new("relu", "ReLU", Shapes::tensor([1, 8, 4, 4]))
                    .with_bottoms(["conv"])
                    .in_partition("xp0", "dpu"),
            )
            .node(
                Node::new("out", "Identity", Shapes::tensor([1, 8, 4, 4]))
                    .with_bottoms(["relu"])
                    .as_output(),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn summarizes_boundary_of_tagged_nodes() {
        let graph = two_op_partition();
        let partitions = TaggedPartitioner.partitions(&graph).unwrap();
        let xp = &partitions["xp0"];
        assert_eq!(xp.target, "dpu");
        assert_eq!(xp.bottoms, vec!["a"]);
        assert_eq!(xp.input_names, vec!["a"]);
        assert_eq!(xp.output_names, vec!["relu"]);
        assert_eq!(xp.tops, vec!["out"]);
        assert_eq!(xp.top_tensors["relu"], vec!["out"]);
        assert_eq!(xp.shapes, vec![TensorShape::new([1, 8, 4, 4])]);
    }

    #[test]
    fn snapshot_round_trips_through_graph_construction() {
        let graph = two_op_partition();
        let xp = TaggedPartitioner.partitions(&graph).unwrap().remove("xp0").unwrap();
        let interior = xp.subgraph().unwrap();
        assert_eq!(interior.names(), ["a", "conv", "relu"]);
        assert_eq!(interior.node("a").unwrap().op_type(), "Input");
        assert!(interior.node("relu").unwrap().tops.is_empty());
        interior.validate().unwrap();
        assert_eq!(interior.into_nodes(), xp.subgraph_data);
    }

    #[test]
    fn mixed_targets_are_rejected() {
        let graph = GraphBuilder::new("g")
            .node(Node::new("a", "Input", Shapes::tensor([1])).in_partition("xp0", "dpu"))
            .node(
                Node::new("b", "ReLU", Shapes::tensor([1]))
                    .with_bottoms(["a"])
                    .in_partition("xp0", "npu"),
            )
            .build()
            .unwrap();
        let err = TaggedPartitioner.partitions(&graph).unwrap_err();
        assert!(err.to_string().contains("mixes targets"));
    }
}
