//! IR graph vertices and their declared output shapes.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::attrs::{AttrValue, Attrs};
use crate::tensor::Tensor;

/// Primary type of graph input nodes.
pub const INPUT_TYPES: &[&str] = &["Input", "StrInput"];
/// Marker tag carried by nodes whose value is a graph output.
pub const OUTPUT_TAG: &str = "Output";
/// Primary type of the accessor nodes that read one element of a multi-output node.
pub const TUPLE_GET_ITEM: &str = "TupleGetItem";
/// Target label assigned to nodes that no partitioner claimed.
pub const DEFAULT_TARGET: &str = "cpu";

fn default_target() -> String {
    DEFAULT_TARGET.to_string()
}

/// Declared shape of one node output. `-1` marks a dynamic dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorShape(pub Vec<i64>);

impl TensorShape {
    pub fn new<D: Into<Vec<i64>>>(dims: D) -> Self {
        TensorShape(dims.into())
    }

    pub fn dims(&self) -> &[i64] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Replaces a dynamic leading dimension with `batch_size` when the latter is known.
    pub fn with_batch(&self, batch_size: i64) -> TensorShape {
        let mut dims = self.0.clone();
        if batch_size > 0 {
            if let Some(first) = dims.first_mut() {
                if *first < 0 {
                    *first = batch_size;
                }
            }
        }
        TensorShape(dims)
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Output shapes of a node: a single tensor, or one shape per output of a multi-output node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Shapes {
    Tensor(TensorShape),
    Tuple(Vec<TensorShape>),
}

impl Shapes {
    pub fn tensor<D: Into<Vec<i64>>>(dims: D) -> Self {
        Shapes::Tensor(TensorShape::new(dims))
    }

    /// Number of outputs described.
    pub fn len(&self) -> usize {
        match self {
            Shapes::Tensor(_) => 1,
            Shapes::Tuple(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self, Shapes::Tuple(_))
    }

    /// Shape of output `index`; a single tensor answers only index 0.
    pub fn get(&self, index: usize) -> Option<&TensorShape> {
        match self {
            Shapes::Tensor(shape) if index == 0 => Some(shape),
            Shapes::Tensor(_) => None,
            Shapes::Tuple(items) => items.get(index),
        }
    }

    pub fn as_tensor(&self) -> Option<&TensorShape> {
        match self {
            Shapes::Tensor(shape) => Some(shape),
            Shapes::Tuple(_) => None,
        }
    }
}

impl From<TensorShape> for Shapes {
    fn from(shape: TensorShape) -> Self {
        Shapes::Tensor(shape)
    }
}

/// Vertex of the IR graph.
///
/// Edges are stored by name in both directions: `bottoms` lists producers in input order and
/// `tops` lists consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    /// Operator kind first, then marker tags such as [`OUTPUT_TAG`].
    #[serde(rename = "type")]
    pub types: Vec<String>,
    pub shapes: Shapes,
    #[serde(default)]
    pub bottoms: Vec<String>,
    #[serde(default)]
    pub tops: Vec<String>,
    /// Frontend operations this node was derived from.
    #[serde(default)]
    pub layer: Vec<String>,
    #[serde(default)]
    pub attrs: Attrs,
    /// Precomputed constant tensors such as weights.
    #[serde(default)]
    pub data: Vec<Tensor>,
    /// Partition this node was assigned to, if any.
    #[serde(default)]
    pub subgraph: Option<String>,
    #[serde(default = "default_target")]
    pub target: String,
    #[serde(default)]
    pub internal: bool,
}

impl Node {
    pub fn new(
        name: impl Into<String>,
        op_type: impl Into<String>,
        shapes: impl Into<Shapes>,
    ) -> Self {
        let name = name.into();
        Node {
            layer: vec![name.clone()],
            name,
            types: vec![op_type.into()],
            shapes: shapes.into(),
            bottoms: Vec::new(),
            tops: Vec::new(),
            attrs: Attrs::new(),
            data: Vec::new(),
            subgraph: None,
            target: default_target(),
            internal: false,
        }
    }

    pub fn with_bottoms<I, S>(mut self, bottoms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bottoms = bottoms.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tops<I, S>(mut self, tops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tops = tops.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn with_data(mut self, data: Vec<Tensor>) -> Self {
        self.data = data;
        self
    }

    /// Assigns the node to `partition`, executed on `target`.
    pub fn in_partition(mut self, partition: impl Into<String>, target: impl Into<String>) -> Self {
        self.subgraph = Some(partition.into());
        self.target = target.into();
        self
    }

    /// Adds the graph-output marker tag.
    pub fn as_output(mut self) -> Self {
        if !self.is_output() {
            self.types.push(OUTPUT_TAG.to_string());
        }
        self
    }

    pub fn op_type(&self) -> &str {
        self.types.first().map(String::as_str).unwrap_or("")
    }

    pub fn has_type(&self, tag: &str) -> bool {
        self.types.iter().any(|t| t == tag)
    }

    pub fn is_input(&self) -> bool {
        INPUT_TYPES.contains(&self.op_type())
    }

    pub fn is_output(&self) -> bool {
        self.has_type(OUTPUT_TAG)
    }

    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attrs.get(key)
    }
}
