//! Partition substitution.
//!
//! Collapses every partition assigned to the build target into one opaque node whose outputs are
//! exposed through `TupleGetItem` accessor nodes named after the original boundary outputs, so
//! downstream references keep resolving. The rewrite runs as a single forward pass over the
//! normalized graph followed by re-linking of the boundary edges and a full topological re-sort.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument};

use super::layout::{IdentityLayoutPass, Layout, LayoutPass};
use crate::graph::{
    sort_topologically, AttrValue, Attrs, CompilerOutput, Graph, GraphError, Node, Shapes,
    OUTPUT_TAG, TUPLE_GET_ITEM,
};
use crate::partition::{Partition, Partitioner, TaggedPartitioner};

/// Attribute keys the pass writes onto collapsed nodes; callers may not supply them.
pub const RESERVED_ATTRS: &[&str] = &[
    "input_names",
    "output_names",
    "input_layers",
    "output_layers",
    "rt_in_map",
    "rt_out_map",
];

/// Caller errors, reported before the graph is touched.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unsupported layout '{layout}': expected one of NCHW, NHWC")]
    UnsupportedLayout { layout: String },
    #[error("extra attribute '{key}' collides with an attribute reserved for collapsed nodes")]
    ReservedAttribute { key: String },
    #[error("build target must not be empty")]
    EmptyTarget,
    #[error("collapsed type tag must not be empty")]
    EmptyCollapsedType,
    #[error("malformed build options: {message}")]
    Malformed { message: String },
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid build configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("graph integrity violated: {0}")]
    Graph(#[from] GraphError),
    #[error("{stage} failed: {message}")]
    Collaborator { stage: &'static str, message: String },
}

impl BuildError {
    fn collaborator(stage: &'static str, err: anyhow::Error) -> Self {
        BuildError::Collaborator {
            stage,
            message: format!("{err:#}"),
        }
    }
}

/// Parameters of one build invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildOptions {
    /// Partitions assigned to this target are collapsed.
    pub target: String,
    /// Primary type given to collapsed nodes.
    pub collapsed_type: String,
    #[serde(default)]
    pub layout: Layout,
    /// Extra attributes copied onto every collapsed node.
    #[serde(default)]
    pub extra_attrs: Attrs,
}

impl BuildOptions {
    pub fn new(target: impl Into<String>, collapsed_type: impl Into<String>) -> Self {
        BuildOptions {
            target: target.into(),
            collapsed_type: collapsed_type.into(),
            layout: Layout::default(),
            extra_attrs: Attrs::new(),
        }
    }

    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_extra_attr(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.extra_attrs.insert(key.into(), value.into());
        self
    }

    pub fn from_json_str(src: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(src).map_err(|err| ConfigError::Malformed {
            message: err.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target.is_empty() {
            return Err(ConfigError::EmptyTarget);
        }
        if self.collapsed_type.is_empty() {
            return Err(ConfigError::EmptyCollapsedType);
        }
        if let Some(key) = self
            .extra_attrs
            .keys()
            .find(|key| RESERVED_ATTRS.contains(&key.as_str()))
        {
            return Err(ConfigError::ReservedAttribute { key: key.clone() });
        }
        Ok(())
    }
}

/// What a build changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildReport {
    /// Ids of the collapsed partitions, in emission order.
    pub collapsed: Vec<String>,
    /// Interior nodes removed per collapsed partition.
    pub consumed: BTreeMap<String, usize>,
    /// Names of the synthesized accessor nodes.
    pub accessors: Vec<String>,
}

/// Rewrites graphs by substituting partitions with opaque nodes.
pub struct SubgraphBuildPass {
    layout_pass: Arc<dyn LayoutPass>,
    partitioner: Arc<dyn Partitioner>,
}

impl Default for SubgraphBuildPass {
    fn default() -> Self {
        Self::new(Arc::new(IdentityLayoutPass), Arc::new(TaggedPartitioner))
    }
}

impl SubgraphBuildPass {
    pub fn new(layout_pass: Arc<dyn LayoutPass>, partitioner: Arc<dyn Partitioner>) -> Self {
        Self {
            layout_pass,
            partitioner,
        }
    }

    pub fn build(&self, graph: Graph, options: &BuildOptions) -> Result<Graph, BuildError> {
        self.build_with_report(graph, options)
            .map(|(graph, _)| graph)
    }

    #[instrument(skip_all, fields(build_target = %options.target, layout = %options.layout))]
    pub fn build_with_report(
        &self,
        graph: Graph,
        options: &BuildOptions,
    ) -> Result<(Graph, BuildReport), BuildError> {
        options.validate()?;
        let verify = crate::env::verify_graphs_enabled();
        if verify {
            graph.validate()?;
        }
        info!(
            graph = graph.name(),
            nodes = graph.len(),
            "subgraph build, target: {}, layout: {}",
            options.target,
            options.layout
        );

        let compiler_output = graph.compiler_output().cloned();
        let graph_name = graph.name().to_string();
        let graph = self
            .layout_pass
            .transform(graph, &options.target, options.layout)
            .map_err(|err| BuildError::collaborator("layout pass", err))?;
        let partitions = self
            .partitioner
            .partitions(&graph)
            .map_err(|err| BuildError::collaborator("partitioner", err))?;
        let output_marked: HashSet<String> = graph
            .iter()
            .filter(|node| node.is_output())
            .map(|node| node.name.clone())
            .collect();
        let node_names: HashSet<String> = graph.iter().map(|node| node.name.clone()).collect();

        // partition id -> interior nodes dropped so far
        let mut consumed: BTreeMap<String, HashSet<String>> = BTreeMap::new();
        // partition output name -> accessor node name
        let mut accessor_of: HashMap<String, String> = HashMap::new();
        let mut report = BuildReport::default();
        let mut net: Vec<Node> = Vec::with_capacity(graph.len());

        for node in graph.into_nodes() {
            let Some(id) = node.subgraph.clone() else {
                net.push(node);
                continue;
            };
            if let Some(members) = consumed.get_mut(&id) {
                debug!(node = %node.name, partition = %id, "dropping interior node");
                members.insert(node.name);
                continue;
            }
            let partition = partitions
                .get(&id)
                .ok_or_else(|| GraphError::UnknownPartition {
                    node: node.name.clone(),
                    partition: id.clone(),
                })?;
            if partition.target != options.target {
                net.push(node);
                continue;
            }

            debug!(
                partition = %id,
                inputs = ?partition.input_names,
                outputs = ?partition.output_names,
                "collapsing partition"
            );
            consumed.insert(id.clone(), HashSet::from([node.name]));
            let mut collapsed =
                collapse(partition, options, compiler_output.as_ref(), &node_names)?;
            let accessors = accessors(partition, &collapsed.name, &output_marked);
            for (output, accessor) in partition.output_names.iter().zip(&accessors) {
                collapsed.tops.push(accessor.name.clone());
                accessor_of.insert(output.clone(), accessor.name.clone());
                report.accessors.push(accessor.name.clone());
            }
            report.collapsed.push(id);
            net.push(collapsed);
            net.extend(accessors);
        }

        relink(&mut net, &partitions, &consumed, &accessor_of)?;

        let sorted = sort_topologically(net)?;
        let rewritten =
            Graph::from_nodes(graph_name, sorted)?.with_compiler_output(compiler_output);
        if verify {
            rewritten.validate()?;
        }

        report.consumed = consumed
            .iter()
            .map(|(id, members)| (id.clone(), members.len()))
            .collect();
        info!(
            collapsed = report.collapsed.len(),
            accessors = report.accessors.len(),
            nodes = rewritten.len(),
            "subgraph build done"
        );
        Ok((rewritten, report))
    }
}

/// Builds the opaque node standing in for `partition`. Its `tops` are filled by the caller.
///
/// The collapsed node is named after the partition id, so the id must not name any node of the
/// graph being rewritten.
fn collapse(
    partition: &Partition,
    options: &BuildOptions,
    compiler_output: Option<&CompilerOutput>,
    node_names: &HashSet<String>,
) -> Result<Node, BuildError> {
    if node_names.contains(&partition.id) {
        return Err(GraphError::InvalidPartition {
            partition: partition.id.clone(),
            reason: format!(
                "partition id '{}' is already the name of a node in the graph",
                partition.id
            ),
        }
        .into());
    }
    if partition.shapes.len() != partition.output_names.len() {
        return Err(GraphError::InvalidPartition {
            partition: partition.id.clone(),
            reason: format!(
                "{} output shapes declared for {} outputs",
                partition.shapes.len(),
                partition.output_names.len()
            ),
        }
        .into());
    }

    let interior = partition.subgraph()?;
    let snapshot = |names: &[String]| -> Result<AttrValue, GraphError> {
        let mut layers = BTreeMap::new();
        for name in names {
            let node = interior.node(name)?;
            layers.insert(name.clone(), AttrValue::Strs(node.layer.clone()));
        }
        Ok(AttrValue::Map(layers))
    };

    let mut attrs = Attrs::new();
    attrs.insert(
        "input_names".into(),
        AttrValue::Strs(partition.input_names.clone()),
    );
    attrs.insert(
        "output_names".into(),
        AttrValue::Strs(partition.output_names.clone()),
    );
    attrs.insert("input_layers".into(), snapshot(&partition.input_names)?);
    attrs.insert("output_layers".into(), snapshot(&partition.output_names)?);
    for (key, value) in &options.extra_attrs {
        attrs.insert(key.clone(), value.clone());
    }
    if let Some(artifact) = compiler_output.and_then(|output| output.get(&partition.id)) {
        debug!(partition = %partition.id, "binding compiled runtime tensor maps");
        attrs.insert("rt_in_map".into(), artifact.in_map.clone().into());
        attrs.insert("rt_out_map".into(), artifact.out_map.clone().into());
    }

    Ok(Node {
        name: partition.id.clone(),
        types: vec![options.collapsed_type.clone()],
        shapes: Shapes::Tuple(partition.shapes.clone()),
        bottoms: partition.bottoms.clone(),
        tops: Vec::new(),
        layer: vec![partition.id.clone()],
        attrs,
        data: Vec::new(),
        subgraph: None,
        target: partition.target.clone(),
        internal: false,
    })
}

/// One accessor per partition output, keeping the boundary output name.
fn accessors(partition: &Partition, collapsed: &str, output_marked: &HashSet<String>) -> Vec<Node> {
    partition
        .output_names
        .iter()
        .zip(&partition.shapes)
        .enumerate()
        .map(|(index, (output, shape))| {
            let mut node = Node::new(output.clone(), TUPLE_GET_ITEM, shape.clone())
                .with_bottoms([collapsed])
                .with_tops(
                    partition
                        .top_tensors
                        .get(output)
                        .cloned()
                        .unwrap_or_default(),
                )
                .with_attr("index", index);
            node.internal = true;
            if output_marked.contains(output) {
                node.types.push(OUTPUT_TAG.to_string());
            }
            node
        })
        .collect()
}

/// Points external producers at collapsed nodes and external consumers at accessors.
fn relink(
    net: &mut [Node],
    partitions: &BTreeMap<String, Partition>,
    consumed: &BTreeMap<String, HashSet<String>>,
    accessor_of: &HashMap<String, String>,
) -> Result<(), GraphError> {
    let position: HashMap<String, usize> = net
        .iter()
        .enumerate()
        .map(|(idx, node)| (node.name.clone(), idx))
        .collect();

    for (id, members) in consumed {
        let partition = &partitions[id];

        for bottom in &partition.bottoms {
            let Some(&idx) = position.get(bottom) else {
                continue;
            };
            let producer = &mut net[idx];
            let mut tops: Vec<String> = Vec::with_capacity(producer.tops.len());
            for top in producer.tops.drain(..) {
                let top = if members.contains(&top) { id.clone() } else { top };
                if !tops.contains(&top) {
                    tops.push(top);
                }
            }
            producer.tops = tops;
        }

        for top in &partition.tops {
            let Some(&idx) = position.get(top) else {
                continue;
            };
            let consumer = &mut net[idx];
            for bottom in consumer.bottoms.iter_mut() {
                if !members.contains(bottom.as_str()) {
                    continue;
                }
                let accessor =
                    accessor_of
                        .get(bottom.as_str())
                        .ok_or_else(|| GraphError::InvalidPartition {
                            partition: id.clone(),
                            reason: format!(
                                "node '{}' reads interior node '{}' which is not a partition output",
                                consumer.name, bottom
                            ),
                        })?;
                *bottom = accessor.clone();
            }
        }
    }
    Ok(())
}

/// Runs the build pass with the default collaborators.
///
/// `layout` is parsed first, so an unsupported layout fails before any graph work happens.
pub fn build(
    graph: Graph,
    target: &str,
    collapsed_type: &str,
    layout: &str,
    extra_attrs: Attrs,
) -> Result<Graph, BuildError> {
    let layout: Layout = layout.parse()?;
    let options = BuildOptions {
        target: target.to_string(),
        collapsed_type: collapsed_type.to_string(),
        layout,
        extra_attrs,
    };
    SubgraphBuildPass::default().build(graph, &options)
}
