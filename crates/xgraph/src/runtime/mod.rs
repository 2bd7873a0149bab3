//! Linear execution engine.
//!
//! A [`Runtime`] lowers an ordered node list into [`RtOp`]s through a per-device
//! [`DispatchTable`] once, at construction, and then executes them strictly in that order on every
//! [`Runtime::run`] or [`Runtime::run_stepwise`] call. Per-call values live only as long as the
//! call (or the returned [`Steps`] iterator).

mod op;
pub mod registry;
mod steps;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::graph::{Graph, Node, Shapes};
use crate::tensor::{Tensor, Value};

pub use op::{RtLayer, RtOp, CONVOLUTION_TYPE};
pub use registry::{
    dispatch_for, has_dispatch, list_devices, register_dispatch, DispatchTable, Lowering,
    DISPATCH_REGISTRARS,
};
pub use steps::{Step, Steps};

use steps::Cursor;

/// Resolved output shapes of already lowered nodes, keyed by node name.
pub type ShapeMap = HashMap<String, Shapes>;

/// Named parameter tensors (weights, biases, constants).
pub type ParamMap = HashMap<String, Tensor>;

/// Batch size meaning "decided by the fed tensors".
pub const DYNAMIC_BATCH: i64 = -1;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("device '{device}' has no lowering for operation type '{op_type}' (node '{node}')")]
    UnsupportedOperation {
        node: String,
        op_type: String,
        device: String,
    },
    #[error("integrity violation at node '{node}': {reason}")]
    Integrity { node: String, reason: String },
    #[error("operation '{op}' reads '{tensor}', which is neither computed, a parameter nor fed")]
    UnresolvedInput { op: String, tensor: String },
    #[error("lowering node '{node}' failed: {message}")]
    Lowering { node: String, message: String },
    #[error("operation '{op}' failed: {message}")]
    Kernel { op: String, message: String },
    #[error("'{name}' is not a node of this runtime or was not computed")]
    NotFound { name: String },
    #[error("no dispatch table registered for device '{device}'")]
    UnknownDevice { device: String },
}

/// Executable form of a graph for one device.
#[derive(Debug)]
pub struct Runtime {
    name: String,
    device: String,
    batch_size: i64,
    params: ParamMap,
    nodes: Vec<Node>,
    node_index: HashMap<String, usize>,
    ops: Vec<Box<dyn RtOp>>,
    input_ops: Vec<usize>,
    output_ops: Vec<usize>,
}

impl Runtime {
    /// Lowers `nodes` with the dispatch table registered for `device`.
    pub fn new(
        name: impl Into<String>,
        nodes: Vec<Node>,
        params: ParamMap,
        device: &str,
        batch_size: i64,
    ) -> Result<Self, RuntimeError> {
        let dispatch = dispatch_for(device).ok_or_else(|| RuntimeError::UnknownDevice {
            device: device.to_string(),
        })?;
        Self::with_dispatch(name, nodes, params, device, dispatch, batch_size)
    }

    /// Lowers the nodes of `graph`, naming the runtime after it.
    pub fn from_graph(
        graph: &Graph,
        params: ParamMap,
        device: &str,
        batch_size: i64,
    ) -> Result<Self, RuntimeError> {
        Self::new(graph.name(), graph.nodes().to_vec(), params, device, batch_size)
    }

    /// Lowers `nodes` with an explicit dispatch table, bypassing the registry.
    ///
    /// A node may lower to several operations that run in sequence. The last of them computes
    /// the node's value: its shape is the one recorded for consumers, and it is the operation
    /// reported among the outputs when the node carries the output tag. An input node is fed
    /// through its first operation.
    pub fn with_dispatch(
        name: impl Into<String>,
        nodes: Vec<Node>,
        params: ParamMap,
        device: &str,
        dispatch: Arc<DispatchTable>,
        batch_size: i64,
    ) -> Result<Self, RuntimeError> {
        let name = name.into();
        let mut node_index = HashMap::with_capacity(nodes.len());
        let mut shapes = ShapeMap::with_capacity(nodes.len());
        let mut produced: HashSet<String> = HashSet::new();
        let mut ops: Vec<Box<dyn RtOp>> = Vec::with_capacity(nodes.len());
        let mut input_ops = Vec::new();
        let mut output_ops = Vec::new();

        for (index, node) in nodes.iter().enumerate() {
            if node_index.insert(node.name.clone(), index).is_some() {
                return Err(RuntimeError::Integrity {
                    node: node.name.clone(),
                    reason: "node name appears more than once".to_string(),
                });
            }
            if let Some(bottom) = node.bottoms.iter().find(|b| !shapes.contains_key(*b)) {
                return Err(RuntimeError::Integrity {
                    node: node.name.clone(),
                    reason: format!("bottom '{bottom}' is not lowered before its consumer"),
                });
            }

            let lowering = dispatch.get(node.op_type()).ok_or_else(|| {
                RuntimeError::UnsupportedOperation {
                    node: node.name.clone(),
                    op_type: node.op_type().to_string(),
                    device: device.to_string(),
                }
            })?;
            let lowered = lowering
                .lower(node, &shapes, &params, batch_size)
                .map_err(|err| RuntimeError::Lowering {
                    node: node.name.clone(),
                    message: format!("{err:#}"),
                })?;
            let Some(last) = lowered.last() else {
                return Err(RuntimeError::Lowering {
                    node: node.name.clone(),
                    message: "lowering produced no operations".to_string(),
                });
            };

            for op in &lowered {
                let fed_here = |input: &String| node.is_input() && *input == node.name;
                if let Some(input) = op.inputs().iter().find(|input| {
                    !produced.contains(*input) && !params.contains_key(*input) && !fed_here(*input)
                }) {
                    return Err(RuntimeError::Integrity {
                        node: node.name.clone(),
                        reason: format!(
                            "operation '{}' reads '{input}', which no earlier operation produces",
                            op.name()
                        ),
                    });
                }
                produced.insert(op.name().to_string());
                debug!(
                    op = op.name(),
                    op_type = op.op_type(),
                    inputs = ?op.inputs(),
                    shape = ?op.shape(),
                    "lowered operation"
                );
            }
            shapes.insert(node.name.clone(), last.shape().clone());

            if node.is_input() && !params.contains_key(&node.name) {
                input_ops.push(ops.len());
            }
            if node.is_output() {
                output_ops.push(ops.len() + lowered.len() - 1);
            }
            ops.extend(lowered);
        }

        info!(
            runtime = %name,
            device,
            batch_size,
            nodes = nodes.len(),
            ops = ops.len(),
            "runtime initialized"
        );

        Ok(Runtime {
            name,
            device: device.to_string(),
            batch_size,
            params,
            nodes,
            node_index,
            ops,
            input_ops,
            output_ops,
        })
    }

    /// Executes every operation in order, stopping after `stop` when given.
    ///
    /// Returns the values of `outputs` in the requested order, or only the last computed value
    /// when `outputs` is empty. Parameters shadow fed inputs of the same name.
    pub fn run(
        &self,
        inputs: &HashMap<String, Tensor>,
        outputs: &[&str],
        stop: Option<&str>,
    ) -> Result<Vec<Value>, RuntimeError> {
        debug!(runtime = %self.name, ?outputs, ?stop, "run");
        let mut cursor = Cursor::new(self, inputs, stop);
        let mut retained: HashMap<&str, Value> = HashMap::new();
        let mut last = None;
        while let Some(executed) = cursor.advance() {
            let executed = executed?;
            if outputs.iter().any(|name| *name == executed.op.name()) {
                retained.insert(executed.op.name(), executed.output.clone());
            }
            last = Some(executed.output);
        }

        if outputs.is_empty() {
            return Ok(last.into_iter().collect());
        }
        outputs
            .iter()
            .map(|name| {
                retained
                    .get(*name)
                    .cloned()
                    .ok_or_else(|| RuntimeError::NotFound {
                        name: name.to_string(),
                    })
            })
            .collect()
    }

    /// Same execution as [`Runtime::run`], one operation per pulled step.
    pub fn run_stepwise<'a>(
        &'a self,
        inputs: &'a HashMap<String, Tensor>,
        stop: Option<&'a str>,
    ) -> Steps<'a> {
        debug!(runtime = %self.name, ?stop, "run stepwise");
        Steps::new(Cursor::new(self, inputs, stop))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn batch_size(&self) -> i64 {
        self.batch_size
    }

    pub fn params(&self) -> &ParamMap {
        &self.params
    }

    /// Lowered operations in execution order.
    pub fn ops(&self) -> &[Box<dyn RtOp>] {
        &self.ops
    }

    /// Names of the operations that must be fed on every run.
    pub fn input_names(&self) -> Vec<&str> {
        self.input_ops.iter().map(|&i| self.ops[i].name()).collect()
    }

    pub fn input_shapes(&self) -> Vec<&Shapes> {
        self.input_ops.iter().map(|&i| self.ops[i].shape()).collect()
    }

    pub fn output_names(&self) -> Vec<&str> {
        self.output_ops.iter().map(|&i| self.ops[i].name()).collect()
    }

    pub fn output_shapes(&self) -> Vec<&Shapes> {
        self.output_ops.iter().map(|&i| self.ops[i].shape()).collect()
    }

    pub fn get_node(&self, name: &str) -> Result<&Node, RuntimeError> {
        self.node_index
            .get(name)
            .map(|&i| &self.nodes[i])
            .ok_or_else(|| RuntimeError::NotFound {
                name: name.to_string(),
            })
    }

    /// Producers of node `name`.
    pub fn get_input_node_names(&self, name: &str) -> Result<&[String], RuntimeError> {
        Ok(&self.get_node(name)?.bottoms)
    }

    /// Consumers of node `name`.
    pub fn get_output_node_names(&self, name: &str) -> Result<&[String], RuntimeError> {
        Ok(&self.get_node(name)?.tops)
    }
}
