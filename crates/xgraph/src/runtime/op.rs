//! Executable operations derived from graph nodes.

use std::fmt;

use anyhow::Result;

use crate::graph::Shapes;
use crate::tensor::Value;

/// Operator kind whose quantization view may differ from its output.
pub const CONVOLUTION_TYPE: &str = "Convolution";

/// One executable step of a lowered graph.
///
/// `inputs` names the operations (or fed tensors) whose values are passed to [`RtOp::forward`],
/// in order. An operation may list its own name to read a tensor fed under that name.
pub trait RtOp: Send + Sync {
    fn name(&self) -> &str;

    /// Operator kind, e.g. `"Convolution"`.
    fn op_type(&self) -> &str;

    fn inputs(&self) -> &[String];

    /// Resolved output shape(s).
    fn shape(&self) -> &Shapes;

    fn forward(&self, inputs: &[Value]) -> Result<Value>;

    /// Value exposed to calibration in place of the forwarded output.
    ///
    /// Only consulted for [`CONVOLUTION_TYPE`] operations, which return their pre-bias
    /// accumulator here. `None` means the view is the forwarded output itself.
    fn quantization_view(&self, _inputs: &[Value]) -> Result<Option<Value>> {
        Ok(None)
    }
}

impl fmt::Debug for dyn RtOp + '_ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtOp")
            .field("name", &self.name())
            .field("op_type", &self.op_type())
            .field("inputs", &self.inputs())
            .field("shape", self.shape())
            .finish()
    }
}

type ForwardFn = Box<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

/// Closure-backed [`RtOp`] for lowerings that do not need a dedicated type.
pub struct RtLayer {
    name: String,
    op_type: String,
    inputs: Vec<String>,
    shape: Shapes,
    forward: ForwardFn,
    quantization: Option<ForwardFn>,
}

impl RtLayer {
    pub fn new<F>(
        name: impl Into<String>,
        op_type: impl Into<String>,
        inputs: Vec<String>,
        shape: Shapes,
        forward: F,
    ) -> Self
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        RtLayer {
            name: name.into(),
            op_type: op_type.into(),
            inputs,
            shape,
            forward: Box::new(forward),
            quantization: None,
        }
    }

    /// Attaches a distinct quantization view.
    pub fn with_quantization_view<F>(mut self, view: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.quantization = Some(Box::new(view));
        self
    }

    pub fn boxed(self) -> Box<dyn RtOp> {
        Box::new(self)
    }
}

impl RtOp for RtLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn op_type(&self) -> &str {
        &self.op_type
    }

    fn inputs(&self) -> &[String] {
        &self.inputs
    }

    fn shape(&self) -> &Shapes {
        &self.shape
    }

    fn forward(&self, inputs: &[Value]) -> Result<Value> {
        (self.forward)(inputs)
    }

    fn quantization_view(&self, inputs: &[Value]) -> Result<Option<Value>> {
        self.quantization
            .as_ref()
            .map(|view| view(inputs))
            .transpose()
    }
}
