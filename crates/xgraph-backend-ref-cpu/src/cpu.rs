use anyhow::{anyhow, bail, ensure, Context, Result};
use tracing::trace;

use xgraph::graph::TUPLE_GET_ITEM;
use xgraph::runtime::{DispatchTable, ParamMap, RtOp, ShapeMap, CONVOLUTION_TYPE};
use xgraph::{Node, Shapes, Tensor, TensorShape, Value};

type Lowered = Result<Vec<Box<dyn RtOp>>>;

#[derive(Debug, Clone, PartialEq)]
pub struct Conv2dSpec {
    /// `[out_channels, in_channels, kernel_h, kernel_w]`.
    pub weights: Tensor,
    pub bias: Option<Tensor>,
    pub strides: [usize; 2],
    pub padding: [usize; 2],
    pub dilation: [usize; 2],
}

#[derive(Debug, Clone, PartialEq)]
pub enum Kernel {
    Input(TensorShape),
    Constant(Tensor),
    Add,
    Multiply,
    Relu,
    Identity,
    BiasAdd { axis: usize, bias: Tensor },
    Transpose(Vec<usize>),
    TupleGetItem(usize),
    Tuple,
    Conv2d(Conv2dSpec),
}

/// Operation executed by the reference CPU kernels.
#[derive(Debug)]
pub struct CpuOp {
    name: String,
    op_type: String,
    inputs: Vec<String>,
    shape: Shapes,
    kernel: Kernel,
}

impl CpuOp {
    pub fn new(node: &Node, inputs: Vec<String>, shape: Shapes, kernel: Kernel) -> Self {
        CpuOp {
            name: node.name.clone(),
            op_type: node.op_type().to_string(),
            inputs,
            shape,
            kernel,
        }
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    fn boxed(self) -> Vec<Box<dyn RtOp>> {
        vec![Box::new(self)]
    }
}

fn arity(op: &CpuOp, inputs: &[Value], expected: usize) -> Result<()> {
    ensure!(
        inputs.len() == expected,
        "{} '{}' expects {expected} input(s), got {}",
        op.op_type,
        op.name,
        inputs.len()
    );
    Ok(())
}

impl RtOp for CpuOp {
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
        let out = match &self.kernel {
            Kernel::Input(declared) => {
                arity(self, inputs, 1)?;
                let fed = inputs[0].as_tensor()?;
                ensure!(
                    conforms(declared, fed.dims()),
                    "input '{}' declared as {declared} but fed {:?}",
                    self.name,
                    fed.dims()
                );
                fed.clone()
            }
            Kernel::Constant(value) => value.clone(),
            Kernel::Add | Kernel::Multiply => {
                arity(self, inputs, 2)?;
                let (lhs, rhs) = (inputs[0].as_tensor()?, inputs[1].as_tensor()?);
                if matches!(self.kernel, Kernel::Add) {
                    lhs.zip_with(rhs, |a, b| a + b)?
                } else {
                    lhs.zip_with(rhs, |a, b| a * b)?
                }
            }
            Kernel::Relu => {
                arity(self, inputs, 1)?;
                inputs[0].as_tensor()?.map(|v| v.max(0.0))
            }
            Kernel::Identity => {
                arity(self, inputs, 1)?;
                return Ok(inputs[0].clone());
            }
            Kernel::BiasAdd { axis, bias } => {
                arity(self, inputs, 1)?;
                bias_add(inputs[0].as_tensor()?, bias, *axis)?
            }
            Kernel::Transpose(axes) => {
                arity(self, inputs, 1)?;
                inputs[0].as_tensor()?.transpose(axes)?
            }
            Kernel::TupleGetItem(index) => {
                arity(self, inputs, 1)?;
                inputs[0].tuple_element(*index)?.clone()
            }
            Kernel::Tuple => {
                let items = inputs
                    .iter()
                    .map(|value| value.as_tensor().cloned())
                    .collect::<Result<Vec<_>>>()?;
                return Ok(Value::Tuple(items));
            }
            Kernel::Conv2d(spec) => {
                arity(self, inputs, 1)?;
                let mut out = conv2d(inputs[0].as_tensor()?, spec)?;
                if let Some(bias) = &spec.bias {
                    out = bias_add(&out, bias, 1)?;
                }
                out
            }
        };
        Ok(Value::Tensor(out))
    }

    fn quantization_view(&self, inputs: &[Value]) -> Result<Option<Value>> {
        match &self.kernel {
            Kernel::Conv2d(spec) => {
                arity(self, inputs, 1)?;
                Ok(Some(Value::Tensor(conv2d(inputs[0].as_tensor()?, spec)?)))
            }
            _ => Ok(None),
        }
    }
}

/// Whether concrete `dims` fit a declared shape whose negative entries are dynamic.
fn conforms(declared: &TensorShape, dims: &[usize]) -> bool {
    declared.rank() == dims.len()
        && declared
            .dims()
            .iter()
            .zip(dims)
            .all(|(&d, &n)| d < 0 || d as usize == n)
}

fn bias_add(x: &Tensor, bias: &Tensor, axis: usize) -> Result<Tensor> {
    let dims = x.dims();
    ensure!(axis < dims.len(), "bias axis {axis} out of range for {:?}", dims);
    ensure!(
        bias.len() == dims[axis],
        "bias of length {} does not match axis {axis} of {:?}",
        bias.len(),
        dims
    );
    let stride: usize = dims[axis + 1..].iter().product();
    let mut out = x.clone();
    for (i, v) in out.data_mut().iter_mut().enumerate() {
        *v += bias.data()[(i / stride) % dims[axis]];
    }
    Ok(out)
}

/// Direct NCHW convolution with OIHW weights.
fn conv2d(x: &Tensor, spec: &Conv2dSpec) -> Result<Tensor> {
    let &[n, c, h, w] = x.dims() else {
        bail!("convolution expects an NCHW input, got {:?}", x.dims());
    };
    let &[o, wc, kh, kw] = spec.weights.dims() else {
        bail!(
            "convolution expects OIHW weights, got {:?}",
            spec.weights.dims()
        );
    };
    ensure!(
        wc == c,
        "weights expect {wc} input channels, input has {c}"
    );
    let [sh, sw] = spec.strides;
    let [ph, pw] = spec.padding;
    let [dh, dw] = spec.dilation;
    ensure!(sh > 0 && sw > 0, "convolution strides must be positive");
    let span_h = dh * (kh - 1) + 1;
    let span_w = dw * (kw - 1) + 1;
    ensure!(
        h + 2 * ph >= span_h && w + 2 * pw >= span_w,
        "kernel {kh}x{kw} does not fit padded input {h}x{w}"
    );
    let oh = (h + 2 * ph - span_h) / sh + 1;
    let ow = (w + 2 * pw - span_w) / sw + 1;

    let input = x.data();
    let weights = spec.weights.data();
    let mut out = vec![0.0f32; n * o * oh * ow];
    for b in 0..n {
        for oc in 0..o {
            for y in 0..oh {
                for xo in 0..ow {
                    let mut acc = 0.0f32;
                    for ic in 0..c {
                        for ky in 0..kh {
                            let iy = (y * sh + ky * dh) as isize - ph as isize;
                            if iy < 0 || iy >= h as isize {
                                continue;
                            }
                            for kx in 0..kw {
                                let ix = (xo * sw + kx * dw) as isize - pw as isize;
                                if ix < 0 || ix >= w as isize {
                                    continue;
                                }
                                let src = ((b * c + ic) * h + iy as usize) * w + ix as usize;
                                let wt = ((oc * c + ic) * kh + ky) * kw + kx;
                                acc += input[src] * weights[wt];
                            }
                        }
                    }
                    out[((b * o + oc) * oh + y) * ow + xo] = acc;
                }
            }
        }
    }
    Tensor::from_vec(&[n, o, oh, ow], out)
}

fn tensor_shape(node: &Node) -> Result<&TensorShape> {
    node.shapes
        .as_tensor()
        .ok_or_else(|| anyhow!("node '{}' must have a single output shape", node.name))
}

fn pair_attr(node: &Node, key: &str, default: usize) -> Result<[usize; 2]> {
    let Some(value) = node.attr(key) else {
        return Ok([default, default]);
    };
    let ints = value
        .as_ints()
        .with_context(|| format!("attribute '{key}' of '{}' must be a list of ints", node.name))?;
    match ints {
        &[a, b] if a >= 0 && b >= 0 => Ok([a as usize, b as usize]),
        other => bail!(
            "attribute '{key}' of '{}' must hold two non-negative ints, got {:?}",
            node.name,
            other
        ),
    }
}

/// First data tensor of `node`, or the parameter stored under `param`.
fn weight(node: &Node, slot: usize, params: &ParamMap, param: &str) -> Option<Tensor> {
    node.data.get(slot).or_else(|| params.get(param)).cloned()
}

fn lower_input(node: &Node, _: &ShapeMap, _: &ParamMap, batch_size: i64) -> Lowered {
    let declared = tensor_shape(node)?.with_batch(batch_size);
    let shape = Shapes::Tensor(declared.clone());
    Ok(CpuOp::new(node, vec![node.name.clone()], shape, Kernel::Input(declared)).boxed())
}

fn lower_constant(node: &Node, _: &ShapeMap, params: &ParamMap, _: i64) -> Lowered {
    let value = weight(node, 0, params, &node.name)
        .with_context(|| format!("constant '{}' carries no data", node.name))?;
    Ok(CpuOp::new(node, Vec::new(), node.shapes.clone(), Kernel::Constant(value)).boxed())
}

fn lower_unary(kernel: Kernel) -> impl Fn(&Node, &ShapeMap, &ParamMap, i64) -> Lowered {
    move |node, _, _, _| {
        ensure!(
            node.bottoms.len() == 1,
            "'{}' expects one bottom, got {:?}",
            node.name,
            node.bottoms
        );
        Ok(CpuOp::new(node, node.bottoms.clone(), node.shapes.clone(), kernel.clone()).boxed())
    }
}

fn lower_binary(kernel: Kernel) -> impl Fn(&Node, &ShapeMap, &ParamMap, i64) -> Lowered {
    move |node, _, _, _| {
        ensure!(
            node.bottoms.len() == 2,
            "'{}' expects two bottoms, got {:?}",
            node.name,
            node.bottoms
        );
        Ok(CpuOp::new(node, node.bottoms.clone(), node.shapes.clone(), kernel.clone()).boxed())
    }
}

fn lower_bias_add(node: &Node, shapes: &ShapeMap, params: &ParamMap, batch: i64) -> Lowered {
    let bias = weight(node, 0, params, &format!("{}_bias", node.name))
        .with_context(|| format!("bias add '{}' carries no bias", node.name))?;
    let axis = node.attr("axis").and_then(|v| v.as_int()).unwrap_or(1);
    ensure!(axis >= 0, "bias add '{}' has negative axis {axis}", node.name);
    lower_unary(Kernel::BiasAdd {
        axis: axis as usize,
        bias,
    })(node, shapes, params, batch)
}

fn lower_transpose(node: &Node, shapes: &ShapeMap, params: &ParamMap, batch: i64) -> Lowered {
    let axes = node
        .attr("axes")
        .and_then(|v| v.as_ints())
        .with_context(|| format!("transpose '{}' has no 'axes' attribute", node.name))?
        .iter()
        .map(|&a| usize::try_from(a).with_context(|| format!("negative axis {a}")))
        .collect::<Result<Vec<_>>>()?;
    lower_unary(Kernel::Transpose(axes))(node, shapes, params, batch)
}

fn lower_tuple_get_item(node: &Node, shapes: &ShapeMap, _: &ParamMap, _: i64) -> Lowered {
    let index = node
        .attr("index")
        .and_then(|v| v.as_int())
        .with_context(|| format!("'{}' has no 'index' attribute", node.name))?;
    let index = usize::try_from(index).with_context(|| format!("negative tuple index {index}"))?;
    let [source] = node.bottoms.as_slice() else {
        bail!("'{}' expects one bottom, got {:?}", node.name, node.bottoms);
    };
    let shape = shapes
        .get(source)
        .and_then(|s| s.get(index))
        .cloned()
        .map(Shapes::Tensor)
        .unwrap_or_else(|| node.shapes.clone());
    trace!(node = %node.name, source = %source, index, "tuple accessor");
    Ok(CpuOp::new(node, node.bottoms.clone(), shape, Kernel::TupleGetItem(index)).boxed())
}

fn lower_tuple(node: &Node, shapes: &ShapeMap, _: &ParamMap, _: i64) -> Lowered {
    let items = node
        .bottoms
        .iter()
        .map(|b| {
            shapes
                .get(b)
                .and_then(Shapes::as_tensor)
                .cloned()
                .with_context(|| format!("tuple '{}' input '{b}' is not a single tensor", node.name))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(CpuOp::new(node, node.bottoms.clone(), Shapes::Tuple(items), Kernel::Tuple).boxed())
}

fn lower_conv2d(node: &Node, shapes: &ShapeMap, params: &ParamMap, batch: i64) -> Lowered {
    let weights = weight(node, 0, params, &format!("{}_weights", node.name))
        .with_context(|| format!("convolution '{}' carries no weights", node.name))?;
    let spec = Conv2dSpec {
        weights,
        bias: weight(node, 1, params, &format!("{}_biases", node.name)),
        strides: pair_attr(node, "strides", 1)?,
        padding: pair_attr(node, "padding", 0)?,
        dilation: pair_attr(node, "dilation", 1)?,
    };
    lower_unary(Kernel::Conv2d(spec))(node, shapes, params, batch)
}

/// Lowering table of every operator the reference kernels implement.
pub fn cpu_dispatch_table() -> DispatchTable {
    let mut table = DispatchTable::new();
    table
        .register("Input", lower_input)
        .register("StrInput", lower_input)
        .register("Constant", lower_constant)
        .register("Add", lower_binary(Kernel::Add))
        .register("Eltwise", lower_binary(Kernel::Add))
        .register("Multiply", lower_binary(Kernel::Multiply))
        .register("ReLU", lower_unary(Kernel::Relu))
        .register("Identity", lower_unary(Kernel::Identity))
        .register("BiasAdd", lower_bias_add)
        .register("Transpose", lower_transpose)
        .register(TUPLE_GET_ITEM, lower_tuple_get_item)
        .register("Tuple", lower_tuple)
        .register(CONVOLUTION_TYPE, lower_conv2d);
    table
}
