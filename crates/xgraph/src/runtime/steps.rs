use std::collections::HashMap;
use std::iter::FusedIterator;
use std::time::Instant;

use tracing::{debug, trace};

use super::op::{RtOp, CONVOLUTION_TYPE};
use super::{Runtime, RuntimeError};
use crate::env;
use crate::tensor::{Tensor, Value};

/// Record of one executed operation.
#[derive(Debug)]
pub struct Step<'a> {
    pub index: usize,
    pub op: &'a dyn RtOp,
    pub inputs: Vec<Value>,
    pub output: Value,
    /// Calibration view of the output; equal to `output` except for convolutions.
    pub quant_output: Value,
}

/// Execution state shared by [`Runtime::run`] and [`Steps`].
///
/// Lookups resolve computed values first, then parameters, then fed inputs, so parameters shadow
/// fed tensors of the same name without either map being copied.
pub(super) struct Cursor<'a> {
    runtime: &'a Runtime,
    fed: &'a HashMap<String, Tensor>,
    computed: HashMap<&'a str, Value>,
    next: usize,
    stop: Option<&'a str>,
    finished: bool,
}

pub(super) struct Executed<'a> {
    pub index: usize,
    pub op: &'a dyn RtOp,
    pub inputs: Vec<Value>,
    pub output: Value,
}

impl<'a> Cursor<'a> {
    pub(super) fn new(
        runtime: &'a Runtime,
        fed: &'a HashMap<String, Tensor>,
        stop: Option<&'a str>,
    ) -> Self {
        Cursor {
            runtime,
            fed,
            computed: HashMap::new(),
            next: 0,
            stop,
            finished: false,
        }
    }

    fn resolve(&self, op: &dyn RtOp, tensor: &str) -> Result<Value, RuntimeError> {
        if let Some(value) = self.computed.get(tensor) {
            return Ok(value.clone());
        }
        if let Some(param) = self.runtime.params.get(tensor) {
            return Ok(Value::Tensor(param.clone()));
        }
        if let Some(fed) = self.fed.get(tensor) {
            return Ok(Value::Tensor(fed.clone()));
        }
        Err(RuntimeError::UnresolvedInput {
            op: op.name().to_string(),
            tensor: tensor.to_string(),
        })
    }

    /// Executes the next operation. Returns `None` once every operation ran, the stop operation
    /// ran, or an earlier step failed.
    pub(super) fn advance(&mut self) -> Option<Result<Executed<'a>, RuntimeError>> {
        if self.finished {
            return None;
        }
        let runtime: &'a Runtime = self.runtime;
        let Some(op) = runtime.ops.get(self.next) else {
            self.finished = true;
            return None;
        };
        let op: &'a dyn RtOp = op.as_ref();
        let index = self.next;
        self.next += 1;

        let result = self.execute(index, op);
        if result.is_err() || self.stop == Some(op.name()) {
            self.finished = true;
        }
        Some(result)
    }

    fn execute(&mut self, index: usize, op: &'a dyn RtOp) -> Result<Executed<'a>, RuntimeError> {
        let inputs = op
            .inputs()
            .iter()
            .map(|tensor| self.resolve(op, tensor))
            .collect::<Result<Vec<_>, _>>()?;

        trace!(index, op = op.name(), op_type = op.op_type(), "running operation");
        let started = env::op_timing_enabled().then(Instant::now);
        let output = op.forward(&inputs).map_err(|err| RuntimeError::Kernel {
            op: op.name().to_string(),
            message: format!("{err:#}"),
        })?;
        if let Some(started) = started {
            debug!(
                op = op.name(),
                op_type = op.op_type(),
                elapsed_us = started.elapsed().as_micros() as u64,
                "operation timing"
            );
        }

        self.computed.insert(op.name(), output.clone());
        Ok(Executed {
            index,
            op,
            inputs,
            output,
        })
    }
}

/// Lazy, one-shot sequence of executed operations returned by [`Runtime::run_stepwise`].
///
/// Each call to `next` runs exactly one operation. Dropping the iterator abandons the run.
pub struct Steps<'a> {
    cursor: Cursor<'a>,
}

impl<'a> Steps<'a> {
    pub(super) fn new(cursor: Cursor<'a>) -> Self {
        Steps { cursor }
    }
}

impl<'a> Iterator for Steps<'a> {
    type Item = Result<Step<'a>, RuntimeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let executed = match self.cursor.advance()? {
            Ok(executed) => executed,
            Err(err) => return Some(Err(err)),
        };
        let Executed {
            index,
            op,
            inputs,
            output,
        } = executed;

        let quant_output = if op.op_type() == CONVOLUTION_TYPE {
            match op.quantization_view(&inputs) {
                Ok(Some(view)) => view,
                Ok(None) => output.clone(),
                Err(err) => {
                    self.cursor.finished = true;
                    return Some(Err(RuntimeError::Kernel {
                        op: op.name().to_string(),
                        message: format!("quantization view: {err:#}"),
                    }));
                }
            }
        } else {
            output.clone()
        };

        Some(Ok(Step {
            index,
            op,
            inputs,
            output,
            quant_output,
        }))
    }
}

impl FusedIterator for Steps<'_> {}
