use anyhow::{anyhow, bail, Result};

use super::host_tensor::Tensor;

/// Value produced by a lowered operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Tensor(Tensor),
    /// Ordered outputs of a multi-output operation, read back through tuple accessors.
    Tuple(Vec<Tensor>),
}

impl Value {
    /// Borrows the tensor, failing for tuple values.
    pub fn as_tensor(&self) -> Result<&Tensor> {
        match self {
            Value::Tensor(tensor) => Ok(tensor),
            Value::Tuple(items) => bail!("expected a tensor but found a tuple of {}", items.len()),
        }
    }

    pub fn into_tensor(self) -> Result<Tensor> {
        match self {
            Value::Tensor(tensor) => Ok(tensor),
            Value::Tuple(items) => bail!("expected a tensor but found a tuple of {}", items.len()),
        }
    }

    /// Returns element `index` of a tuple value.
    ///
    /// A plain tensor behaves like a one-element tuple.
    pub fn tuple_element(&self, index: usize) -> Result<&Tensor> {
        match self {
            Value::Tensor(tensor) if index == 0 => Ok(tensor),
            Value::Tensor(_) => bail!("tuple index {index} out of range for a single tensor"),
            Value::Tuple(items) => items.get(index).ok_or_else(|| {
                anyhow!(
                    "tuple index {index} out of range for a tuple of {}",
                    items.len()
                )
            }),
        }
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self, Value::Tuple(_))
    }
}

impl From<Tensor> for Value {
    fn from(tensor: Tensor) -> Self {
        Value::Tensor(tensor)
    }
}

impl From<Vec<Tensor>> for Value {
    fn from(items: Vec<Tensor>) -> Self {
        Value::Tuple(items)
    }
}
