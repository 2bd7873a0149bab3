//! Host-backed f32 tensor used for parameters, feeds, and reference kernels.

use super::shape::Shape;
use anyhow::{bail, ensure, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Dense row-major `f32` tensor living in host memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Shape,
    data: Vec<f32>,
}

impl Tensor {
    /// Constructs a tensor from raw values, validating the length against the dimensions.
    pub fn from_vec(dims: &[usize], data: Vec<f32>) -> Result<Self> {
        Self::from_shape(Shape::new(dims.to_vec()), data)
    }

    /// Constructs a tensor from raw values, validating the length against the shape.
    pub fn from_shape(shape: Shape, data: Vec<f32>) -> Result<Self> {
        if data.len() != shape.num_elements() {
            bail!(
                "tensor data length ({}) does not match shape {:?}",
                data.len(),
                shape.dims()
            );
        }
        Ok(Tensor { shape, data })
    }

    /// Rank-0 tensor holding `value`.
    pub fn scalar(value: f32) -> Self {
        Tensor {
            shape: Shape::scalar(),
            data: vec![value],
        }
    }

    /// Returns a tensor of the requested shape filled with `value`.
    pub fn full(dims: &[usize], value: f32) -> Self {
        let shape = Shape::new(dims.to_vec());
        let len = shape.num_elements();
        Tensor {
            shape,
            data: vec![value; len],
        }
    }

    pub fn zeros(dims: &[usize]) -> Self {
        Self::full(dims, 0.0)
    }

    pub fn ones(dims: &[usize]) -> Self {
        Self::full(dims, 1.0)
    }

    /// Seeded `N(0, std^2)` samples, drawn pairwise with Box-Muller.
    pub fn randn(dims: &[usize], std: f32, rng: &mut impl Rng) -> Self {
        let shape = Shape::new(dims.to_vec());
        let len = shape.num_elements();
        let mut values = Vec::with_capacity(len);
        while values.len() < len {
            let u1: f32 = rng.gen::<f32>().max(f32::MIN_POSITIVE);
            let u2: f32 = rng.gen::<f32>();
            let r = (-2.0 * u1.ln()).sqrt();
            let theta = 2.0 * std::f32::consts::PI * u2;
            values.push(r * theta.cos() * std);
            if values.len() < len {
                values.push(r * theta.sin() * std);
            }
        }
        Tensor {
            shape,
            data: values,
        }
    }

    /// Element count.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Shorthand for `self.shape().dims()`.
    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    /// Borrow the row-major payload.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable access to the row-major payload.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Applies `f` to every element, producing a new tensor.
    pub fn map<F>(&self, f: F) -> Tensor
    where
        F: Fn(f32) -> f32,
    {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }

    /// Combines two tensors element by element.
    ///
    /// Shapes must match exactly unless one side holds a single element, which is broadcast.
    pub fn zip_with<F>(&self, rhs: &Tensor, f: F) -> Result<Tensor>
    where
        F: Fn(f32, f32) -> f32,
    {
        if self.shape == rhs.shape {
            let data = self
                .data
                .iter()
                .zip(rhs.data.iter())
                .map(|(&a, &b)| f(a, b))
                .collect();
            return Ok(Tensor {
                shape: self.shape.clone(),
                data,
            });
        }
        if rhs.len() == 1 {
            let b = rhs.data[0];
            return Ok(self.map(|a| f(a, b)));
        }
        if self.len() == 1 {
            let a = self.data[0];
            return Ok(rhs.map(|b| f(a, b)));
        }
        bail!(
            "incompatible shapes for elementwise op: {:?} vs {:?}",
            self.shape.dims(),
            rhs.shape.dims()
        )
    }

    /// Permutes the axes of the tensor; `perm[i]` names the source axis of output axis `i`.
    pub fn transpose(&self, perm: &[usize]) -> Result<Tensor> {
        let rank = self.shape.rank();
        ensure!(
            perm.len() == rank,
            "transpose permutation {:?} does not match rank {}",
            perm,
            rank
        );
        let mut seen = vec![false; rank];
        for &axis in perm {
            ensure!(
                axis < rank && !seen[axis],
                "invalid transpose permutation {:?}",
                perm
            );
            seen[axis] = true;
        }

        let src_dims = self.shape.dims();
        let src_strides = self.shape.strides();
        let out_dims: Vec<usize> = perm.iter().map(|&axis| src_dims[axis]).collect();
        let out_shape = Shape::new(out_dims.clone());
        let mut out = Vec::with_capacity(self.len());
        let mut index = vec![0usize; rank];
        for _ in 0..self.len() {
            let offset: usize = index
                .iter()
                .zip(perm)
                .map(|(&i, &axis)| i * src_strides[axis])
                .sum();
            out.push(self.data[offset]);
            for axis in (0..rank).rev() {
                index[axis] += 1;
                if index[axis] < out_dims[axis] {
                    break;
                }
                index[axis] = 0;
            }
        }
        Ok(Tensor {
            shape: out_shape,
            data: out,
        })
    }
}
