//! Host tensors and runtime values exchanged between lowered operations.
//!
//! Lowered operations consume and produce [`Value`]s: either a single dense [`Tensor`] or an
//! ordered tuple of tensors for multi-output operations such as collapsed partitions.

mod host_tensor;
pub mod shape;
mod value;

pub use host_tensor::Tensor;
pub use shape::Shape;
pub use value::Value;
