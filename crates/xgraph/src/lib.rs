pub mod graph;
pub mod partition;
pub mod passes;
pub mod runtime;
pub mod tensor;
mod env;

pub use graph::{AttrValue, Attrs, Graph, GraphBuilder, GraphError, Node, Shapes, TensorShape};
pub use partition::{Layout, Partition};
pub use passes::subgraph::{build, BuildError, BuildOptions, SubgraphBuildPass};
pub use runtime::{DispatchTable, RtOp, Runtime, RuntimeError, Step, Steps};
pub use tensor::{Shape, Tensor, Value};
