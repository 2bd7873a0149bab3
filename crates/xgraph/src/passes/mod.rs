//! Whole-graph rewrite passes.

pub mod layout;
pub mod subgraph;

pub use layout::{IdentityLayoutPass, Layout, LayoutPass};
pub use subgraph::{build, BuildError, BuildOptions, BuildReport, ConfigError, SubgraphBuildPass};
