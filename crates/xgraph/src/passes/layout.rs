//! Canonical tensor layouts and the layout-normalization seam.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::subgraph::ConfigError;
use crate::graph::Graph;

/// Layouts a graph can be normalized to before partition substitution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Layout {
    #[default]
    #[serde(rename = "NCHW")]
    Nchw,
    #[serde(rename = "NHWC")]
    Nhwc,
}

impl Layout {
    pub fn as_str(self) -> &'static str {
        match self {
            Layout::Nchw => "NCHW",
            Layout::Nhwc => "NHWC",
        }
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Layout {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NCHW" => Ok(Layout::Nchw),
            "NHWC" => Ok(Layout::Nhwc),
            other => Err(ConfigError::UnsupportedLayout {
                layout: other.to_string(),
            }),
        }
    }
}

/// Normalizes a graph to `layout`, possibly inserting explicit layout-conversion nodes.
pub trait LayoutPass: Send + Sync {
    fn transform(&self, graph: Graph, target: &str, layout: Layout) -> Result<Graph>;
}

impl<F> LayoutPass for F
where
    F: Fn(Graph, &str, Layout) -> Result<Graph> + Send + Sync,
{
    fn transform(&self, graph: Graph, target: &str, layout: Layout) -> Result<Graph> {
        self(graph, target, layout)
    }
}

/// Layout pass for graphs that are already in the requested layout.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityLayoutPass;

impl LayoutPass for IdentityLayoutPass {
    fn transform(&self, graph: Graph, _target: &str, _layout: Layout) -> Result<Graph> {
        Ok(graph)
    }
}
