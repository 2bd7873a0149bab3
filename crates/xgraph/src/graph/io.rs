//! JSON and bincode persistence for graphs.
//!
//! Deserialization always goes through [`Graph::from_nodes`], so a stored graph (or a partition
//! snapshot) comes back with the same node order, edges and attributes it was saved with.

use std::{fs, io, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{CompilerOutput, Graph, GraphError, Node};

/// Version tag written into every serialized graph.
pub const GRAPH_FORMAT_VERSION: &str = "xgraph.v1";

fn default_format_version() -> String {
    GRAPH_FORMAT_VERSION.to_string()
}

#[derive(Serialize, Deserialize)]
struct GraphRepr {
    #[serde(default = "default_format_version")]
    format_version: String,
    name: String,
    nodes: Vec<Node>,
    #[serde(default)]
    compiler_output: Option<CompilerOutput>,
}

#[derive(Debug, Error)]
pub enum GraphSerdeError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("graph format version '{found}' does not match expected '{expected}'")]
    FormatVersionMismatch {
        found: String,
        expected: &'static str,
    },
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl Graph {
    fn to_repr(&self) -> GraphRepr {
        GraphRepr {
            format_version: GRAPH_FORMAT_VERSION.to_string(),
            name: self.name.clone(),
            nodes: self.nodes.clone(),
            compiler_output: self.compiler_output.clone(),
        }
    }

    fn from_repr(repr: GraphRepr) -> Result<Self, GraphSerdeError> {
        if repr.format_version != GRAPH_FORMAT_VERSION {
            return Err(GraphSerdeError::FormatVersionMismatch {
                found: repr.format_version,
                expected: GRAPH_FORMAT_VERSION,
            });
        }
        Ok(Graph::from_nodes(repr.name, repr.nodes)?.with_compiler_output(repr.compiler_output))
    }

    pub fn to_json_string(&self) -> Result<String, GraphSerdeError> {
        serde_json::to_string_pretty(&self.to_repr()).map_err(GraphSerdeError::from)
    }

    pub fn from_json_str(src: &str) -> Result<Self, GraphSerdeError> {
        let repr: GraphRepr = serde_json::from_str(src)?;
        Self::from_repr(repr)
    }

    pub fn to_bincode_bytes(&self) -> Result<Vec<u8>, GraphSerdeError> {
        bincode::serialize(&self.to_repr()).map_err(GraphSerdeError::from)
    }

    pub fn from_bincode_slice(bytes: &[u8]) -> Result<Self, GraphSerdeError> {
        let repr: GraphRepr = bincode::deserialize(bytes)?;
        Self::from_repr(repr)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<(), GraphSerdeError> {
        fs::write(path, self.to_json_string()?)?;
        Ok(())
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self, GraphSerdeError> {
        let src = fs::read_to_string(path)?;
        Self::from_json_str(&src)
    }
}
