//! Lowering dispatch tables and the per-device registry.
//!
//! A [`DispatchTable`] maps operator type tags to [`Lowering`] handlers for one device. Backend
//! crates publish their tables under a device label with [`register_dispatch`], either explicitly
//! or through a registrar in [`DISPATCH_REGISTRARS`], which runs the first time the registry is
//! queried.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Once, RwLock};

use anyhow::Result;
use once_cell::sync::Lazy;
use tracing::debug;

use super::op::RtOp;
use super::{ParamMap, ShapeMap};
use crate::graph::Node;

/// Turns one graph node into executable operations.
///
/// `shapes` holds the resolved output shapes of every node lowered before this one.
pub trait Lowering: Send + Sync {
    fn lower(
        &self,
        node: &Node,
        shapes: &ShapeMap,
        params: &ParamMap,
        batch_size: i64,
    ) -> Result<Vec<Box<dyn RtOp>>>;
}

impl<F> Lowering for F
where
    F: Fn(&Node, &ShapeMap, &ParamMap, i64) -> Result<Vec<Box<dyn RtOp>>> + Send + Sync,
{
    fn lower(
        &self,
        node: &Node,
        shapes: &ShapeMap,
        params: &ParamMap,
        batch_size: i64,
    ) -> Result<Vec<Box<dyn RtOp>>> {
        self(node, shapes, params, batch_size)
    }
}

/// Type tag to lowering handler map for a single device.
#[derive(Clone, Default)]
pub struct DispatchTable {
    handlers: HashMap<String, Arc<dyn Lowering>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a closure or function as the handler for `op_type`, replacing any previous one.
    pub fn register<F>(&mut self, op_type: impl Into<String>, lowering: F) -> &mut Self
    where
        F: Fn(&Node, &ShapeMap, &ParamMap, i64) -> Result<Vec<Box<dyn RtOp>>>
            + Send
            + Sync
            + 'static,
    {
        self.register_lowering(op_type, Arc::new(lowering))
    }

    pub fn register_lowering(
        &mut self,
        op_type: impl Into<String>,
        lowering: Arc<dyn Lowering>,
    ) -> &mut Self {
        self.handlers.insert(op_type.into(), lowering);
        self
    }

    pub fn get(&self, op_type: &str) -> Option<&Arc<dyn Lowering>> {
        self.handlers.get(op_type)
    }

    pub fn contains(&self, op_type: &str) -> bool {
        self.handlers.contains_key(op_type)
    }

    /// Registered type tags, sorted.
    pub fn op_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchTable")
            .field("op_types", &self.op_types())
            .finish()
    }
}

/// Registrar functions contributed by backend crates.
#[linkme::distributed_slice]
pub static DISPATCH_REGISTRARS: [fn()] = [..];

static REGISTRARS_RAN: Once = Once::new();

static GLOBAL_REGISTRY: Lazy<RwLock<HashMap<String, Arc<DispatchTable>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

fn run_registrars() {
    REGISTRARS_RAN.call_once(|| {
        for registrar in DISPATCH_REGISTRARS.iter() {
            registrar();
        }
    });
}

/// Publishes `table` as the dispatch table of `device`, replacing any previous table.
pub fn register_dispatch(device: impl Into<String>, table: DispatchTable) {
    let device = device.into();
    debug!(device = %device, op_types = table.handlers.len(), "registering dispatch table");
    GLOBAL_REGISTRY
        .write()
        .unwrap()
        .insert(device, Arc::new(table));
}

/// Looks up the dispatch table of `device`.
pub fn dispatch_for(device: &str) -> Option<Arc<DispatchTable>> {
    run_registrars();
    GLOBAL_REGISTRY.read().unwrap().get(device).cloned()
}

pub fn has_dispatch(device: &str) -> bool {
    run_registrars();
    GLOBAL_REGISTRY.read().unwrap().contains_key(device)
}

/// Registered device labels, sorted.
pub fn list_devices() -> Vec<String> {
    run_registrars();
    let mut devices: Vec<String> = GLOBAL_REGISTRY.read().unwrap().keys().cloned().collect();
    devices.sort();
    devices
}
