pub mod cpu;

pub use cpu::{cpu_dispatch_table, Conv2dSpec, CpuOp, Kernel};

/// Publishes the reference CPU lowering table under the "cpu" and "cpu-ref" device labels.
///
/// Linking this crate is enough: the registrar below runs on the first registry lookup.
/// Calling it again replaces the published tables with fresh copies.
pub fn register_cpu_dispatch() {
    let table = cpu_dispatch_table();
    xgraph::runtime::register_dispatch("cpu", table.clone());
    xgraph::runtime::register_dispatch("cpu-ref", table);
}

#[linkme::distributed_slice(xgraph::runtime::DISPATCH_REGISTRARS)]
static REGISTER_CPU_DISPATCH: fn() = register_cpu_dispatch;
