//! NUMA/PCI topology probing and RDMA device selection.
//!
//! This crate is the leaf dependency of the AState transport core
//! (§2.1–2.2 of the spec): it answers two questions — "which RDMA
//! devices should this process use?" and "which NUMA node are they on?"
//! — without knowing anything about queue pairs, memory registration, or
//! transfers.

pub mod gpu;
pub mod numa;
pub mod selector;
pub mod sysfs;

pub use gpu::{EnvGpuTopologyProvider, GpuTopologyProvider, NoGpuTopologyProvider};
pub use selector::{select_devices, DeviceSelection, SelectionStrategy};

/// Owned by the transport engine (not a process-wide singleton, per spec
/// §9's note that `GpuTopologyManager` should become engine-owned rather
/// than a lazily-initialized global). Performs selection once at
/// `Start()` time and remembers the result for the lifetime of the
/// engine.
pub struct GpuTopologyManager {
    gpu: Box<dyn GpuTopologyProvider>,
}

impl GpuTopologyManager {
    pub fn new(gpu: Box<dyn GpuTopologyProvider>) -> Self {
        Self { gpu }
    }

    /// Initialization never fails: an unavailable GPU runtime or empty
    /// topology degrades to rank-based selection or an empty device list
    /// respectively (spec §4.1 failure semantics).
    pub fn select(&self, rank: u32, max_devices: usize) -> DeviceSelection {
        selector::select_devices(self.gpu.as_ref(), rank, max_devices)
    }

    /// Pin the calling thread (and its default memory allocation policy)
    /// to `node`. No-op for `node < 0`.
    pub fn pin_to_node(&self, node: i32) {
        numa::pin_to_node(node)
    }
}

impl Default for GpuTopologyManager {
    fn default() -> Self {
        Self::new(Box::new(EnvGpuTopologyProvider))
    }
}
