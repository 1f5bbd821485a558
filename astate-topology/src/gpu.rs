//! Active-GPU query, consumed as a narrow external interface.
//!
//! The transport core never links a CUDA runtime directly (out of scope
//! per spec §1); it asks for the active device index and, if selection by
//! topology is needed, that device's PCI address through this trait.

use std::env;

/// What the engine needs to know from "the GPU runtime" to do
/// topology-aware device selection. A real binding (e.g. via `cust` or
/// `cudarc`) implements this; the environment-backed implementation below
/// is the default and is what the test suite exercises.
pub trait GpuTopologyProvider: Send + Sync {
    /// The currently active CUDA device index for this process, if any.
    fn active_device_index(&self) -> Option<u32>;

    /// PCI bus address (e.g. `0000:3b:00.0`) of the given device index.
    fn device_pci_address(&self, index: u32) -> Option<String>;
}

/// Reads `ASTATE_ACTIVE_GPU_INDEX` / `ASTATE_GPU_PCI_ADDRESS_<index>` from
/// the environment. Used when no real GPU runtime binding is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvGpuTopologyProvider;

impl GpuTopologyProvider for EnvGpuTopologyProvider {
    fn active_device_index(&self) -> Option<u32> {
        env::var("ASTATE_ACTIVE_GPU_INDEX")
            .ok()
            .and_then(|v| v.trim().parse::<i32>().ok())
            .filter(|&d| d >= 0)
            .map(|d| d as u32)
    }

    fn device_pci_address(&self, index: u32) -> Option<String> {
        env::var(format!("ASTATE_GPU_PCI_ADDRESS_{index}")).ok()
    }
}

/// A process with no GPU visible at all (e.g. a pure CPU inference host).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGpuTopologyProvider;

impl GpuTopologyProvider for NoGpuTopologyProvider {
    fn active_device_index(&self) -> Option<u32> {
        None
    }

    fn device_pci_address(&self, _index: u32) -> Option<String> {
        None
    }
}
