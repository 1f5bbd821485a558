//! RDMA device selection: by GPU PCI topology distance, or by rank.

use crate::gpu::GpuTopologyProvider;
use crate::sysfs;
use tracing::{info, warn};

/// Outcome of a device selection pass, kept around for logging/diagnostics
/// rather than discarded once the name list is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSelection {
    pub devices: Vec<String>,
    /// NUMA node of `devices[0]`, or -1 if unknown/empty.
    pub rdma_numa_node: i32,
    pub strategy: SelectionStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    ByGpuTopology { gpu_index: u32 },
    ByRank { rank: u32 },
}

impl DeviceSelection {
    fn from_devices(devices: Vec<String>, strategy: SelectionStrategy) -> Self {
        let rdma_numa_node = devices
            .first()
            .map(|d| sysfs::read_numa_node(d))
            .unwrap_or(-1);
        Self {
            devices,
            rdma_numa_node,
            strategy,
        }
    }
}

/// Select up to `max` RDMA devices for this process: by GPU PCI topology
/// if a GPU runtime reports an active device, otherwise by rank. Never
/// fails — an unavailable GPU topology falls back to rank-based selection
/// (logged, not fatal), and an empty result is logged as a warning, never
/// treated as an error (the backend uses its own default in that case).
pub fn select_devices(
    gpu: &dyn GpuTopologyProvider,
    rank: u32,
    max: usize,
) -> DeviceSelection {
    let available = sysfs::list_ib_devices();

    let selection = match gpu.active_device_index() {
        Some(gpu_index) => {
            match select_rdma_devices(gpu, gpu_index, max, &available) {
                Some(devices) => DeviceSelection::from_devices(
                    devices,
                    SelectionStrategy::ByGpuTopology { gpu_index },
                ),
                None => {
                    warn!(
                        gpu_index,
                        "GPU topology selection failed, falling back to rank-based selection"
                    );
                    DeviceSelection::from_devices(
                        select_rdma_devices_by_rank(rank, max, &available),
                        SelectionStrategy::ByRank { rank },
                    )
                }
            }
        }
        None => DeviceSelection::from_devices(
            select_rdma_devices_by_rank(rank, max, &available),
            SelectionStrategy::ByRank { rank },
        ),
    };

    if selection.devices.is_empty() {
        warn!("no RDMA device pattern selected; backend will use its default");
    } else {
        info!(
            devices = ?selection.devices,
            numa_node = selection.rdma_numa_node,
            "selected RDMA devices"
        );
    }

    selection
}

/// Returns the `max` devices closest to `gpu` in PCI topology, or `None`
/// if the GPU's PCI address can't be resolved (caller falls back to
/// rank-based selection).
pub fn select_rdma_devices(
    gpu: &dyn GpuTopologyProvider,
    gpu_index: u32,
    max: usize,
    devices: &[String],
) -> Option<Vec<String>> {
    if max == 0 || devices.is_empty() {
        return Some(Vec::new());
    }
    let gpu_pci = gpu.device_pci_address(gpu_index)?;

    let mut scored: Vec<(u32, &String)> = devices
        .iter()
        .map(|d| (pci_distance(&gpu_pci, sysfs::ib_device_pci_slot(d).as_deref()), d))
        .collect();

    // stable sort: ties break by natural device name order (devices is
    // already naturally sorted by the caller)
    scored.sort_by_key(|(dist, _)| *dist);

    Some(scored.into_iter().take(max).map(|(_, d)| d.clone()).collect())
}

/// Deterministically partitions `devices` across ranks: equal ranks yield
/// equal selections; a contiguous `max`-sized window starting at an
/// offset derived from `rank` so that different ranks on the same
/// machine prefer disjoint windows when `max` divides the device count.
pub fn select_rdma_devices_by_rank(rank: u32, max: usize, devices: &[String]) -> Vec<String> {
    let n = devices.len();
    if n == 0 || max == 0 {
        return Vec::new();
    }
    let start = (rank as usize).wrapping_mul(max) % n;
    (0..max.min(n))
        .map(|i| devices[(start + i) % n].clone())
        .collect()
}

/// PCI "distance" heuristic between a GPU's PCI address and an RDMA
/// device's: same bus number is closest, same domain only is further,
/// anything else (or unknown) is furthest. Lower is closer.
fn pci_distance(gpu_pci: &str, rdma_pci: Option<&str>) -> u32 {
    let Some(rdma_pci) = rdma_pci else {
        return u32::MAX;
    };
    let (Some(gpu_parts), Some(rdma_parts)) = (split_pci_addr(gpu_pci), split_pci_addr(rdma_pci))
    else {
        return u32::MAX;
    };

    if gpu_parts.1 == rdma_parts.1 {
        0 // same PCI bus
    } else if gpu_parts.0 == rdma_parts.0 {
        1 // same PCI domain, different bus
    } else {
        2
    }
}

/// Splits `"0000:3b:00.0"` into `(domain, bus)` = `("0000", "3b")`.
fn split_pci_addr(addr: &str) -> Option<(&str, &str)> {
    let mut parts = addr.splitn(3, ':');
    let domain = parts.next()?;
    let bus = parts.next()?;
    Some((domain, bus))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn devs(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_rank_selection_is_deterministic() {
        let devices = devs(&["mlx5_0", "mlx5_1", "mlx5_2", "mlx5_3"]);
        let a = select_rdma_devices_by_rank(1, 2, &devices);
        let b = select_rdma_devices_by_rank(1, 2, &devices);
        assert_eq!(a, b);
    }

    #[test]
    fn test_rank_selection_avoids_collision_when_divisible() {
        let devices = devs(&["mlx5_0", "mlx5_1", "mlx5_2", "mlx5_3"]);
        let r0 = select_rdma_devices_by_rank(0, 2, &devices);
        let r1 = select_rdma_devices_by_rank(1, 2, &devices);
        assert_ne!(r0, r1);
        assert_eq!(r0, devs(&["mlx5_0", "mlx5_1"]));
        assert_eq!(r1, devs(&["mlx5_2", "mlx5_3"]));
    }

    #[test]
    fn test_rank_selection_empty_devices() {
        assert_eq!(select_rdma_devices_by_rank(0, 2, &[]), Vec::<String>::new());
    }

    #[test]
    fn test_rank_selection_max_zero() {
        let devices = devs(&["mlx5_0"]);
        assert_eq!(select_rdma_devices_by_rank(0, 0, &devices), Vec::<String>::new());
    }

    #[test]
    fn test_pci_distance_same_bus_closest() {
        assert_eq!(pci_distance("0000:3b:00.0", Some("0000:3b:00.1")), 0);
        assert_eq!(pci_distance("0000:3b:00.0", Some("0000:5e:00.0")), 1);
        assert_eq!(pci_distance("0000:3b:00.0", Some("0001:5e:00.0")), 2);
        assert_eq!(pci_distance("0000:3b:00.0", None), u32::MAX);
    }

    struct FixedGpu {
        index: u32,
        pci: Option<String>,
    }
    impl GpuTopologyProvider for FixedGpu {
        fn active_device_index(&self) -> Option<u32> {
            Some(self.index)
        }
        fn device_pci_address(&self, index: u32) -> Option<String> {
            if index == self.index {
                self.pci.clone()
            } else {
                None
            }
        }
    }

    #[test]
    fn test_select_rdma_devices_falls_back_without_pci_address() {
        let gpu = FixedGpu {
            index: 0,
            pci: None,
        };
        let devices = devs(&["mlx5_0"]);
        assert!(select_rdma_devices(&gpu, 0, 1, &devices).is_none());
    }

    #[test]
    fn test_select_devices_empty_is_not_fatal() {
        let gpu = crate::gpu::NoGpuTopologyProvider;
        let selection = select_devices(&gpu, 0, 4);
        // on a host with no /sys/class/infiniband this is simply empty
        assert!(selection.devices.len() <= 4);
    }
}
