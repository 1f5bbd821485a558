//! sysfs utilities for RDMA device and PCI topology discovery

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

pub const IB_CLASS: &str = "/sys/class/infiniband";
pub const PCI_DEVICES: &str = "/sys/bus/pci/devices";
pub const NODE_CLASS: &str = "/sys/devices/system/node";

/// Read a sysfs file as a trimmed string; empty/missing files yield `None`.
pub fn read_sysfs_string(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Read `/sys/class/infiniband/<dev>/device/numa_node`. Per spec §4.1/§6:
/// ASCII integer, whitespace tolerated; missing/unreadable/negative is
/// reported as unknown (-1), never an error.
pub fn read_numa_node(dev: &str) -> i32 {
    let path = Path::new(IB_CLASS).join(dev).join("device/numa_node");
    match read_sysfs_string(&path).and_then(|s| s.parse::<i32>().ok()) {
        Some(n) if n >= 0 => n,
        _ => {
            debug!(device = dev, "numa_node unknown, defaulting to -1");
            -1
        }
    }
}

/// Enumerate RDMA device names under `/sys/class/infiniband`, naturally
/// sorted (mlx5_0 before mlx5_1 before mlx5_10).
pub fn list_ib_devices() -> Vec<String> {
    let ib_path = Path::new(IB_CLASS);
    if !ib_path.exists() {
        return Vec::new();
    }

    let mut names: Vec<String> = match fs::read_dir(ib_path) {
        Ok(entries) => entries
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect(),
        Err(_) => return Vec::new(),
    };

    names.sort_by(|a, b| natural_sort_key(a).cmp(&natural_sort_key(b)));
    names
}

/// Extract the PCI slot address (e.g. `0000:3b:00.0`) of an RDMA device by
/// following its `device` symlink.
pub fn ib_device_pci_slot(dev: &str) -> Option<String> {
    let device_path = Path::new(IB_CLASS).join(dev).join("device");
    get_pci_slot(&device_path)
}

fn get_pci_slot(device_path: &Path) -> Option<String> {
    fs::read_link(device_path)
        .ok()
        .and_then(|target| target.file_name().map(|s| s.to_string_lossy().to_string()))
}

/// List the CPUs assigned to a NUMA node from
/// `/sys/devices/system/node/node<N>/cpulist` (a range list like
/// `0-3,8-11`).
pub fn node_cpulist(node: i32) -> Vec<usize> {
    if node < 0 {
        return Vec::new();
    }
    let path = PathBuf::from(NODE_CLASS)
        .join(format!("node{node}"))
        .join("cpulist");
    let Some(raw) = read_sysfs_string(&path) else {
        return Vec::new();
    };
    parse_cpu_range_list(&raw)
}

fn parse_cpu_range_list(s: &str) -> Vec<usize> {
    let mut cpus = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((lo, hi)) = part.split_once('-') {
            if let (Ok(lo), Ok(hi)) = (lo.parse::<usize>(), hi.parse::<usize>()) {
                cpus.extend(lo..=hi);
            }
        } else if let Ok(cpu) = part.parse::<usize>() {
            cpus.push(cpu);
        }
    }
    cpus
}

/// Natural sort key for device names (e.g. `mlx5_2` < `mlx5_10`).
pub fn natural_sort_key(s: &str) -> (String, u32) {
    let mut prefix = String::new();
    let mut num_str = String::new();

    for c in s.chars() {
        if c.is_ascii_digit() {
            num_str.push(c);
        } else if num_str.is_empty() {
            prefix.push(c);
        } else {
            break;
        }
    }

    let num = num_str.parse().unwrap_or(0);
    (prefix, num)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_natural_sort_key() {
        assert!(natural_sort_key("mlx5_2") < natural_sort_key("mlx5_10"));
        assert!(natural_sort_key("ibp0") < natural_sort_key("ibp1"));
    }

    #[test]
    fn test_parse_cpu_range_list() {
        assert_eq!(parse_cpu_range_list("0-3,8-11"), vec![0, 1, 2, 3, 8, 9, 10, 11]);
        assert_eq!(parse_cpu_range_list("5"), vec![5]);
        assert_eq!(parse_cpu_range_list(""), Vec::<usize>::new());
    }

    #[test]
    fn test_read_numa_node_missing_device() {
        // a device that can't exist on any real system
        assert_eq!(read_numa_node("__astate_test_missing_dev__"), -1);
    }
}
