//! NUMA pinning: bind the calling thread's scheduling and memory
//! allocation policy to the primary NIC's NUMA node.

use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::sysfs;

/// Binds the *calling* thread's CPU affinity to the CPUs of `node`, and
/// sets a best-effort `MPOL_BIND` memory policy for the same node.
/// Failures are logged and otherwise ignored: topology init failure must
/// never be fatal to the engine (spec §4.1).
pub fn pin_to_node(node: i32) {
    if node < 0 {
        debug!("no NUMA node to pin to, skipping");
        return;
    }

    let cpus = sysfs::node_cpulist(node);
    if cpus.is_empty() {
        warn!(node, "no CPUs found for NUMA node, skipping affinity pin");
    } else if let Err(e) = set_cpu_affinity(&cpus) {
        warn!(node, error = %e, "failed to set CPU affinity");
    }

    if let Err(e) = bind_memory_policy(node) {
        warn!(node, error = %e, "failed to set memory policy");
    }
}

fn set_cpu_affinity(cpus: &[usize]) -> nix::Result<()> {
    let mut set = CpuSet::new();
    for &cpu in cpus {
        if cpu < CpuSet::count() {
            set.set(cpu)?;
        }
    }
    // pid 0 means "the calling thread" under Linux's sched_setaffinity(2)
    sched_setaffinity(Pid::from_raw(0), &set)
}

const MPOL_BIND: i32 = 2;

/// Sets this thread's default memory allocation policy to bind to
/// `node` via the raw `set_mempolicy` syscall (`mbind(2)`'s sibling for
/// a thread's default policy rather than one mapped region). `nix` has
/// no safe wrapper for it; the unsafety here is confined to building a
/// correctly-sized nodemask and invoking the syscall per
/// `set_mempolicy(2)`.
fn bind_memory_policy(node: i32) -> std::io::Result<()> {
    let nodemask_bits = std::mem::size_of::<libc::c_ulong>() * 8;
    let words = (node as usize / nodemask_bits) + 1;
    let mut mask = vec![0 as libc::c_ulong; words];
    mask[node as usize / nodemask_bits] |= 1 << (node as usize % nodemask_bits);

    // SAFETY: `mask` is sized to hold bit `node`; `maxnode` matches the
    // mask's bit length as `set_mempolicy(2)` requires.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_set_mempolicy,
            MPOL_BIND,
            mask.as_ptr(),
            (words * nodemask_bits) as libc::c_ulong,
        )
    };

    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_to_node_negative_is_noop() {
        // must not panic and must not touch affinity
        pin_to_node(-1);
    }
}
