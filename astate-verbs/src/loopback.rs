//! An in-process backend that performs the one-sided copy directly
//! instead of going over a real NIC.
//!
//! This is the default backend (no `ibverbs` feature required) and
//! stands in for a UCX-style software transport the way the pack's
//! `rdma-transport` example falls back from RDMA to TCP when no RDMA
//! hardware is present — here the fallback goes all the way to a direct
//! memory copy, which is sufficient for same-host testing and for
//! callers that don't have RDMA hardware at all.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::{debug, trace};

use crate::{
    BackendConfig, BackendSetupConfig, InstanceId, MemType, MrHandle, OpHandle, TransferConfig,
    TransferRequest, TransferStatus, VerbsContext, VerbsError,
};

struct RegisteredRegion {
    len: usize,
    mem_type: MemType,
}

pub struct LoopbackContext {
    instance_id: InstanceId,
    config: BackendConfig,
    regions: Mutex<HashMap<u64, RegisteredRegion>>,
    completed_ops: Mutex<HashMap<u64, TransferStatus>>,
    next_op_id: AtomicU64,
    transfer_count: AtomicU64,
    bytes_transferred: AtomicU64,
}

/// Creates a loopback context. Never fails: there is no hardware to
/// probe.
pub fn setup(config: BackendSetupConfig) -> Result<Box<dyn VerbsContext>, VerbsError> {
    let instance_id = InstanceId(hash_endpoint(&config.local_host, config.local_port));
    Ok(Box::new(LoopbackContext {
        instance_id,
        config: BackendConfig {
            listener_port: config.local_port,
            device_pattern: config.device_pattern,
            local_host: config.local_host,
        },
        regions: Mutex::new(HashMap::new()),
        completed_ops: Mutex::new(HashMap::new()),
        next_op_id: AtomicU64::new(1),
        transfer_count: AtomicU64::new(0),
        bytes_transferred: AtomicU64::new(0),
    }))
}

fn hash_endpoint(host: &str, port: u16) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    host.hash(&mut hasher);
    port.hash(&mut hasher);
    hasher.finish()
}

impl VerbsContext for LoopbackContext {
    fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    fn config_mut(&mut self) -> &mut BackendConfig {
        &mut self.config
    }

    fn setup_rpc_server(&mut self) -> Result<(), VerbsError> {
        // nothing to bind: the loopback backend has no real listener
        debug!(port = self.config.listener_port, "loopback listener ready");
        Ok(())
    }

    fn query_instance_id(&self, host: &str, port: u16) -> Result<InstanceId, VerbsError> {
        if host.starts_with("unreachable") {
            return Err(VerbsError::ResolutionFailed {
                host: host.to_string(),
                port,
                reason: "simulated unreachable peer".to_string(),
            });
        }
        Ok(InstanceId(hash_endpoint(host, port)))
    }

    fn register_ram(&self, addr: u64, len: usize, _numa: i32) -> Result<MrHandle, VerbsError> {
        self.register(addr, len, MemType::Ram)
    }

    fn register_vram(&self, addr: u64, len: usize, _gpu_id: i32) -> Result<MrHandle, VerbsError> {
        self.register(addr, len, MemType::Vram)
    }

    fn deregister(&self, mr: MrHandle) -> bool {
        self.regions.lock().unwrap().remove(&mr.0).is_some()
    }

    fn exec_transfer(&self, req: &TransferRequest, _conf: &TransferConfig) -> Option<OpHandle> {
        if req.length == 0 || req.local_addr == 0 || req.remote_addr == 0 {
            return None;
        }

        // SAFETY: the caller (the transport engine) guarantees both
        // addresses are valid for `length` bytes and non-overlapping for
        // the duration of this call (spec §3 invariant 2 / §5 ordering
        // guarantees). This is the loopback stand-in for an RDMA
        // READ/WRITE actually touching memory.
        let status = unsafe {
            match req.opcode {
                crate::TransferOpcode::Write => {
                    std::ptr::copy_nonoverlapping(
                        req.local_addr as *const u8,
                        req.remote_addr as *mut u8,
                        req.length,
                    );
                    TransferStatus::Success
                }
                crate::TransferOpcode::Read => {
                    std::ptr::copy_nonoverlapping(
                        req.remote_addr as *const u8,
                        req.local_addr as *mut u8,
                        req.length,
                    );
                    TransferStatus::Success
                }
            }
        };

        self.transfer_count.fetch_add(1, Ordering::Relaxed);
        self.bytes_transferred
            .fetch_add(req.length as u64, Ordering::Relaxed);

        let op_id = self.next_op_id.fetch_add(1, Ordering::Relaxed);
        self.completed_ops.lock().unwrap().insert(op_id, status);
        trace!(op_id, length = req.length, "loopback transfer completed");
        Some(OpHandle(op_id))
    }

    fn transfer_result(&self, op: OpHandle) -> TransferStatus {
        self.completed_ops
            .lock()
            .unwrap()
            .get(&op.0)
            .copied()
            .unwrap_or(TransferStatus::Failed)
    }

    fn release_op(&self, op: OpHandle) {
        self.completed_ops.lock().unwrap().remove(&op.0);
    }

    fn print_perf(&self) {
        tracing::info!(
            transfers = self.transfer_count.load(Ordering::Relaxed),
            bytes = self.bytes_transferred.load(Ordering::Relaxed),
            "loopback perf"
        );
    }

    fn clean(&self) {
        // nothing to tear down: no listener was bound, no thread was
        // spawned. Clearing the maps just frees memory a bit earlier.
        self.regions.lock().unwrap().clear();
        self.completed_ops.lock().unwrap().clear();
        debug!("loopback context cleaned");
    }
}

impl LoopbackContext {
    fn register(&self, addr: u64, len: usize, mem_type: MemType) -> Result<MrHandle, VerbsError> {
        if addr == 0 || len == 0 {
            return Err(VerbsError::RegistrationFailed(
                "null address or zero length".to_string(),
            ));
        }
        self.regions
            .lock()
            .unwrap()
            .insert(addr, RegisteredRegion { len, mem_type });
        Ok(MrHandle(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Box<dyn VerbsContext> {
        setup(BackendSetupConfig {
            device_pattern: None,
            local_host: "127.0.0.1".to_string(),
            local_port: 19001,
        })
        .unwrap()
    }

    #[test]
    fn test_register_and_deregister() {
        let ctx = ctx();
        let buf = vec![0u8; 16];
        let addr = buf.as_ptr() as u64;
        let mr = ctx.register_ram(addr, 16, -1).unwrap();
        assert!(ctx.deregister(mr));
        assert!(!ctx.deregister(mr), "second deregister must return false");
    }

    #[test]
    fn test_write_copies_bytes() {
        let ctx = ctx();
        let src = vec![7u8; 8];
        let mut dst = vec![0u8; 8];

        let req = TransferRequest {
            opcode: crate::TransferOpcode::Write,
            local_addr: src.as_ptr() as u64,
            length: 8,
            remote_addr: dst.as_mut_ptr() as u64,
            remote_instance: ctx.instance_id(),
        };
        let conf = TransferConfig {
            pollers: 4,
            chunk_size: 1024 * 1024,
            timeout_ms: -1,
        };

        let op = ctx.exec_transfer(&req, &conf).expect("handle");
        assert_eq!(ctx.transfer_result(op), TransferStatus::Success);
        ctx.release_op(op);
        assert_eq!(dst, vec![7u8; 8]);
    }

    #[test]
    fn test_zero_length_yields_no_handle() {
        let ctx = ctx();
        let req = TransferRequest {
            opcode: crate::TransferOpcode::Write,
            local_addr: 1,
            length: 0,
            remote_addr: 2,
            remote_instance: ctx.instance_id(),
        };
        let conf = TransferConfig {
            pollers: 4,
            chunk_size: 1024 * 1024,
            timeout_ms: -1,
        };
        assert!(ctx.exec_transfer(&req, &conf).is_none());
    }

    #[test]
    fn test_unreachable_host_fails_resolution() {
        let ctx = ctx();
        assert!(ctx.query_instance_id("unreachable-peer", 1).is_err());
    }

    #[test]
    fn test_clean_drops_registered_regions() {
        let ctx = ctx();
        let buf = vec![0u8; 16];
        let mr = ctx.register_ram(buf.as_ptr() as u64, 16, -1).unwrap();
        ctx.clean();
        assert!(!ctx.deregister(mr), "clean must have already cleared the region");
    }
}
