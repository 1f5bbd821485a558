//! Real RDMA device discovery and control-plane bring-up on top of the
//! `sideway` ibverbs wrapper — the same crate `hca-probe`/`roce-detector`
//! use to enumerate HCAs, query port state, and walk the GID table.
//!
//! Scope note: this module wires up genuine device/port/GID discovery
//! and a real TCP control-plane listener for `setup_rpc_server` /
//! `query_instance_id` (spec §4.2/§4.3), including a background thread
//! that accepts connections and answers with this context's instance
//! id. Posting actual RDMA READ/WRITE work requests against a queue
//! pair needs `sideway`'s PD/MR/QP builder surface, which wasn't part
//! of the retrieved reference material for this port; until that
//! wiring lands, the data path for this backend executes through the
//! same safe copy primitive the [`crate::loopback`] backend uses,
//! gated on a live, discovered RDMA device rather than skipping
//! discovery altogether. See `DESIGN.md`.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use sideway::ibverbs::device;
use sideway::ibverbs::device_context::PortState;
use tracing::{debug, info, warn};

use crate::{
    BackendConfig, BackendSetupConfig, InstanceId, MemType, MrHandle, OpHandle, TransferConfig,
    TransferRequest, TransferStatus, VerbsContext, VerbsError,
};

/// Control-plane handshake: a peer connects, sends this, and gets the
/// context's instance id back as 8 big-endian bytes.
const HELLO: &[u8] = b"ASTATE_HELLO";
const PEER_READ_TIMEOUT: Duration = Duration::from_secs(5);

struct RegisteredRegion {
    len: usize,
    #[allow(dead_code)]
    mem_type: MemType,
}

pub struct IbverbsContext {
    device_name: Option<String>,
    config: BackendConfig,
    regions: Mutex<HashMap<u64, RegisteredRegion>>,
    completed_ops: Mutex<HashMap<u64, TransferStatus>>,
    next_op_id: AtomicU64,
    listener_running: Arc<AtomicBool>,
    listener_thread: Mutex<Option<JoinHandle<()>>>,
}

/// Opens the first RDMA device matching `config.device_pattern` (empty
/// pattern matches any device) and queries its port state, mirroring
/// `detect_rdma_config` in `hca-probe`. Falls back to a device-less
/// context (still usable for the TCP control plane) if no device is
/// present, logged as a warning rather than a setup failure — topology
/// absence is not fatal to bring-up (spec §4.1).
pub fn setup(config: BackendSetupConfig) -> Result<Box<dyn VerbsContext>, VerbsError> {
    let device_name = match discover_device(config.device_pattern.as_deref()) {
        Ok(name) => name,
        Err(e) => {
            warn!(error = %e, "no RDMA device discovered, continuing without one");
            None
        }
    };

    Ok(Box::new(IbverbsContext {
        device_name,
        config: BackendConfig {
            listener_port: config.local_port,
            device_pattern: config.device_pattern,
            local_host: config.local_host,
        },
        regions: Mutex::new(HashMap::new()),
        completed_ops: Mutex::new(HashMap::new()),
        next_op_id: AtomicU64::new(1),
        listener_running: Arc::new(AtomicBool::new(false)),
        listener_thread: Mutex::new(None),
    }))
}

fn discover_device(pattern: Option<&str>) -> anyhow::Result<Option<String>> {
    let device_list = device::DeviceList::new()?;
    let prefix = pattern.unwrap_or("");

    for dev in &device_list {
        let name = dev.name();
        if !prefix.is_empty() && !name.starts_with(prefix) {
            continue;
        }

        let ctx = dev.open()?;
        let port_attr = ctx.query_port(1)?;
        let active = matches!(port_attr.port_state(), PortState::Active);
        info!(device = name, active, "discovered RDMA device");
        if active {
            return Ok(Some(name.to_string()));
        }
    }

    Ok(None)
}

/// Services one accepted connection: read the hello, reply with the
/// instance id. Malformed/short requests are dropped, not fatal to the
/// listener thread.
fn service_peer(mut stream: TcpStream, instance_id: u64) {
    let _ = stream.set_read_timeout(Some(PEER_READ_TIMEOUT));
    let mut req = [0u8; HELLO.len()];
    if stream.read_exact(&mut req).is_err() || req != *HELLO {
        return;
    }
    let _ = stream.write_all(&instance_id.to_be_bytes());
}

impl VerbsContext for IbverbsContext {
    fn instance_id(&self) -> InstanceId {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        use std::hash::{Hash, Hasher};
        self.config.local_host.hash(&mut hasher);
        self.config.listener_port.hash(&mut hasher);
        InstanceId(hasher.finish())
    }

    fn config_mut(&mut self) -> &mut BackendConfig {
        &mut self.config
    }

    /// Binds the listener and spawns a background thread that accepts
    /// connections and answers each with this context's instance id,
    /// so a peer's `query_instance_id` can actually complete against
    /// it (rather than a bind-only stub nothing ever services).
    fn setup_rpc_server(&mut self) -> Result<(), VerbsError> {
        let addr = format!("0.0.0.0:{}", self.config.listener_port);
        let listener =
            TcpListener::bind(&addr).map_err(|e| VerbsError::ListenerFailed(e.to_string()))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| VerbsError::ListenerFailed(e.to_string()))?;

        let instance_id = self.instance_id().0;
        let running = self.listener_running.clone();
        running.store(true, Ordering::Relaxed);

        let handle = thread::spawn(move || {
            for incoming in listener.incoming() {
                if !running.load(Ordering::Relaxed) {
                    break;
                }
                match incoming {
                    Ok(stream) => service_peer(stream, instance_id),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(20));
                    }
                    Err(e) => {
                        warn!(error = %e, "control-plane accept error");
                        thread::sleep(Duration::from_millis(20));
                    }
                }
            }
        });

        *self.listener_thread.lock().unwrap() = Some(handle);
        debug!(addr, "ibverbs control-plane listener bound and servicing requests");
        Ok(())
    }

    fn query_instance_id(&self, host: &str, port: u16) -> Result<InstanceId, VerbsError> {
        let addr = format!("{host}:{port}");
        let mut stream =
            TcpStream::connect(&addr).map_err(|e| VerbsError::ResolutionFailed {
                host: host.to_string(),
                port,
                reason: e.to_string(),
            })?;
        let _ = stream.set_read_timeout(Some(PEER_READ_TIMEOUT));

        stream
            .write_all(HELLO)
            .map_err(|e| VerbsError::ResolutionFailed {
                host: host.to_string(),
                port,
                reason: e.to_string(),
            })?;

        let mut buf = [0u8; 8];
        stream
            .read_exact(&mut buf)
            .map_err(|e| VerbsError::ResolutionFailed {
                host: host.to_string(),
                port,
                reason: e.to_string(),
            })?;

        Ok(InstanceId(u64::from_be_bytes(buf)))
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
        if self.device_name.is_none() {
            warn!("exec_transfer with no RDMA device discovered");
            return None;
        }

        // SAFETY: same contract as `loopback::LoopbackContext::exec_transfer`
        // — caller-validated non-overlapping, in-bounds addresses.
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

        let op_id = self.next_op_id.fetch_add(1, Ordering::Relaxed);
        self.completed_ops.lock().unwrap().insert(op_id, status);
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
        info!(device = ?self.device_name, "ibverbs perf dump");
    }

    /// Stops the accept thread and joins it. The socket itself is
    /// closed as the thread's `TcpListener` drops on exit.
    fn clean(&self) {
        self.listener_running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.listener_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl IbverbsContext {
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

    #[test]
    fn test_setup_rpc_server_services_query_instance_id() {
        let mut ctx = setup(BackendSetupConfig {
            device_pattern: None,
            local_host: "127.0.0.1".to_string(),
            local_port: 0,
        })
        .unwrap();

        ctx.config_mut().listener_port = 19301;
        ctx.setup_rpc_server().unwrap();

        // give the accept thread a moment to start polling
        thread::sleep(Duration::from_millis(50));

        let resolved = ctx.query_instance_id("127.0.0.1", 19301).unwrap();
        assert_eq!(resolved, ctx.instance_id());

        ctx.clean();
    }
}
