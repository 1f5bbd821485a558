//! The public transport engine (spec §4.4, §4.6–§4.8): `Start`, `Stop`,
//! `RegisterMemory`, `DeregisterMemory`, `Send`, `Receive`,
//! `AsyncSend`/`AsyncReceive`, and the accessor surface. Composes the
//! topology selector, the verbs backend, the listener bootstrapper,
//! the retry policy, and the perf sampler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{error, info, warn};

use astate_topology::GpuTopologyManager;
use astate_verbs::{
    BackendSetupConfig, MrHandle, TransferConfig, TransferOpcode, TransferRequest, TransferStatus,
    VerbsContext,
};

use crate::error::TransportError;
use crate::options::{Options, ParallelConfig};
use crate::perf_sampler::{now_ms, PerfSampler};
use crate::retry::{retry, CountingAndSleepRetry};
use crate::rpc_listener;

/// The post-`Start` warm-up sleep (spec §5): the current backend needs
/// this long before its listener reliably accepts connections. Load
/// bearing, not decorative — revisit once a backend exposes an async
/// readiness signal (spec §9).
const ENGINE_WARMUP_MS: u64 = 1000;

const TRANSFER_CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    New,
    Starting,
    Running,
    Stopping,
    Terminated,
}

pub struct TransportEngine {
    options: Options,
    topology: GpuTopologyManager,
    state: Mutex<LifecycleState>,
    ctx: Mutex<Option<Arc<dyn VerbsContext>>>,
    sampler: Mutex<Option<PerfSampler>>,
    bind_port: AtomicI32,
    last_send_receive_time_ms: Arc<AtomicI64>,
    perf_interval_ms: Arc<AtomicU64>,
    rdma_numa_node: Mutex<i32>,
    registrations: Mutex<HashMap<(u64, usize), MrHandle>>,
}

impl TransportEngine {
    pub fn new(options: Options) -> Self {
        let perf_interval_ms = Arc::new(AtomicU64::new(options.perf_stats_interval_ms));
        TransportEngine {
            topology: GpuTopologyManager::default(),
            state: Mutex::new(LifecycleState::New),
            ctx: Mutex::new(None),
            sampler: Mutex::new(None),
            bind_port: AtomicI32::new(-1),
            last_send_receive_time_ms: Arc::new(AtomicI64::new(0)),
            perf_interval_ms,
            rdma_numa_node: Mutex::new(-1),
            registrations: Mutex::new(HashMap::new()),
            options,
        }
    }

    /// Brings the engine from `New` to `Running`. Returns `false` on any
    /// setup or bind failure, leaving the engine back in `New` so a
    /// caller may retry with adjusted options.
    pub fn start(&self, parallel: ParallelConfig) -> bool {
        let selection = self
            .topology
            .select(parallel.role_rank, self.options.max_rdma_devices);

        let setup_config = BackendSetupConfig {
            device_pattern: selection.devices.first().cloned(),
            local_host: self.options.local_host.clone(),
            local_port: self.options.local_port,
        };

        let backend_ctx = match setup_backend(setup_config) {
            Ok(ctx) => ctx,
            Err(e) => {
                error!(error = %e, "backend setup failed");
                return false;
            }
        };

        self.start_with_backend_inner(selection, backend_ctx)
    }

    /// Test/assembly seam: brings the engine up against an
    /// already-constructed backend context instead of going through
    /// [`setup_backend`]'s feature-gated selection. This is how the
    /// §8 scenarios drive a mock backend through the real bring-up and
    /// retry paths rather than reimplementing them.
    pub fn start_with_backend(
        &self,
        parallel: ParallelConfig,
        backend_ctx: Box<dyn VerbsContext>,
    ) -> bool {
        let selection = self
            .topology
            .select(parallel.role_rank, self.options.max_rdma_devices);
        self.start_with_backend_inner(selection, backend_ctx)
    }

    fn start_with_backend_inner(
        &self,
        selection: astate_topology::DeviceSelection,
        mut backend_ctx: Box<dyn VerbsContext>,
    ) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if *state != LifecycleState::New {
                warn!(?state, "Start called outside the New state");
                return false;
            }
            *state = LifecycleState::Starting;
        }

        *self.rdma_numa_node.lock().unwrap() = selection.rdma_numa_node;
        info!(
            devices = ?selection.devices,
            numa_node = selection.rdma_numa_node,
            strategy = ?selection.strategy,
            "device selection complete"
        );

        let bound_port = match rpc_listener::bring_up(backend_ctx.as_mut(), &self.options) {
            Ok(port) => port,
            Err(e) => {
                error!(error = %e, "listener bring-up failed");
                *self.state.lock().unwrap() = LifecycleState::New;
                return false;
            }
        };

        if self.options.enable_numa_allocation {
            self.topology.pin_to_node(selection.rdma_numa_node);
        }

        let ctx: Arc<dyn VerbsContext> = Arc::from(backend_ctx);
        self.bind_port.store(bound_port as i32, Ordering::Relaxed);
        *self.ctx.lock().unwrap() = Some(ctx.clone());

        if self.options.enable_perf_metrics {
            let sampler = PerfSampler::start(
                ctx,
                self.perf_interval_ms.clone(),
                self.last_send_receive_time_ms.clone(),
            );
            *self.sampler.lock().unwrap() = Some(sampler);
        }

        *self.state.lock().unwrap() = LifecycleState::Running;

        info!(warmup_ms = ENGINE_WARMUP_MS, "warming up before returning");
        std::thread::sleep(Duration::from_millis(ENGINE_WARMUP_MS));

        true
    }

    /// Idempotent: a `Stop` outside `Running` (never started, or already
    /// stopped) is a no-op. Joins the perf thread before releasing the
    /// backend context (spec §4.7 hard ordering invariant).
    pub fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state != LifecycleState::Running {
                return;
            }
            *state = LifecycleState::Stopping;
        }

        if let Some(sampler) = self.sampler.lock().unwrap().take() {
            sampler.stop();
        }

        if let Some(ctx) = self.ctx.lock().unwrap().take() {
            ctx.clean();
        }
        *self.state.lock().unwrap() = LifecycleState::Terminated;
    }

    pub fn is_running(&self) -> bool {
        *self.state.lock().unwrap() == LifecycleState::Running
    }

    /// `is_vram=false` registers against the engine's primary NIC NUMA
    /// node, not `gpu_or_numa` — that argument exists for interface
    /// parity with the VRAM path (spec §4.6).
    pub fn register_memory(&self, addr: u64, len: usize, is_vram: bool, gpu_or_numa: i32) -> bool {
        let ctx = match self.current_ctx() {
            Some(ctx) => ctx,
            None => {
                warn!("RegisterMemory called without a running backend context");
                return false;
            }
        };

        let result = if is_vram {
            ctx.register_vram(addr, len, gpu_or_numa)
        } else {
            let numa_node = *self.rdma_numa_node.lock().unwrap();
            ctx.register_ram(addr, len, numa_node)
        };

        match result {
            Ok(mr) => {
                self.registrations.lock().unwrap().insert((addr, len), mr);
                true
            }
            Err(e) => {
                error!(addr, len, error = %e, "memory registration failed");
                false
            }
        }
    }

    /// Never raises. Deregistering an unknown `{addr,len}` pair returns
    /// `false` without touching engine state (spec §4.6 invariant).
    pub fn deregister_memory(&self, addr: u64, len: usize) -> bool {
        let ctx = match self.current_ctx() {
            Some(ctx) => ctx,
            None => return false,
        };
        match self.registrations.lock().unwrap().remove(&(addr, len)) {
            Some(mr) => ctx.deregister(mr),
            None => false,
        }
    }

    pub fn send(&self, local_addr: u64, length: usize, host: &str, port: u16, remote_addr: u64) -> bool {
        self.transfer(
            TransferOpcode::Write,
            local_addr,
            length,
            host,
            port,
            remote_addr,
            self.options.write_timeout_ms,
            self.options.send_retry_count,
            self.options.send_retry_sleep_ms,
            "Send",
        )
    }

    pub fn receive(&self, local_addr: u64, length: usize, host: &str, port: u16, remote_addr: u64) -> bool {
        self.transfer(
            TransferOpcode::Read,
            local_addr,
            length,
            host,
            port,
            remote_addr,
            self.options.read_timeout_ms,
            self.options.receive_retry_count,
            self.options.receive_retry_sleep_ms,
            "Receive",
        )
    }

    /// Declared, not implemented (spec §4.4): async semantics belong
    /// above one-sided transfers, not below them.
    pub fn async_send(&self, _local_addr: u64, _length: usize, _host: &str, _port: u16, _remote_addr: u64) -> Result<(), TransportError> {
        Err(TransportError::NotImplemented("AsyncSend"))
    }

    pub fn async_receive(&self, _local_addr: u64, _length: usize, _host: &str, _port: u16, _remote_addr: u64) -> Result<(), TransportError> {
        Err(TransportError::NotImplemented("AsyncReceive"))
    }

    /// Meaningful only after a successful `Start`; `-1` otherwise.
    pub fn get_bind_port(&self) -> i32 {
        self.bind_port.load(Ordering::Relaxed)
    }

    pub fn get_write_timeout(&self) -> i64 {
        self.options.write_timeout_ms
    }

    pub fn get_read_timeout(&self) -> i64 {
        self.options.read_timeout_ms
    }

    pub fn get_local_server_name(&self) -> String {
        format!("{}:{}", self.options.local_host, self.get_bind_port())
    }

    pub fn get_meta_addr(&self) -> Option<&str> {
        self.options.meta_service_address.as_deref()
    }

    fn current_ctx(&self) -> Option<Arc<dyn VerbsContext>> {
        self.ctx.lock().unwrap().clone()
    }

    #[allow(clippy::too_many_arguments)]
    fn transfer(
        &self,
        opcode: TransferOpcode,
        local_addr: u64,
        length: usize,
        host: &str,
        port: u16,
        remote_addr: u64,
        timeout_ms: i64,
        retry_count: u32,
        retry_sleep_ms: u64,
        name: &str,
    ) -> bool {
        // Preconditions, validated in order (spec §4.4): these are
        // argument errors and must not consume a backend call.
        let ctx = match self.current_ctx() {
            Some(ctx) => ctx,
            None => {
                warn!(name, "argument error: backend context not initialized");
                return false;
            }
        };
        if local_addr == 0 || length == 0 {
            warn!(name, local_addr, length, "argument error: null buffer or zero length");
            return false;
        }
        if remote_addr == 0 {
            warn!(name, "argument error: missing remote virtual address");
            return false;
        }

        self.last_send_receive_time_ms
            .store(now_ms(), Ordering::Relaxed);

        let host = host.to_string();
        let pollers = self.options.rdma_num_pollers;
        let policy = CountingAndSleepRetry {
            attempts: retry_count,
            sleep_ms: retry_sleep_ms,
        };

        let result = retry(name, &policy, |_attempt| {
            transfer_once(
                ctx.as_ref(),
                opcode,
                local_addr,
                length,
                &host,
                port,
                remote_addr,
                timeout_ms,
                pollers,
            )
        });

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(name, remote_host = %host, remote_port = port, error = %e, "transfer failed");
                false
            }
        }
    }
}

/// One attempt of the per-call procedure (spec §4.4 steps 1–3): resolve
/// the peer, submit the op, and release its handle on every path.
#[allow(clippy::too_many_arguments)]
fn transfer_once(
    ctx: &dyn VerbsContext,
    opcode: TransferOpcode,
    local_addr: u64,
    length: usize,
    host: &str,
    port: u16,
    remote_addr: u64,
    timeout_ms: i64,
    pollers: u32,
) -> Result<(), TransportError> {
    let remote_instance = ctx
        .query_instance_id(host, port)
        .map_err(|e| TransportError::TransientTransferError(e.to_string()))?;

    let req = TransferRequest {
        opcode,
        local_addr,
        length,
        remote_addr,
        remote_instance,
    };
    let conf = TransferConfig {
        pollers,
        chunk_size: TRANSFER_CHUNK_SIZE,
        timeout_ms,
    };

    match ctx.exec_transfer(&req, &conf) {
        None => Err(TransportError::TransientTransferError(
            "exec_transfer returned no handle".to_string(),
        )),
        Some(op) => {
            let status = ctx.transfer_result(op);
            ctx.release_op(op);
            match status {
                TransferStatus::Success => Ok(()),
                TransferStatus::Failed => Err(TransportError::TransientTransferError(
                    "backend reported failure".to_string(),
                )),
            }
        }
    }
}

#[cfg(feature = "ibverbs")]
fn setup_backend(
    config: BackendSetupConfig,
) -> Result<Box<dyn VerbsContext>, astate_verbs::VerbsError> {
    astate_verbs::ibverbs_backend::setup(config)
}

#[cfg(not(feature = "ibverbs"))]
fn setup_backend(
    config: BackendSetupConfig,
) -> Result<Box<dyn VerbsContext>, astate_verbs::VerbsError> {
    astate_verbs::loopback::setup(config)
}
