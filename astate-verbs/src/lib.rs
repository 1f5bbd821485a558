//! The narrow capability surface the transport engine depends on (spec
//! §4.2). Everything above this crate talks to a `VerbsContext` trait
//! object; it never sees a concrete verbs library type. Two
//! implementations exist:
//!
//! - [`loopback`]: an in-process, zero-external-dependency backend that
//!   performs the one-sided copy directly. This is the default backend
//!   and is what the engine's test suite exercises.
//! - [`ibverbs_backend`] (feature `ibverbs`): a real RDMA verbs backend
//!   built on the `sideway` crate, the same dependency
//!   `hca-probe`/`roce-detector` use for device discovery.
//!
//! Swapping backends never requires a change above this crate — the
//! engine only constructs a context through [`setup`].

pub mod ibverbs_backend;
pub mod loopback;

use std::fmt;

use thiserror::Error;

/// Opaque remote-peer identifier the backend assigns after a successful
/// `query_instance_id` round trip (spec glossary: "Instance id").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(pub u64);

/// Opaque handle to a registered memory region. Never dereferenced by the
/// engine; the backend alone knows what it points to internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MrHandle(pub u64);

/// Opaque handle to an in-flight (or completed, pending release) transfer
/// operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemType {
    Ram,
    Vram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOpcode {
    Read,
    Write,
}

/// One outstanding one-sided operation. `local_addr`/`remote_addr` are
/// opaque already-resolved virtual addresses (spec §1 non-goal: the core
/// does not own tensor-level addressing).
#[derive(Debug, Clone, Copy)]
pub struct TransferRequest {
    pub opcode: TransferOpcode,
    pub local_addr: u64,
    pub length: usize,
    pub remote_addr: u64,
    pub remote_instance: InstanceId,
}

/// Fixed per-call execution parameters (spec §4.2: polling concurrency
/// hint, chunk size, per-direction timeout). These are engine-chosen
/// constants, not caller-tunable per request.
#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    pub pollers: u32,
    pub chunk_size: usize,
    /// milliseconds; -1 means "wait forever", propagated verbatim to the
    /// backend.
    pub timeout_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Success,
    Failed,
}

/// Mutable pre-bring-up configuration a backend exposes so the listener
/// port can be set before `setup_rpc_server` is called (spec §4.2,
/// §4.3).
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub listener_port: u16,
    pub device_pattern: Option<String>,
    pub local_host: String,
}

/// Inputs to [`setup`]: device selection pattern and the host this
/// process will advertise to peers.
#[derive(Debug, Clone)]
pub struct BackendSetupConfig {
    pub device_pattern: Option<String>,
    pub local_host: String,
    pub local_port: u16,
}

#[derive(Debug, Error)]
pub enum VerbsError {
    #[error("backend setup failed: {0}")]
    SetupFailed(String),
    #[error("listener bring-up failed: {0}")]
    ListenerFailed(String),
    #[error("instance id resolution failed for {host}:{port}: {reason}")]
    ResolutionFailed {
        host: String,
        port: u16,
        reason: String,
    },
    #[error("memory registration failed: {0}")]
    RegistrationFailed(String),
}

/// The capability surface of spec §4.2, minus `setup` itself (each
/// backend exposes its own free `setup` function that *produces* a
/// `VerbsContext`, since in Rust the context is naturally the `Self` the
/// trait methods act on).
pub trait VerbsContext: Send + Sync {
    fn instance_id(&self) -> InstanceId;

    fn config_mut(&mut self) -> &mut BackendConfig;

    fn setup_rpc_server(&mut self) -> Result<(), VerbsError>;

    fn query_instance_id(&self, host: &str, port: u16) -> Result<InstanceId, VerbsError>;

    fn register_ram(&self, addr: u64, len: usize, numa: i32) -> Result<MrHandle, VerbsError>;

    fn register_vram(&self, addr: u64, len: usize, gpu_id: i32) -> Result<MrHandle, VerbsError>;

    /// Never raises; returns `false` for an unknown/already-deregistered
    /// handle (spec §4.6 invariant).
    fn deregister(&self, mr: MrHandle) -> bool;

    /// `None` means the submission itself failed to produce a handle
    /// (spec §4.4 step 3: treated the same as a non-success status).
    fn exec_transfer(&self, req: &TransferRequest, conf: &TransferConfig) -> Option<OpHandle>;

    fn transfer_result(&self, op: OpHandle) -> TransferStatus;

    fn release_op(&self, op: OpHandle);

    fn print_perf(&self);

    /// Tears down whatever `setup_rpc_server` stood up (spec §4.2's
    /// `clean(ctx)`). Called once, from `Stop`, after the perf sampler
    /// has already joined (spec §4.7 ordering). `&self` rather than
    /// `&mut self`: the engine holds the context behind an `Arc` by
    /// the time `Stop` runs.
    fn clean(&self);
}

impl fmt::Debug for dyn VerbsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VerbsContext(instance={:?})", self.instance_id())
    }
}
