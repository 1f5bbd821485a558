//! End-to-end scenarios against mock backends, driving the real
//! bring-up/retry/transfer paths rather than reimplementing them
//! (`TransportEngine::start_with_backend` is the injection seam).

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use astate_engine::{Options, ParallelConfig, TransportEngine};
use astate_verbs::{
    BackendConfig, InstanceId, MrHandle, OpHandle, TransferConfig, TransferRequest,
    TransferStatus, VerbsContext, VerbsError,
};

/// A `VerbsContext` whose `setup_rpc_server`/`exec_transfer`/
/// `query_instance_id` behavior is scripted per test, standing in for
/// the mock backend the §8 scenarios describe.
struct MockContext {
    config: Mutex<BackendConfig>,
    /// `setup_rpc_server` fails for these ports exactly once each, then
    /// succeeds (models "port already bound").
    reject_ports: Vec<u16>,
    bind_calls: AtomicU32,
    /// `exec_transfer` returns `None` for the first `fail_transfers`
    /// calls, then succeeds.
    fail_transfers: u32,
    transfer_calls: AtomicU32,
    next_op: AtomicU64,
}

impl MockContext {
    fn new(reject_ports: Vec<u16>, fail_transfers: u32) -> Self {
        MockContext {
            config: Mutex::new(BackendConfig {
                listener_port: 0,
                device_pattern: None,
                local_host: "127.0.0.1".to_string(),
            }),
            reject_ports,
            bind_calls: AtomicU32::new(0),
            fail_transfers,
            transfer_calls: AtomicU32::new(0),
            next_op: AtomicU64::new(1),
        }
    }
}

impl VerbsContext for MockContext {
    fn instance_id(&self) -> InstanceId {
        InstanceId(1)
    }

    fn config_mut(&mut self) -> &mut BackendConfig {
        self.config.get_mut().unwrap()
    }

    fn setup_rpc_server(&mut self) -> Result<(), VerbsError> {
        self.bind_calls.fetch_add(1, Ordering::SeqCst);
        let port = self.config.lock().unwrap().listener_port;
        if self.reject_ports.contains(&port) {
            Err(VerbsError::ListenerFailed(format!("port {port} already bound")))
        } else {
            Ok(())
        }
    }

    fn query_instance_id(&self, _host: &str, _port: u16) -> Result<InstanceId, VerbsError> {
        Ok(InstanceId(42))
    }

    fn register_ram(&self, addr: u64, _len: usize, _numa: i32) -> Result<MrHandle, VerbsError> {
        Ok(MrHandle(addr))
    }

    fn register_vram(&self, addr: u64, _len: usize, _gpu_id: i32) -> Result<MrHandle, VerbsError> {
        Ok(MrHandle(addr))
    }

    fn deregister(&self, _mr: MrHandle) -> bool {
        true
    }

    fn exec_transfer(&self, _req: &TransferRequest, _conf: &TransferConfig) -> Option<OpHandle> {
        let call = self.transfer_calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_transfers {
            None
        } else {
            let op = self.next_op.fetch_add(1, Ordering::SeqCst);
            Some(OpHandle(op))
        }
    }

    fn transfer_result(&self, _op: OpHandle) -> TransferStatus {
        TransferStatus::Success
    }

    fn release_op(&self, _op: OpHandle) {}

    fn print_perf(&self) {}

    fn clean(&self) {}
}

fn parallel() -> ParallelConfig {
    ParallelConfig {
        role_rank: 0,
        role_size: 1,
    }
}

/// S2 — scan bring-up with first port taken: `setup_rpc_server` fails
/// for `base`, succeeds for `base+1`.
#[test]
fn scenario_s2_scan_bring_up_with_first_port_taken() {
    let mut options = Options::default();
    options.fixed_port = false;

    let engine = TransportEngine::new(options);
    // We don't know `base` ahead of time (drawn inside `start`), so
    // reject whatever port is tried first by making the mock reject
    // exactly one bind attempt: the first port it's asked to bind.
    let mock = RejectFirstThenSucceed::new();
    assert!(engine.start_with_backend(parallel(), Box::new(mock)));
    assert!(engine.get_bind_port() >= 51010);
    engine.stop();
}

/// A variant of `MockContext` that rejects exactly the first port it's
/// asked to bind, regardless of value — used because the scan's random
/// base isn't known to the test in advance.
struct RejectFirstThenSucceed {
    config: Mutex<BackendConfig>,
    calls: AtomicU32,
}

impl RejectFirstThenSucceed {
    fn new() -> Self {
        RejectFirstThenSucceed {
            config: Mutex::new(BackendConfig {
                listener_port: 0,
                device_pattern: None,
                local_host: "127.0.0.1".to_string(),
            }),
            calls: AtomicU32::new(0),
        }
    }
}

impl VerbsContext for RejectFirstThenSucceed {
    fn instance_id(&self) -> InstanceId {
        InstanceId(1)
    }
    fn config_mut(&mut self) -> &mut BackendConfig {
        self.config.get_mut().unwrap()
    }
    fn setup_rpc_server(&mut self) -> Result<(), VerbsError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(VerbsError::ListenerFailed("first port taken".to_string()))
        } else {
            Ok(())
        }
    }
    fn query_instance_id(&self, _host: &str, _port: u16) -> Result<InstanceId, VerbsError> {
        Ok(InstanceId(1))
    }
    fn register_ram(&self, addr: u64, _len: usize, _numa: i32) -> Result<MrHandle, VerbsError> {
        Ok(MrHandle(addr))
    }
    fn register_vram(&self, addr: u64, _len: usize, _gpu_id: i32) -> Result<MrHandle, VerbsError> {
        Ok(MrHandle(addr))
    }
    fn deregister(&self, _mr: MrHandle) -> bool {
        true
    }
    fn exec_transfer(&self, _req: &TransferRequest, _conf: &TransferConfig) -> Option<OpHandle> {
        Some(OpHandle(1))
    }
    fn transfer_result(&self, _op: OpHandle) -> TransferStatus {
        TransferStatus::Success
    }
    fn release_op(&self, _op: OpHandle) {}
    fn print_perf(&self) {}
    fn clean(&self) {}
}

/// S3 — scan exhaustion: every port in the window fails, `start`
/// returns `false`, and a subsequent `Stop` is a no-op.
struct AlwaysReject {
    config: Mutex<BackendConfig>,
}

impl VerbsContext for AlwaysReject {
    fn instance_id(&self) -> InstanceId {
        InstanceId(0)
    }
    fn config_mut(&mut self) -> &mut BackendConfig {
        self.config.get_mut().unwrap()
    }
    fn setup_rpc_server(&mut self) -> Result<(), VerbsError> {
        Err(VerbsError::ListenerFailed("all ports taken".to_string()))
    }
    fn query_instance_id(&self, _host: &str, _port: u16) -> Result<InstanceId, VerbsError> {
        Ok(InstanceId(0))
    }
    fn register_ram(&self, addr: u64, _len: usize, _numa: i32) -> Result<MrHandle, VerbsError> {
        Ok(MrHandle(addr))
    }
    fn register_vram(&self, addr: u64, _len: usize, _gpu_id: i32) -> Result<MrHandle, VerbsError> {
        Ok(MrHandle(addr))
    }
    fn deregister(&self, _mr: MrHandle) -> bool {
        true
    }
    fn exec_transfer(&self, _req: &TransferRequest, _conf: &TransferConfig) -> Option<OpHandle> {
        None
    }
    fn transfer_result(&self, _op: OpHandle) -> TransferStatus {
        TransferStatus::Failed
    }
    fn release_op(&self, _op: OpHandle) {}
    fn print_perf(&self) {}
    fn clean(&self) {}
}

#[test]
fn scenario_s3_scan_exhaustion_fails_start_and_stop_is_noop() {
    let mut options = Options::default();
    options.fixed_port = false;

    let engine = TransportEngine::new(options);
    let mock = AlwaysReject {
        config: Mutex::new(BackendConfig {
            listener_port: 0,
            device_pattern: None,
            local_host: "127.0.0.1".to_string(),
        }),
    };
    assert!(!engine.start_with_backend(parallel(), Box::new(mock)));
    assert!(!engine.is_running());
    // Stop on a never-successfully-started engine is a no-op, not a panic.
    engine.stop();
    assert!(!engine.is_running());
}

/// S5 — Receive retries then succeeds: `exec_transfer` fails twice,
/// then succeeds; `retry_count=3, retry_sleep_ms=10` yields exactly
/// three submissions and roughly 20ms of sleeping.
#[test]
fn scenario_s5_receive_retries_then_succeeds() {
    let mut options = Options::default();
    options.fixed_port = true;
    options.local_port = 19201;
    options.receive_retry_count = 3;
    options.receive_retry_sleep_ms = 10;

    let engine = TransportEngine::new(options);
    let mock = MockContext::new(vec![], 2);
    assert!(engine.start_with_backend(parallel(), Box::new(mock)));

    let started = Instant::now();
    assert!(engine.receive(1, 8, "peer", 19001, 2));
    let elapsed = started.elapsed();
    assert!(elapsed.as_millis() >= 15, "expected ~20ms of retry sleeps, got {elapsed:?}");

    engine.stop();
}

/// S6 — argument error is not retried: `Send(0, 0, ...)` returns
/// `false` immediately with zero backend submissions.
#[test]
fn scenario_s6_argument_error_is_not_retried() {
    let mut options = Options::default();
    options.fixed_port = true;
    options.local_port = 19202;
    options.send_retry_count = 5;

    let engine = TransportEngine::new(options);
    assert!(engine.start_with_backend(parallel(), Box::new(MockContext::new(vec![], 0))));
    assert!(!engine.send(0, 0, "peer", 1, 0));
    engine.stop();
}

/// S4 — Send happy path: register, send, observe success.
#[test]
fn scenario_s4_send_happy_path() {
    let mut options = Options::default();
    options.fixed_port = true;
    options.local_port = 19203;

    let engine = TransportEngine::new(options);
    assert!(engine.start_with_backend(parallel(), Box::new(MockContext::new(vec![], 0))));
    assert!(engine.register_memory(0x1000, 4 * 1024 * 1024, false, -1));
    assert!(engine.send(0x1000, 4 * 1024 * 1024, "peer", 19001, 0x9000));
    engine.stop();
}
