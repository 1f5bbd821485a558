//! Configuration snapshot (spec §3, §6). `Options` is built once via
//! [`Options::from_env`] or by repeated [`Options::apply_config_str`]
//! calls, then handed to [`crate::engine::TransportEngine::start`] —
//! after that point it is immutable, mirroring `hca-probe`'s CLI args
//! being parsed once at the top of `main`.

use anyhow::{bail, Result};

/// Role placement passed to `Start` (spec §3).
#[derive(Debug, Clone, Copy)]
pub struct ParallelConfig {
    pub role_rank: u32,
    pub role_size: u32,
}

#[derive(Debug, Clone)]
pub struct Options {
    pub meta_service_address: Option<String>,
    pub local_host: String,
    pub local_port: u16,
    pub fixed_port: bool,
    /// milliseconds; -1 means infinite.
    pub read_timeout_ms: i64,
    /// milliseconds; -1 means infinite.
    pub write_timeout_ms: i64,
    pub rdma_num_pollers: u32,
    pub max_rdma_devices: usize,
    pub enable_numa_allocation: bool,
    pub enable_perf_metrics: bool,
    pub perf_stats_interval_ms: u64,
    pub send_retry_count: u32,
    pub send_retry_sleep_ms: u64,
    pub receive_retry_count: u32,
    pub receive_retry_sleep_ms: u64,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            meta_service_address: None,
            local_host: "0.0.0.0".to_string(),
            local_port: 0,
            fixed_port: false,
            read_timeout_ms: -1,
            write_timeout_ms: -1,
            rdma_num_pollers: 4,
            max_rdma_devices: 1,
            enable_numa_allocation: false,
            enable_perf_metrics: false,
            perf_stats_interval_ms: 500,
            send_retry_count: 3,
            send_retry_sleep_ms: 100,
            receive_retry_count: 3,
            receive_retry_sleep_ms: 100,
        }
    }
}

impl Options {
    /// Reads every key in spec §6's configuration table from the
    /// process environment, falling back to defaults for anything
    /// unset. Unknown env vars are ignored; malformed values for a
    /// recognized key are logged and skipped rather than aborting
    /// startup, the same tolerance `hermes`'s env-driven cluster scan
    /// applies to its own config knobs.
    pub fn from_env() -> Self {
        let mut opts = Options::default();
        for key in CONFIG_KEYS {
            if let Ok(value) = std::env::var(key) {
                if let Err(e) = opts.apply_config_str(key, &value) {
                    tracing::warn!(key, value, error = %e, "ignoring malformed config value");
                }
            }
        }
        opts
    }

    /// Programmatic/config-map entry point: apply one recognized key.
    /// Returns an error for an unrecognized key or a value that fails
    /// to parse for a recognized one.
    pub fn apply_config_str(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "TRANSFER_ENGINE_META_SERVICE_ADDRESS" => {
                self.meta_service_address = Some(value.to_string());
            }
            "TRANSFER_ENGINE_LOCAL_PORT" => self.local_port = value.parse()?,
            "TRANSFER_ENGINE_SERVICE_FIXED_PORT" => self.fixed_port = parse_bool(value)?,
            "TRANSFER_ENGINE_READ_TIMEOUT_MS" => self.read_timeout_ms = value.parse()?,
            "TRANSFER_ENGINE_WRITE_TIMEOUT_MS" => self.write_timeout_ms = value.parse()?,
            "TRANSFER_ENGINE_RDMA_NUM_POLLERS" => self.rdma_num_pollers = value.parse()?,
            "TRANSFER_ENGINE_MAX_RDMA_DEVICES" => self.max_rdma_devices = value.parse()?,
            "TRANSFER_ENGINE_ENABLE_NUMA_ALLOCATION" => {
                self.enable_numa_allocation = parse_bool(value)?
            }
            "TRANSFER_ENGINE_ENABLE_PERF_METRICS" => self.enable_perf_metrics = parse_bool(value)?,
            "TRANSFER_ENGINE_PERF_STATS_INTERVAL_MS" => {
                self.perf_stats_interval_ms = value.parse()?
            }
            "TRANSPORT_SEND_RETRY_COUNT" => self.send_retry_count = value.parse()?,
            "TRANSPORT_RECEIVE_RETRY_COUNT" => self.receive_retry_count = value.parse()?,
            "TRANSPORT_SEND_RETRY_SLEEP_MS" => self.send_retry_sleep_ms = value.parse()?,
            "TRANSPORT_RECEIVE_RETRY_SLEEP_MS" => self.receive_retry_sleep_ms = value.parse()?,
            other => bail!("unrecognized configuration key: {other}"),
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("not a boolean: {other}"),
    }
}

const CONFIG_KEYS: &[&str] = &[
    "TRANSFER_ENGINE_META_SERVICE_ADDRESS",
    "TRANSFER_ENGINE_LOCAL_PORT",
    "TRANSFER_ENGINE_SERVICE_FIXED_PORT",
    "TRANSFER_ENGINE_READ_TIMEOUT_MS",
    "TRANSFER_ENGINE_WRITE_TIMEOUT_MS",
    "TRANSFER_ENGINE_RDMA_NUM_POLLERS",
    "TRANSFER_ENGINE_MAX_RDMA_DEVICES",
    "TRANSFER_ENGINE_ENABLE_NUMA_ALLOCATION",
    "TRANSFER_ENGINE_ENABLE_PERF_METRICS",
    "TRANSFER_ENGINE_PERF_STATS_INTERVAL_MS",
    "TRANSPORT_SEND_RETRY_COUNT",
    "TRANSPORT_RECEIVE_RETRY_COUNT",
    "TRANSPORT_SEND_RETRY_SLEEP_MS",
    "TRANSPORT_RECEIVE_RETRY_SLEEP_MS",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = Options::default();
        assert_eq!(opts.perf_stats_interval_ms, 500);
        assert!(!opts.fixed_port);
    }

    #[test]
    fn test_apply_known_key() {
        let mut opts = Options::default();
        opts.apply_config_str("TRANSFER_ENGINE_LOCAL_PORT", "19001")
            .unwrap();
        assert_eq!(opts.local_port, 19001);
    }

    #[test]
    fn test_apply_bool_variants() {
        let mut opts = Options::default();
        opts.apply_config_str("TRANSFER_ENGINE_SERVICE_FIXED_PORT", "true")
            .unwrap();
        assert!(opts.fixed_port);
        opts.apply_config_str("TRANSFER_ENGINE_SERVICE_FIXED_PORT", "0")
            .unwrap();
        assert!(!opts.fixed_port);
    }

    #[test]
    fn test_unrecognized_key_errors() {
        let mut opts = Options::default();
        assert!(opts.apply_config_str("NOT_A_KEY", "1").is_err());
    }
}
