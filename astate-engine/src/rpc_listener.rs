//! Control-plane listener bring-up (spec §4.3): fixed port, or a
//! randomized-window port scan bounded by [`K_BIND_PORT_MAX_RETRY`].

use rand::Rng;
use tracing::{info, warn};

use crate::error::TransportError;
use crate::options::Options;
use crate::retry::{retry, CountingRetry};
use astate_verbs::VerbsContext;

/// Number of ports tried in scan mode before giving up. The source
/// names this `kBindPortMaxRetry` without specifying its value; 10 is
/// chosen here (see `DESIGN.md`) as enough headroom for a handful of
/// colliding processes on one host without growing the scan window
/// past what a single `Start` call should spend retrying.
pub const K_BIND_PORT_MAX_RETRY: u32 = 10;

const SCAN_BASE_PORT: u16 = 51010;
const SCAN_RANDOM_WINDOW: u16 = 1000;

/// Binds the control-plane listener and returns the port actually
/// bound. In fixed mode this is always `options.local_port`; in scan
/// mode it is the first port in `[51010+r, 51010+r+K_BIND_PORT_MAX_RETRY)`
/// that bound successfully.
pub fn bring_up(
    ctx: &mut dyn VerbsContext,
    options: &Options,
) -> Result<u16, TransportError> {
    if options.fixed_port {
        ctx.config_mut().listener_port = options.local_port;
        return ctx
            .setup_rpc_server()
            .map(|()| options.local_port)
            .map_err(|e| TransportError::BindError(e.to_string()));
    }

    let r: u16 = rand::thread_rng().gen_range(0..=SCAN_RANDOM_WINDOW);
    let base = SCAN_BASE_PORT + r;
    info!(base, "scanning for a listener port");

    let policy = CountingRetry {
        attempts: K_BIND_PORT_MAX_RETRY,
    };

    retry("rpc_listener_bind", &policy, |attempt| {
        let port = base + (attempt as u16 - 1);
        ctx.config_mut().listener_port = port;
        match ctx.setup_rpc_server() {
            Ok(()) => {
                info!(port, "listener bound");
                Ok(port)
            }
            Err(e) => {
                warn!(port, error = %e, "bind attempt failed, trying next port");
                Err(TransportError::TransientTransferError(e.to_string()))
            }
        }
    })
    .map_err(|e| TransportError::BindError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use astate_verbs::loopback;

    fn ctx() -> Box<dyn VerbsContext> {
        loopback::setup(astate_verbs::BackendSetupConfig {
            device_pattern: None,
            local_host: "127.0.0.1".to_string(),
            local_port: 0,
        })
        .unwrap()
    }

    #[test]
    fn test_fixed_port_binds_requested_port() {
        let mut ctx = ctx();
        let mut options = Options::default();
        options.fixed_port = true;
        options.local_port = 19001;
        let port = bring_up(ctx.as_mut(), &options).unwrap();
        assert_eq!(port, 19001);
    }

    #[test]
    fn test_scan_mode_binds_in_window() {
        let mut ctx = ctx();
        let options = Options::default();
        let port = bring_up(ctx.as_mut(), &options).unwrap();
        assert!(port >= SCAN_BASE_PORT);
        assert!(port < SCAN_BASE_PORT + SCAN_RANDOM_WINDOW + K_BIND_PORT_MAX_RETRY as u16);
    }
}
