//! Error taxonomy for the transport engine (spec §7). `retryable()`
//! is what [`crate::retry`]'s runner inspects to decide whether a
//! failed attempt should be retried — the Rust replacement for the
//! exception-as-control-flow pattern the source used.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    /// Null buffer, zero length, missing remote address, or a call
    /// against an uninitialized context. Never retried.
    #[error("argument error: {0}")]
    ArgumentError(String),

    /// Backend returned a non-success status, a null op handle, or
    /// instance-id resolution failed. Subject to counting-with-sleep
    /// retry.
    #[error("transient transfer error: {0}")]
    TransientTransferError(String),

    /// Listener bring-up failed under scan mode after exhausting the
    /// configured port window.
    #[error("listener bind error: {0}")]
    BindError(String),

    /// Context creation or memory registration returned a null
    /// handle. Fatal: `Start` returns false, `RegisterMemory` surfaces
    /// a failure.
    #[error("backend setup error: {0}")]
    BackendSetupError(String),

    /// `AsyncSend`/`AsyncReceive`: always raised, never a bug.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
}

impl TransportError {
    /// Whether [`crate::retry::Retry`] should attempt this operation
    /// again after this error. Only `TransientTransferError` is
    /// retryable; everything else aborts the retry loop immediately
    /// (spec §7 propagation policy).
    pub fn retryable(&self) -> bool {
        matches!(self, TransportError::TransientTransferError(_))
    }
}
