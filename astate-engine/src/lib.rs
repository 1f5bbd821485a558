//! The RDMA one-sided tensor transport engine: memory registration,
//! topology-aware device selection, RPC bring-up, retrying
//! `Send`/`Receive`, and a conditional perf sampler, composed over a
//! pluggable [`astate_verbs::VerbsContext`] backend.

pub mod engine;
pub mod error;
pub mod logging;
pub mod options;
pub mod perf_sampler;
pub mod retry;
pub mod rpc_listener;

pub use engine::TransportEngine;
pub use error::TransportError;
pub use options::{Options, ParallelConfig};
