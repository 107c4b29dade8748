//! # gcbridge-abi
//!
//! `extern "C"` surface for host runtimes whose allocator hooks are rerouted
//! to an external conservative collector. Produces `libgcbridge.so`.
//!
//! ```text
//! host hook -> gcbridge_* (this crate) -> process GcBridge -> native collector
//! ```
//!
//! Status codes are the constants in [`gcbridge_core::error::code`]. The
//! collector backend is the simulated heap by default and the system libgc
//! with the `bdwgc` feature.

pub mod alloc_abi;
pub mod collect_abi;
mod state;
pub mod stats_abi;

pub use state::{Backend, MarkStackFn, with_bridge};
