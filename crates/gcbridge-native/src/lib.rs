//! # gcbridge-native
//!
//! [`NativeCollector`](gcbridge_core::NativeCollector) backends.
//!
//! - [`SimCollector`]: in-process conservative mark-and-sweep heap with the
//!   bdwgc contract and per-primitive call counters. Always available.
//! - [`BdwgcCollector`]: the system libgc, behind the `bdwgc` feature.
//! - [`os`]: process memory queries shared by both.

pub mod os;
pub mod sim;

#[cfg(feature = "bdwgc")]
pub mod bdwgc;

#[cfg(feature = "bdwgc")]
pub use bdwgc::BdwgcCollector;
pub use sim::{RootSink, SimCallCounts, SimCollector};
