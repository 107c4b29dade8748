//! # gcbridge-core
//!
//! Safe Rust half of the bridge that lets a managed runtime hand every object
//! lifetime to an external conservative mark-and-sweep collector.
//!
//! # Architecture
//!
//! ```text
//! host hook -> GcBridge -> (classify, descriptor cache, ledger) -> NativeCollector
//!                  ^                                                    |
//!                  +---- CollectionController <--- collection events --+
//! ```
//!
//! - **Heap manager** (`heap`): one-time setup of the native collector
//! - **Allocator** (`bridge`, `classify`): size-classed routing to the native primitives
//! - **Collection controller** (`controller`): root-marking protocol across the boundary
//! - **Stats reporter** (`stats`): collector and OS counters in the host's vocabulary
//! - **Descriptor cache** (`descriptor`): identity-stable typed-allocation descriptors
//! - **Ownership ledger** (`ledger`): double/unowned release detection
//! - **Configuration** (`config`), **errors** (`error`), **metrics** (`metrics`),
//!   **lifecycle log** (`lifecycle`)

#![deny(unsafe_code)]

#[allow(unsafe_code)]
pub mod bridge;
pub mod classify;
#[allow(unsafe_code)]
pub mod collector;
pub mod config;
pub mod controller;
pub mod descriptor;
pub mod error;
pub mod fatal;
pub mod heap;
pub mod ledger;
pub mod lifecycle;
pub mod metrics;
pub mod stats;

pub use bridge::GcBridge;
pub use classify::AllocPath;
pub use collector::{CollectionEvent, CollectionHook, GcDescriptor, HeapUsage, NativeCollector};
pub use config::{CheckLevel, HeapConfig};
pub use controller::{CollectionController, CollectionState, CycleTicket, RootMarker};
pub use descriptor::{AllocationDescriptor, DescriptorCache, DescriptorHandle, PointerBitmap};
pub use error::{BridgeError, MisuseViolation};
pub use lifecycle::{LifecycleLog, LifecycleRecord, LogLevel};
pub use metrics::{BridgeMetrics, MetricsSnapshot};
pub use stats::{HostMemStats, MemoryStatsSnapshot};
