//! Bridge error types.

use thiserror::Error;

use crate::classify::AllocPath;
use crate::controller::CollectionState;

/// C status codes returned by the ABI layer.
pub mod code {
    pub const OK: i32 = 0;
    pub const OUT_OF_MEMORY: i32 = 1;
    pub const NOT_INITIALIZED: i32 = 2;
    pub const ALREADY_INITIALIZED: i32 = 3;
    pub const DOUBLE_RELEASE: i32 = 4;
    pub const UNOWNED_RELEASE: i32 = 5;
    pub const COLLECTION_IN_PROGRESS: i32 = 6;
    pub const TICKET_MISMATCH: i32 = 7;
    pub const INVALID_CONFIG: i32 = 8;
}

/// Protocol violations by the host.
///
/// Each of these is undefined behavior against a bare collector binding; the
/// bridge reports them instead of corrupting the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MisuseViolation {
    #[error("`{op}` called before initialize")]
    NotInitialized { op: &'static str },
    #[error("initialize called more than once")]
    AlreadyInitialized,
    #[error("pointer {addr:#x} released twice")]
    DoubleRelease { addr: usize },
    #[error("pointer {addr:#x} is not owned by this allocator")]
    UnownedRelease { addr: usize },
    #[error("collection already in progress (state: {state})")]
    CollectionInProgress { state: CollectionState },
    #[error("collection ticket {got} does not match open window {expected}")]
    TicketMismatch { expected: u64, got: u64 },
}

/// Errors surfaced at the bridge API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// The native primitive returned null after its own collection attempt.
    #[error("out of memory: {requested} bytes via {path} path")]
    OutOfMemory { requested: usize, path: AllocPath },
    #[error("misuse: {0}")]
    Misuse(#[from] MisuseViolation),
    #[error("invalid heap configuration: {0}")]
    InvalidConfig(&'static str),
}

impl BridgeError {
    /// Status code for the C ABI.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::OutOfMemory { .. } => code::OUT_OF_MEMORY,
            Self::InvalidConfig(_) => code::INVALID_CONFIG,
            Self::Misuse(violation) => match violation {
                MisuseViolation::NotInitialized { .. } => code::NOT_INITIALIZED,
                MisuseViolation::AlreadyInitialized => code::ALREADY_INITIALIZED,
                MisuseViolation::DoubleRelease { .. } => code::DOUBLE_RELEASE,
                MisuseViolation::UnownedRelease { .. } => code::UNOWNED_RELEASE,
                MisuseViolation::CollectionInProgress { .. } => code::COLLECTION_IN_PROGRESS,
                MisuseViolation::TicketMismatch { .. } => code::TICKET_MISMATCH,
            },
        }
    }

    /// Returns true for failures the reference design treats as fatal.
    #[must_use]
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}
