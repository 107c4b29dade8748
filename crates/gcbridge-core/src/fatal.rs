//! Fatal path for hosts that cannot handle allocation failure.

use crate::error::BridgeError;
use crate::lifecycle::{LifecycleLog, LogLevel};

/// Record `err` as a `Fatal` lifecycle record and abort the process.
///
/// Abort rather than panic: the caller may be inside a foreign frame where
/// unwinding is undefined.
pub fn abort_on(log: &LifecycleLog, symbol: &'static str, err: &BridgeError) -> ! {
    log.emit(LogLevel::Fatal, symbol, "abort", outcome_of(err), |r| {
        r.with_details(err.to_string())
    });
    std::process::abort()
}

const fn outcome_of(err: &BridgeError) -> &'static str {
    match err {
        BridgeError::OutOfMemory { .. } => "out_of_memory",
        BridgeError::Misuse(_) => "misuse",
        BridgeError::InvalidConfig(_) => "invalid_config",
    }
}
