//! Process-fatal errors
//!
//! Conditions the runtime cannot recover from (broken invariants, failed
//! heap setup, a stack walk that found no handler) are routed through
//! [`fatal_error`]. The default handler logs and aborts the process; tests
//! and embedders that want to observe the failure can install their own
//! handler with [`set_fatal_error_handler`].

use parking_lot::RwLock;

/// Conditions that terminate the process
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FatalError {
    /// Reserving memory for an isolate or its heap failed
    #[error("Out of memory: {0}")]
    OutOfMemory(&'static str),

    /// An isolate was allocated before process-wide initialization
    #[error("Platform not initialized; call platform::initialize_once_per_process first")]
    NotInitialized,

    /// Startup, read-only and shared-heap snapshots must be provided together
    #[error("Snapshot arguments must be all present or all absent")]
    SnapshotArgumentMismatch,

    /// The shared-space owner was torn down while clients were attached
    #[error("Shared space owner {owner} torn down with {clients} attached client(s)")]
    SharedSpaceClientsAlive { owner: u64, clients: usize },

    /// An isolate was destroyed while still entered on some thread
    #[error("Isolate {isolate} destroyed with {entries} outstanding entr(ies)")]
    OutstandingEntries { isolate: u64, entries: usize },

    /// The unwinder ran off the bottom of the stack
    #[error("No exception handler found on the stack")]
    NoHandlerFound,

    /// Formatting a stack trace re-entered more than once
    #[error("Stack trace formatting re-entered {0} times")]
    StackTraceDoubleFault(u32),

    /// Embedded blob integrity or refcount violation
    #[error("Embedded blob: {0}")]
    BlobMismatch(String),

    /// An uncaught exception with abort-on-uncaught-exception enabled
    #[error("Aborting on uncaught exception: {0}")]
    AbortOnUncaughtException(String),

    /// Any other internal consistency check
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),
}

/// A handler that never returns
pub type FatalHandler = fn(&FatalError) -> !;

static HANDLER: RwLock<FatalHandler> = parking_lot::const_rwlock(abort_process as FatalHandler);

/// Default handler: log and abort
pub fn abort_process(err: &FatalError) -> ! {
    eprintln!("keel: fatal error: {err}");
    std::process::abort()
}

/// Handler that panics instead of aborting, so tests can use `#[should_panic]`
pub fn panic_on_fatal(err: &FatalError) -> ! {
    panic!("fatal: {err}")
}

/// Install the process-wide fatal handler
pub fn set_fatal_error_handler(handler: FatalHandler) {
    *HANDLER.write() = handler;
}

/// Report a fatal error. Never returns.
#[cold]
pub fn fatal_error(err: FatalError) -> ! {
    tracing::error!(error = %err, "fatal error");
    let handler = *HANDLER.read();
    handler(&err)
}

/// Check an internal invariant, reporting a fatal error when it does not hold
#[macro_export]
macro_rules! fatal_check {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::fatal::fatal_error($crate::fatal::FatalError::InvariantViolation(format!($($arg)+)))
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_error_messages() {
        let err = FatalError::SharedSpaceClientsAlive { owner: 3, clients: 2 };
        assert_eq!(
            err.to_string(),
            "Shared space owner 3 torn down with 2 attached client(s)"
        );
        assert!(FatalError::NoHandlerFound.to_string().contains("No exception handler"));
    }

    #[test]
    #[should_panic(expected = "fatal: Invariant violated: broken 7")]
    fn test_fatal_check_reports_through_handler() {
        set_fatal_error_handler(panic_on_fatal);
        fatal_check!(1 + 1 == 3, "broken {}", 7);
    }
}
