//! Isolate configuration

use super::Isolate;
use std::fmt;
use std::sync::Arc;

/// Decides whether an uncaught exception aborts the process. Returning
/// false lets the exception propagate normally.
pub type AbortOnUncaughtExceptionCallback = Arc<dyn Fn(&Isolate) -> bool + Send + Sync>;

/// Options for creating an isolate
#[derive(Clone)]
pub struct IsolateOptions {
    /// Frame limit for error stack traces
    pub stack_trace_limit: usize,

    /// Extend stack traces with frames waiting on the current one
    pub async_stack_traces: bool,

    /// Show builtin and other non-user frames in stack traces
    pub builtins_in_stack_traces: bool,

    /// Attach a stack trace to messages of uncaught exceptions
    pub capture_stack_trace_for_uncaught_exceptions: bool,
    pub uncaught_stack_trace_limit: usize,

    /// Abort when an exception nobody will catch is thrown
    pub abort_on_uncaught_exception: bool,
    pub abort_on_uncaught_exception_callback: Option<AbortOnUncaughtExceptionCallback>,

    /// Own or join the process-wide shared space
    pub shared_space: bool,

    /// Run a background compile dispatcher thread
    pub concurrent_recompilation: bool,

    /// Log every throw with its stack trace
    pub print_all_exceptions: bool,

    /// Machine stack budget per thread in bytes
    pub stack_size: usize,

    /// Size of the region backing the isolate itself
    pub isolate_region_size: usize,

    /// Size of the region reserved for generated code
    pub code_range_size: usize,
}

impl Default for IsolateOptions {
    fn default() -> Self {
        Self {
            stack_trace_limit: 10,
            async_stack_traces: true,
            builtins_in_stack_traces: false,
            capture_stack_trace_for_uncaught_exceptions: false,
            uncaught_stack_trace_limit: 10,
            abort_on_uncaught_exception: false,
            abort_on_uncaught_exception_callback: None,
            shared_space: false,
            concurrent_recompilation: true,
            print_all_exceptions: false,
            stack_size: 984 * 1024,
            isolate_region_size: 64 * 1024,
            code_range_size: 256 * 1024,
        }
    }
}

impl IsolateOptions {
    /// Participate in the process-wide shared space
    pub fn with_shared_space(mut self) -> Self {
        self.shared_space = true;
        self
    }

    /// Skip the background compile thread
    pub fn without_concurrent_recompilation(mut self) -> Self {
        self.concurrent_recompilation = false;
        self
    }

    pub fn stack_trace_limit(mut self, limit: usize) -> Self {
        self.stack_trace_limit = limit;
        self
    }

    pub fn capture_uncaught_stack_traces(mut self, limit: usize) -> Self {
        self.capture_stack_trace_for_uncaught_exceptions = true;
        self.uncaught_stack_trace_limit = limit;
        self
    }

    pub fn abort_on_uncaught_exception(
        mut self,
        callback: Option<AbortOnUncaughtExceptionCallback>,
    ) -> Self {
        self.abort_on_uncaught_exception = true;
        self.abort_on_uncaught_exception_callback = callback;
        self
    }
}

impl fmt::Debug for IsolateOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolateOptions")
            .field("stack_trace_limit", &self.stack_trace_limit)
            .field("async_stack_traces", &self.async_stack_traces)
            .field("builtins_in_stack_traces", &self.builtins_in_stack_traces)
            .field(
                "capture_stack_trace_for_uncaught_exceptions",
                &self.capture_stack_trace_for_uncaught_exceptions,
            )
            .field("abort_on_uncaught_exception", &self.abort_on_uncaught_exception)
            .field("shared_space", &self.shared_space)
            .field("concurrent_recompilation", &self.concurrent_recompilation)
            .field("stack_size", &self.stack_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = IsolateOptions::default();
        assert_eq!(options.stack_trace_limit, 10);
        assert!(options.async_stack_traces);
        assert!(!options.shared_space);
        assert!(options.concurrent_recompilation);
    }

    #[test]
    fn test_builders() {
        let options = IsolateOptions::default()
            .with_shared_space()
            .stack_trace_limit(3)
            .capture_uncaught_stack_traces(5);
        assert!(options.shared_space);
        assert_eq!(options.stack_trace_limit, 3);
        assert!(options.capture_stack_trace_for_uncaught_exceptions);
        assert_eq!(options.uncaught_stack_trace_limit, 5);
        assert!(
            !IsolateOptions::default()
                .without_concurrent_recompilation()
                .concurrent_recompilation
        );
    }
}
