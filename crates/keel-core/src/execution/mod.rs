//! Execution state and the passes that read or rewrite it
//!
//! - [`ThreadLocalTop`]: exception slots, handler chain and the machine stack
//!   of one thread inside one isolate
//! - [`unwind_and_find_handler`]: exception dispatch
//! - [`predict_exception_catcher`]: catch prediction without unwinding
//! - [`CallSiteBuilder`] and the capture functions: stack traces, including
//!   frames stitched together across `await` points
//! - [`MessageListeners`]: reporting of uncaught exceptions
//! - [`InterruptQueue`] and [`StackGuard`]: cross-thread interrupt requests

mod async_stack;
mod catch_prediction;
mod interrupts;
mod messages;
mod stack_trace;
mod thread_local_top;
mod unwinder;

pub use async_stack::{capture_async_stack_trace, capture_async_stack_trace_from_promise, AsyncIntrinsics};
pub use catch_prediction::{
    get_promise_on_stack_on_throw, predict_exception, predict_exception_catcher,
    promise_has_user_defined_reject_handler, top_exception_handler_type, CatchPrediction,
    ExceptionHandlerType,
};
pub use interrupts::{InterruptFlag, InterruptQueue, InterruptRequest, StackGuard};
pub use messages::{
    compute_location, compute_location_from_error, create_message, MessageListener,
    MessageListeners, MessageLocation,
};
pub use stack_trace::{
    capture_detailed_stack_trace, capture_simple_stack_trace, format_call_sites, CallSiteBuilder,
    CallSiteInfo, FrameSkipMode, PromiseCombinator, StackFrameInfo, StackTraceOptions, StackTracePrinter,
};
pub use thread_local_top::{
    ExternalTryCatch, PendingHandler, StackHandler, ThreadLocalTop, TryCatchId,
    EXTERNAL_TRY_CATCH_SIZE,
};
pub use unwinder::{unwind_and_find_handler, UnwindEnv};

use crate::code::CodeLookup;
use crate::heap::ObjectHeap;

/// What read-only stack walks need besides the thread state
#[derive(Clone, Copy)]
pub struct WalkEnv<'a> {
    pub heap: &'a ObjectHeap,
    pub code: &'a dyn CodeLookup,
}
