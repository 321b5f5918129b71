//! Exception, termination and interrupt API of an isolate
//!
//! Everything here acts on the calling thread's [`ThreadLocalTop`], which
//! the thread must have allocated by entering (or initializing) the isolate.
//!
//! # Exception slots
//!
//! - **pending**: thrown and propagating through managed frames
//! - **scheduled**: raised by an embedder callback, promoted to pending when
//!   control returns to managed code
//!
//! At most one of the two is occupied at any time.

use super::{Isolate, IsolateError, IsolateResult, PerThreadData};
use crate::code::{Address, Builtins, Code};
use crate::execution::{
    capture_detailed_stack_trace, capture_simple_stack_trace, compute_location, compute_location_from_error,
    create_message, format_call_sites, get_promise_on_stack_on_throw, predict_exception_catcher,
    promise_has_user_defined_reject_handler, top_exception_handler_type, CallSiteInfo, CatchPrediction,
    ExceptionHandlerType, ExternalTryCatch, InterruptFlag, MessageListener, MessageLocation, PendingHandler,
    StackFrameInfo, FrameSkipMode, StackTraceOptions, ThreadLocalTop, TryCatchId, UnwindEnv, WalkEnv,
};
use crate::fatal::{fatal_error, FatalError};
use crate::frames::{FrameSpec, RawFrame, StackFrameIterator};
use crate::heap::RootVisitor;
use crate::value::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, trace};

impl Isolate {
    // ========================================================================
    // Thread-local state access
    // ========================================================================

    fn this_thread(&self) -> IsolateResult<Arc<PerThreadData>> {
        self.thread_table
            .find_for_this_thread()
            .ok_or(IsolateError::ThreadNotAttached)
    }

    /// Run `f` on the calling thread's execution state
    pub fn with_thread_local_top<R>(&self, f: impl FnOnce(&mut ThreadLocalTop) -> R) -> IsolateResult<R> {
        let data = self.this_thread()?;
        let mut top = data.top();
        Ok(f(&mut top))
    }

    fn require_builtins(&self, operation: &'static str) -> IsolateResult<Arc<Builtins>> {
        self.builtins().ok_or_else(|| IsolateError::InvalidState {
            operation,
            state: self.state(),
        })
    }

    fn trace_options(&self, limit: usize, skip_mode: FrameSkipMode) -> StackTraceOptions {
        StackTraceOptions {
            limit,
            skip_mode,
            show_builtins: self.options.builtins_in_stack_traces,
            async_stack_traces: self.options.async_stack_traces,
        }
    }

    /// Push a frame on the calling thread's stack, returning its fp
    pub fn push_frame(&self, spec: FrameSpec) -> IsolateResult<Address> {
        self.with_thread_local_top(|top| top.push_frame(spec))
    }

    pub fn pop_frame(&self) -> IsolateResult<Option<RawFrame>> {
        self.with_thread_local_top(|top| top.pop_frame())
    }

    /// Code object containing `pc`
    pub fn lookup_code(&self, pc: Address) -> IsolateResult<Arc<Code>> {
        self.code_registry.lookup(pc).ok_or(IsolateError::UnknownCode(pc))
    }

    // ========================================================================
    // Exception slots
    // ========================================================================

    pub fn pending_exception(&self) -> IsolateResult<Option<Value>> {
        self.with_thread_local_top(|top| top.pending_exception())
    }

    pub fn has_pending_exception(&self) -> IsolateResult<bool> {
        self.with_thread_local_top(|top| top.has_pending_exception())
    }

    /// Fails if an exception is already scheduled
    pub fn set_pending_exception(&self, exception: Value) -> IsolateResult<()> {
        self.with_thread_local_top(|top| top.set_pending_exception(exception))?
    }

    pub fn clear_pending_exception(&self) -> IsolateResult<Option<Value>> {
        self.with_thread_local_top(|top| top.clear_pending_exception())
    }

    pub fn scheduled_exception(&self) -> IsolateResult<Option<Value>> {
        self.with_thread_local_top(|top| top.scheduled_exception())
    }

    pub fn has_scheduled_exception(&self) -> IsolateResult<bool> {
        self.with_thread_local_top(|top| top.has_scheduled_exception())
    }

    /// Fails if an exception is already pending
    pub fn set_scheduled_exception(&self, exception: Value) -> IsolateResult<()> {
        self.with_thread_local_top(|top| top.set_scheduled_exception(exception))?
    }

    pub fn clear_scheduled_exception(&self) -> IsolateResult<Option<Value>> {
        self.with_thread_local_top(|top| top.clear_scheduled_exception())
    }

    pub fn pending_message(&self) -> IsolateResult<Option<Value>> {
        self.with_thread_local_top(|top| top.pending_message())
    }

    // ========================================================================
    // Throwing
    // ========================================================================

    /// Throw `exception`, recording a message when someone will want one.
    ///
    /// A message is created unless the exception is a rethrow or the
    /// innermost external try-catch neither reports nor captures messages.
    /// Returns the exception sentinel for the caller to propagate.
    pub fn throw(&self, exception: Value, location: Option<MessageLocation>) -> IsolateResult<Value> {
        let data = self.this_thread()?;
        let abort_candidate = {
            let mut top = data.top();
            if top.has_scheduled_exception() {
                return Err(IsolateError::ExceptionConflict(
                    "cannot throw while an exception is scheduled",
                ));
            }
            let rethrowing = top.take_rethrowing_message();
            let requires_message = top
                .try_catch_handler()
                .map_or(true, |handler| handler.is_verbose || handler.capture_message);

            let mut abort_candidate = false;
            if requires_message && !rethrowing && exception.is_catchable() {
                let mut heap = self.heap.lock();
                if self.options.print_all_exceptions {
                    debug!(isolate = self.id.as_u64(), exception = %heap.describe(exception), "exception thrown");
                }
                let (location, stack_trace, prediction) = {
                    let env = WalkEnv {
                        heap: &heap,
                        code: &self.code_registry,
                    };
                    let location = location
                        .or_else(|| compute_location_from_error(&heap, exception))
                        .or_else(|| compute_location(&top, &env));
                    let stack_trace = if self.options.capture_stack_trace_for_uncaught_exceptions {
                        let options = self.trace_options(self.options.uncaught_stack_trace_limit, FrameSkipMode::SkipNone);
                        capture_simple_stack_trace(&top, &env, &options, &self.intrinsics())
                    } else {
                        Vec::new()
                    };
                    let prediction = self
                        .options
                        .abort_on_uncaught_exception
                        .then(|| predict_exception_catcher(&top, &env));
                    (location, stack_trace, prediction)
                };
                let message = create_message(&mut heap, exception, location, stack_trace);
                top.set_pending_message(Some(message));
                abort_candidate = matches!(
                    prediction,
                    Some(CatchPrediction::NotCaught | CatchPrediction::CaughtByExternal)
                );
            }
            top.set_pending_exception(exception)?;
            abort_candidate
        };

        if abort_candidate {
            let abort = match &self.options.abort_on_uncaught_exception_callback {
                Some(callback) => callback(self),
                None => true,
            };
            if abort {
                let description = self.heap.lock().describe(exception);
                fatal_error(FatalError::AbortOnUncaughtException(description));
            }
        }
        Ok(Value::exception())
    }

    /// Rethrow without creating a new message
    pub fn rethrow(&self, exception: Value) -> IsolateResult<Value> {
        self.with_thread_local_top(|top| top.set_pending_exception(exception))??;
        Ok(Value::exception())
    }

    /// Rethrow, restoring a previously captured message
    pub fn rethrow_with_message(&self, exception: Value, message: Value) -> IsolateResult<Value> {
        self.with_thread_local_top(|top| -> IsolateResult<()> {
            top.set_pending_exception(exception)?;
            top.set_pending_message(Some(message));
            Ok(())
        })??;
        Ok(Value::exception())
    }

    /// Throw from an embedder callback: the exception waits in the
    /// scheduled slot until control returns to managed code
    pub fn schedule_throw(&self, exception: Value) -> IsolateResult<()> {
        self.throw(exception, None)?;
        self.with_thread_local_top(|top| -> IsolateResult<()> {
            let handler_type = top_exception_handler_type(top, exception);
            propagate_to_external_try_catch(top, handler_type);
            // The message stays pending so promotion can still report it
            if top.has_pending_exception() {
                top.set_external_caught_exception(false);
                top.schedule_pending_exception()?;
            }
            Ok(())
        })?
    }

    /// Move the scheduled exception to pending and return the sentinel
    pub fn promote_scheduled_exception(&self) -> IsolateResult<Value> {
        let exception = self
            .clear_scheduled_exception()?
            .ok_or(IsolateError::NoScheduledException)?;
        trace!(isolate = self.id.as_u64(), "promoting scheduled exception");
        self.rethrow(exception)
    }

    /// Drop the scheduled exception when the external try-catch `id` has
    /// taken it. A scheduled termination is only dropped once no frames
    /// remain.
    pub fn cancel_scheduled_exception_from_try_catch(&self, id: TryCatchId) -> IsolateResult<()> {
        self.with_thread_local_top(|top| -> IsolateResult<()> {
            let (caught, message) = {
                let handler = top.try_catch(id).ok_or(IsolateError::UnknownTryCatch(id))?;
                (handler.exception, handler.message)
            };
            if let Some(scheduled) = top.scheduled_exception() {
                if scheduled.is_termination_exception() {
                    if top.stack().depth() == 0 {
                        top.set_external_caught_exception(false);
                        top.clear_scheduled_exception();
                    }
                } else if Some(scheduled) == caught {
                    top.clear_scheduled_exception();
                }
            }
            if message.is_some() && top.pending_message() == message {
                top.clear_pending_message();
            }
            Ok(())
        })?
    }

    /// Decide what happens to the pending exception as control leaves
    /// managed code.
    ///
    /// Returns true if it was rescheduled; false if it was cleared.
    pub fn optional_reschedule_exception(&self, clear_exception: bool) -> IsolateResult<bool> {
        self.with_thread_local_top(|top| -> IsolateResult<bool> {
            let exception = top.pending_exception().ok_or(IsolateError::NoPendingException)?;
            let handler_type = top_exception_handler_type(top, exception);
            propagate_to_external_try_catch(top, handler_type);

            let mut clear = clear_exception;
            if !exception.is_termination_exception() && top.external_caught_exception() {
                // Clear if no managed frame sits between here and the
                // external handler
                if let Some(external) = top.try_catch_handler_address() {
                    let innermost_js_sp = StackFrameIterator::new(top.stack().active(), &self.code_registry)
                        .find(|frame| frame.is_java_script())
                        .map(|frame| frame.common().sp());
                    if innermost_js_sp.map_or(true, |sp| sp > external) {
                        clear = true;
                    }
                }
            }

            if clear {
                top.set_external_caught_exception(false);
                top.clear_pending_exception();
                return Ok(false);
            }
            top.schedule_pending_exception()?;
            Ok(true)
        })?
    }

    // ========================================================================
    // External try-catch scopes
    // ========================================================================

    pub fn register_try_catch(&self, try_catch: ExternalTryCatch) -> IsolateResult<TryCatchId> {
        self.with_thread_local_top(|top| top.register_try_catch(try_catch))
    }

    /// Remove the innermost scope, which must be `id`
    pub fn unregister_try_catch(&self, id: TryCatchId) -> IsolateResult<ExternalTryCatch> {
        self.with_thread_local_top(|top| top.unregister_try_catch(id))?
    }

    /// Copy of a registered scope's state
    pub fn try_catch(&self, id: TryCatchId) -> IsolateResult<ExternalTryCatch> {
        self.with_thread_local_top(|top| top.try_catch(id).cloned())?
            .ok_or(IsolateError::UnknownTryCatch(id))
    }

    /// Which handler would see `exception` first
    pub fn top_exception_handler_type(&self, exception: Value) -> IsolateResult<ExceptionHandlerType> {
        self.with_thread_local_top(|top| top_exception_handler_type(top, exception))
    }

    /// Hand the pending exception to the innermost external try-catch if it
    /// is the top handler. Returns false when a managed handler is on top.
    pub fn propagate_pending_exception_to_external_try_catch(&self) -> IsolateResult<bool> {
        self.with_thread_local_top(|top| -> IsolateResult<bool> {
            let exception = top.pending_exception().ok_or(IsolateError::NoPendingException)?;
            let handler_type = top_exception_handler_type(top, exception);
            Ok(propagate_to_external_try_catch(top, handler_type))
        })?
    }

    /// Mark the innermost external try-catch as terminated
    pub fn set_termination_on_external_try_catch(&self) -> IsolateResult<()> {
        self.with_thread_local_top(set_termination_on_external_try_catch)
    }

    /// Deliver the pending message to listeners if nobody else will
    ///
    /// Messages for exceptions caught by a non-verbose external try-catch
    /// are dropped. Listeners run with no isolate lock held.
    pub fn report_pending_messages(&self, report: bool) -> IsolateResult<()> {
        let message = self.with_thread_local_top(|top| -> Option<Value> {
            let Some(exception) = top.pending_exception() else {
                return None;
            };
            let handler_type = top_exception_handler_type(top, exception);
            if !propagate_to_external_try_catch(top, handler_type) || !report {
                return None;
            }
            let message = top.clear_pending_message()?;
            if !exception.is_catchable() {
                return None;
            }
            let should_report = match handler_type {
                ExceptionHandlerType::External => top.try_catch_handler().is_some_and(|h| h.is_verbose),
                _ => true,
            };
            should_report.then_some(message)
        })?;

        let Some(message) = message else {
            return Ok(());
        };
        let Some(message) = self.heap.lock().message(message).cloned() else {
            return Ok(());
        };
        if !self.message_listeners.notify(&message) {
            debug!(isolate = self.id.as_u64(), text = %message.text, "unreported message");
        }
        Ok(())
    }

    pub fn add_message_listener(&self, listener: MessageListener) {
        self.message_listeners.add(listener);
    }

    pub fn message_listener_count(&self) -> usize {
        self.message_listeners.len()
    }

    // ========================================================================
    // Termination
    // ========================================================================

    /// Ask the isolate to terminate. Safe from any thread; takes effect at
    /// the next interrupt check.
    pub fn request_termination(&self) {
        self.termination_requested.store(true, Ordering::Release);
        self.stack_guard.request(InterruptFlag::TerminateExecution);
        debug!(isolate = self.id.as_u64(), "termination requested");
    }

    /// Throw the uncatchable termination exception
    pub fn terminate_execution(&self) -> IsolateResult<Value> {
        self.throw(Value::termination_exception(), None)
    }

    /// Undo a termination that has not unwound everything yet
    pub fn cancel_terminate_execution(&self) -> IsolateResult<()> {
        self.with_thread_local_top(|top| {
            if let Some(handler) = top.try_catch_handler_mut() {
                if handler.has_terminated {
                    handler.has_terminated = false;
                    handler.can_continue = true;
                }
            }
            if top.pending_exception().is_some_and(|e| e.is_termination_exception()) {
                top.set_external_caught_exception(false);
                top.clear_pending_exception();
            }
            if top.scheduled_exception().is_some_and(|e| e.is_termination_exception()) {
                top.set_external_caught_exception(false);
                top.clear_scheduled_exception();
            }
        })?;
        self.termination_requested.store(false, Ordering::Release);
        self.stack_guard.clear(InterruptFlag::TerminateExecution);
        Ok(())
    }

    /// Throw a RangeError for stack exhaustion
    pub fn stack_overflow(&self) -> IsolateResult<Value> {
        let error = self.new_error("RangeError", "Maximum call stack size exceeded")?;
        self.throw(error, None)
    }

    pub fn throw_illegal_operation(&self) -> IsolateResult<Value> {
        let exception = self.heap.lock().new_string("illegal access");
        self.throw(exception, None)
    }

    /// Allocate an error object carrying the current stack
    pub fn new_error(&self, name: &str, message: &str) -> IsolateResult<Value> {
        let stack = self.capture_simple_stack_trace(self.options.stack_trace_limit, FrameSkipMode::SkipNone)?;
        let mut heap = self.heap.lock();
        let error = heap.new_error(name, message);
        if let Some(e) = heap.error_mut(error) {
            e.stack = Some(stack);
        }
        Ok(error)
    }

    // ========================================================================
    // Unwinding
    // ========================================================================

    /// Find the handler for the pending exception and record where
    /// execution resumes. Fatal if no handler exists.
    pub fn unwind_and_find_handler(&self) -> IsolateResult<Value> {
        let builtins = self.require_builtins("unwind")?;
        let data = self.this_thread()?;
        let mut top = data.top();
        let env = UnwindEnv {
            code: &self.code_registry,
            builtins: &builtins,
            debug: &self.debug,
            materialized_objects: Some(&self.materialized_objects),
            deoptimizer_lazy_throw: &self.deoptimizer_lazy_throw,
            termination_requested: self.is_termination_requested(),
        };
        crate::execution::unwind_and_find_handler(&mut top, &env)
    }

    /// Consume the resumption point recorded by the last unwind
    pub fn take_pending_handler(&self) -> IsolateResult<Option<PendingHandler>> {
        self.with_thread_local_top(|top| top.take_pending_handler())
    }

    // ========================================================================
    // Catch prediction and promises
    // ========================================================================

    /// Predict who catches an exception thrown at the current point
    pub fn predict_exception_catcher(&self) -> IsolateResult<CatchPrediction> {
        let data = self.this_thread()?;
        let top = data.top();
        let heap = self.heap.lock();
        Ok(predict_exception_catcher(
            &top,
            &WalkEnv {
                heap: &heap,
                code: &self.code_registry,
            },
        ))
    }

    /// The promise an exception thrown now would reject, or undefined
    pub fn get_promise_on_stack_on_throw(&self) -> IsolateResult<Value> {
        let data = self.this_thread()?;
        let top = data.top();
        let mut heap = self.heap.lock();
        Ok(get_promise_on_stack_on_throw(&top, &self.code_registry, &mut heap))
    }

    pub fn promise_has_user_defined_reject_handler(&self, promise: Value) -> bool {
        promise_has_user_defined_reject_handler(&self.heap.lock(), promise)
    }

    pub fn push_promise(&self, promise: Value) -> IsolateResult<()> {
        self.with_thread_local_top(|top| top.push_promise(promise))
    }

    pub fn pop_promise(&self) -> IsolateResult<Option<Value>> {
        self.with_thread_local_top(|top| top.pop_promise())
    }

    pub fn is_promise_stack_empty(&self) -> IsolateResult<bool> {
        self.with_thread_local_top(|top| top.promise_stack().is_empty())
    }

    // ========================================================================
    // Stack traces
    // ========================================================================

    /// Call sites of the current stack, innermost first, followed by the
    /// async frames waiting on the current microtask
    pub fn capture_simple_stack_trace(&self, limit: usize, skip_mode: FrameSkipMode) -> IsolateResult<Vec<CallSiteInfo>> {
        let data = self.this_thread()?;
        let top = data.top();
        let heap = self.heap.lock();
        let env = WalkEnv {
            heap: &heap,
            code: &self.code_registry,
        };
        Ok(capture_simple_stack_trace(
            &top,
            &env,
            &self.trace_options(limit, skip_mode),
            &self.intrinsics(),
        ))
    }

    pub fn capture_detailed_stack_trace(&self, limit: usize) -> IsolateResult<Vec<StackFrameInfo>> {
        let data = self.this_thread()?;
        let top = data.top();
        let heap = self.heap.lock();
        let env = WalkEnv {
            heap: &heap,
            code: &self.code_registry,
        };
        Ok(capture_detailed_stack_trace(&top, &env, limit))
    }

    /// Render the current stack. A nested request gets the partial output;
    /// a second nested request is fatal.
    pub fn stack_trace_string(&self) -> IsolateResult<String> {
        let sites = self.capture_simple_stack_trace(self.options.stack_trace_limit, FrameSkipMode::SkipNone)?;
        let data = self.this_thread()?;
        Ok(data
            .stack_trace_printer()
            .render(format_call_sites("Stack trace:", &sites)))
    }

    /// Log the current stack trace and return it
    pub fn print_current_stack_trace(&self) -> IsolateResult<String> {
        let trace = self.stack_trace_string()?;
        info!(isolate = self.id.as_u64(), "{trace}");
        Ok(trace)
    }

    /// Source location of the innermost managed frame
    pub fn compute_location(&self) -> IsolateResult<Option<MessageLocation>> {
        let data = self.this_thread()?;
        let top = data.top();
        let heap = self.heap.lock();
        Ok(compute_location(
            &top,
            &WalkEnv {
                heap: &heap,
                code: &self.code_registry,
            },
        ))
    }

    // ========================================================================
    // Interrupts
    // ========================================================================

    /// Queue `callback` to run on the isolate's thread at the next
    /// interrupt check. Safe from any thread.
    pub fn request_interrupt(&self, callback: impl FnOnce(&Isolate) + Send + 'static) {
        self.interrupts.push(Box::new(callback));
        self.stack_guard.request(InterruptFlag::ApiInterrupt);
    }

    /// Run queued interrupt callbacks in FIFO order. Returns how many ran.
    pub fn invoke_api_interrupt_callbacks(&self) -> usize {
        let mut ran = 0;
        while let Some(callback) = self.interrupts.pop() {
            callback(self);
            ran += 1;
        }
        ran
    }

    /// Service pending interrupts. Returns the exception sentinel if
    /// execution must terminate, undefined otherwise.
    pub fn handle_interrupts(&self) -> IsolateResult<Value> {
        if self.stack_guard.take(InterruptFlag::TerminateExecution) {
            return self.terminate_execution();
        }
        if self.stack_guard.take(InterruptFlag::ApiInterrupt) {
            let ran = self.invoke_api_interrupt_callbacks();
            trace!(isolate = self.id.as_u64(), ran, "ran interrupt callbacks");
        }
        Ok(Value::undefined())
    }

    // ========================================================================
    // Roots
    // ========================================================================

    /// Visit every heap reference the isolate holds outside the heap
    pub fn iterate(&self, visitor: &mut dyn RootVisitor) {
        for data in self.thread_table.all() {
            data.top().iterate(visitor);
        }
        if let Some(handles) = self.subsystems.lock().global_handles.as_mut() {
            handles.iterate(visitor);
        }
        self.materialized_objects.lock().iterate(visitor);
    }

    /// Create a global handle keeping `value` alive
    pub fn create_global_handle(&self, value: Value) -> IsolateResult<usize> {
        let mut subsystems = self.subsystems.lock();
        let handles = subsystems.global_handles.as_mut().ok_or(IsolateError::InvalidState {
            operation: "create a global handle in",
            state: self.state(),
        })?;
        Ok(handles.create(value))
    }
}

/// Record the pending exception on the innermost external try-catch if it
/// is the top handler
fn propagate_to_external_try_catch(top: &mut ThreadLocalTop, handler_type: ExceptionHandlerType) -> bool {
    let Some(exception) = top.pending_exception() else {
        return false;
    };
    match handler_type {
        ExceptionHandlerType::JavaScript => {
            top.set_external_caught_exception(false);
            false
        }
        ExceptionHandlerType::None => {
            top.set_external_caught_exception(false);
            true
        }
        ExceptionHandlerType::External => {
            top.set_external_caught_exception(true);
            if !exception.is_catchable() {
                set_termination_on_external_try_catch(top);
            } else {
                let message = top.pending_message();
                if let Some(handler) = top.try_catch_handler_mut() {
                    handler.can_continue = true;
                    handler.has_terminated = false;
                    handler.exception = Some(exception);
                    if message.is_some() {
                        handler.message = message;
                    }
                }
            }
            true
        }
    }
}

fn set_termination_on_external_try_catch(top: &mut ThreadLocalTop) {
    if let Some(handler) = top.try_catch_handler_mut() {
        handler.can_continue = false;
        handler.has_terminated = true;
        handler.exception = Some(Value::termination_exception());
    }
}
