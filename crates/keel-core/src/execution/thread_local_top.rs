//! Per-thread execution state
//!
//! Everything here belongs to exactly one (thread, isolate) pair and is only
//! mutated by the owning thread. Other threads may read it during a global
//! pause, for root iteration.
//!
//! At most one of the pending and scheduled exception slots is occupied at
//! any time; the setters refuse to break that rule.

use crate::code::Address;
use crate::frames::{FrameSpec, FrameMarker, RawFrame, SegmentedStack, STACK_HANDLER_SIZE};
use crate::heap::{Root, RootVisitor};
use crate::isolate::{IsolateError, IsolateResult};
use crate::value::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::ThreadId;

/// Size of an external try-catch scope on the native stack
pub const EXTERNAL_TRY_CATCH_SIZE: usize = 64;

/// Handler record installed by an entry frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackHandler {
    pub address: Address,
}

/// Identifier of an external try-catch scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TryCatchId(u64);

impl TryCatchId {
    fn new() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        TryCatchId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// An embedder-installed scope that catches exceptions escaping managed code
#[derive(Debug, Clone)]
pub struct ExternalTryCatch {
    id: TryCatchId,
    address: Address,
    /// Report caught exceptions to message listeners anyway
    pub is_verbose: bool,
    /// Create a message object for caught exceptions
    pub capture_message: bool,
    pub exception: Option<Value>,
    pub message: Option<Value>,
    /// False once termination reached this scope
    pub can_continue: bool,
    pub has_terminated: bool,
    /// The embedder asked for the exception to be rethrown on exit
    pub rethrow: bool,
}

impl Default for ExternalTryCatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ExternalTryCatch {
    pub fn new() -> Self {
        Self {
            id: TryCatchId::new(),
            address: 0,
            is_verbose: false,
            capture_message: true,
            exception: None,
            message: None,
            can_continue: true,
            has_terminated: false,
            rethrow: false,
        }
    }

    pub fn verbose(mut self) -> Self {
        self.is_verbose = true;
        self
    }

    pub fn without_message(mut self) -> Self {
        self.capture_message = false;
        self
    }

    pub fn id(&self) -> TryCatchId {
        self.id
    }

    /// Native stack address of the scope
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn has_caught(&self) -> bool {
        self.exception.is_some()
    }

    /// Forget the caught exception
    pub fn reset(&mut self) {
        self.exception = None;
        self.message = None;
        self.rethrow = false;
    }
}

/// Where execution resumes after a handler was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingHandler {
    /// Context to install, or undefined to keep the frame's
    pub context: Value,
    pub entrypoint: Address,
    pub constant_pool: Address,
    pub fp: Address,
    pub sp: Address,
    /// Frames unwound above the handler frame
    pub frames_above_handler: usize,
}

/// Execution state of one thread inside one isolate
#[derive(Debug)]
pub struct ThreadLocalTop {
    thread_id: ThreadId,
    pending_exception: Option<Value>,
    scheduled_exception: Option<Value>,
    pending_message: Option<Value>,
    context: Value,
    external_caught_exception: bool,
    rethrowing_message: bool,
    handlers: Vec<StackHandler>,
    try_catches: Vec<ExternalTryCatch>,
    pending_handler: Option<PendingHandler>,
    stack: SegmentedStack,
    promise_stack: Vec<Value>,
    current_microtask: Value,
    array_join_stack: Vec<Value>,
}

impl ThreadLocalTop {
    pub fn new(thread_id: ThreadId) -> Self {
        Self {
            thread_id,
            pending_exception: None,
            scheduled_exception: None,
            pending_message: None,
            context: Value::undefined(),
            external_caught_exception: false,
            rethrowing_message: false,
            handlers: Vec::new(),
            try_catches: Vec::new(),
            pending_handler: None,
            stack: SegmentedStack::new(),
            promise_stack: Vec::new(),
            current_microtask: Value::undefined(),
            array_join_stack: Vec::new(),
        }
    }

    /// Reset to a clean state, keeping the owning thread
    pub fn initialize(&mut self) {
        *self = Self::new(self.thread_id);
    }

    /// Drop everything that keeps heap objects alive
    pub fn free(&mut self) {
        self.initialize();
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    // ========================================================================
    // Exception slots
    // ========================================================================

    pub fn pending_exception(&self) -> Option<Value> {
        self.pending_exception
    }

    pub fn has_pending_exception(&self) -> bool {
        self.pending_exception.is_some()
    }

    pub fn set_pending_exception(&mut self, exception: Value) -> IsolateResult<()> {
        if self.scheduled_exception.is_some() {
            return Err(IsolateError::ExceptionConflict(
                "cannot set a pending exception while one is scheduled",
            ));
        }
        self.pending_exception = Some(exception);
        Ok(())
    }

    pub fn clear_pending_exception(&mut self) -> Option<Value> {
        self.pending_exception.take()
    }

    pub fn scheduled_exception(&self) -> Option<Value> {
        self.scheduled_exception
    }

    pub fn has_scheduled_exception(&self) -> bool {
        self.scheduled_exception.is_some()
    }

    pub fn set_scheduled_exception(&mut self, exception: Value) -> IsolateResult<()> {
        if self.pending_exception.is_some() {
            return Err(IsolateError::ExceptionConflict(
                "cannot schedule an exception while one is pending",
            ));
        }
        self.scheduled_exception = Some(exception);
        Ok(())
    }

    pub fn clear_scheduled_exception(&mut self) -> Option<Value> {
        self.scheduled_exception.take()
    }

    /// Move the pending exception into the scheduled slot
    pub fn schedule_pending_exception(&mut self) -> IsolateResult<()> {
        let exception = self
            .pending_exception
            .take()
            .ok_or(IsolateError::NoPendingException)?;
        self.scheduled_exception = Some(exception);
        Ok(())
    }

    pub fn pending_message(&self) -> Option<Value> {
        self.pending_message
    }

    pub fn set_pending_message(&mut self, message: Option<Value>) {
        self.pending_message = message;
    }

    pub fn clear_pending_message(&mut self) -> Option<Value> {
        self.pending_message.take()
    }

    pub fn external_caught_exception(&self) -> bool {
        self.external_caught_exception
    }

    pub fn set_external_caught_exception(&mut self, caught: bool) {
        self.external_caught_exception = caught;
    }

    /// Consume the flag marking the next throw as a rethrow
    pub fn take_rethrowing_message(&mut self) -> bool {
        std::mem::take(&mut self.rethrowing_message)
    }

    pub fn set_rethrowing_message(&mut self, rethrowing: bool) {
        self.rethrowing_message = rethrowing;
    }

    pub fn context(&self) -> Value {
        self.context
    }

    pub fn set_context(&mut self, context: Value) {
        self.context = context;
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    /// Handlers installed by entry frames, outermost first
    pub fn handlers(&self) -> &[StackHandler] {
        &self.handlers
    }

    /// Address of the innermost managed-code handler
    pub fn js_handler_address(&self) -> Option<Address> {
        self.handlers.last().map(|h| h.address)
    }

    /// Drop handlers above `depth`
    pub(crate) fn truncate_handlers(&mut self, depth: usize) {
        self.handlers.truncate(depth);
    }

    /// Install an external try-catch scope; it becomes the innermost
    pub fn register_try_catch(&mut self, mut try_catch: ExternalTryCatch) -> TryCatchId {
        try_catch.address = self.stack.reserve_native(EXTERNAL_TRY_CATCH_SIZE);
        let id = try_catch.id;
        self.try_catches.push(try_catch);
        id
    }

    /// Remove the innermost external try-catch scope
    pub fn unregister_try_catch(&mut self, id: TryCatchId) -> IsolateResult<ExternalTryCatch> {
        match self.try_catches.last() {
            Some(top) if top.id == id => {}
            Some(_) if self.try_catches.iter().any(|t| t.id == id) => {
                return Err(IsolateError::TryCatchOrder)
            }
            _ => return Err(IsolateError::UnknownTryCatch(id)),
        }
        let try_catch = self.try_catches.pop().ok_or(IsolateError::UnknownTryCatch(id))?;
        self.stack
            .release_native(try_catch.address, EXTERNAL_TRY_CATCH_SIZE);
        Ok(try_catch)
    }

    /// Innermost external try-catch scope
    pub fn try_catch_handler(&self) -> Option<&ExternalTryCatch> {
        self.try_catches.last()
    }

    pub fn try_catch_handler_mut(&mut self) -> Option<&mut ExternalTryCatch> {
        self.try_catches.last_mut()
    }

    pub fn try_catch(&self, id: TryCatchId) -> Option<&ExternalTryCatch> {
        self.try_catches.iter().find(|t| t.id == id)
    }

    pub fn try_catch_mut(&mut self, id: TryCatchId) -> Option<&mut ExternalTryCatch> {
        self.try_catches.iter_mut().find(|t| t.id == id)
    }

    pub fn try_catch_handler_address(&self) -> Option<Address> {
        self.try_catches.last().map(|t| t.address)
    }

    pub fn pending_handler(&self) -> Option<&PendingHandler> {
        self.pending_handler.as_ref()
    }

    pub(crate) fn set_pending_handler(&mut self, handler: PendingHandler) {
        self.pending_handler = Some(handler);
    }

    /// Consume the resumption point left by the last unwind
    pub fn take_pending_handler(&mut self) -> Option<PendingHandler> {
        self.pending_handler.take()
    }

    // ========================================================================
    // Stack
    // ========================================================================

    pub fn stack(&self) -> &SegmentedStack {
        &self.stack
    }

    pub fn stack_mut(&mut self) -> &mut SegmentedStack {
        &mut self.stack
    }

    /// Push a frame. Entry frames also install a stack handler.
    pub fn push_frame(&mut self, spec: FrameSpec) -> Address {
        let is_entry = matches!(spec.marker(), FrameMarker::Entry | FrameMarker::ConstructEntry);
        let handler_index = self.handlers.len();
        let frame = self.stack.push(spec);
        let (fp, sp) = (frame.fp, frame.sp);
        if is_entry {
            self.handlers.push(StackHandler { address: sp });
            if let Some(frame) = self.stack.active_mut().frames_mut().last_mut() {
                frame.handler = Some(handler_index);
            }
        }
        fp
    }

    /// Pop the innermost frame, removing the handler an entry frame installed
    pub fn pop_frame(&mut self) -> Option<RawFrame> {
        let frame = self.stack.pop()?;
        if let Some(index) = frame.handler {
            self.handlers.truncate(index);
        }
        Some(frame)
    }

    /// Resumption sp for the handler at `index`
    pub fn handler_resume_sp(&self, index: usize) -> Option<Address> {
        self.handlers.get(index).map(|h| h.address + STACK_HANDLER_SIZE)
    }

    // ========================================================================
    // Promises and microtasks
    // ========================================================================

    /// Promise created by the innermost async function or promise executor
    pub fn push_promise(&mut self, promise: Value) {
        self.promise_stack.push(promise);
    }

    pub fn pop_promise(&mut self) -> Option<Value> {
        self.promise_stack.pop()
    }

    /// Tracked promises, outermost first
    pub fn promise_stack(&self) -> &[Value] {
        &self.promise_stack
    }

    pub fn current_microtask(&self) -> Value {
        self.current_microtask
    }

    pub fn set_current_microtask(&mut self, microtask: Value) {
        self.current_microtask = microtask;
    }

    /// Reentrancy guard for array joins in progress
    pub fn array_join_stack(&self) -> &[Value] {
        &self.array_join_stack
    }

    pub fn array_join_stack_mut(&mut self) -> &mut Vec<Value> {
        &mut self.array_join_stack
    }

    // ========================================================================
    // Roots
    // ========================================================================

    /// Visit every heap reference held by this thread
    pub fn iterate(&mut self, visitor: &mut dyn RootVisitor) {
        fn visit_option(
            visitor: &mut dyn RootVisitor,
            root: Root,
            description: &'static str,
            slot: &mut Option<Value>,
        ) {
            if let Some(value) = slot {
                visitor.visit_root(root, description, value);
            }
        }

        visit_option(visitor, Root::ThreadLocalTop, "pending exception", &mut self.pending_exception);
        visit_option(visitor, Root::ThreadLocalTop, "pending message", &mut self.pending_message);
        visitor.visit_root(Root::ThreadLocalTop, "context", &mut self.context);
        visit_option(visitor, Root::ThreadLocalTop, "scheduled exception", &mut self.scheduled_exception);
        visitor.visit_root(Root::ThreadLocalTop, "current microtask", &mut self.current_microtask);
        if let Some(handler) = &mut self.pending_handler {
            visitor.visit_root(Root::ThreadLocalTop, "pending handler context", &mut handler.context);
        }
        visitor.visit_roots(Root::ThreadLocalTop, "array join stack", &mut self.array_join_stack);

        for try_catch in &mut self.try_catches {
            visit_option(visitor, Root::ExternalTryCatch, "try-catch exception", &mut try_catch.exception);
            visit_option(visitor, Root::ExternalTryCatch, "try-catch message", &mut try_catch.message);
        }

        visitor.visit_roots(Root::PromiseStack, "promise stack", &mut self.promise_stack);

        for segment in self.stack.segments_mut() {
            for frame in segment.frames_mut() {
                visitor.visit_root(Root::StackRoots, "frame function", &mut frame.function);
                visitor.visit_root(Root::StackRoots, "frame receiver", &mut frame.receiver);
                visitor.visit_root(Root::StackRoots, "frame context", &mut frame.context);
                visitor.visit_root(Root::StackRoots, "frame exception", &mut frame.exception);
                visitor.visit_roots(Root::StackRoots, "frame registers", &mut frame.registers);
            }
        }
    }
}
