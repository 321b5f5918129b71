//! Exception dispatch
//!
//! Walks the thread's stack from the innermost frame outwards until a frame
//! can handle the pending exception, then records where execution resumes.
//!
//! ```text
//!   frame          catchable exception             uncatchable exception
//!   ─────────────  ──────────────────────────────  ───────────────────────
//!   entry          always: pop its stack handler   always
//!   optimized      return-table hit                skipped
//!   stub           turbofanned builtin with table  skipped
//!   interpreted    range-table hit                 skipped
//!   baseline       range-table hit                 skipped
//!   continuation   always                          skipped
//!   builtin        never (no tables)               skipped
//! ```
//!
//! Running off the bottom of a switchable segment continues in its parent.
//! Running off the bottom of the last segment is fatal: every stack starts
//! with an entry frame.

use super::thread_local_top::{PendingHandler, StackHandler, ThreadLocalTop};
use crate::code::{Address, Builtin, Builtins, CodeLookup, NULL_ADDRESS};
use crate::debug::Debug;
use crate::fatal::{fatal_error, FatalError};
use crate::fatal_check;
use crate::frames::{StackFrame, StackFrameIterator, UnoptimizedFrame, STACK_HANDLER_SIZE};
use crate::isolate::{IsolateError, IsolateResult, MaterializedObjectStore};
use crate::value::Value;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Collaborators the unwinder consults
pub struct UnwindEnv<'a> {
    pub code: &'a dyn CodeLookup,
    pub builtins: &'a Builtins,
    pub debug: &'a Debug,
    pub materialized_objects: Option<&'a Mutex<MaterializedObjectStore>>,
    pub deoptimizer_lazy_throw: &'a AtomicBool,
    /// Termination was requested; nothing is catchable by managed code
    pub termination_requested: bool,
}

/// Frame state to patch once the handler is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FramePatch {
    None,
    /// Entry frame: drop its handler and everything above it
    PopStackHandler { depth: usize },
    /// Interpreted frame resumes at the handler's bytecode offset
    BytecodeOffset { fp: Address, offset: u32 },
    /// Baseline frame takes the context from the handler's register
    Context { fp: Address, context: Value },
    /// Continuation frame receives the exception in its slot
    Exception { fp: Address, exception: Value },
}

#[derive(Debug)]
struct HandlerMatch {
    handler: PendingHandler,
    patch: FramePatch,
    lazy_throw: bool,
    clear_restart: bool,
}

impl HandlerMatch {
    fn new(handler: PendingHandler) -> Self {
        Self {
            handler,
            patch: FramePatch::None,
            lazy_throw: false,
            clear_restart: false,
        }
    }

    fn with_patch(mut self, patch: FramePatch) -> Self {
        self.patch = patch;
        self
    }
}

/// Find the handler for the pending exception and record it in `top`.
///
/// On success the pending exception is cleared, the resumption point is
/// stored as the pending handler, and the exception is returned.
pub fn unwind_and_find_handler(
    top: &mut ThreadLocalTop,
    env: &UnwindEnv<'_>,
) -> IsolateResult<Value> {
    let exception = top
        .pending_exception()
        .ok_or(IsolateError::NoPendingException)?;
    let catchable = exception.is_catchable() && !env.termination_requested;

    if !catchable {
        top.array_join_stack_mut().clear();
    }

    let mut visited_frames = 0usize;
    loop {
        let found = {
            let segment = top.stack().active();
            let handlers = top.handlers();
            let mut found = None;
            for frame in StackFrameIterator::new(segment, env.code) {
                if let Some(m) = lookup_in_frame(&frame, visited_frames, catchable, exception, handlers, env) {
                    found = Some(m);
                    break;
                }
                if frame.is_turbofan() {
                    if let Some(store) = env.materialized_objects {
                        store.lock().remove(frame.fp());
                    }
                }
                visited_frames += 1;
            }
            found
        };

        match found {
            Some(m) => {
                tracing::trace!(
                    frames = m.handler.frames_above_handler,
                    entrypoint = m.handler.entrypoint,
                    "found exception handler"
                );
                apply(top, env, m);
                top.clear_pending_exception();
                return Ok(exception);
            }
            None => {
                // Continue in the segment this one returns to
                if top.stack_mut().switch_to_parent().is_none() {
                    fatal_error(FatalError::NoHandlerFound);
                }
            }
        }
    }
}

fn apply(top: &mut ThreadLocalTop, env: &UnwindEnv<'_>, m: HandlerMatch) {
    if m.lazy_throw {
        env.deoptimizer_lazy_throw.store(true, Ordering::Release);
    }
    if m.clear_restart {
        env.debug.clear_restart_frame();
    }
    match m.patch {
        FramePatch::None => {}
        FramePatch::PopStackHandler { depth } => top.truncate_handlers(depth),
        FramePatch::BytecodeOffset { fp, offset } => {
            if let Some(frame) = top.stack_mut().active_mut().frame_by_fp_mut(fp) {
                frame.bytecode_offset = offset;
            }
        }
        FramePatch::Context { fp, context } => {
            if let Some(frame) = top.stack_mut().active_mut().frame_by_fp_mut(fp) {
                frame.context = context;
            }
        }
        FramePatch::Exception { fp, exception } => {
            if let Some(frame) = top.stack_mut().active_mut().frame_by_fp_mut(fp) {
                frame.exception = exception;
            }
        }
    }
    top.set_pending_handler(m.handler);
}

fn found(
    context: Value,
    entrypoint: Address,
    constant_pool: Address,
    fp: Address,
    sp: Address,
    frames_above_handler: usize,
) -> HandlerMatch {
    HandlerMatch::new(PendingHandler {
        context,
        entrypoint,
        constant_pool,
        fp,
        sp,
        frames_above_handler,
    })
}

fn lookup_in_frame(
    frame: &StackFrame<'_>,
    visited_frames: usize,
    catchable: bool,
    exception: Value,
    handlers: &[StackHandler],
    env: &UnwindEnv<'_>,
) -> Option<HandlerMatch> {
    if env.debug.should_restart_frame(frame.id()) {
        return Some(restart_frame(frame, visited_frames, catchable, env));
    }

    match frame {
        StackFrame::Entry(f) | StackFrame::ConstructEntry(f) => {
            let Some(index) = f.handler_index() else {
                fatal_error(FatalError::InvariantViolation(
                    "entry frame without a stack handler".into(),
                ));
            };
            let Some(handler) = handlers.get(index) else {
                fatal_error(FatalError::InvariantViolation(format!(
                    "entry frame handler {index} is not installed"
                )));
            };
            let Some(code) = f.0.code() else {
                fatal_error(FatalError::InvariantViolation(format!(
                    "entry frame at pc {:#x} has no code",
                    f.0.pc()
                )));
            };
            // Entry trampolines have a single return entry for the call out
            let Some(offset) = code.handler_table().lookup_return(0) else {
                fatal_error(FatalError::InvariantViolation(
                    "entry trampoline has no handler".into(),
                ));
            };
            Some(
                found(
                    Value::undefined(),
                    code.instruction_start() + offset as usize,
                    code.constant_pool(),
                    NULL_ADDRESS,
                    handler.address + STACK_HANDLER_SIZE,
                    visited_frames,
                )
                .with_patch(FramePatch::PopStackHandler { depth: index }),
            )
        }

        StackFrame::Optimized(f) => {
            if !catchable {
                return None;
            }
            let code = f.0.code()?;
            let mut offset = f.lookup_handler_in_table()?;
            let mut lazy_throw = false;
            if code.kind().can_deoptimize() && code.marked_for_deoptimization() {
                // The deoptimizer rethrows at the call site once the frame
                // has been converted back to unoptimized frames
                offset = f.0.pc_offset();
                lazy_throw = true;
            }
            let mut m = found(
                Value::undefined(),
                code.instruction_start() + offset as usize,
                code.constant_pool(),
                f.0.fp(),
                f.handler_sp(),
                visited_frames,
            );
            m.lazy_throw = lazy_throw;
            Some(m)
        }

        StackFrame::Stub(f) => {
            if !catchable {
                return None;
            }
            let code = f.0.code()?;
            let offset = f.lookup_handler_in_table()?;
            let slots = code.stack_slots() as usize;
            let sp = f.0.fp() + crate::frames::FIXED_FRAME_SIZE_ABOVE_FP
                - slots * crate::code::POINTER_SIZE;
            Some(found(
                Value::undefined(),
                code.instruction_start() + offset as usize,
                code.constant_pool(),
                f.0.fp(),
                sp,
                visited_frames,
            ))
        }

        StackFrame::Interpreted(f) => {
            if !catchable {
                return None;
            }
            let range = f.lookup_handler_in_table()?;
            let context = context_register(f, range.context_register);
            fatal_check!(
                visited_frames >= 1,
                "interpreted handler frame must be below the frame that threw"
            );
            let code = env.builtins.code(Builtin::InterpreterEnterAtBytecode);
            Some(
                found(
                    context,
                    code.instruction_start(),
                    code.constant_pool(),
                    f.0.fp(),
                    f.handler_sp(),
                    // The interpreter re-enters the frame itself
                    visited_frames - 1,
                )
                .with_patch(FramePatch::BytecodeOffset {
                    fp: f.0.fp(),
                    offset: range.handler,
                }),
            )
        }

        StackFrame::Baseline(f) => {
            if !catchable {
                return None;
            }
            let range = f.lookup_handler_in_table()?;
            let code = f.0.code()?;
            let context = context_register(f, range.context_register);
            let Some(pc) = code.pc_for_bytecode_offset(range.handler) else {
                fatal_error(FatalError::InvariantViolation(format!(
                    "baseline code has no pc for handler offset {}",
                    range.handler
                )));
            };
            Some(
                found(
                    Value::undefined(),
                    pc,
                    code.constant_pool(),
                    f.0.fp(),
                    f.handler_sp(),
                    visited_frames,
                )
                .with_patch(FramePatch::Context {
                    fp: f.0.fp(),
                    context,
                }),
            )
        }

        StackFrame::Builtin(f) => {
            if catchable {
                if let Some(code) = f.0.code() {
                    fatal_check!(
                        code.handler_table().lookup_return(f.0.pc_offset()).is_none(),
                        "builtin frame {} has an exception handler",
                        code.builtin().map_or("?", |b| b.name())
                    );
                }
            }
            None
        }

        StackFrame::BuiltinContinuationWithCatch(f) => {
            if !catchable {
                return None;
            }
            let code = f.0.code()?;
            let sp = f.0.sp();
            Some(
                found(
                    Value::undefined(),
                    code.instruction_start(),
                    code.constant_pool(),
                    f.0.fp(),
                    sp,
                    visited_frames,
                )
                .with_patch(FramePatch::Exception {
                    fp: f.0.fp(),
                    exception,
                }),
            )
        }

        StackFrame::Exit(_) | StackFrame::Native(_) => None,
    }
}

/// Value of the register holding the handler's context
fn context_register(frame: &UnoptimizedFrame<'_>, index: u32) -> Value {
    match frame.0.raw().registers.get(index as usize) {
        Some(&context) => context,
        None => fatal_error(FatalError::InvariantViolation(format!(
            "context register r{index} out of range for a frame with {} registers",
            frame.register_count()
        ))),
    }
}

fn restart_frame(
    frame: &StackFrame<'_>,
    visited_frames: usize,
    catchable: bool,
    env: &UnwindEnv<'_>,
) -> HandlerMatch {
    fatal_check!(!catchable, "frame restart requires an uncatchable exception");
    fatal_check!(frame.is_java_script(), "only managed frames can be restarted");

    if let StackFrame::Optimized(f) = frame {
        // Optimized frames restart through lazy deoptimization
        let Some(code) = f.0.code() else {
            fatal_error(FatalError::InvariantViolation(
                "restarted optimized frame has no code".into(),
            ));
        };
        fatal_check!(
            code.marked_for_deoptimization(),
            "restarted optimized frame must be marked for deoptimization"
        );
        let mut m = found(
            Value::undefined(),
            code.instruction_start() + f.0.pc_offset() as usize,
            code.constant_pool(),
            f.0.fp(),
            f.handler_sp(),
            visited_frames,
        );
        m.lazy_throw = true;
        return m;
    }

    let code = env.builtins.code(Builtin::RestartFrameTrampoline);
    let mut m = found(
        Value::undefined(),
        code.instruction_start(),
        code.constant_pool(),
        frame.fp(),
        NULL_ADDRESS,
        visited_frames,
    );
    m.clear_restart = true;
    m
}
