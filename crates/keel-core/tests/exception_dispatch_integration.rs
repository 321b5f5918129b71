//! Integration tests for exception dispatch
//!
//! Builds synthetic machine stacks through the isolate API and checks where
//! the unwinder resumes execution and what the catch predictor expects.

mod common;

use common::*;
use keel_core::code::{Builtin, BytecodeArray, CodeDesc, CodeKind, HandlerPrediction, HandlerTable};
use keel_core::frames::FrameSpec;
use keel_core::{CatchPrediction, ExternalTryCatch, Isolate, IsolateError, Value};

/// Runtime call frame on top of the managed frames
fn push_exit(isolate: &Isolate) {
    let centry = builtin(isolate, Builtin::CEntry);
    isolate.push_frame(FrameSpec::exit(&centry)).unwrap();
}

// ============================================================================
// Exception slots
// ============================================================================

#[test]
fn test_pending_and_scheduled_never_both_set() {
    fn both(isolate: &Isolate) -> bool {
        isolate.has_pending_exception().unwrap() && isolate.has_scheduled_exception().unwrap()
    }

    let isolate = isolate();

    isolate.throw(Value::smi(1), None).unwrap();
    assert!(!both(&isolate));
    assert!(matches!(
        isolate.set_scheduled_exception(Value::smi(2)),
        Err(IsolateError::ExceptionConflict(_))
    ));
    assert!(!both(&isolate));

    // Moving the pending exception to the scheduled slot empties the former
    isolate.register_try_catch(ExternalTryCatch::new()).unwrap();
    push_entry(&isolate);
    assert!(isolate.optional_reschedule_exception(false).unwrap());
    assert!(!isolate.has_pending_exception().unwrap());
    assert!(isolate.has_scheduled_exception().unwrap());

    assert!(matches!(
        isolate.set_pending_exception(Value::smi(3)),
        Err(IsolateError::ExceptionConflict(_))
    ));
    assert!(!both(&isolate));

    isolate.promote_scheduled_exception().unwrap();
    assert!(isolate.has_pending_exception().unwrap());
    assert!(!isolate.has_scheduled_exception().unwrap());
}

#[test]
fn test_unwind_requires_pending_exception() {
    let isolate = isolate();
    push_entry(&isolate);
    assert!(matches!(
        isolate.unwind_and_find_handler(),
        Err(IsolateError::NoPendingException)
    ));
}

// ============================================================================
// Unwinding
// ============================================================================

#[test]
fn test_entry_frame_catches_through_plain_frames() {
    for depth in 1..6 {
        let isolate = isolate();
        push_entry(&isolate);
        for i in 0..depth {
            let function = user_function(&isolate, &format!("f{i}"), bytecode(None, HandlerPrediction::Caught));
            push_interpreted(&isolate, function, 4);
        }

        let error = isolate.new_error("Error", "deep").unwrap();
        isolate.throw(error, None).unwrap();
        assert_eq!(isolate.unwind_and_find_handler().unwrap(), error);

        let handler = isolate.take_pending_handler().unwrap().unwrap();
        assert_eq!(handler.frames_above_handler, depth);
        assert!(!isolate.has_pending_exception().unwrap());
    }
}

#[test]
fn test_optimized_and_interpreted_frames_unwind_to_entry() {
    let isolate = isolate();
    push_entry(&isolate);
    let middle = user_function(&isolate, "middle", bytecode(None, HandlerPrediction::Caught));
    let code = optimized_code(&isolate);
    push_optimized(&isolate, &code, middle);
    let inner = user_function(&isolate, "inner", bytecode(None, HandlerPrediction::Caught));
    push_interpreted(&isolate, inner, 8);

    let error = isolate.new_error("Error", "x").unwrap();
    isolate.throw(error, None).unwrap();
    assert_eq!(isolate.unwind_and_find_handler().unwrap(), error);

    let handler = isolate.take_pending_handler().unwrap().unwrap();
    let js_entry = builtin(&isolate, Builtin::JSEntry);
    assert_eq!(handler.frames_above_handler, 2);
    assert_eq!(
        handler.entrypoint,
        js_entry.instruction_start() + Builtin::ENTRY_HANDLER_OFFSET as usize
    );
    assert!(handler.context.is_undefined());

    // The entry frame's stack handler is consumed
    assert!(isolate.with_thread_local_top(|top| top.handlers().is_empty()).unwrap());
    assert!(isolate.take_pending_handler().unwrap().is_none());
}

#[test]
fn test_interpreted_try_block_catches() {
    let isolate = isolate();
    push_entry(&isolate);
    let outer = user_function(&isolate, "outer", bytecode(Some((0, 8, 12)), HandlerPrediction::Caught));
    let outer_fp = push_interpreted(&isolate, outer, 4);
    let inner = user_function(&isolate, "inner", bytecode(None, HandlerPrediction::Caught));
    push_interpreted(&isolate, inner, 8);
    push_exit(&isolate);

    isolate.throw(Value::smi(42), None).unwrap();
    assert_eq!(isolate.unwind_and_find_handler().unwrap(), Value::smi(42));

    let handler = isolate.take_pending_handler().unwrap().unwrap();
    let enter_at_bytecode = builtin(&isolate, Builtin::InterpreterEnterAtBytecode);
    assert_eq!(handler.fp, outer_fp);
    assert_eq!(handler.entrypoint, enter_at_bytecode.instruction_start());
    // Exit and inner frames are dropped; the interpreter re-enters outer
    assert_eq!(handler.frames_above_handler, 1);

    let offset = isolate
        .with_thread_local_top(|top| {
            top.stack()
                .active()
                .frame_by_fp(outer_fp)
                .map(|frame| frame.bytecode_offset)
        })
        .unwrap();
    assert_eq!(offset, Some(12));

    // The entry frame's handler is left alone
    assert_eq!(isolate.with_thread_local_top(|top| top.handlers().len()).unwrap(), 1);
}

#[test]
fn test_offset_outside_try_range_is_not_caught() {
    let isolate = isolate();
    push_entry(&isolate);
    let outer = user_function(&isolate, "outer", bytecode(Some((0, 4, 12)), HandlerPrediction::Caught));
    push_interpreted(&isolate, outer, 8);
    push_exit(&isolate);

    isolate.throw(Value::smi(1), None).unwrap();
    isolate.unwind_and_find_handler().unwrap();
    let handler = isolate.take_pending_handler().unwrap().unwrap();
    assert_eq!(handler.frames_above_handler, 2);
    assert_eq!(handler.fp, keel_core::NULL_ADDRESS);
}

#[test]
fn test_continuation_frame_receives_exception() {
    let isolate = isolate();
    push_entry(&isolate);
    let continuation = builtin(&isolate, Builtin::JavaScriptBuiltinContinuationWithCatch);
    let continuation_fp = isolate
        .push_frame(FrameSpec::continuation_with_catch(&continuation))
        .unwrap();
    push_exit(&isolate);

    isolate.throw(Value::smi(5), None).unwrap();
    isolate.unwind_and_find_handler().unwrap();

    let handler = isolate.take_pending_handler().unwrap().unwrap();
    assert_eq!(handler.fp, continuation_fp);
    assert_eq!(handler.frames_above_handler, 1);
    let slot = isolate
        .with_thread_local_top(|top| {
            top.stack()
                .active()
                .frame_by_fp(continuation_fp)
                .map(|frame| frame.exception)
        })
        .unwrap();
    assert_eq!(slot, Some(Value::smi(5)));
}

#[test]
fn test_termination_skips_managed_handlers() {
    let isolate = isolate();
    push_entry(&isolate);
    let outer = user_function(&isolate, "outer", bytecode(Some((0, 8, 12)), HandlerPrediction::Caught));
    push_interpreted(&isolate, outer, 4);
    push_exit(&isolate);
    isolate
        .with_thread_local_top(|top| top.array_join_stack_mut().push(Value::smi(9)))
        .unwrap();

    isolate.terminate_execution().unwrap();
    assert_eq!(
        isolate.unwind_and_find_handler().unwrap(),
        Value::termination_exception()
    );
    let handler = isolate.take_pending_handler().unwrap().unwrap();
    assert_eq!(handler.frames_above_handler, 2);
    assert!(isolate
        .with_thread_local_top(|top| top.array_join_stack().is_empty())
        .unwrap());
}

#[test]
#[should_panic(expected = "No exception handler found")]
fn test_unwinding_without_entry_frame_is_fatal() {
    let isolate = isolate();
    isolate.throw(Value::smi(1), None).unwrap();
    let _ = isolate.unwind_and_find_handler();
}

#[test]
#[should_panic(expected = "entry frame at pc")]
fn test_entry_frame_without_code_is_fatal() {
    let isolate = isolate();
    let code = isolate
        .code_registry()
        .install(CodeDesc::new(CodeKind::Stub, 32))
        .unwrap();
    isolate.push_frame(FrameSpec::entry(&code)).unwrap();
    isolate.code_registry().remove(code.instruction_start());

    isolate.throw(Value::smi(1), None).unwrap();
    let _ = isolate.unwind_and_find_handler();
}

#[test]
#[should_panic(expected = "context register r5 out of range")]
fn test_handler_context_register_must_exist() {
    let isolate = isolate();
    push_entry(&isolate);
    let mut table = HandlerTable::new();
    table.push_range(0, 8, 12, 5, HandlerPrediction::Caught);
    let outer = user_function(&isolate, "outer", BytecodeArray::new(16, 2).with_handler_table(table));
    push_interpreted(&isolate, outer, 4);
    let inner = user_function(&isolate, "inner", bytecode(None, HandlerPrediction::Caught));
    push_interpreted(&isolate, inner, 8);

    isolate.throw(Value::smi(1), None).unwrap();
    let _ = isolate.unwind_and_find_handler();
}

// ============================================================================
// Catch prediction
// ============================================================================

#[test]
fn test_predict_caught_by_managed_code() {
    let isolate = isolate();
    push_entry(&isolate);
    let outer = user_function(&isolate, "outer", bytecode(Some((0, 8, 12)), HandlerPrediction::Caught));
    push_interpreted(&isolate, outer, 4);
    let inner = user_function(&isolate, "inner", bytecode(None, HandlerPrediction::Caught));
    push_interpreted(&isolate, inner, 8);

    assert_eq!(
        isolate.predict_exception_catcher().unwrap(),
        CatchPrediction::CaughtByManagedCode
    );
}

#[test]
fn test_predict_promise_rejection() {
    let isolate = isolate();
    push_entry(&isolate);
    let outer = user_function(&isolate, "outer", bytecode(Some((0, 8, 12)), HandlerPrediction::Promise));
    push_interpreted(&isolate, outer, 4);

    assert_eq!(
        isolate.predict_exception_catcher().unwrap(),
        CatchPrediction::CaughtByPromise
    );
}

#[test]
fn test_predict_not_caught() {
    let isolate = isolate();
    push_entry(&isolate);
    let inner = user_function(&isolate, "inner", bytecode(None, HandlerPrediction::Caught));
    push_interpreted(&isolate, inner, 8);

    assert_eq!(
        isolate.predict_exception_catcher().unwrap(),
        CatchPrediction::NotCaught
    );
}

#[test]
fn test_predict_external_handler_above_entry() {
    let isolate = isolate();
    push_entry(&isolate);
    let outer = user_function(&isolate, "outer", bytecode(Some((0, 8, 12)), HandlerPrediction::Caught));
    push_interpreted(&isolate, outer, 4);
    push_entry(&isolate);
    // Registered after the inner entry frame, so it is the innermost handler
    isolate.register_try_catch(ExternalTryCatch::new()).unwrap();
    let inner = user_function(&isolate, "inner", bytecode(None, HandlerPrediction::Caught));
    push_interpreted(&isolate, inner, 8);

    assert_eq!(
        isolate.predict_exception_catcher().unwrap(),
        CatchPrediction::CaughtByExternal
    );
}

#[test]
fn test_predict_external_handler_below_entry() {
    let isolate = isolate();
    // Same managed try block, but the external handler sits below both
    // entry frames and the managed handler gets the exception first
    isolate.register_try_catch(ExternalTryCatch::new()).unwrap();
    push_entry(&isolate);
    let outer = user_function(&isolate, "outer", bytecode(Some((0, 8, 12)), HandlerPrediction::Caught));
    push_interpreted(&isolate, outer, 4);
    push_entry(&isolate);
    let inner = user_function(&isolate, "inner", bytecode(None, HandlerPrediction::Caught));
    push_interpreted(&isolate, inner, 8);

    assert_eq!(
        isolate.predict_exception_catcher().unwrap(),
        CatchPrediction::CaughtByManagedCode
    );
}

#[test]
fn test_predict_external_handler_catches_after_last_entry() {
    let isolate = isolate();
    isolate.register_try_catch(ExternalTryCatch::new()).unwrap();
    push_entry(&isolate);
    let inner = user_function(&isolate, "inner", bytecode(None, HandlerPrediction::Caught));
    push_interpreted(&isolate, inner, 8);

    assert_eq!(
        isolate.predict_exception_catcher().unwrap(),
        CatchPrediction::CaughtByExternal
    );
}

#[test]
fn test_predict_verbose_external_handler_is_uncaught() {
    let isolate = isolate();
    isolate.register_try_catch(ExternalTryCatch::new().verbose()).unwrap();
    push_entry(&isolate);
    let inner = user_function(&isolate, "inner", bytecode(None, HandlerPrediction::Caught));
    push_interpreted(&isolate, inner, 8);

    assert_eq!(
        isolate.predict_exception_catcher().unwrap(),
        CatchPrediction::NotCaught
    );
}

#[test]
fn test_prediction_agrees_with_unwinder() {
    let isolate = isolate();
    push_entry(&isolate);
    let outer = user_function(&isolate, "outer", bytecode(Some((0, 8, 12)), HandlerPrediction::Caught));
    let outer_fp = push_interpreted(&isolate, outer, 4);
    push_exit(&isolate);

    assert_eq!(
        isolate.predict_exception_catcher().unwrap(),
        CatchPrediction::CaughtByManagedCode
    );
    isolate.throw(Value::smi(1), None).unwrap();
    isolate.unwind_and_find_handler().unwrap();
    assert_eq!(isolate.take_pending_handler().unwrap().unwrap().fp, outer_fp);
}
