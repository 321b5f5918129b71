//! Catch prediction
//!
//! Answers "who will catch this exception?" without unwinding anything.
//! Debuggers use it to decide whether to pause on an exception, and promise
//! hooks use it to find the promise an exception will reject.

use super::thread_local_top::ThreadLocalTop;
use super::WalkEnv;
use crate::code::{AbstractCode, CodeKind, CodeLookup, HandlerPrediction};
use crate::frames::{
    BuiltinFrame, CommonFrame, ContinuationFrame, EntryFrame, FrameVisitor, OptimizedFrame,
    StackFrame, StackFrameIterator, StubFrame, UnoptimizedFrame,
};
use crate::heap::ObjectHeap;
use crate::value::Value;

/// Who is expected to catch an exception thrown now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CatchPrediction {
    NotCaught,
    CaughtByManagedCode,
    CaughtByPromise,
    CaughtByAsyncAwait,
    CaughtByExternal,
}

impl From<HandlerPrediction> for CatchPrediction {
    fn from(prediction: HandlerPrediction) -> Self {
        match prediction {
            HandlerPrediction::Uncaught => CatchPrediction::NotCaught,
            HandlerPrediction::Caught => CatchPrediction::CaughtByManagedCode,
            HandlerPrediction::Promise => CatchPrediction::CaughtByPromise,
            HandlerPrediction::AsyncAwait | HandlerPrediction::UncaughtAsyncAwait => {
                CatchPrediction::CaughtByAsyncAwait
            }
        }
    }
}

/// Which kind of handler is innermost on the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionHandlerType {
    /// A stack handler installed by an entry frame
    JavaScript,
    /// An embedder try-catch scope
    External,
    None,
}

/// Innermost handler for `exception`. Uncatchable exceptions skip managed
/// handlers entirely.
pub fn top_exception_handler_type(top: &ThreadLocalTop, exception: Value) -> ExceptionHandlerType {
    let js_handler = top.js_handler_address();
    let external_handler = top.try_catch_handler_address();

    let Some(js_handler) = js_handler.filter(|_| exception.is_catchable()) else {
        return if external_handler.is_some() {
            ExceptionHandlerType::External
        } else {
            ExceptionHandlerType::None
        };
    };
    match external_handler {
        None => ExceptionHandlerType::JavaScript,
        // Stacks grow down: the lower address is the more recent scope
        Some(external) if external < js_handler => ExceptionHandlerType::External,
        Some(_) => ExceptionHandlerType::JavaScript,
    }
}

/// Prediction for a single managed frame
pub fn predict_exception(frame: &StackFrame<'_>, heap: &ObjectHeap) -> HandlerPrediction {
    match frame {
        StackFrame::Optimized(f) => {
            if f.lookup_handler_in_table().is_none() {
                return HandlerPrediction::Uncaught;
            }
            // Inlined functions, innermost first
            for summary in frame.summarize(heap).iter().rev() {
                let prediction = match &summary.abstract_code {
                    AbstractCode::Code(code) if code.kind() == CodeKind::Builtin => {
                        code.builtin_catch_prediction()
                    }
                    AbstractCode::Code(_) => continue,
                    AbstractCode::Bytecode(bytecode) => {
                        match bytecode.handler_table.lookup_range(summary.code_offset) {
                            Some(range) => range.prediction,
                            None => continue,
                        }
                    }
                };
                if prediction != HandlerPrediction::Uncaught {
                    return prediction;
                }
            }
            HandlerPrediction::Uncaught
        }
        StackFrame::Interpreted(f) | StackFrame::Baseline(f) => f
            .lookup_handler_in_table()
            .map_or(HandlerPrediction::Uncaught, |range| range.prediction),
        _ => HandlerPrediction::Uncaught,
    }
}

/// Builtin prediction for stub-like frames, if their code can catch at all
fn builtin_frame_prediction(frame: &CommonFrame<'_>) -> Option<HandlerPrediction> {
    let code = frame.code()?;
    (code.kind() == CodeKind::Builtin && code.is_turbofanned() && !code.handler_table().is_empty())
        .then(|| code.builtin_catch_prediction())
}

struct CatcherPredictor<'t, 'h> {
    top: &'t ThreadLocalTop,
    heap: &'h ObjectHeap,
    result: CatchPrediction,
}

impl CatcherPredictor<'_, '_> {
    fn finish(&mut self, prediction: CatchPrediction) -> bool {
        if prediction == CatchPrediction::NotCaught {
            return true;
        }
        self.result = prediction;
        false
    }
}

impl<'a> FrameVisitor<'a> for CatcherPredictor<'_, '_> {
    fn visit_entry(&mut self, frame: &EntryFrame<'a>) -> bool {
        let Some(external) = self.top.try_catch_handler() else {
            return true;
        };
        if external.is_verbose {
            return true;
        }
        // The handler below this entry frame's own handler
        let entry_handler = frame
            .handler_index()
            .and_then(|i| i.checked_sub(1))
            .and_then(|i| self.top.handlers().get(i))
            .map(|h| h.address);
        match entry_handler {
            Some(next) if next <= external.address() => true,
            _ => self.finish(CatchPrediction::CaughtByExternal),
        }
    }

    fn visit_unoptimized(&mut self, frame: &UnoptimizedFrame<'a>) -> bool {
        let prediction = frame
            .lookup_handler_in_table()
            .map_or(HandlerPrediction::Uncaught, |range| range.prediction);
        self.finish(prediction.into())
    }

    fn visit_optimized(&mut self, frame: &OptimizedFrame<'a>) -> bool {
        let prediction = predict_exception(&StackFrame::Optimized(frame.clone()), self.heap);
        self.finish(prediction.into())
    }

    fn visit_builtin(&mut self, _frame: &BuiltinFrame<'a>) -> bool {
        true
    }

    fn visit_stub(&mut self, frame: &StubFrame<'a>) -> bool {
        match builtin_frame_prediction(&frame.0) {
            Some(prediction) => self.finish(prediction.into()),
            None => true,
        }
    }

    fn visit_continuation(&mut self, frame: &ContinuationFrame<'a>) -> bool {
        match frame.0.code() {
            Some(code) => self.finish(code.builtin_catch_prediction().into()),
            None => true,
        }
    }
}

/// Predict who catches an exception thrown at the current point
pub fn predict_exception_catcher(top: &ThreadLocalTop, env: &WalkEnv<'_>) -> CatchPrediction {
    if top_exception_handler_type(top, Value::undefined()) == ExceptionHandlerType::External {
        return CatchPrediction::CaughtByExternal;
    }

    let mut predictor = CatcherPredictor {
        top,
        heap: env.heap,
        result: CatchPrediction::NotCaught,
    };
    for frame in StackFrameIterator::new(top.stack().active(), env.code) {
        if !frame.accept(&mut predictor) {
            break;
        }
    }
    predictor.result
}

/// Whether a reject handler on `promise`, or on anything it forwards to, is
/// user code
pub fn promise_has_user_defined_reject_handler(heap: &ObjectHeap, promise: Value) -> bool {
    let mut pending = Vec::new();
    let mut current = promise;
    // Descend through outer promises, collecting the pending ones
    loop {
        let Some(p) = heap.promise(current) else {
            break;
        };
        if p.handled_hint {
            return true;
        }
        if p.is_pending() {
            pending.push(current);
        }
        if heap.promise(p.handled_by).is_none() || pending.len() > 1024 {
            break;
        }
        current = p.handled_by;
    }

    pending
        .iter()
        .rev()
        .any(|&p| reactions_have_user_reject_handler(heap, p, 0))
}

fn is_reject_handler(heap: &ObjectHeap, handler: Value) -> bool {
    match heap.function(handler) {
        Some(function) => !function.is_forwarding_handler,
        None => handler.is_object(),
    }
}

fn reactions_have_user_reject_handler(heap: &ObjectHeap, promise: Value, depth: usize) -> bool {
    if depth > 64 {
        return false;
    }
    let Some(p) = heap.promise(promise) else {
        return false;
    };
    p.reactions.iter().any(|reaction| {
        let derived = if heap.promise(reaction.promise_or_capability).is_some() {
            reaction.promise_or_capability
        } else if let Some(capability) = heap.capability(reaction.promise_or_capability) {
            capability.promise
        } else {
            return false;
        };
        if !reaction.reject_handler.is_undefined() && is_reject_handler(heap, reaction.reject_handler)
        {
            return true;
        }
        promise_has_user_defined_reject_handler(heap, derived)
            || reactions_have_user_reject_handler(heap, derived, depth + 1)
    })
}

/// The promise an exception thrown now will reject, or undefined
///
/// A promise found behind a managed `catch` is marked as handled.
pub fn get_promise_on_stack_on_throw(
    top: &ThreadLocalTop,
    code: &dyn CodeLookup,
    heap: &mut ObjectHeap,
) -> Value {
    let (promise, caught) = find_promise_on_stack(top, &WalkEnv { heap: &*heap, code });
    if caught {
        if let Some(p) = heap.promise_mut(promise) {
            p.handled_hint = true;
        }
    }
    promise
}

fn find_promise_on_stack(top: &ThreadLocalTop, env: &WalkEnv<'_>) -> (Value, bool) {
    let promises = top.promise_stack();
    let mut promise_index = promises.len();
    let mut result = Value::undefined();

    for frame in StackFrameIterator::new(top.stack().active(), env.code) {
        let prediction = if frame.is_java_script() {
            predict_exception(&frame, env.heap)
        } else if let StackFrame::Stub(f) = &frame {
            match builtin_frame_prediction(&f.0) {
                Some(prediction) => prediction,
                None => continue,
            }
        } else {
            continue;
        };

        match prediction {
            HandlerPrediction::Uncaught => continue,
            HandlerPrediction::Caught => return (result, true),
            HandlerPrediction::Promise => {
                let promise = promise_index
                    .checked_sub(1)
                    .map_or(Value::undefined(), |i| promises[i]);
                return (promise, false);
            }
            HandlerPrediction::AsyncAwait | HandlerPrediction::UncaughtAsyncAwait => {
                // Assume async calls are awaited: keep popping async frames
                // until one has a dependent that handles the rejection
                let Some(index) = promise_index.checked_sub(1) else {
                    return (result, false);
                };
                result = promises[index];
                if promise_has_user_defined_reject_handler(env.heap, result) {
                    return (result, false);
                }
                promise_index = index;
            }
        }
    }
    (result, false)
}
