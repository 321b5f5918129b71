//! Async stack stitching
//!
//! Physical frames stop at the microtask boundary. To show the functions
//! waiting on the current one, follow the promise it will settle: when its
//! single reaction is a known await or combinator closure, the suspended
//! generator (or aggregate promise) behind that closure is the next logical
//! frame.
//!
//! ```text
//!   promise ──reaction──► AsyncFunctionAwaitResolveClosure
//!                              │ context.extension
//!                              ▼
//!                          generator (suspended) ──► append async frame
//!                              │ .promise
//!                              ▼
//!                          next promise ...
//! ```

use super::stack_trace::{CallSiteBuilder, PromiseCombinator};
use super::thread_local_top::ThreadLocalTop;
use crate::code::Builtin;
use crate::fatal_check;
use crate::heap::{context_slots, GeneratorKind, ObjectHeap};
use crate::value::Value;

/// Combinator functions of an isolate, reported as the function of
/// combinator frames
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AsyncIntrinsics {
    pub promise_all: Value,
    pub promise_all_settled: Value,
    pub promise_any: Value,
}

impl AsyncIntrinsics {
    fn function_for(&self, combinator: PromiseCombinator) -> Value {
        match combinator {
            PromiseCombinator::All => self.promise_all,
            PromiseCombinator::AllSettled => self.promise_all_settled,
            PromiseCombinator::Any => self.promise_any,
        }
    }
}

fn is_builtin_function(heap: &ObjectHeap, function: Value, builtin: Builtin) -> bool {
    heap.function(function)
        .map_or(false, |f| f.code.builtin() == Some(builtin))
}

fn is_async_fulfill_handler(heap: &ObjectHeap, handler: Value) -> bool {
    [
        Builtin::AsyncFunctionAwaitResolveClosure,
        Builtin::AsyncGeneratorAwaitResolveClosure,
        Builtin::AsyncGeneratorYieldWithAwaitResolveClosure,
    ]
    .into_iter()
    .any(|b| is_builtin_function(heap, handler, b))
}

fn is_async_reject_handler(heap: &ObjectHeap, handler: Value) -> bool {
    [
        Builtin::AsyncFunctionAwaitRejectClosure,
        Builtin::AsyncGeneratorAwaitRejectClosure,
    ]
    .into_iter()
    .any(|b| is_builtin_function(heap, handler, b))
}

/// Generator captured by an await closure
fn awaiting_generator(heap: &ObjectHeap, closure: Value) -> Option<Value> {
    let context = heap.function(closure)?.context;
    let generator = heap.context(context)?.extension;
    heap.generator(generator).map(|_| generator)
}

/// Promise an async function or generator will settle next
fn generator_promise(heap: &ObjectHeap, generator: Value) -> Option<Value> {
    let g = heap.generator(generator)?;
    match g.kind {
        GeneratorKind::AsyncFunction => Some(g.promise),
        // The oldest request is the one being worked on
        GeneratorKind::AsyncGenerator => g.queue.first().copied(),
        GeneratorKind::Generator => None,
    }
}

fn combinator_capability_promise(heap: &ObjectHeap, element: Value) -> Option<Value> {
    let context = heap.function(element)?.context;
    let capability = heap.context(context)?.slot(context_slots::CAPABILITY);
    heap.capability(capability).map(|c| c.promise)
}

/// Append the async frames waiting on `promise`
pub fn capture_async_stack_trace_from_promise(
    mut promise: Value,
    intrinsics: &AsyncIntrinsics,
    builder: &mut CallSiteBuilder<'_>,
) {
    let heap = builder.heap();
    while !builder.full() {
        let Some(p) = heap.promise(promise) else {
            return;
        };
        if !p.is_pending() {
            return;
        }
        // Only a promise with exactly one reaction continues a single chain
        let [reaction] = p.reactions.as_slice() else {
            return;
        };

        let next = if is_async_fulfill_handler(heap, reaction.fulfill_handler)
            || is_async_reject_handler(heap, reaction.reject_handler)
        {
            let Some(generator) = awaiting_generator(heap, reaction.fulfill_handler) else {
                return;
            };
            let Some(g) = heap.generator(generator) else {
                return;
            };
            fatal_check!(g.is_suspended(), "awaiting generator is not suspended");
            builder.append_async_frame(g);
            generator_promise(heap, generator)
        } else if is_builtin_function(heap, reaction.fulfill_handler, Builtin::PromiseAllResolveElementClosure) {
            builder.append_promise_combinator_frame(
                reaction.fulfill_handler,
                PromiseCombinator::All,
                intrinsics.function_for(PromiseCombinator::All),
            );
            combinator_capability_promise(heap, reaction.fulfill_handler)
        } else if is_builtin_function(
            heap,
            reaction.fulfill_handler,
            Builtin::PromiseAllSettledResolveElementClosure,
        ) {
            builder.append_promise_combinator_frame(
                reaction.fulfill_handler,
                PromiseCombinator::AllSettled,
                intrinsics.function_for(PromiseCombinator::AllSettled),
            );
            combinator_capability_promise(heap, reaction.fulfill_handler)
        } else if is_builtin_function(heap, reaction.reject_handler, Builtin::PromiseAnyRejectElementClosure) {
            builder.append_promise_combinator_frame(
                reaction.reject_handler,
                PromiseCombinator::Any,
                intrinsics.function_for(PromiseCombinator::Any),
            );
            combinator_capability_promise(heap, reaction.reject_handler)
        } else if is_builtin_function(heap, reaction.fulfill_handler, Builtin::PromiseCapabilityDefaultResolve) {
            heap.function(reaction.fulfill_handler)
                .and_then(|f| heap.context(f.context))
                .map(|c| c.slot(context_slots::PROMISE))
        } else {
            // A generic chain: continue with the derived promise, if native
            let derived = reaction.promise_or_capability;
            if heap.promise(derived).is_some() {
                Some(derived)
            } else {
                heap.capability(derived)
                    .map(|c| c.promise)
                    .filter(|p| heap.promise(*p).is_some())
            }
        };

        match next {
            Some(next) => promise = next,
            None => return,
        }
    }
}

/// Append the async frames waiting on the microtask currently running
pub fn capture_async_stack_trace(
    top: &ThreadLocalTop,
    intrinsics: &AsyncIntrinsics,
    builder: &mut CallSiteBuilder<'_>,
) {
    let heap = builder.heap();
    let Some(job) = heap.reaction_job(top.current_microtask()) else {
        return;
    };

    if is_async_fulfill_handler(heap, job.handler) || is_async_reject_handler(heap, job.handler) {
        // The job resumes an await: the generator behind it is running now
        let Some(generator) = awaiting_generator(heap, job.handler) else {
            return;
        };
        if !heap.generator(generator).map_or(false, |g| g.is_executing()) {
            return;
        }
        if let Some(promise) = generator_promise(heap, generator) {
            capture_async_stack_trace_from_promise(promise, intrinsics, builder);
        }
    } else if heap.promise(job.promise_or_capability).is_some() {
        capture_async_stack_trace_from_promise(job.promise_or_capability, intrinsics, builder);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{BytecodeArray, Code, CodeDesc, CodeKind, Script, SharedFunctionInfo};
    use crate::execution::StackTraceOptions;
    use crate::heap::{
        Context, Generator, GeneratorState, HeapObject, JsFunction, PromiseCapability,
        PromiseReaction, PromiseReactionJob, ReactionKind,
    };
    use std::sync::Arc;

    fn builtin_closure(heap: &mut ObjectHeap, builtin: Builtin, context: Value, hash: u32) -> Value {
        let code = Arc::new(Code::install(builtin.descriptor(), 0x1000 + builtin.index() * 0x100));
        heap.allocate(HeapObject::Function(JsFunction {
            shared: Arc::new(
                SharedFunctionInfo::new(builtin.name(), BytecodeArray::new(0, 0))
                    .with_origin(crate::code::FunctionOrigin::Builtin),
            ),
            code,
            context,
            identity_hash: hash,
            is_forwarding_handler: false,
        }))
    }

    fn user_function(heap: &mut ObjectHeap, name: &str) -> Value {
        let code = Arc::new(Code::install(CodeDesc::new(CodeKind::Stub, 8), 0x9000));
        heap.allocate(HeapObject::Function(JsFunction {
            shared: Arc::new(
                SharedFunctionInfo::new(name, BytecodeArray::new(8, 1))
                    .with_script(Script::new("app.ks", "")),
            ),
            code,
            context: Value::undefined(),
            identity_hash: 1,
            is_forwarding_handler: false,
        }))
    }

    /// An async function suspended on `awaited`, returning its own promise
    fn suspended_async_function(heap: &mut ObjectHeap, name: &str, awaited: Value) -> Value {
        let function = user_function(heap, name);
        let own_promise = heap.new_promise();
        let generator = heap.allocate(HeapObject::Generator(Generator {
            kind: GeneratorKind::AsyncFunction,
            function,
            receiver: Value::undefined(),
            state: GeneratorState::Suspended,
            input_or_debug_pos: 0,
            promise: own_promise,
            queue: Vec::new(),
        }));
        let context = heap.allocate(HeapObject::Context(Context {
            extension: generator,
            slots: Vec::new(),
        }));
        let resolve = builtin_closure(heap, Builtin::AsyncFunctionAwaitResolveClosure, context, 0);
        let reject = builtin_closure(heap, Builtin::AsyncFunctionAwaitRejectClosure, context, 0);
        heap.promise_mut(awaited).unwrap().reactions.push(PromiseReaction {
            fulfill_handler: resolve,
            reject_handler: reject,
            promise_or_capability: Value::undefined(),
        });
        own_promise
    }

    #[test]
    fn test_await_chain() {
        let mut heap = ObjectHeap::new();
        let leaf = heap.new_promise();
        let middle = suspended_async_function(&mut heap, "middle", leaf);
        let _outer = suspended_async_function(&mut heap, "outer", middle);

        let mut builder = CallSiteBuilder::new(&heap, &StackTraceOptions::default());
        capture_async_stack_trace_from_promise(leaf, &AsyncIntrinsics::default(), &mut builder);
        let names: Vec<_> = builder.build().into_iter().map(|s| s.function_name).collect();
        assert_eq!(names, vec!["middle", "outer"]);
    }

    #[test]
    fn test_promise_all_frame() {
        let mut heap = ObjectHeap::new();
        let element_promise = heap.new_promise();
        let aggregate = heap.new_promise();
        let capability = heap.allocate(HeapObject::PromiseCapability(PromiseCapability {
            promise: aggregate,
            resolve: Value::undefined(),
            reject: Value::undefined(),
        }));
        let context = heap.allocate(HeapObject::Context(Context {
            extension: Value::undefined(),
            slots: vec![capability],
        }));
        let element = builtin_closure(&mut heap, Builtin::PromiseAllResolveElementClosure, context, 3);
        heap.promise_mut(element_promise).unwrap().reactions.push(PromiseReaction {
            fulfill_handler: element,
            reject_handler: Value::undefined(),
            promise_or_capability: Value::undefined(),
        });
        let _waiter = suspended_async_function(&mut heap, "main", aggregate);

        let promise_all = heap.allocate(HeapObject::Plain);
        let intrinsics = AsyncIntrinsics {
            promise_all,
            ..Default::default()
        };
        let mut builder = CallSiteBuilder::new(&heap, &StackTraceOptions::default());
        capture_async_stack_trace_from_promise(element_promise, &intrinsics, &mut builder);
        let sites = builder.build();
        assert_eq!(sites.len(), 2);
        assert_eq!(sites[0].promise_combinator, Some((PromiseCombinator::All, 2)));
        assert_eq!(sites[0].to_string(), "async Promise.all (index 2)");
        assert_eq!(sites[1].function_name, "main");
    }

    #[test]
    fn test_stops_at_settled_or_branching_promise() {
        let mut heap = ObjectHeap::new();
        let leaf = heap.new_promise();
        suspended_async_function(&mut heap, "a", leaf);
        suspended_async_function(&mut heap, "b", leaf);

        let mut builder = CallSiteBuilder::new(&heap, &StackTraceOptions::default());
        capture_async_stack_trace_from_promise(leaf, &AsyncIntrinsics::default(), &mut builder);
        assert!(builder.is_empty());
    }

    #[test]
    fn test_current_microtask_resumes_executing_generator() {
        let mut heap = ObjectHeap::new();
        let awaited = heap.new_promise();
        let own = suspended_async_function(&mut heap, "inner", awaited);
        suspended_async_function(&mut heap, "caller", own);

        let resolve = heap.promise(awaited).unwrap().reactions[0].fulfill_handler;
        let generator = awaiting_generator(&heap, resolve).unwrap();
        heap.generator_mut(generator).unwrap().state = GeneratorState::Executing;
        let job = heap.allocate(HeapObject::ReactionJob(PromiseReactionJob {
            kind: ReactionKind::Fulfill,
            handler: resolve,
            promise_or_capability: Value::undefined(),
        }));

        let mut top = ThreadLocalTop::new(std::thread::current().id());
        top.set_current_microtask(job);
        let mut builder = CallSiteBuilder::new(&heap, &StackTraceOptions::default());
        capture_async_stack_trace(&top, &AsyncIntrinsics::default(), &mut builder);
        let names: Vec<_> = builder.build().into_iter().map(|s| s.function_name).collect();
        assert_eq!(names, vec!["caller"]);
    }
}
