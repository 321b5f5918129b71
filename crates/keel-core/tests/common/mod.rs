//! Shared fixtures for the integration tests

#![allow(dead_code)]

use keel_core::code::{
    Builtin, BytecodeArray, Code, CodeDesc, CodeKind, HandlerPrediction, HandlerTable, Script,
    SharedFunctionInfo, SourcePositionTable,
};
use keel_core::fatal::{panic_on_fatal, set_fatal_error_handler};
use keel_core::frames::FrameSpec;
use keel_core::heap::{HeapObject, JsFunction};
use keel_core::platform::{Platform, ProcessOptions};
use keel_core::{Address, Isolate, IsolateOptions, Value};
use std::sync::Arc;

pub const SOURCE: &str = "function outer() {\n  try {\n    inner();\n  } catch (e) {}\n}\nfunction inner() {\n  throw new Error('x');\n}\n";

/// Make fatal errors panic so `#[should_panic]` can observe them
pub fn panic_on_fatal_errors() {
    set_fatal_error_handler(panic_on_fatal);
}

pub fn platform() -> Arc<Platform> {
    panic_on_fatal_errors();
    Platform::new(ProcessOptions::default())
}

pub fn options() -> IsolateOptions {
    IsolateOptions::default().without_concurrent_recompilation()
}

/// An initialized isolate on a private platform
pub fn isolate() -> Arc<Isolate> {
    Isolate::new(platform(), options()).expect("isolate init")
}

pub fn builtin(isolate: &Isolate, builtin: Builtin) -> Arc<Code> {
    Arc::clone(isolate.builtins().expect("builtins installed").code(builtin))
}

/// Bytecode with an optional try range `[start, end)` whose handler is at
/// `handler`
pub fn bytecode(try_range: Option<(u32, u32, u32)>, prediction: HandlerPrediction) -> BytecodeArray {
    let mut table = HandlerTable::new();
    if let Some((start, end, handler)) = try_range {
        table.push_range(start, end, handler, 0, prediction);
    }
    let mut positions = SourcePositionTable::new();
    positions.add(0, 0).add(4, 27).add(8, 82);
    BytecodeArray::new(16, 2)
        .with_handler_table(table)
        .with_source_positions(positions)
}

/// A user function running `bytecode` from a script
pub fn user_function(isolate: &Isolate, name: &str, bytecode: BytecodeArray) -> Value {
    let script = Script::new("main.ks", SOURCE);
    let shared = SharedFunctionInfo::new(name, bytecode).with_script(script);
    let code = builtin(isolate, Builtin::InterpreterEntryTrampoline);
    isolate.with_heap(|heap| {
        heap.allocate(HeapObject::Function(JsFunction {
            shared: Arc::new(shared),
            code,
            context: Value::undefined(),
            identity_hash: 1,
            is_forwarding_handler: false,
        }))
    })
}

pub fn push_entry(isolate: &Isolate) -> Address {
    let entry = builtin(isolate, Builtin::JSEntry);
    isolate.push_frame(FrameSpec::entry(&entry)).expect("push entry frame")
}

pub fn push_interpreted(isolate: &Isolate, function: Value, offset: u32) -> Address {
    let trampoline = builtin(isolate, Builtin::InterpreterEntryTrampoline);
    let bytecode = isolate
        .with_heap(|heap| heap.function(function).map(|f| Arc::clone(&f.shared.bytecode)))
        .expect("function object");
    isolate
        .push_frame(FrameSpec::interpreted(&trampoline, function, bytecode, offset))
        .expect("push interpreted frame")
}

/// Optimized code with no handler table
pub fn optimized_code(isolate: &Isolate) -> Arc<Code> {
    isolate
        .code_registry()
        .install(CodeDesc::new(CodeKind::Turbofan, 64).with_stack_slots(6))
        .expect("code range has room")
}

pub fn push_optimized(isolate: &Isolate, code: &Code, function: Value) -> Address {
    isolate
        .push_frame(FrameSpec::optimized(code, function, 8))
        .expect("push optimized frame")
}
