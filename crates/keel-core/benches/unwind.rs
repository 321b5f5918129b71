use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use keel_core::code::{
    Builtin, BytecodeArray, HandlerPrediction, HandlerTable, Script, SharedFunctionInfo,
    SourcePositionTable,
};
use keel_core::frames::FrameSpec;
use keel_core::heap::{HeapObject, JsFunction};
use keel_core::platform::{Platform, ProcessOptions};
use keel_core::{ExternalTryCatch, FrameSkipMode, Isolate, IsolateOptions, Value};
use std::sync::Arc;

const SOURCE: &str = "function f() {\n  return g();\n}\n";

/// Isolate whose throws skip message creation, so repeated throws do not
/// grow the heap
fn isolate() -> Arc<Isolate> {
    let options = IsolateOptions::default().without_concurrent_recompilation();
    let isolate = Isolate::new(Platform::new(ProcessOptions::default()), options).unwrap();
    isolate
        .register_try_catch(ExternalTryCatch::new().without_message())
        .unwrap();
    isolate
}

fn function(isolate: &Isolate, name: &str, try_range: bool) -> Value {
    let mut table = HandlerTable::new();
    if try_range {
        table.push_range(0, 16, 12, 0, HandlerPrediction::Caught);
    }
    let mut positions = SourcePositionTable::new();
    positions.add(0, 0).add(4, 17);
    let bytecode = BytecodeArray::new(16, 2)
        .with_handler_table(table)
        .with_source_positions(positions);
    let shared = SharedFunctionInfo::new(name, bytecode).with_script(Script::new("bench.ks", SOURCE));
    let code = Arc::clone(isolate.builtins().unwrap().code(Builtin::InterpreterEntryTrampoline));
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

/// Entry frame, then `depth` interpreted frames; the outermost one has a
/// try block when `caught`
fn build_stack(isolate: &Isolate, functions: &[Value], caught: Option<Value>) {
    let builtins = isolate.builtins().unwrap();
    let trampoline = Arc::clone(builtins.code(Builtin::InterpreterEntryTrampoline));
    isolate.push_frame(FrameSpec::entry(builtins.code(Builtin::JSEntry))).unwrap();
    let frames = caught.into_iter().chain(functions.iter().copied());
    for function in frames {
        let bytecode = isolate
            .with_heap(|heap| heap.function(function).map(|f| Arc::clone(&f.shared.bytecode)))
            .unwrap();
        isolate
            .push_frame(FrameSpec::interpreted(&trampoline, function, bytecode, 4))
            .unwrap();
    }
    isolate.push_frame(FrameSpec::exit(builtins.code(Builtin::CEntry))).unwrap();
}

fn clear_stack(isolate: &Isolate) {
    while isolate.pop_frame().unwrap().is_some() {}
}

fn bench_unwind(c: &mut Criterion) {
    let isolate = isolate();
    let mut group = c.benchmark_group("unwind");

    for depth in [1usize, 8, 64] {
        let functions: Vec<_> = (0..depth).map(|i| function(&isolate, &format!("f{i}"), false)).collect();
        let catcher = function(&isolate, "catcher", true);

        group.bench_with_input(BenchmarkId::new("to_entry", depth), &depth, |b, _| {
            b.iter(|| {
                build_stack(&isolate, &functions, None);
                isolate.throw(Value::smi(1), None).unwrap();
                black_box(isolate.unwind_and_find_handler().unwrap());
                isolate.take_pending_handler().unwrap();
                clear_stack(&isolate);
            });
        });

        group.bench_with_input(BenchmarkId::new("to_try_block", depth), &depth, |b, _| {
            b.iter(|| {
                build_stack(&isolate, &functions, Some(catcher));
                isolate.throw(Value::smi(1), None).unwrap();
                black_box(isolate.unwind_and_find_handler().unwrap());
                isolate.take_pending_handler().unwrap();
                clear_stack(&isolate);
            });
        });
    }

    group.finish();
}

fn bench_stack_walks(c: &mut Criterion) {
    let isolate = isolate();
    let functions: Vec<_> = (0..32).map(|i| function(&isolate, &format!("f{i}"), false)).collect();
    let catcher = function(&isolate, "catcher", true);
    build_stack(&isolate, &functions, Some(catcher));

    c.bench_function("predict_exception_catcher", |b| {
        b.iter(|| black_box(isolate.predict_exception_catcher().unwrap()));
    });

    c.bench_function("capture_simple_stack_trace", |b| {
        b.iter(|| {
            black_box(
                isolate
                    .capture_simple_stack_trace(black_box(10), FrameSkipMode::SkipNone)
                    .unwrap(),
            )
        });
    });

    c.bench_function("capture_detailed_stack_trace", |b| {
        b.iter(|| black_box(isolate.capture_detailed_stack_trace(32).unwrap()));
    });

    clear_stack(&isolate);
}

criterion_group!(benches, bench_unwind, bench_stack_walks);
criterion_main!(benches);
