//! Integration tests for isolates used from several threads

mod common;

use common::*;
use crossbeam::channel::bounded;
use keel_core::heap::{Root, RootCollector};
use keel_core::isolate::LifecycleState;
use keel_core::{Isolate, IsolateError, Platform, ProcessOptions, Value};
use parking_lot::Mutex;
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn test_each_thread_has_its_own_exception_state() {
    let isolate = isolate();
    let main_error = isolate.with_heap(|heap| heap.new_error("Error", "main"));
    isolate.throw(main_error, None).unwrap();

    let worker_error = thread::scope(|scope| {
        scope
            .spawn(|| {
                // Not attached until it enters
                assert!(matches!(
                    isolate.has_pending_exception(),
                    Err(IsolateError::ThreadNotAttached)
                ));
                isolate.enter().unwrap();
                assert!(!isolate.has_pending_exception().unwrap());
                let error = isolate.with_heap(|heap| heap.new_error("Error", "worker"));
                isolate.throw(error, None).unwrap();
                assert_eq!(isolate.pending_exception().unwrap(), Some(error));
                isolate.exit().unwrap();
                error
            })
            .join()
            .unwrap()
    });

    assert_eq!(isolate.pending_exception().unwrap(), Some(main_error));
    assert_eq!(isolate.thread_table().len(), 2);

    // Roots come from every thread that ever entered
    let mut roots = RootCollector::new();
    isolate.iterate(&mut roots);
    let pending: Vec<_> = roots.objects_in(Root::ThreadLocalTop).collect();
    assert!(pending.contains(&main_error));
    assert!(pending.contains(&worker_error));
}

#[test]
fn test_interrupts_requested_from_other_threads() {
    let isolate = isolate();
    let seen = Arc::new(Mutex::new(Vec::new()));

    thread::scope(|scope| {
        for i in 0..4 {
            let isolate = &isolate;
            let seen = Arc::clone(&seen);
            scope.spawn(move || {
                isolate.request_interrupt(move |_| seen.lock().push(i));
            });
        }
    });

    assert!(isolate.stack_guard().has_pending());
    assert_eq!(isolate.handle_interrupts().unwrap(), Value::undefined());
    let mut ran = seen.lock().clone();
    ran.sort_unstable();
    assert_eq!(ran, vec![0, 1, 2, 3]);
    assert_eq!(isolate.invoke_api_interrupt_callbacks(), 0);
}

#[test]
fn test_termination_requested_while_running_elsewhere() {
    let isolate = isolate();
    let (ready_tx, ready_rx) = bounded::<()>(0);
    let (go_tx, go_rx) = bounded::<()>(0);

    thread::scope(|scope| {
        let worker = scope.spawn(|| {
            isolate.enter().unwrap();
            push_entry(&isolate);
            ready_tx.send(()).unwrap();
            go_rx.recv().unwrap();

            // The interrupt check turns the request into a termination
            assert_eq!(isolate.handle_interrupts().unwrap(), Value::exception());
            assert_eq!(
                isolate.pending_exception().unwrap(),
                Some(Value::termination_exception())
            );
            assert_eq!(
                isolate.unwind_and_find_handler().unwrap(),
                Value::termination_exception()
            );
            isolate.cancel_terminate_execution().unwrap();
            isolate.exit().unwrap();
        });

        ready_rx.recv().unwrap();
        isolate.request_termination();
        assert!(isolate.is_termination_requested());
        go_tx.send(()).unwrap();
        worker.join().unwrap();
    });

    assert!(!isolate.is_termination_requested());
    // The requesting thread's own state is untouched
    assert!(!isolate.has_pending_exception().unwrap());
}

#[test]
fn test_isolates_on_separate_threads() {
    let platform = platform();
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let platform = Arc::clone(&platform);
            thread::spawn(move || {
                let isolate = Isolate::new(platform, options()).unwrap();
                isolate.enter().unwrap();
                let error = isolate.stack_overflow().unwrap();
                assert_eq!(error, Value::exception());
                let pending = isolate.pending_exception().unwrap().unwrap();
                let description = isolate.with_heap(|heap| heap.describe(pending));
                isolate.exit().unwrap();
                isolate.deinit().unwrap();
                description
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(
            handle.join().unwrap(),
            "RangeError: Maximum call stack size exceeded"
        );
    }
}

#[test]
fn test_concurrent_deinit_tears_down_once() {
    panic_on_fatal_errors();
    let platform = Platform::new(ProcessOptions::without_embedded_blob());
    let isolate = Isolate::new(Arc::clone(&platform), options()).unwrap();
    let barrier = Barrier::new(4);

    let completed = thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    isolate.deinit()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|result| match result {
                Ok(()) => true,
                Err(err) => {
                    assert!(matches!(err, IsolateError::InvalidState { .. }), "{err}");
                    false
                }
            })
            .count()
    });

    assert!(completed >= 1);
    assert_eq!(isolate.state(), LifecycleState::Deinitialized);
    assert_eq!(platform.blob_registry().refs(), 0);
    assert_eq!(platform.blob_registry().frees(), 1);
}
