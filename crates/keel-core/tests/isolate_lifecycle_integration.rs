//! Integration tests for the isolate lifecycle
//!
//! Covers creation and teardown, the shared space, nested entry and the
//! reference counting of the embedded blob across isolates.

mod common;

use common::*;
use keel_core::isolate::{current, LifecycleState};
use keel_core::snapshot::{Deserializer, SnapshotData, SnapshotError, SnapshotSet};
use keel_core::{Isolate, IsolateError, IsolateOptions, Platform, ProcessOptions};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// ============================================================================
// Creation and teardown
// ============================================================================

#[test]
fn test_init_deinit_leaves_nothing_alive() {
    let isolate = Isolate::allocate_in(platform(), IsolateOptions::default());
    assert_eq!(isolate.state(), LifecycleState::Allocated);
    assert!(isolate.builtins().is_none());

    isolate.init().unwrap();
    assert!(isolate.is_initialized());
    let live = isolate.live_subsystems();
    for subsystem in ["builtins", "code range", "embedded blob", "thread data", "compile dispatcher"] {
        assert!(live.contains(&subsystem), "{subsystem} missing from {live:?}");
    }

    isolate.deinit().unwrap();
    assert_eq!(isolate.state(), LifecycleState::Deinitialized);
    assert!(isolate.live_subsystems().is_empty());
    assert!(isolate.builtins().is_none());
    drop(isolate);
}

#[test]
fn test_drop_without_deinit_tears_down() {
    panic_on_fatal_errors();
    let platform = Platform::new(ProcessOptions::without_embedded_blob());
    let isolate = Isolate::new(Arc::clone(&platform), options()).unwrap();
    assert!(isolate.has_embedded_blob());
    assert_eq!(platform.blob_registry().refs(), 1);

    drop(isolate);
    assert_eq!(platform.blob_registry().refs(), 0);
    assert_eq!(platform.blob_registry().frees(), 1);
}

#[test]
fn test_deinit_after_failed_snapshot_boot() {
    struct Rejecting;

    impl Deserializer for Rejecting {
        fn deserialize_into(&self, _isolate: &Isolate, _snapshots: SnapshotSet<'_>) -> Result<(), SnapshotError> {
            Err(SnapshotError::Rejected("checksum mismatch".into()))
        }
    }

    let isolate = Isolate::allocate_in(platform(), options());
    isolate.set_deserializer(Arc::new(Rejecting));
    let data = SnapshotData::new(vec![1u8, 2, 3]);
    let result = isolate.init_with_snapshot(Some(&data), Some(&data), Some(&data), false);
    assert!(matches!(result, Err(IsolateError::Snapshot(_))));
    assert_eq!(isolate.state(), LifecycleState::Failed);

    // A failed isolate cannot be entered but can be torn down
    assert!(matches!(isolate.enter(), Err(IsolateError::InvalidState { .. })));
    isolate.deinit().unwrap();
    assert!(isolate.live_subsystems().is_empty());
}

#[test]
fn test_snapshot_boot_runs_deserializer() {
    #[derive(Default)]
    struct Counting(AtomicUsize);

    impl Deserializer for Counting {
        fn deserialize_into(&self, isolate: &Isolate, snapshots: SnapshotSet<'_>) -> Result<(), SnapshotError> {
            assert!(isolate.builtins().is_some());
            assert!(snapshots.can_rehash);
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let deserializer = Arc::new(Counting::default());
    let isolate = Isolate::allocate_in(platform(), options());
    isolate.set_deserializer(Arc::clone(&deserializer) as Arc<dyn Deserializer>);
    let data = SnapshotData::new(vec![7u8; 16]);
    isolate
        .init_with_snapshot(Some(&data), Some(&data), Some(&data), true)
        .unwrap();
    assert_eq!(deserializer.0.load(Ordering::SeqCst), 1);
    assert!(isolate.is_initialized());
}

// ============================================================================
// Shared space
// ============================================================================

#[test]
fn test_shared_space_client_detaches_before_owner() {
    let platform = platform();
    let options = options().with_shared_space();
    let owner = Isolate::new(Arc::clone(&platform), options.clone()).unwrap();
    let client = Isolate::new(Arc::clone(&platform), options).unwrap();

    assert!(owner.is_shared_space_owner());
    assert!(client.is_shared_space_client());
    {
        let space = platform.shared_space().unwrap();
        assert_eq!(space.owner(), owner.id());
        assert_eq!(space.clients(), vec![client.id()]);
    }

    client.deinit().unwrap();
    assert_eq!(owner.shared_space().unwrap().client_count(), 0);

    owner.deinit().unwrap();
    assert!(platform.shared_space().is_none());
    assert!(owner.live_subsystems().is_empty());
}

#[test]
fn test_new_owner_after_previous_owner_left() {
    let platform = platform();
    let options = options().with_shared_space();
    let first = Isolate::new(Arc::clone(&platform), options.clone()).unwrap();
    first.deinit().unwrap();

    let second = Isolate::new(Arc::clone(&platform), options).unwrap();
    assert!(second.is_shared_space_owner());
    assert_eq!(platform.shared_space().unwrap().owner(), second.id());
}

#[test]
#[should_panic(expected = "Shared space owner")]
fn test_owner_teardown_with_clients_is_fatal() {
    let platform = platform();
    let options = options().with_shared_space();
    let owner = Isolate::new(Arc::clone(&platform), options.clone()).unwrap();
    let _client = Isolate::new(Arc::clone(&platform), options).unwrap();
    owner.deinit().unwrap();
}

// ============================================================================
// Entering and exiting
// ============================================================================

#[test]
fn test_nested_enter_restores_previous_isolate() {
    let platform = platform();
    let a = Isolate::new(Arc::clone(&platform), options()).unwrap();
    let b = Isolate::new(Arc::clone(&platform), options()).unwrap();
    assert!(current().is_none());

    for depth in 1..=3 {
        a.enter().unwrap();
        assert_eq!(a.entry_count_on_this_thread(), depth);
    }
    for _ in 0..2 {
        b.enter().unwrap();
        assert!(Arc::ptr_eq(&current().unwrap(), &b));
    }

    // Only the innermost isolate can be exited
    assert!(matches!(a.exit(), Err(IsolateError::NotEntered)));

    b.exit().unwrap();
    assert!(Arc::ptr_eq(&current().unwrap(), &b));
    b.exit().unwrap();
    assert!(Arc::ptr_eq(&current().unwrap(), &a));
    assert_eq!(b.outstanding_entries(), 0);

    for _ in 0..3 {
        a.exit().unwrap();
    }
    assert!(current().is_none());
    assert_eq!(a.outstanding_entries(), 0);
    assert!(matches!(a.exit(), Err(IsolateError::NotEntered)));
}

#[test]
fn test_reentry_keeps_thread_state() {
    let platform = platform();
    let a = Isolate::new(Arc::clone(&platform), options()).unwrap();
    let b = Isolate::new(Arc::clone(&platform), options()).unwrap();

    a.enter().unwrap();
    push_entry(&a);
    b.enter().unwrap();
    a.enter().unwrap();
    assert_eq!(a.with_thread_local_top(|top| top.handlers().len()).unwrap(), 1);

    a.exit().unwrap();
    b.exit().unwrap();
    a.exit().unwrap();
}

#[test]
fn test_threads_enter_independently() {
    let isolate = isolate();
    isolate.enter().unwrap();

    std::thread::scope(|scope| {
        scope.spawn(|| {
            assert!(current().is_none());
            isolate.enter().unwrap();
            assert_eq!(isolate.entry_count_on_this_thread(), 1);
            assert_eq!(isolate.outstanding_entries(), 2);
            isolate.exit().unwrap();
        });
    });

    assert_eq!(isolate.thread_table().len(), 2);
    assert_eq!(isolate.outstanding_entries(), 1);
    isolate.exit().unwrap();
}

#[test]
fn test_dispose_while_entered_is_fatal() {
    let isolate = isolate();
    isolate.enter().unwrap();

    let result = panic::catch_unwind(AssertUnwindSafe(|| Arc::clone(&isolate).dispose()));
    let message = result
        .unwrap_err()
        .downcast::<String>()
        .map(|s| *s)
        .unwrap_or_default();
    assert!(message.contains("outstanding"), "unexpected panic: {message}");

    isolate.exit().unwrap();
    Arc::clone(&isolate).dispose();
    assert_eq!(isolate.state(), LifecycleState::Deinitialized);
}

// ============================================================================
// Embedded blob sharing
// ============================================================================

#[test]
fn test_isolates_share_one_created_blob() {
    panic_on_fatal_errors();
    let platform = Platform::new(ProcessOptions::without_embedded_blob());
    let registry = platform.blob_registry();
    assert!(!registry.has_sticky());

    let isolates: Vec<_> = (0..4)
        .map(|_| Isolate::new(Arc::clone(&platform), options()).unwrap())
        .collect();
    assert!(registry.has_sticky());
    assert_eq!(registry.refs(), 4);
    assert!(!registry.current_is_binary_embedded());

    let code = isolates[0].embedded_blob().unwrap().code_address();
    for isolate in &isolates {
        assert_eq!(isolate.embedded_blob().unwrap().code_address(), code);
    }

    for (i, isolate) in isolates.iter().enumerate() {
        isolate.deinit().unwrap();
        assert_eq!(registry.refs(), 3 - i);
    }
    assert!(!registry.has_sticky());
    assert_eq!(registry.frees(), 1);
    assert!(registry.current().is_null());
}

#[test]
fn test_blob_recreated_after_last_release() {
    panic_on_fatal_errors();
    let platform = Platform::new(ProcessOptions::without_embedded_blob());
    Isolate::new(Arc::clone(&platform), options()).unwrap().dispose();
    assert_eq!(platform.blob_registry().frees(), 1);

    let isolate = Isolate::new(Arc::clone(&platform), options()).unwrap();
    assert_eq!(platform.blob_registry().refs(), 1);
    isolate.dispose();
    assert_eq!(platform.blob_registry().frees(), 2);
}

#[test]
fn test_binary_blob_is_never_freed() {
    let platform = platform();
    let registry = platform.blob_registry();
    let isolate = Isolate::new(Arc::clone(&platform), options()).unwrap();
    assert!(registry.current_is_binary_embedded());
    assert!(isolate.embedded_blob().unwrap().is_binary_embedded());
    assert_eq!(registry.refs(), 0);

    isolate.deinit().unwrap();
    assert_eq!(registry.frees(), 0);
}

// ============================================================================
// Memory exhaustion
// ============================================================================

#[test]
#[should_panic(expected = "Out of memory: isolate region")]
fn test_isolate_region_exhaustion_is_fatal() {
    panic_on_fatal_errors();
    let platform = Platform::new(ProcessOptions::default().with_memory_budget(1024));
    let _ = Isolate::allocate_in(platform, options());
}

#[test]
#[should_panic(expected = "Out of memory: code range")]
fn test_code_range_exhaustion_is_fatal() {
    panic_on_fatal_errors();
    let options = options();
    let budget = options.isolate_region_size + options.code_range_size / 2;
    let platform = Platform::new(ProcessOptions::default().with_memory_budget(budget));
    let isolate = Isolate::allocate_in(platform, options);
    let _ = isolate.init();
}
