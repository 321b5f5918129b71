//! Integration tests for the process-wide platform
//!
//! Kept in its own test binary: the platform can only be initialized once
//! per process.

use keel_core::fatal::{panic_on_fatal, set_fatal_error_handler};
use keel_core::platform::{self, ProcessOptions};
use keel_core::{Isolate, IsolateOptions};
use std::panic;

#[test]
fn test_allocation_requires_initialized_platform() {
    set_fatal_error_handler(panic_on_fatal);
    assert!(platform::global().is_none());

    let result = panic::catch_unwind(|| {
        Isolate::allocate();
    });
    let message = result
        .unwrap_err()
        .downcast::<String>()
        .map(|s| *s)
        .unwrap_or_default();
    assert!(message.contains("Platform not initialized"), "unexpected panic: {message}");

    let first = platform::initialize_once_per_process(ProcessOptions::default());
    let second = platform::initialize_once_per_process(ProcessOptions::without_embedded_blob());
    assert!(std::sync::Arc::ptr_eq(&first, &second));
    assert!(second.options().binary_embedded_blob);

    let isolate = Isolate::allocate_with_options(
        IsolateOptions::default().without_concurrent_recompilation(),
    );
    assert!(std::sync::Arc::ptr_eq(isolate.platform(), &first));
    isolate.init().unwrap();
    isolate.enter().unwrap();
    assert!(std::sync::Arc::ptr_eq(&keel_core::isolate::current().unwrap(), &isolate));
    isolate.exit().unwrap();
    isolate.dispose();
}
