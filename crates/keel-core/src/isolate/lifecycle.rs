//! Isolate lifecycle: allocation, initialization, entry and teardown
//!
//! Init builds subsystems in a fixed order and deinit releases them in the
//! reverse order:
//!
//! ```text
//!   init:    shared space → code range → caches/handles → compile thread
//!            → thread-local state → embedded blob → builtins → snapshot
//!   deinit:  compile thread → shared space → heap → builtins/code range
//!            → embedded blob → caches
//! ```
//!
//! Entering is tracked per thread on a stack of `(isolate, count)` items, so
//! leaving the innermost isolate restores whichever one was entered before.

use super::{
    Isolate, IsolateError, IsolateId, IsolateOptions, IsolateResult, LifecycleState,
    MaterializedObjectStore, OptimizingCompileDispatcher, SharedSpace, SharedSpaceRole, Subsystems,
    ThreadDataTable,
};
use crate::blob::BlobHandle;
use crate::code::{Builtin, Builtins, BytecodeArray, CodeRange, CodeRegistry, FunctionOrigin, SharedFunctionInfo};
use crate::debug::Debug;
use crate::execution::{
    AsyncIntrinsics, InterruptQueue, MessageListeners, StackGuard,
};
use crate::fatal::{fatal_error, FatalError};
use crate::fatal_check;
use crate::heap::{HeapObject, JsFunction, ObjectHeap};
use crate::platform::{self, Platform};
use crate::snapshot::{SnapshotData, SnapshotSet};
use crate::value::Value;
use parking_lot::{Mutex, RwLock};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

// ============================================================================
// Per-thread entry stack
// ============================================================================

struct EntryStackItem {
    isolate: Arc<Isolate>,
    entry_count: usize,
}

thread_local! {
    static ENTRY_STACK: RefCell<Vec<EntryStackItem>> = const { RefCell::new(Vec::new()) };
}

/// The isolate most recently entered on this thread and not yet exited
pub fn current() -> Option<Arc<Isolate>> {
    ENTRY_STACK.with(|stack| stack.borrow().last().map(|item| Arc::clone(&item.isolate)))
}

// ============================================================================
// Allocation
// ============================================================================

impl Isolate {
    /// Allocate and initialize an isolate on `platform`
    pub fn new(platform: Arc<Platform>, options: IsolateOptions) -> IsolateResult<Arc<Isolate>> {
        let isolate = Self::allocate_in(platform, options);
        isolate.init()?;
        Ok(isolate)
    }

    /// Allocate with default options on the process-wide platform
    pub fn allocate() -> Arc<Isolate> {
        Self::allocate_with_options(IsolateOptions::default())
    }

    /// Allocate on the process-wide platform. Fatal if the platform has not
    /// been initialized.
    pub fn allocate_with_options(options: IsolateOptions) -> Arc<Isolate> {
        let Some(platform) = platform::global() else {
            fatal_error(FatalError::NotInitialized);
        };
        Self::allocate_in(platform, options)
    }

    /// Reserve the isolate's region and pick up an initial embedded blob.
    /// Nothing else is set up until [`Isolate::init`].
    pub fn allocate_in(platform: Arc<Platform>, options: IsolateOptions) -> Arc<Isolate> {
        let Some(reservation) = platform.page_allocator().reserve(options.isolate_region_size) else {
            fatal_error(FatalError::OutOfMemory("isolate region"));
        };
        let id = IsolateId::new();
        let blob = platform.blob_registry().acquire_initial();
        debug!(isolate = id.as_u64(), region = ?reservation, has_blob = blob.is_some(), "allocated isolate");

        Arc::new(Isolate {
            id,
            thread_table: ThreadDataTable::new(id, options.stack_size),
            platform,
            options,
            state: Mutex::new(LifecycleState::Allocated),
            reservation: Mutex::new(Some(reservation)),
            heap: Mutex::new(ObjectHeap::new()),
            code_registry: CodeRegistry::new(),
            builtins: RwLock::new(None),
            blob: Mutex::new(blob),
            intrinsics: RwLock::new(AsyncIntrinsics::default()),
            outstanding_entries: AtomicUsize::new(0),
            subsystems: Mutex::new(Subsystems::default()),
            materialized_objects: Mutex::new(MaterializedObjectStore::new()),
            deoptimizer_lazy_throw: AtomicBool::new(false),
            shared_space: Mutex::new(None),
            debug: Debug::new(),
            stack_guard: StackGuard::new(),
            interrupts: InterruptQueue::new(),
            termination_requested: AtomicBool::new(false),
            message_listeners: MessageListeners::new(),
            deserializer: RwLock::new(None),
        })
    }

    // ========================================================================
    // Initialization
    // ========================================================================

    /// Initialize from scratch
    pub fn init(&self) -> IsolateResult<()> {
        self.init_with_snapshot(None, None, None, false)
    }

    /// Initialize, deserializing from snapshots if given.
    ///
    /// The three snapshots must be all present or all absent; a mix is
    /// fatal. On error the isolate is left `Failed` and must still be
    /// deinitialized.
    pub fn init_with_snapshot(
        &self,
        startup: Option<&SnapshotData>,
        read_only: Option<&SnapshotData>,
        shared: Option<&SnapshotData>,
        can_rehash: bool,
    ) -> IsolateResult<()> {
        let snapshots = match (startup, read_only, shared) {
            (None, None, None) => None,
            (Some(startup), Some(read_only), Some(shared)) => Some(SnapshotSet {
                startup,
                read_only,
                shared,
                can_rehash,
            }),
            _ => fatal_error(FatalError::SnapshotArgumentMismatch),
        };

        {
            let mut state = self.state.lock();
            if *state != LifecycleState::Allocated {
                return Err(IsolateError::InvalidState {
                    operation: "initialize",
                    state: *state,
                });
            }
            if snapshots.is_some() && self.deserializer.read().is_none() {
                return Err(IsolateError::NoDeserializer);
            }
            *state = LifecycleState::Initializing;
        }

        match self.init_phases(snapshots) {
            Ok(()) => {
                *self.state.lock() = LifecycleState::Initialized;
                debug!(isolate = self.id.as_u64(), "isolate initialized");
                Ok(())
            }
            Err(err) => {
                *self.state.lock() = LifecycleState::Failed;
                warn!(isolate = self.id.as_u64(), error = %err, "isolate initialization failed");
                Err(err)
            }
        }
    }

    fn init_phases(&self, snapshots: Option<SnapshotSet<'_>>) -> IsolateResult<()> {
        let from_snapshot = snapshots.is_some();
        debug!(isolate = self.id.as_u64(), from_snapshot, "initializing isolate");

        if self.options.shared_space {
            self.attach_shared_space();
        }

        let Some(reservation) = self.platform.page_allocator().reserve(self.options.code_range_size) else {
            fatal_error(FatalError::OutOfMemory("code range"));
        };
        debug!(isolate = self.id.as_u64(), range = ?reservation, "reserved code range");
        self.code_registry.set_code_range(CodeRange::new(reservation));

        self.subsystems.lock().create_core();
        if self.options.concurrent_recompilation {
            let dispatcher =
                OptimizingCompileDispatcher::start(format!("keel-compile-{}", self.id.as_u64()))?;
            self.subsystems.lock().compile_dispatcher = Some(dispatcher);
        }

        // The initializing thread gets per-thread state without entering
        let data = self.thread_table.find_or_allocate_for_this_thread();
        data.top().initialize();

        let blob = self.set_up_embedded_blob(from_snapshot);
        let builtins = Arc::new(Builtins::install(&blob, &self.code_registry));
        debug!(isolate = self.id.as_u64(), count = Builtin::COUNT, "installed builtins");
        *self.intrinsics.write() = self.create_intrinsics(&builtins);
        *self.builtins.write() = Some(builtins);

        if let Some(snapshots) = snapshots {
            let deserializer = self.deserializer.read().clone().ok_or(IsolateError::NoDeserializer)?;
            debug!(
                isolate = self.id.as_u64(),
                startup = %snapshots.startup.checksum(),
                can_rehash = snapshots.can_rehash,
                "deserializing snapshot"
            );
            deserializer.deserialize_into(self, snapshots)?;
        }
        Ok(())
    }

    /// Become the shared space owner, or a client of the existing owner
    fn attach_shared_space(&self) {
        let role = {
            let mut slot = self.platform.shared_space_slot().lock();
            match slot.upgrade() {
                Some(space) => {
                    space.attach(self.id);
                    debug!(isolate = self.id.as_u64(), owner = space.owner().as_u64(), "attached to shared space");
                    SharedSpaceRole::Client(Arc::downgrade(&space))
                }
                None => {
                    let space = Arc::new(SharedSpace::new(self.id));
                    *slot = Arc::downgrade(&space);
                    debug!(isolate = self.id.as_u64(), "created shared space");
                    SharedSpaceRole::Owner(space)
                }
            }
        };
        *self.shared_space.lock() = Some(role);
    }

    /// Make sure this isolate holds a blob and publish it as current.
    ///
    /// Booting from scratch without the binary-embedded blob creates (or
    /// reuses) a refcounted one. Booting from a snapshot must already hold
    /// the blob the snapshot was built against.
    fn set_up_embedded_blob(&self, from_snapshot: bool) -> BlobHandle {
        let registry = self.platform.blob_registry();
        let mut held = self.blob.lock();
        let has_binary = held.as_ref().is_some_and(BlobHandle::is_binary_embedded);
        if !from_snapshot && !has_binary {
            let handle = registry.create_and_set(held.as_ref());
            *held = Some(handle);
        }
        let Some(handle) = held.clone() else {
            fatal_error(FatalError::BlobMismatch(
                "booting from a snapshot requires an embedded blob".into(),
            ));
        };
        registry.set_current(&handle);
        handle
    }

    /// Closures identifying the promise combinators in async stack traces
    fn create_intrinsics(&self, builtins: &Builtins) -> AsyncIntrinsics {
        let mut heap = self.heap.lock();
        let mut make = |name: &str, builtin: Builtin| {
            let shared = SharedFunctionInfo::new(name, BytecodeArray::new(0, 0)).with_origin(FunctionOrigin::Builtin);
            heap.allocate(HeapObject::Function(JsFunction {
                shared: Arc::new(shared),
                code: Arc::clone(builtins.code(builtin)),
                context: Value::undefined(),
                identity_hash: 0,
                is_forwarding_handler: false,
            }))
        };
        AsyncIntrinsics {
            promise_all: make("all", Builtin::PromiseAll),
            promise_all_settled: make("allSettled", Builtin::PromiseAllSettled),
            promise_any: make("any", Builtin::PromiseAny),
        }
    }

    // ========================================================================
    // Entering and exiting
    // ========================================================================

    /// Make this isolate current on the calling thread.
    ///
    /// Reentrant: entering the isolate that is already current only bumps
    /// its count. The first entry from a thread allocates its per-thread
    /// data.
    pub fn enter(self: &Arc<Self>) -> IsolateResult<()> {
        let state = self.state();
        if matches!(
            state,
            LifecycleState::Deinitializing | LifecycleState::Deinitialized | LifecycleState::Failed
        ) {
            return Err(IsolateError::InvalidState {
                operation: "enter",
                state,
            });
        }

        ENTRY_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            match stack.last_mut() {
                Some(item) if Arc::ptr_eq(&item.isolate, self) => {
                    item.entry_count += 1;
                }
                _ => {
                    // State left by an earlier, still nested entry survives
                    self.thread_table.find_or_allocate_for_this_thread();
                    stack.push(EntryStackItem {
                        isolate: Arc::clone(self),
                        entry_count: 1,
                    });
                }
            }
        });
        self.outstanding_entries.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Undo the matching [`Isolate::enter`]. Once the count reaches zero the
    /// previously entered isolate (if any) becomes current again.
    pub fn exit(&self) -> IsolateResult<()> {
        let popped = ENTRY_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            let item = match stack.last_mut() {
                Some(item) if std::ptr::eq(Arc::as_ptr(&item.isolate), self) => item,
                _ => return Err(IsolateError::NotEntered),
            };
            item.entry_count -= 1;
            Ok(if item.entry_count == 0 { stack.pop() } else { None })
        })?;
        self.outstanding_entries.fetch_sub(1, Ordering::AcqRel);
        // Dropped outside the borrow: this may be the last reference
        drop(popped);
        Ok(())
    }

    /// How many times the calling thread has entered this isolate without
    /// exiting
    pub fn entry_count_on_this_thread(&self) -> usize {
        ENTRY_STACK.with(|stack| {
            stack
                .borrow()
                .iter()
                .filter(|item| std::ptr::eq(Arc::as_ptr(&item.isolate), self))
                .map(|item| item.entry_count)
                .sum()
        })
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Tear down every subsystem in the reverse of init order.
    ///
    /// Works after a failed or skipped init. Calling it twice is a no-op.
    pub fn deinit(&self) -> IsolateResult<()> {
        let state = {
            let mut guard = self.state.lock();
            let state = *guard;
            match state {
                LifecycleState::Deinitialized => return Ok(()),
                LifecycleState::Initializing | LifecycleState::Deinitializing => {
                    return Err(IsolateError::InvalidState {
                        operation: "deinitialize",
                        state,
                    })
                }
                LifecycleState::Allocated | LifecycleState::Initialized | LifecycleState::Failed => {}
            }
            // Claimed under the lock so a concurrent deinit backs off
            *guard = LifecycleState::Deinitializing;
            state
        };
        debug!(isolate = self.id.as_u64(), ?state, "deinitializing isolate");

        // Background compilation must be finished before anything it reads
        // goes away
        let dispatcher = self.subsystems.lock().compile_dispatcher.take();
        if let Some(mut dispatcher) = dispatcher {
            dispatcher.stop();
        }

        self.detach_shared_space();

        self.thread_table.remove_all();
        self.materialized_objects.lock().clear();
        self.subsystems.lock().global_handles = None;
        self.heap.lock().clear();

        if let Some(builtins) = self.builtins.write().take() {
            builtins.uninstall(&self.code_registry);
        }
        self.code_registry.clear();
        if let Some(range) = self.code_registry.take_code_range() {
            self.platform.page_allocator().release(range.into_reservation());
        }
        *self.intrinsics.write() = AsyncIntrinsics::default();

        if let Some(handle) = self.blob.lock().take() {
            self.platform.blob_registry().release(handle);
        }

        self.subsystems.lock().clear_caches();
        let dropped = self.interrupts.clear();
        if dropped > 0 {
            debug!(isolate = self.id.as_u64(), dropped, "dropped queued interrupts");
        }
        self.message_listeners.clear();

        *self.state.lock() = LifecycleState::Deinitialized;
        debug!(isolate = self.id.as_u64(), "isolate deinitialized");
        Ok(())
    }

    fn detach_shared_space(&self) {
        let role = self.shared_space.lock().take();
        match role {
            Some(SharedSpaceRole::Owner(space)) => {
                space.assert_no_clients_on_tear_down();
                let mut slot = self.platform.shared_space_slot().lock();
                if slot.upgrade().is_some_and(|current| Arc::ptr_eq(&current, &space)) {
                    *slot = std::sync::Weak::new();
                }
            }
            Some(SharedSpaceRole::Client(space)) => {
                if let Some(space) = space.upgrade() {
                    space.detach(self.id);
                }
            }
            None => {}
        }
    }

    /// Deinitialize and release this handle. Fatal if any thread still has
    /// the isolate entered.
    pub fn dispose(self: Arc<Self>) {
        let entries = self.outstanding_entries();
        if entries != 0 {
            fatal_error(FatalError::OutstandingEntries {
                isolate: self.id.as_u64(),
                entries,
            });
        }
        if let Err(err) = self.deinit() {
            error!(isolate = self.id.as_u64(), error = %err, "deinit failed during dispose");
        }
    }
}

impl Drop for Isolate {
    fn drop(&mut self) {
        let entries = self.outstanding_entries();
        if entries != 0 {
            fatal_error(FatalError::OutstandingEntries {
                isolate: self.id.as_u64(),
                entries,
            });
        }
        {
            // Only a fatal error raised mid-init or mid-deinit leaves these
            // states behind
            let mut state = self.state.lock();
            if matches!(*state, LifecycleState::Initializing | LifecycleState::Deinitializing) {
                *state = LifecycleState::Failed;
            }
        }
        if self.state() != LifecycleState::Deinitialized {
            if let Err(err) = self.deinit() {
                error!(isolate = self.id.as_u64(), error = %err, "deinit failed during drop");
            }
        }
        let live = self.live_subsystems();
        fatal_check!(live.is_empty(), "isolate {} dropped with live subsystems: {:?}", self.id, live);

        if let Some(reservation) = self.reservation.lock().take() {
            self.platform.page_allocator().release(reservation);
        }
        debug!(isolate = self.id.as_u64(), "isolate freed");
    }
}
