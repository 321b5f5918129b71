//! Isolates
//!
//! An [`Isolate`] is one independent instance of the runtime: its own heap,
//! installed code, per-thread execution state and exception machinery.
//! Threads attach with [`Isolate::enter`] and detach with [`Isolate::exit`];
//! a thread may enter several isolates in a nested fashion and the same
//! isolate reentrantly.
//!
//! ```text
//!   allocate ──► Allocated ──init──► Initialized ──deinit──► Deinitialized
//!                    │                    ▲
//!                    └──init fails──► Failed ──deinit──┘
//! ```
//!
//! Lock order: thread data table, then a thread's `ThreadLocalTop`, then the
//! object heap. Callbacks (interrupts, message listeners, the abort hook) run
//! with no isolate lock held.

mod exceptions;
mod lifecycle;
mod options;
mod shared;
mod subsystems;
mod thread_data;

pub use lifecycle::current;
pub use options::{AbortOnUncaughtExceptionCallback, IsolateOptions};
pub use shared::SharedSpace;
pub use subsystems::{
    CompilationCache, CompileJob, DateCache, GlobalHandles, MaterializedObjectStore,
    OptimizingCompileDispatcher, RegExpStack, StubCache, Subsystems,
};
pub use thread_data::{PerThreadData, ThreadDataTable};

use crate::blob::{BlobError, BlobHandle};
use crate::code::{Address, Builtins, CodeRegistry};
use crate::debug::Debug;
use crate::execution::{
    AsyncIntrinsics, InterruptQueue, MessageListeners, StackGuard, TryCatchId,
};
use crate::heap::ObjectHeap;
use crate::platform::{Platform, Reservation};
use crate::snapshot::{Deserializer, SnapshotError};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;

/// Recoverable isolate errors
#[derive(Debug, Error)]
pub enum IsolateError {
    /// Exit without a matching enter on this thread
    #[error("isolate is not entered on this thread")]
    NotEntered,

    /// The calling thread has no per-thread data in this isolate
    #[error("thread is not attached to the isolate")]
    ThreadNotAttached,

    /// The pending and scheduled exception slots would both be occupied
    #[error("exception slot conflict: {0}")]
    ExceptionConflict(&'static str),

    #[error("no pending exception")]
    NoPendingException,

    #[error("no scheduled exception")]
    NoScheduledException,

    /// Operation not allowed in the current lifecycle state
    #[error("cannot {operation} an isolate in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: LifecycleState,
    },

    #[error("unknown try-catch scope {0:?}")]
    UnknownTryCatch(TryCatchId),

    /// Try-catch scopes must be unregistered innermost first
    #[error("try-catch scopes unregistered out of order")]
    TryCatchOrder,

    #[error("no code object contains address {0:#x}")]
    UnknownCode(Address),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("embedded blob error: {0}")]
    Blob(#[from] BlobError),

    /// Booting from a snapshot needs a deserializer
    #[error("no deserializer installed")]
    NoDeserializer,

    /// A background thread could not be started
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type IsolateResult<T> = Result<T, IsolateError>;

/// Unique identifier for an isolate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IsolateId(u64);

impl IsolateId {
    /// Create a new unique isolate ID
    pub fn new() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        IsolateId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for IsolateId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IsolateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "isolate#{}", self.0)
    }
}

/// Lifecycle state of an isolate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Memory reserved, nothing set up yet
    Allocated,
    Initializing,
    Initialized,
    /// Init failed part way; deinit cleans up what exists
    Failed,
    /// Teardown in progress on some thread
    Deinitializing,
    Deinitialized,
}

/// This isolate's relation to the process-wide shared space
#[derive(Debug)]
enum SharedSpaceRole {
    Owner(Arc<SharedSpace>),
    Client(Weak<SharedSpace>),
}

/// One independent runtime instance
pub struct Isolate {
    id: IsolateId,
    platform: Arc<Platform>,
    options: IsolateOptions,
    state: Mutex<LifecycleState>,

    /// Region backing the isolate itself
    reservation: Mutex<Option<Reservation>>,

    heap: Mutex<ObjectHeap>,
    code_registry: CodeRegistry,
    builtins: RwLock<Option<Arc<Builtins>>>,
    blob: Mutex<Option<BlobHandle>>,
    intrinsics: RwLock<AsyncIntrinsics>,

    thread_table: ThreadDataTable,
    /// Enters not yet matched by an exit, across all threads
    outstanding_entries: AtomicUsize,

    subsystems: Mutex<Subsystems>,
    materialized_objects: Mutex<MaterializedObjectStore>,
    deoptimizer_lazy_throw: AtomicBool,
    shared_space: Mutex<Option<SharedSpaceRole>>,

    debug: Debug,
    stack_guard: StackGuard,
    interrupts: InterruptQueue,
    termination_requested: AtomicBool,
    message_listeners: MessageListeners,
    deserializer: RwLock<Option<Arc<dyn Deserializer>>>,
}

impl Isolate {
    pub fn id(&self) -> IsolateId {
        self.id
    }

    pub fn platform(&self) -> &Arc<Platform> {
        &self.platform
    }

    pub fn options(&self) -> &IsolateOptions {
        &self.options
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    pub fn is_initialized(&self) -> bool {
        self.state() == LifecycleState::Initialized
    }

    pub fn code_registry(&self) -> &CodeRegistry {
        &self.code_registry
    }

    /// Installed builtins, once initialized
    pub fn builtins(&self) -> Option<Arc<Builtins>> {
        self.builtins.read().clone()
    }

    pub fn intrinsics(&self) -> AsyncIntrinsics {
        *self.intrinsics.read()
    }

    /// Whether this isolate currently holds a reference to an embedded blob
    pub fn has_embedded_blob(&self) -> bool {
        self.blob.lock().is_some()
    }

    pub fn embedded_blob(&self) -> Option<BlobHandle> {
        self.blob.lock().clone()
    }

    pub fn thread_table(&self) -> &ThreadDataTable {
        &self.thread_table
    }

    pub fn outstanding_entries(&self) -> usize {
        self.outstanding_entries.load(Ordering::Acquire)
    }

    pub fn debug(&self) -> &Debug {
        &self.debug
    }

    pub fn stack_guard(&self) -> &StackGuard {
        &self.stack_guard
    }

    pub fn materialized_objects(&self) -> &Mutex<MaterializedObjectStore> {
        &self.materialized_objects
    }

    /// Consume the flag the unwinder sets when throwing into code marked
    /// for deoptimization
    pub fn take_deoptimizer_lazy_throw(&self) -> bool {
        self.deoptimizer_lazy_throw.swap(false, Ordering::AcqRel)
    }

    pub fn is_termination_requested(&self) -> bool {
        self.termination_requested.load(Ordering::Acquire)
    }

    pub fn set_deserializer(&self, deserializer: Arc<dyn Deserializer>) {
        *self.deserializer.write() = Some(deserializer);
    }

    /// Run `f` with the object heap locked
    pub fn with_heap<R>(&self, f: impl FnOnce(&mut ObjectHeap) -> R) -> R {
        f(&mut self.heap.lock())
    }

    /// Names of subsystems that are currently alive
    pub fn live_subsystems(&self) -> Vec<&'static str> {
        let mut live = self.subsystems.lock().live();
        if self.code_registry.has_code_range() {
            live.push("code range");
        }
        if self.builtins.read().is_some() {
            live.push("builtins");
        }
        if self.blob.lock().is_some() {
            live.push("embedded blob");
        }
        if self.shared_space.lock().is_some() {
            live.push("shared space");
        }
        if !self.thread_table.is_empty() {
            live.push("thread data");
        }
        live
    }

    /// Whether this isolate owns the process-wide shared space
    pub fn is_shared_space_owner(&self) -> bool {
        matches!(*self.shared_space.lock(), Some(SharedSpaceRole::Owner(_)))
    }

    pub fn is_shared_space_client(&self) -> bool {
        matches!(*self.shared_space.lock(), Some(SharedSpaceRole::Client(_)))
    }

    /// The shared space this isolate owns or is a client of
    pub fn shared_space(&self) -> Option<Arc<SharedSpace>> {
        match &*self.shared_space.lock() {
            Some(SharedSpaceRole::Owner(space)) => Some(Arc::clone(space)),
            Some(SharedSpaceRole::Client(space)) => space.upgrade(),
            None => None,
        }
    }
}

impl fmt::Debug for Isolate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Isolate")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("outstanding_entries", &self.outstanding_entries())
            .finish_non_exhaustive()
    }
}
