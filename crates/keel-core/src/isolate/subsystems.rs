//! Per-isolate subsystems created by init and torn down by deinit
//!
//! Every slot in [`Subsystems`] is independently optional, so deinit can run
//! after an init that failed part way.

use crate::code::{Address, SharedFunctionInfo};
use crate::heap::{Root, RootVisitor};
use crate::value::Value;
use crossbeam::channel::{unbounded, Sender};
use rustc_hash::FxHashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

// ============================================================================
// Deoptimization bookkeeping
// ============================================================================

/// Objects materialized for optimized frames that are being deoptimized,
/// keyed by frame pointer
#[derive(Debug, Default)]
pub struct MaterializedObjectStore {
    frames: FxHashMap<Address, Vec<Value>>,
}

impl MaterializedObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, fp: Address, objects: Vec<Value>) {
        self.frames.insert(fp, objects);
    }

    pub fn get(&self, fp: Address) -> Option<&[Value]> {
        self.frames.get(&fp).map(Vec::as_slice)
    }

    pub fn remove(&mut self, fp: Address) -> Option<Vec<Value>> {
        self.frames.remove(&fp)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn iterate(&mut self, visitor: &mut dyn RootVisitor) {
        for objects in self.frames.values_mut() {
            visitor.visit_roots(Root::MaterializedObjects, "materialized object", objects);
        }
    }
}

// ============================================================================
// Caches
// ============================================================================

/// Compiled functions by script and source position
#[derive(Debug, Default)]
pub struct CompilationCache {
    entries: FxHashMap<(u32, u32), Arc<SharedFunctionInfo>>,
}

impl CompilationCache {
    pub fn lookup(&self, script_id: u32, position: u32) -> Option<Arc<SharedFunctionInfo>> {
        self.entries.get(&(script_id, position)).cloned()
    }

    pub fn put(&mut self, script_id: u32, position: u32, shared: Arc<SharedFunctionInfo>) {
        self.entries.insert((script_id, position), shared);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Property access stubs by (shape, name) key
#[derive(Debug, Default)]
pub struct StubCache {
    entries: FxHashMap<(u32, u32), Address>,
}

impl StubCache {
    pub fn get(&self, shape: u32, name: u32) -> Option<Address> {
        self.entries.get(&(shape, name)).copied()
    }

    pub fn set(&mut self, shape: u32, name: u32, stub: Address) {
        self.entries.insert((shape, name), stub);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Local time zone offsets, invalidated when the time zone changes
#[derive(Debug, Default)]
pub struct DateCache {
    stamp: u32,
    offsets: FxHashMap<i64, i64>,
}

impl DateCache {
    pub fn stamp(&self) -> u32 {
        self.stamp
    }

    pub fn offset_for(&mut self, time_ms: i64, compute: impl FnOnce(i64) -> i64) -> i64 {
        *self.offsets.entry(time_ms).or_insert_with(|| compute(time_ms))
    }

    /// Forget cached offsets after a time zone change
    pub fn reset(&mut self) {
        self.offsets.clear();
        self.stamp = self.stamp.wrapping_add(1);
    }
}

/// Backtracking stack of the regular expression engine
#[derive(Debug)]
pub struct RegExpStack {
    memory: Vec<u8>,
    limit: usize,
}

impl RegExpStack {
    pub const INITIAL_SIZE: usize = 1024;
    pub const MAXIMUM_SIZE: usize = 64 * 1024 * 1024;

    pub fn new() -> Self {
        Self {
            memory: vec![0; Self::INITIAL_SIZE],
            limit: Self::MAXIMUM_SIZE,
        }
    }

    pub fn size(&self) -> usize {
        self.memory.len()
    }

    /// Grow to at least `size` bytes. Returns false past the limit.
    pub fn ensure_capacity(&mut self, size: usize) -> bool {
        if size > self.limit {
            return false;
        }
        if size > self.memory.len() {
            self.memory.resize(size.next_power_of_two().min(self.limit), 0);
        }
        true
    }

    pub fn reset(&mut self) {
        self.memory.truncate(Self::INITIAL_SIZE);
        self.memory.shrink_to_fit();
    }
}

impl Default for RegExpStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Strong references held on behalf of the embedder
#[derive(Debug, Default)]
pub struct GlobalHandles {
    slots: Vec<Option<Value>>,
    free: Vec<usize>,
}

impl GlobalHandles {
    pub fn create(&mut self, value: Value) -> usize {
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(value);
                index
            }
            None => {
                self.slots.push(Some(value));
                self.slots.len() - 1
            }
        }
    }

    pub fn get(&self, handle: usize) -> Option<Value> {
        self.slots.get(handle).copied().flatten()
    }

    pub fn destroy(&mut self, handle: usize) -> Option<Value> {
        let value = self.slots.get_mut(handle)?.take()?;
        self.free.push(handle);
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iterate(&mut self, visitor: &mut dyn RootVisitor) {
        for value in self.slots.iter_mut().flatten() {
            visitor.visit_root(Root::GlobalHandles, "global handle", value);
        }
    }
}

// ============================================================================
// Background compilation
// ============================================================================

/// Work handed to the background compile thread
pub type CompileJob = Box<dyn FnOnce() + Send + 'static>;

/// Runs compile jobs on a dedicated background thread
pub struct OptimizingCompileDispatcher {
    sender: Option<Sender<CompileJob>>,
    handle: Option<thread::JoinHandle<()>>,
    completed: Arc<AtomicUsize>,
}

impl OptimizingCompileDispatcher {
    /// Start the background thread
    pub fn start(name: String) -> io::Result<Self> {
        let (sender, receiver) = unbounded::<CompileJob>();
        let completed = Arc::new(AtomicUsize::new(0));
        let done = Arc::clone(&completed);
        let handle = thread::Builder::new().name(name).spawn(move || {
            for job in receiver.iter() {
                job();
                done.fetch_add(1, Ordering::Release);
            }
        })?;
        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
            completed,
        })
    }

    /// Queue a job. Returns false once stopped.
    pub fn queue(&self, job: CompileJob) -> bool {
        match &self.sender {
            Some(sender) => sender.send(job).is_ok(),
            None => false,
        }
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Finish queued jobs and join the thread
    pub fn stop(&mut self) {
        // Closing the channel ends the worker loop once it is drained
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("compile dispatcher thread panicked");
            }
        }
    }
}

impl Drop for OptimizingCompileDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for OptimizingCompileDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimizingCompileDispatcher")
            .field("running", &self.is_running())
            .field("completed", &self.completed())
            .finish()
    }
}

// ============================================================================
// Slots
// ============================================================================

/// Optional subsystem slots of an isolate
#[derive(Debug, Default)]
pub struct Subsystems {
    pub compilation_cache: Option<CompilationCache>,
    pub stub_cache: Option<StubCache>,
    pub date_cache: Option<DateCache>,
    pub regexp_stack: Option<RegExpStack>,
    pub global_handles: Option<GlobalHandles>,
    pub compile_dispatcher: Option<OptimizingCompileDispatcher>,
}

impl Subsystems {
    /// Create the caches and handle tables
    pub fn create_core(&mut self) {
        self.compilation_cache = Some(CompilationCache::default());
        self.stub_cache = Some(StubCache::default());
        self.date_cache = Some(DateCache::default());
        self.regexp_stack = Some(RegExpStack::new());
        self.global_handles = Some(GlobalHandles::default());
    }

    /// Null out the caches. The dispatcher is stopped separately, first.
    pub fn clear_caches(&mut self) {
        self.compilation_cache = None;
        self.stub_cache = None;
        self.date_cache = None;
        self.regexp_stack = None;
    }

    pub fn live(&self) -> Vec<&'static str> {
        let mut live = Vec::new();
        if self.compilation_cache.is_some() {
            live.push("compilation cache");
        }
        if self.stub_cache.is_some() {
            live.push("stub cache");
        }
        if self.date_cache.is_some() {
            live.push("date cache");
        }
        if self.regexp_stack.is_some() {
            live.push("regexp stack");
        }
        if self.global_handles.is_some() {
            live.push("global handles");
        }
        if self.compile_dispatcher.is_some() {
            live.push("compile dispatcher");
        }
        live
    }
}
