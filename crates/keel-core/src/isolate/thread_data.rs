//! Per-thread data table
//!
//! Each thread that enters an isolate gets a [`PerThreadData`] holding its
//! [`ThreadLocalTop`]. Only [`ThreadDataTable::find_or_allocate`] inserts;
//! lookups never allocate.

use super::IsolateId;
use crate::execution::{StackTracePrinter, ThreadLocalTop};
use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// State of one thread inside one isolate
#[derive(Debug)]
pub struct PerThreadData {
    isolate: IsolateId,
    thread_id: ThreadId,
    stack_size: usize,
    top: Mutex<ThreadLocalTop>,
    stack_trace_printer: StackTracePrinter,
}

impl PerThreadData {
    fn new(isolate: IsolateId, thread_id: ThreadId, stack_size: usize) -> Self {
        Self {
            isolate,
            thread_id,
            stack_size,
            top: Mutex::new(ThreadLocalTop::new(thread_id)),
            stack_trace_printer: StackTracePrinter::new(),
        }
    }

    pub fn isolate(&self) -> IsolateId {
        self.isolate
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Machine stack budget of the thread
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn top(&self) -> MutexGuard<'_, ThreadLocalTop> {
        self.top.lock()
    }

    /// Renders this thread's stack traces; nesting is tracked per thread
    pub fn stack_trace_printer(&self) -> &StackTracePrinter {
        &self.stack_trace_printer
    }
}

/// Thread id to per-thread data, guarded by a single mutex
#[derive(Debug)]
pub struct ThreadDataTable {
    isolate: IsolateId,
    stack_size: usize,
    table: Mutex<FxHashMap<ThreadId, Arc<PerThreadData>>>,
}

impl ThreadDataTable {
    pub fn new(isolate: IsolateId, stack_size: usize) -> Self {
        Self {
            isolate,
            stack_size,
            table: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn find(&self, thread_id: ThreadId) -> Option<Arc<PerThreadData>> {
        self.table.lock().get(&thread_id).cloned()
    }

    pub fn find_for_this_thread(&self) -> Option<Arc<PerThreadData>> {
        self.find(thread::current().id())
    }

    /// Data for the calling thread, allocating it on first use
    pub fn find_or_allocate_for_this_thread(&self) -> Arc<PerThreadData> {
        let thread_id = thread::current().id();
        let mut table = self.table.lock();
        let data = table.entry(thread_id).or_insert_with(|| {
            tracing::debug!(isolate = self.isolate.as_u64(), ?thread_id, "allocated per-thread data");
            Arc::new(PerThreadData::new(self.isolate, thread_id, self.stack_size))
        });
        Arc::clone(data)
    }

    /// Drop the calling thread's data
    pub fn discard_for_this_thread(&self) -> Option<Arc<PerThreadData>> {
        self.table.lock().remove(&thread::current().id())
    }

    /// Drop every thread's data, freeing what their states keep alive
    pub fn remove_all(&self) {
        let drained: Vec<_> = self.table.lock().drain().map(|(_, data)| data).collect();
        for data in drained {
            data.top().free();
        }
    }

    /// Snapshot of all per-thread data
    pub fn all(&self) -> Vec<Arc<PerThreadData>> {
        self.table.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }
}
