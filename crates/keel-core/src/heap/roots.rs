//! GC root visiting
//!
//! The collector is not part of this crate. It reaches everything the
//! execution core keeps alive through a [`RootVisitor`], which may rewrite a
//! slot when it moves the referenced object.

use crate::value::Value;

/// Which root set a slot belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Root {
    /// Thread-local exception and context slots
    ThreadLocalTop,
    /// Exceptions and messages held by external try-catch scopes
    ExternalTryCatch,
    /// Slots in machine stack frames
    StackRoots,
    /// Promises tracked for catch prediction
    PromiseStack,
    /// Strong global handles
    GlobalHandles,
    /// Objects materialized for frames awaiting deoptimization
    MaterializedObjects,
}

/// Visitor over root slots
pub trait RootVisitor {
    /// Visit one slot. Implementations may overwrite `slot`.
    fn visit_root(&mut self, root: Root, description: &'static str, slot: &mut Value);

    /// Visit a run of slots
    fn visit_roots(&mut self, root: Root, description: &'static str, slots: &mut [Value]) {
        for slot in slots {
            self.visit_root(root, description, slot);
        }
    }
}

/// Visitor that collects every heap reference it sees
#[derive(Debug, Default)]
pub struct RootCollector {
    pub roots: Vec<(Root, &'static str, Value)>,
}

impl RootCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Heap references seen in `root`
    pub fn objects_in(&self, root: Root) -> impl Iterator<Item = Value> + '_ {
        self.roots
            .iter()
            .filter(move |(r, _, _)| *r == root)
            .map(|(_, _, v)| *v)
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

impl RootVisitor for RootCollector {
    fn visit_root(&mut self, root: Root, description: &'static str, slot: &mut Value) {
        if slot.is_object() {
            self.roots.push((root, description, *slot));
        }
    }
}
