//! Process-wide state
//!
//! Exactly one [`Platform`] is installed per process by
//! [`initialize_once_per_process`] before any isolate is allocated. It owns:
//! - the page allocator isolates reserve memory from
//! - the embedded blob registry
//! - the slot for the process-wide shared space owner
//!
//! Tests that need isolated process state build their own `Platform` with
//! [`Platform::new`] and allocate isolates with `Isolate::allocate_in`.

use crate::blob::EmbeddedBlobRegistry;
use crate::code::Address;
use crate::isolate::SharedSpace;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// A reserved region of memory
pub struct Reservation {
    memory: Box<[u8]>,
}

impl Reservation {
    pub fn base(&self) -> Address {
        self.memory.as_ptr() as Address
    }

    pub fn size(&self) -> usize {
        self.memory.len()
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Reservation({:#x}+{})", self.base(), self.size())
    }
}

/// Source of memory reservations
pub trait PageAllocator: Send + Sync {
    /// Reserve `size` bytes, or `None` when memory is exhausted
    fn reserve(&self, size: usize) -> Option<Reservation>;

    /// Return a reservation
    fn release(&self, reservation: Reservation);
}

/// Allocator backed by the global heap
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPageAllocator;

impl PageAllocator for SystemPageAllocator {
    fn reserve(&self, size: usize) -> Option<Reservation> {
        let mut memory = Vec::new();
        memory.try_reserve_exact(size).ok()?;
        memory.resize(size, 0);
        Some(Reservation {
            memory: memory.into_boxed_slice(),
        })
    }

    fn release(&self, reservation: Reservation) {
        drop(reservation);
    }
}

/// Allocator with a fixed budget on top of another allocator
pub struct BoundedPageAllocator {
    inner: Arc<dyn PageAllocator>,
    limit: usize,
    used: AtomicUsize,
}

impl BoundedPageAllocator {
    pub fn new(inner: Arc<dyn PageAllocator>, limit: usize) -> Self {
        Self {
            inner,
            limit,
            used: AtomicUsize::new(0),
        }
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }
}

impl PageAllocator for BoundedPageAllocator {
    fn reserve(&self, size: usize) -> Option<Reservation> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|&total| total <= self.limit)
            })
            .ok()?;
        let reservation = self.inner.reserve(size);
        if reservation.is_none() {
            self.used.fetch_sub(size, Ordering::AcqRel);
        }
        reservation
    }

    fn release(&self, reservation: Reservation) {
        self.used.fetch_sub(reservation.size(), Ordering::AcqRel);
        self.inner.release(reservation);
    }
}

/// Process-wide configuration
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    /// Whether a builtins blob is linked into the binary
    pub binary_embedded_blob: bool,

    /// Cap on memory reserved by all isolates (None = unlimited)
    pub memory_budget: Option<usize>,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            binary_embedded_blob: true,
            memory_budget: None,
        }
    }
}

impl ProcessOptions {
    /// Build without a binary-embedded blob; the first isolate creates one
    pub fn without_embedded_blob() -> Self {
        Self {
            binary_embedded_blob: false,
            ..Default::default()
        }
    }

    pub fn with_memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget = Some(bytes);
        self
    }
}

/// Process-wide runtime state
pub struct Platform {
    options: ProcessOptions,
    page_allocator: Arc<dyn PageAllocator>,
    blob_registry: EmbeddedBlobRegistry,
    shared_space: Mutex<Weak<SharedSpace>>,
}

impl Platform {
    pub fn new(options: ProcessOptions) -> Arc<Self> {
        let system: Arc<dyn PageAllocator> = Arc::new(SystemPageAllocator);
        let page_allocator = match options.memory_budget {
            Some(limit) => Arc::new(BoundedPageAllocator::new(system, limit)) as Arc<dyn PageAllocator>,
            None => system,
        };
        let blob_registry = if options.binary_embedded_blob {
            EmbeddedBlobRegistry::with_binary_blob()
        } else {
            EmbeddedBlobRegistry::without_default()
        };
        Arc::new(Self {
            options,
            page_allocator,
            blob_registry,
            shared_space: Mutex::new(Weak::new()),
        })
    }

    pub fn options(&self) -> &ProcessOptions {
        &self.options
    }

    pub fn page_allocator(&self) -> &Arc<dyn PageAllocator> {
        &self.page_allocator
    }

    pub fn blob_registry(&self) -> &EmbeddedBlobRegistry {
        &self.blob_registry
    }

    /// Slot holding the process-wide shared space owner
    pub(crate) fn shared_space_slot(&self) -> &Mutex<Weak<SharedSpace>> {
        &self.shared_space
    }

    /// The current shared space, if an owner is alive
    pub fn shared_space(&self) -> Option<Arc<SharedSpace>> {
        self.shared_space.lock().upgrade()
    }
}

impl std::fmt::Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform")
            .field("options", &self.options)
            .field("blob_registry", &self.blob_registry)
            .finish_non_exhaustive()
    }
}

static PLATFORM: OnceCell<Arc<Platform>> = OnceCell::new();

/// Install the process-wide platform. Later calls return the existing one
/// and ignore `options`.
pub fn initialize_once_per_process(options: ProcessOptions) -> Arc<Platform> {
    Arc::clone(PLATFORM.get_or_init(|| {
        tracing::info!(?options, "initializing process platform");
        Platform::new(options)
    }))
}

/// The process-wide platform, if initialized
pub fn global() -> Option<Arc<Platform>> {
    PLATFORM.get().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_allocator_budget() {
        let allocator = BoundedPageAllocator::new(Arc::new(SystemPageAllocator), 1024);
        let a = allocator.reserve(600).unwrap();
        assert!(allocator.reserve(600).is_none());
        assert_eq!(allocator.used(), 600);
        allocator.release(a);
        assert_eq!(allocator.used(), 0);
        assert!(allocator.reserve(1024).is_some());
    }

    #[test]
    fn test_initialize_once() {
        let a = initialize_once_per_process(ProcessOptions::default());
        let b = initialize_once_per_process(ProcessOptions::without_embedded_blob());
        assert!(Arc::ptr_eq(&a, &b));
        assert!(global().is_some());
    }

    #[test]
    fn test_platform_without_blob() {
        let platform = Platform::new(ProcessOptions::without_embedded_blob());
        assert!(platform.blob_registry().default_blob().is_none());
        assert!(platform.shared_space().is_none());
    }
}
