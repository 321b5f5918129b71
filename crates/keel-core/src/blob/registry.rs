//! Process-wide embedded blob bookkeeping
//!
//! The registry tracks two things:
//! - the *current* blob, published through relaxed atomics so any thread can
//!   read it without locking
//! - the *sticky* blob, a runtime-created blob shared by every isolate that
//!   boots without a binary-embedded one, refcounted under a mutex
//!
//! ```text
//!   isolate A init ──► create ──► sticky (refs = 1)
//!   isolate B init ──────────────► sticky (refs = 2)
//!   isolate A deinit ────────────► sticky (refs = 1)
//!   isolate B deinit ────────────► refs = 0 ──► freed, current cleared
//! ```

use super::{binary_embedded_blob, EmbeddedBlob};
use crate::code::{Address, NULL_ADDRESS};
use crate::fatal::{fatal_error, FatalError};
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Address and size of the code and data sections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlobView {
    pub code: Address,
    pub code_size: u32,
    pub data: Address,
    pub data_size: u32,
}

impl BlobView {
    pub fn is_null(&self) -> bool {
        self.code == NULL_ADDRESS
    }
}

/// A blob an isolate is running on
#[derive(Debug, Clone)]
pub enum BlobHandle {
    /// Linked into the binary, never freed
    Static(&'static EmbeddedBlob),
    /// Created at runtime and shared through the sticky slot
    Shared(Arc<EmbeddedBlob>),
}

impl BlobHandle {
    pub fn is_binary_embedded(&self) -> bool {
        matches!(self, BlobHandle::Static(_))
    }
}

impl Deref for BlobHandle {
    type Target = EmbeddedBlob;

    fn deref(&self) -> &EmbeddedBlob {
        match self {
            BlobHandle::Static(blob) => blob,
            BlobHandle::Shared(blob) => blob,
        }
    }
}

#[derive(Debug)]
struct StickyState {
    sticky: Option<Arc<EmbeddedBlob>>,
    refcounting_enabled: bool,
    refs: usize,
    frees: usize,
}

/// Tracks the current and sticky embedded blobs
#[derive(Debug)]
pub struct EmbeddedBlobRegistry {
    default_blob: Option<&'static EmbeddedBlob>,
    current_code: AtomicUsize,
    current_code_size: AtomicU32,
    current_data: AtomicUsize,
    current_data_size: AtomicU32,
    state: Mutex<StickyState>,
}

impl EmbeddedBlobRegistry {
    /// Registry whose default is the blob linked into the binary
    pub fn with_binary_blob() -> Self {
        Self::new(Some(binary_embedded_blob()))
    }

    /// Registry with no default; isolates must create a blob on first boot
    pub fn without_default() -> Self {
        Self::new(None)
    }

    fn new(default_blob: Option<&'static EmbeddedBlob>) -> Self {
        Self {
            default_blob,
            current_code: AtomicUsize::new(NULL_ADDRESS),
            current_code_size: AtomicU32::new(0),
            current_data: AtomicUsize::new(NULL_ADDRESS),
            current_data_size: AtomicU32::new(0),
            state: Mutex::new(StickyState {
                sticky: None,
                refcounting_enabled: true,
                refs: 0,
                frees: 0,
            }),
        }
    }

    pub fn default_blob(&self) -> Option<&'static EmbeddedBlob> {
        self.default_blob
    }

    /// The blob most recently installed by any isolate
    pub fn current(&self) -> BlobView {
        BlobView {
            code: self.current_code.load(Ordering::Relaxed),
            code_size: self.current_code_size.load(Ordering::Relaxed),
            data: self.current_data.load(Ordering::Relaxed),
            data_size: self.current_data_size.load(Ordering::Relaxed),
        }
    }

    /// Whether the current blob is the one linked into the binary
    pub fn current_is_binary_embedded(&self) -> bool {
        let code = self.current_code.load(Ordering::Relaxed);
        code != NULL_ADDRESS && self.default_blob.map(|b| b.code_address()) == Some(code)
    }

    fn publish(&self, view: BlobView) {
        self.current_code.store(view.code, Ordering::Relaxed);
        self.current_code_size.store(view.code_size, Ordering::Relaxed);
        self.current_data.store(view.data, Ordering::Relaxed);
        self.current_data_size.store(view.data_size, Ordering::Relaxed);
    }

    /// Install `blob` as current. Debug builds re-verify the digests.
    pub fn set_current(&self, blob: &EmbeddedBlob) {
        #[cfg(debug_assertions)]
        if let Err(err) = blob.verify() {
            fatal_error(FatalError::BlobMismatch(err.to_string()));
        }
        self.publish(blob.view());
    }

    pub fn clear_current(&self) {
        self.publish(BlobView::default());
    }

    /// Blob a newly allocated isolate starts with: the sticky blob (taking a
    /// reference) if one exists, otherwise the binary default.
    pub fn acquire_initial(&self) -> Option<BlobHandle> {
        let handle = {
            let mut state = self.state.lock();
            match state.sticky.clone() {
                Some(sticky) => {
                    state.refs += 1;
                    Some(BlobHandle::Shared(sticky))
                }
                None => self.default_blob.map(BlobHandle::Static),
            }
        };
        if let Some(blob) = &handle {
            self.set_current(blob);
        }
        handle
    }

    /// Blob for an isolate booting from scratch. Reuses the sticky blob when
    /// one exists, otherwise creates one and makes it sticky.
    ///
    /// `held` is what the isolate already holds from [`acquire_initial`];
    /// a held sticky reference is reused without taking another.
    ///
    /// [`acquire_initial`]: EmbeddedBlobRegistry::acquire_initial
    pub fn create_and_set(&self, held: Option<&BlobHandle>) -> BlobHandle {
        let mut state = self.state.lock();
        if let Some(sticky) = state.sticky.clone() {
            match held {
                Some(BlobHandle::Shared(blob)) if Arc::ptr_eq(blob, &sticky) => {}
                Some(BlobHandle::Shared(_)) => fatal_error(FatalError::BlobMismatch(
                    "isolate holds a shared blob that is not the sticky blob".into(),
                )),
                _ => state.refs += 1,
            }
            drop(state);
            self.set_current(&sticky);
            return BlobHandle::Shared(sticky);
        }

        if let Some(BlobHandle::Shared(_)) = held {
            fatal_error(FatalError::BlobMismatch(
                "isolate holds a shared blob but no sticky blob exists".into(),
            ));
        }
        if state.refs != 0 {
            fatal_error(FatalError::BlobMismatch(format!(
                "creating a blob with {} outstanding references",
                state.refs
            )));
        }

        let blob = Arc::new(EmbeddedBlob::create());
        self.set_current(&blob);
        state.refs += 1;
        state.sticky = Some(Arc::clone(&blob));
        tracing::debug!(code = blob.code_address(), "installed sticky embedded blob");
        BlobHandle::Shared(blob)
    }

    /// Drop an isolate's reference. Frees the sticky blob on the last release
    /// while refcounting is enabled.
    pub fn release(&self, handle: BlobHandle) {
        let BlobHandle::Shared(blob) = handle else {
            return;
        };
        let mut state = self.state.lock();
        let Some(sticky) = &state.sticky else {
            return;
        };
        if !Arc::ptr_eq(sticky, &blob) {
            fatal_error(FatalError::BlobMismatch(
                "released blob is not the sticky blob".into(),
            ));
        }
        if state.refs == 0 {
            fatal_error(FatalError::BlobMismatch("blob refcount underflow".into()));
        }
        state.refs -= 1;
        if state.refs == 0 && state.refcounting_enabled {
            state.sticky = None;
            state.frees += 1;
            drop(state);
            self.clear_current();
            tracing::debug!("freed sticky embedded blob");
        }
    }

    /// Keep the sticky blob alive past its last isolate. Tools that serialize
    /// the blob after tearing the isolate down use this.
    pub fn disable_refcounting(&self) {
        self.state.lock().refcounting_enabled = false;
    }

    /// Explicitly free the sticky blob. Only valid after
    /// [`disable_refcounting`](EmbeddedBlobRegistry::disable_refcounting).
    pub fn free_current(&self) {
        let mut state = self.state.lock();
        if state.refcounting_enabled {
            fatal_error(FatalError::BlobMismatch(
                "free_current requires refcounting to be disabled".into(),
            ));
        }
        let Some(sticky) = state.sticky.take() else {
            return;
        };
        if self.current_code.load(Ordering::Relaxed) != sticky.code_address() {
            fatal_error(FatalError::BlobMismatch(
                "current blob is not the sticky blob".into(),
            ));
        }
        state.frees += 1;
        drop(state);
        self.clear_current();
    }

    pub fn has_sticky(&self) -> bool {
        self.state.lock().sticky.is_some()
    }

    /// Outstanding references to the sticky blob
    pub fn refs(&self) -> usize {
        self.state.lock().refs
    }

    /// Number of sticky blobs freed so far
    pub fn frees(&self) -> usize {
        self.state.lock().frees
    }
}
