//! Address-indexed code registry
//!
//! Stack walking needs to go from a return address to the code containing it.
//! The registry keeps installed code ordered by instruction start so that
//! lookup is a single range query.

use super::{Address, Code, CodeDesc};
use crate::platform::Reservation;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Alignment of code allocated from a [`CodeRange`]
const CODE_ALIGNMENT: usize = 32;

/// Finds the code object containing a pc
pub trait CodeLookup {
    fn lookup_code(&self, pc: Address) -> Option<Arc<Code>>;
}

/// Reserved address range that dynamically generated code is placed in
#[derive(Debug)]
pub struct CodeRange {
    reservation: Reservation,
    next: Mutex<usize>,
}

impl CodeRange {
    pub fn new(reservation: Reservation) -> Self {
        Self {
            reservation,
            next: Mutex::new(0),
        }
    }

    pub fn base(&self) -> Address {
        self.reservation.base()
    }

    pub fn size(&self) -> usize {
        self.reservation.size()
    }

    pub fn contains(&self, address: Address) -> bool {
        self.base() <= address && address < self.base() + self.size()
    }

    /// Bump-allocate room for `size` bytes of instructions plus constant pool
    fn allocate(&self, size: usize) -> Option<Address> {
        let mut next = self.next.lock();
        let start = *next;
        let end = start
            .checked_add(size.max(1))?
            .checked_add(CODE_ALIGNMENT - 1)?
            & !(CODE_ALIGNMENT - 1);
        if end > self.size() {
            return None;
        }
        *next = end;
        Some(self.base() + start)
    }

    pub fn into_reservation(self) -> Reservation {
        self.reservation
    }
}

/// All code installed in an isolate
#[derive(Debug, Default)]
pub struct CodeRegistry {
    code: RwLock<BTreeMap<Address, Arc<Code>>>,
    range: RwLock<Option<CodeRange>>,
}

impl CodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the code range used by [`CodeRegistry::install`]
    pub fn set_code_range(&self, range: CodeRange) {
        *self.range.write() = Some(range);
    }

    /// Detach and return the code range
    pub fn take_code_range(&self) -> Option<CodeRange> {
        self.range.write().take()
    }

    pub fn has_code_range(&self) -> bool {
        self.range.read().is_some()
    }

    /// Install code at a fixed address (builtins in the embedded blob)
    pub fn insert_at(&self, desc: CodeDesc, instruction_start: Address) -> Arc<Code> {
        let code = Arc::new(Code::install(desc, instruction_start));
        self.code.write().insert(instruction_start, Arc::clone(&code));
        code
    }

    /// Install code into the code range. Returns `None` when the range is
    /// missing or exhausted.
    pub fn install(&self, desc: CodeDesc) -> Option<Arc<Code>> {
        let start = {
            let range = self.range.read();
            // Instructions followed by an 8-byte constant pool slot
            range
                .as_ref()?
                .allocate(desc.instruction_size as usize + 8)?
        };
        Some(self.insert_at(desc, start))
    }

    pub fn remove(&self, instruction_start: Address) -> Option<Arc<Code>> {
        self.code.write().remove(&instruction_start)
    }

    pub fn lookup(&self, pc: Address) -> Option<Arc<Code>> {
        let code = self.code.read();
        let (_, candidate) = code.range(..=pc).next_back()?;
        candidate.contains(pc).then(|| Arc::clone(candidate))
    }

    pub fn len(&self) -> usize {
        self.code.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every installed code object
    pub fn clear(&self) {
        self.code.write().clear();
    }
}

impl CodeLookup for CodeRegistry {
    fn lookup_code(&self, pc: Address) -> Option<Arc<Code>> {
        self.lookup(pc)
    }
}
