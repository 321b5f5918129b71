//! Value representation using tagged 64-bit words
//!
//! Exceptions, receivers and register contents are all `Value`s. Heap
//! references are arena indices rather than raw pointers, so a `Value` can be
//! copied freely between threads and across a stack walk.
//!
//! # Encoding Strategy
//!
//! ```text
//! object:   iiiiiiiiiiiiiiiiiiiiiiiiiiiiiiii00000000000000000000000000000000
//! smi:      ssssssssssssssssssssssssssssssss00000000000000000000000000000001
//! bool:     000000000000000000000000000000000000000000000000000000000000b010
//! oddball:  0000000000000000000000000000000000000000000000000000000kkkkk110
//! ```
//!
//! Oddballs cover `undefined`, `null`, the hole, the termination exception and
//! the exception sentinel returned by throwing operations.

use crate::heap::ObjectId;
use std::fmt;

/// Tagged value representation
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(u64);

impl Value {
    // Tag constants (lowest 3 bits)
    const TAG_MASK: u64 = 0b111;
    const TAG_OBJECT: u64 = 0b000;
    const TAG_SMI: u64 = 0b001;
    const TAG_BOOL: u64 = 0b010;
    const TAG_ODDBALL: u64 = 0b110;

    const TRUE: u64 = (1 << 3) | Self::TAG_BOOL;
    const FALSE: u64 = Self::TAG_BOOL;

    // Oddball kinds (bits 3..8)
    const UNDEFINED: u64 = Self::TAG_ODDBALL;
    const NULL: u64 = (1 << 3) | Self::TAG_ODDBALL;
    const THE_HOLE: u64 = (2 << 3) | Self::TAG_ODDBALL;
    const TERMINATION_EXCEPTION: u64 = (3 << 3) | Self::TAG_ODDBALL;
    const EXCEPTION: u64 = (4 << 3) | Self::TAG_ODDBALL;

    /// The `undefined` value
    #[inline]
    pub const fn undefined() -> Self {
        Value(Self::UNDEFINED)
    }

    /// The `null` value
    #[inline]
    pub const fn null() -> Self {
        Value(Self::NULL)
    }

    /// Marker for an empty slot
    #[inline]
    pub const fn the_hole() -> Self {
        Value(Self::THE_HOLE)
    }

    /// The uncatchable exception used to terminate execution
    #[inline]
    pub const fn termination_exception() -> Self {
        Value(Self::TERMINATION_EXCEPTION)
    }

    /// Sentinel returned by operations that left an exception pending
    #[inline]
    pub const fn exception() -> Self {
        Value(Self::EXCEPTION)
    }

    /// Create a boolean value
    #[inline]
    pub const fn bool(b: bool) -> Self {
        Value(if b { Self::TRUE } else { Self::FALSE })
    }

    /// Create a small integer
    #[inline]
    pub const fn smi(i: i32) -> Self {
        Value((((i as u32) as u64) << 32) | Self::TAG_SMI)
    }

    /// Create a reference to a heap object
    #[inline]
    pub const fn object(id: ObjectId) -> Self {
        Value(((id.as_u32() as u64) << 32) | Self::TAG_OBJECT)
    }

    #[inline]
    pub const fn is_undefined(&self) -> bool {
        self.0 == Self::UNDEFINED
    }

    #[inline]
    pub const fn is_null(&self) -> bool {
        self.0 == Self::NULL
    }

    #[inline]
    pub const fn is_the_hole(&self) -> bool {
        self.0 == Self::THE_HOLE
    }

    #[inline]
    pub const fn is_termination_exception(&self) -> bool {
        self.0 == Self::TERMINATION_EXCEPTION
    }

    #[inline]
    pub const fn is_exception(&self) -> bool {
        self.0 == Self::EXCEPTION
    }

    #[inline]
    pub const fn is_bool(&self) -> bool {
        (self.0 & Self::TAG_MASK) == Self::TAG_BOOL
    }

    #[inline]
    pub const fn is_smi(&self) -> bool {
        (self.0 & Self::TAG_MASK) == Self::TAG_SMI
    }

    #[inline]
    pub const fn is_object(&self) -> bool {
        (self.0 & Self::TAG_MASK) == Self::TAG_OBJECT
    }

    /// `undefined` or `null`
    #[inline]
    pub const fn is_nullish(&self) -> bool {
        self.is_undefined() || self.is_null()
    }

    /// Whether managed-code handlers may observe this value as an exception
    #[inline]
    pub const fn is_catchable(&self) -> bool {
        !self.is_termination_exception()
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.is_bool().then_some(self.0 == Self::TRUE)
    }

    pub fn as_smi(&self) -> Option<i32> {
        self.is_smi().then_some((self.0 >> 32) as u32 as i32)
    }

    pub fn as_object(&self) -> Option<ObjectId> {
        self.is_object()
            .then(|| ObjectId::from_u32((self.0 >> 32) as u32))
    }

    /// Raw encoded bits
    #[inline]
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::undefined()
    }
}

impl From<ObjectId> for Value {
    fn from(id: ObjectId) -> Self {
        Value::object(id)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(id) = self.as_object() {
            write!(f, "Object({})", id.as_u32())
        } else if let Some(i) = self.as_smi() {
            write!(f, "Smi({i})")
        } else if let Some(b) = self.as_bool() {
            write!(f, "Bool({b})")
        } else if self.is_undefined() {
            f.write_str("Undefined")
        } else if self.is_null() {
            f.write_str("Null")
        } else if self.is_the_hole() {
            f.write_str("TheHole")
        } else if self.is_termination_exception() {
            f.write_str("TerminationException")
        } else if self.is_exception() {
            f.write_str("Exception")
        } else {
            write!(f, "Value({:#x})", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oddballs_are_distinct() {
        let all = [
            Value::undefined(),
            Value::null(),
            Value::the_hole(),
            Value::termination_exception(),
            Value::exception(),
        ];
        for (i, a) in all.iter().enumerate() {
            for (j, b) in all.iter().enumerate() {
                assert_eq!(i == j, a == b);
            }
            assert!(!a.is_object());
            assert!(!a.is_smi());
        }
    }

    #[test]
    fn test_smi_sign() {
        assert_eq!(Value::smi(-7).as_smi(), Some(-7));
        assert_eq!(Value::smi(i32::MAX).as_smi(), Some(i32::MAX));
        assert_eq!(Value::smi(3).as_object(), None);
    }

    #[test]
    fn test_object_reference() {
        let v = Value::object(ObjectId::from_u32(42));
        assert!(v.is_object());
        assert_eq!(v.as_object(), Some(ObjectId::from_u32(42)));
        assert!(v.is_catchable());
        assert!(!Value::termination_exception().is_catchable());
    }

    #[test]
    fn test_debug_format() {
        assert_eq!(format!("{:?}", Value::bool(true)), "Bool(true)");
        assert_eq!(format!("{:?}", Value::undefined()), "Undefined");
    }
}
