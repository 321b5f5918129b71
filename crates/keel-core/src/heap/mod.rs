//! Managed object heap
//!
//! Allocation policy and collection live elsewhere. This arena is the view of
//! the heap the execution core works with: objects are addressed by
//! [`ObjectId`] and inspected through typed accessors.

mod objects;
mod roots;

pub use objects::{
    context_slots, Context, ErrorObject, Generator, GeneratorKind, GeneratorState, HeapObject,
    JsFunction, MessageObject, Promise, PromiseCapability, PromiseReaction, PromiseReactionJob,
    PromiseStatus, ReactionKind,
};
pub use roots::{Root, RootCollector, RootVisitor};

use crate::value::Value;

/// Index of an object in the heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u32);

impl ObjectId {
    #[inline]
    pub const fn from_u32(raw: u32) -> Self {
        ObjectId(raw)
    }

    #[inline]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

macro_rules! typed_accessors {
    ($($name:ident, $name_mut:ident => $variant:ident($ty:ty);)*) => {
        $(
            pub fn $name(&self, value: Value) -> Option<&$ty> {
                match self.get(value.as_object()?)? {
                    HeapObject::$variant(inner) => Some(inner),
                    _ => None,
                }
            }

            pub fn $name_mut(&mut self, value: Value) -> Option<&mut $ty> {
                match self.get_mut(value.as_object()?)? {
                    HeapObject::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        )*
    };
}

/// Arena of heap objects
#[derive(Debug, Default)]
pub struct ObjectHeap {
    objects: Vec<HeapObject>,
}

impl ObjectHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, object: HeapObject) -> Value {
        let id = ObjectId(self.objects.len() as u32);
        self.objects.push(object);
        Value::object(id)
    }

    pub fn get(&self, id: ObjectId) -> Option<&HeapObject> {
        self.objects.get(id.0 as usize)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut HeapObject> {
        self.objects.get_mut(id.0 as usize)
    }

    pub fn object(&self, value: Value) -> Option<&HeapObject> {
        self.get(value.as_object()?)
    }

    typed_accessors! {
        function, function_mut => Function(JsFunction);
        context, context_mut => Context(Context);
        promise, promise_mut => Promise(Promise);
        capability, capability_mut => PromiseCapability(PromiseCapability);
        generator, generator_mut => Generator(Generator);
        reaction_job, reaction_job_mut => ReactionJob(PromiseReactionJob);
        error, error_mut => Error(ErrorObject);
        message, message_mut => Message(MessageObject);
    }

    pub fn string(&self, value: Value) -> Option<&str> {
        match self.object(value)? {
            HeapObject::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn new_string(&mut self, s: impl Into<String>) -> Value {
        self.allocate(HeapObject::String(s.into()))
    }

    pub fn new_error(&mut self, name: impl Into<String>, message: impl Into<String>) -> Value {
        self.allocate(HeapObject::Error(ErrorObject {
            name: name.into(),
            message: message.into(),
            stack: None,
        }))
    }

    pub fn new_promise(&mut self) -> Value {
        self.allocate(HeapObject::Promise(Promise::pending()))
    }

    /// Short description used in messages and stack trace headers
    pub fn describe(&self, value: Value) -> String {
        if let Some(error) = self.error(value) {
            return if error.message.is_empty() {
                error.name.clone()
            } else {
                format!("{}: {}", error.name, error.message)
            };
        }
        if let Some(s) = self.string(value) {
            return s.to_owned();
        }
        if let Some(i) = value.as_smi() {
            return i.to_string();
        }
        if let Some(b) = value.as_bool() {
            return b.to_string();
        }
        if value.is_undefined() {
            return "undefined".into();
        }
        if value.is_null() {
            return "null".into();
        }
        match self.object(value) {
            Some(object) => format!("[object {}]", object.type_name()),
            None => format!("{value:?}"),
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Release every object
    pub fn clear(&mut self) {
        self.objects.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_access() {
        let mut heap = ObjectHeap::new();
        let promise = heap.new_promise();
        let text = heap.new_string("boom");

        assert!(heap.promise(promise).unwrap().is_pending());
        assert!(heap.promise(text).is_none());
        assert_eq!(heap.string(text), Some("boom"));
        assert!(heap.promise(Value::smi(0)).is_none());

        heap.promise_mut(promise).unwrap().handled_hint = true;
        assert!(heap.promise(promise).unwrap().handled_hint);
    }

    #[test]
    fn test_describe() {
        let mut heap = ObjectHeap::new();
        let err = heap.new_error("TypeError", "x is not a function");
        assert_eq!(heap.describe(err), "TypeError: x is not a function");
        assert_eq!(heap.describe(Value::smi(3)), "3");
        let plain = heap.allocate(HeapObject::Plain);
        assert_eq!(heap.describe(plain), "[object Object]");
    }
}
