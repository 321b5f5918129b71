//! Heap object layouts the execution core needs to inspect

use crate::code::{Code, SharedFunctionInfo};
use crate::execution::{CallSiteInfo, MessageLocation};
use crate::value::Value;
use std::sync::Arc;

/// A managed function closure
#[derive(Debug, Clone)]
pub struct JsFunction {
    pub shared: Arc<SharedFunctionInfo>,
    /// Code the closure currently runs
    pub code: Arc<Code>,
    pub context: Value,
    pub identity_hash: u32,
    /// Internal handler that only forwards results between promises
    pub is_forwarding_handler: bool,
}

/// Slots of a function context
pub mod context_slots {
    /// Promise combinators: the capability of the aggregate promise
    pub const CAPABILITY: usize = 0;
    /// Default resolve/reject functions: the promise being settled
    pub const PROMISE: usize = 0;
}

/// A function context
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// For await closures this holds the suspended generator
    pub extension: Value,
    pub slots: Vec<Value>,
}

impl Context {
    pub fn slot(&self, index: usize) -> Value {
        self.slots.get(index).copied().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseStatus {
    Pending,
    Fulfilled,
    Rejected,
}

/// A reaction registered on a pending promise
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromiseReaction {
    pub fulfill_handler: Value,
    pub reject_handler: Value,
    /// The derived promise, a capability, or undefined
    pub promise_or_capability: Value,
}

#[derive(Debug, Clone)]
pub struct Promise {
    pub status: PromiseStatus,
    pub result: Value,
    pub reactions: Vec<PromiseReaction>,
    pub has_handler: bool,
    /// Set when the runtime knows the rejection will be handled
    pub handled_hint: bool,
    /// Outer promise whose handlers also observe this promise
    pub handled_by: Value,
}

impl Promise {
    pub fn pending() -> Self {
        Self {
            status: PromiseStatus::Pending,
            result: Value::undefined(),
            reactions: Vec::new(),
            has_handler: false,
            handled_hint: false,
            handled_by: Value::undefined(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == PromiseStatus::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromiseCapability {
    pub promise: Value,
    pub resolve: Value,
    pub reject: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorKind {
    Generator,
    AsyncFunction,
    AsyncGenerator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorState {
    Suspended,
    Executing,
    Closed,
}

/// Suspended activation of a generator or async function
#[derive(Debug, Clone)]
pub struct Generator {
    pub kind: GeneratorKind,
    pub function: Value,
    pub receiver: Value,
    pub state: GeneratorState,
    /// Bytecode offset the generator is suspended at
    pub input_or_debug_pos: u32,
    /// Async functions: the promise returned to the caller
    pub promise: Value,
    /// Async generators: pending request promises, oldest first
    pub queue: Vec<Value>,
}

impl Generator {
    pub fn is_suspended(&self) -> bool {
        self.state == GeneratorState::Suspended
    }

    pub fn is_executing(&self) -> bool {
        self.state == GeneratorState::Executing
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionKind {
    Fulfill,
    Reject,
}

/// A queued promise reaction job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromiseReactionJob {
    pub kind: ReactionKind,
    pub handler: Value,
    pub promise_or_capability: Value,
}

/// A thrown error object
#[derive(Debug, Clone)]
pub struct ErrorObject {
    pub name: String,
    pub message: String,
    /// Stack captured when the error was thrown
    pub stack: Option<Vec<CallSiteInfo>>,
}

/// A message describing an exception, with its source location
#[derive(Debug, Clone)]
pub struct MessageObject {
    pub exception: Value,
    pub text: String,
    pub location: Option<MessageLocation>,
    pub stack_trace: Vec<CallSiteInfo>,
}

/// Objects stored in the [`ObjectHeap`](super::ObjectHeap)
#[derive(Debug, Clone)]
pub enum HeapObject {
    Plain,
    String(String),
    Error(ErrorObject),
    Function(JsFunction),
    Context(Context),
    Promise(Promise),
    PromiseCapability(PromiseCapability),
    Generator(Generator),
    ReactionJob(PromiseReactionJob),
    Message(MessageObject),
}

impl HeapObject {
    pub fn type_name(&self) -> &'static str {
        match self {
            HeapObject::Plain => "Object",
            HeapObject::String(_) => "String",
            HeapObject::Error(_) => "Error",
            HeapObject::Function(_) => "Function",
            HeapObject::Context(_) => "Context",
            HeapObject::Promise(_) => "Promise",
            HeapObject::PromiseCapability(_) => "PromiseCapability",
            HeapObject::Generator(_) => "Generator",
            HeapObject::ReactionJob(_) => "PromiseReactionJob",
            HeapObject::Message(_) => "Message",
        }
    }
}
