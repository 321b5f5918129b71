//! Message objects for uncaught exceptions
//!
//! A message pairs the exception with the source location it was thrown at
//! and, optionally, the stack trace at the throw. Listeners registered on
//! the isolate receive every reported message in registration order.

use super::stack_trace::CallSiteInfo;
use super::thread_local_top::ThreadLocalTop;
use super::WalkEnv;
use crate::code::Script;
use crate::frames::StackFrameIterator;
use crate::heap::{HeapObject, MessageObject, ObjectHeap};
use crate::value::Value;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Source range an exception is attributed to
#[derive(Debug, Clone)]
pub struct MessageLocation {
    pub script: Arc<Script>,
    pub start_pos: u32,
    pub end_pos: u32,
}

impl MessageLocation {
    pub fn new(script: Arc<Script>, start_pos: u32, end_pos: u32) -> Self {
        Self {
            script,
            start_pos,
            end_pos,
        }
    }

    /// 1-based line and column of the start position
    pub fn line_and_column(&self) -> (u32, u32) {
        self.script.line_and_column(self.start_pos)
    }
}

impl fmt::Display for MessageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (line, column) = self.line_and_column();
        write!(f, "{}:{}:{}", self.script.name(), line, column)
    }
}

/// Location of the innermost managed frame that has a script
pub fn compute_location(top: &ThreadLocalTop, env: &WalkEnv<'_>) -> Option<MessageLocation> {
    for frame in StackFrameIterator::new(top.stack().active(), env.code) {
        if !frame.is_java_script() {
            continue;
        }
        for summary in frame.summarize(env.heap).iter().rev() {
            let Some(shared) = summary.shared(env.heap) else {
                continue;
            };
            let Some(script) = shared.script.clone() else {
                continue;
            };
            let position = summary.source_position().unwrap_or(shared.start_position);
            return Some(MessageLocation::new(script, position, position + 1));
        }
    }
    None
}

/// Location recorded in an error object's captured stack
pub fn compute_location_from_error(heap: &ObjectHeap, exception: Value) -> Option<MessageLocation> {
    let stack = heap.error(exception)?.stack.as_ref()?;
    stack.iter().find_map(|site| {
        let script = site.script.clone()?;
        let position = site.source_position?;
        Some(MessageLocation::new(script, position, position + 1))
    })
}

/// Allocate a message object for `exception`
pub fn create_message(
    heap: &mut ObjectHeap,
    exception: Value,
    location: Option<MessageLocation>,
    stack_trace: Vec<CallSiteInfo>,
) -> Value {
    let text = format!("Uncaught {}", heap.describe(exception));
    heap.allocate(HeapObject::Message(MessageObject {
        exception,
        text,
        location,
        stack_trace,
    }))
}

pub type MessageListener = Arc<dyn Fn(&MessageObject) + Send + Sync>;

/// Registered message listeners
#[derive(Default)]
pub struct MessageListeners {
    listeners: RwLock<Vec<MessageListener>>,
}

impl MessageListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: MessageListener) {
        self.listeners.write().push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    pub fn clear(&self) {
        self.listeners.write().clear();
    }

    /// Deliver `message` to every listener. Returns false if there were none.
    pub fn notify(&self, message: &MessageObject) -> bool {
        // Listeners may register further listeners
        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            listener(message);
        }
        !listeners.is_empty()
    }
}

impl fmt::Debug for MessageListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageListeners")
            .field("count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_create_message_text() {
        let mut heap = ObjectHeap::new();
        let error = heap.new_error("TypeError", "x is not a function");
        let script = Script::new("main.ks", "let x;\nx();\n");
        let message = create_message(&mut heap, error, Some(MessageLocation::new(script, 7, 8)), Vec::new());
        let message = heap.message(message).unwrap();
        assert_eq!(message.text, "Uncaught TypeError: x is not a function");
        assert_eq!(message.location.as_ref().unwrap().to_string(), "main.ks:2:1");
    }

    #[test]
    fn test_listeners_in_registration_order() {
        let listeners = MessageListeners::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            listeners.add(Arc::new(move |m: &MessageObject| {
                seen.lock().push(format!("{tag}:{}", m.text));
            }));
        }
        let message = MessageObject {
            exception: Value::smi(1),
            text: "Uncaught 1".into(),
            location: None,
            stack_trace: Vec::new(),
        };
        assert!(listeners.notify(&message));
        assert_eq!(*seen.lock(), vec!["first:Uncaught 1", "second:Uncaught 1"]);
    }

    #[test]
    fn test_location_from_error_stack() {
        let mut heap = ObjectHeap::new();
        let error = heap.new_error("Error", "");
        assert!(compute_location_from_error(&heap, error).is_none());
        assert!(compute_location_from_error(&heap, Value::smi(3)).is_none());
    }
}
