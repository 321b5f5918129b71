//! Interrupt requests
//!
//! Other threads ask the thread running an isolate to do something at its
//! next interrupt check: terminate, or run an embedder callback. Requests set
//! a flag on the [`StackGuard`] (cheap to poll) and callbacks go through an
//! unbounded channel that is drained without holding any lock, so a callback
//! may itself request further interrupts.

use crate::isolate::Isolate;
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Callback run on the isolate's thread at the next interrupt check
pub type InterruptRequest = Box<dyn FnOnce(&Isolate) + Send + 'static>;

/// Kinds of pending interrupts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum InterruptFlag {
    TerminateExecution = 1 << 0,
    ApiInterrupt = 1 << 1,
}

impl InterruptFlag {
    fn bit(self) -> u32 {
        self as u32
    }
}

/// Pending interrupt flags, polled at interrupt checks
#[derive(Debug, Default)]
pub struct StackGuard {
    interrupts: AtomicU32,
}

impl StackGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, flag: InterruptFlag) {
        self.interrupts.fetch_or(flag.bit(), Ordering::AcqRel);
    }

    pub fn clear(&self, flag: InterruptFlag) {
        self.interrupts.fetch_and(!flag.bit(), Ordering::AcqRel);
    }

    pub fn check(&self, flag: InterruptFlag) -> bool {
        self.interrupts.load(Ordering::Acquire) & flag.bit() != 0
    }

    /// Clear `flag`, returning whether it was set
    pub fn take(&self, flag: InterruptFlag) -> bool {
        self.interrupts.fetch_and(!flag.bit(), Ordering::AcqRel) & flag.bit() != 0
    }

    pub fn has_pending(&self) -> bool {
        self.interrupts.load(Ordering::Acquire) != 0
    }
}

/// Queue of embedder interrupt callbacks
pub struct InterruptQueue {
    sender: Sender<InterruptRequest>,
    receiver: Receiver<InterruptRequest>,
}

impl Default for InterruptQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptQueue {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }

    pub fn push(&self, request: InterruptRequest) {
        // Both ends live in self, so the channel cannot be disconnected
        let _ = self.sender.send(request);
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Next queued callback, if any
    pub fn pop(&self) -> Option<InterruptRequest> {
        self.receiver.try_recv().ok()
    }

    /// Drop every queued callback without running it
    pub fn clear(&self) -> usize {
        self.receiver.try_iter().count()
    }
}

impl fmt::Debug for InterruptQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptQueue")
            .field("pending", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_are_independent() {
        let guard = StackGuard::new();
        guard.request(InterruptFlag::TerminateExecution);
        guard.request(InterruptFlag::ApiInterrupt);
        assert!(guard.take(InterruptFlag::ApiInterrupt));
        assert!(!guard.take(InterruptFlag::ApiInterrupt));
        assert!(guard.check(InterruptFlag::TerminateExecution));
        guard.clear(InterruptFlag::TerminateExecution);
        assert!(!guard.has_pending());
    }

    #[test]
    fn test_queue_fifo_across_threads() {
        let queue = std::sync::Arc::new(InterruptQueue::new());
        let pusher = {
            let queue = std::sync::Arc::clone(&queue);
            std::thread::spawn(move || {
                for _ in 0..3 {
                    queue.push(Box::new(|_| {}));
                }
            })
        };
        pusher.join().unwrap();
        assert_eq!(queue.len(), 3);
        assert!(queue.pop().is_some());
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }
}
