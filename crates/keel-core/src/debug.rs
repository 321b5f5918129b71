//! Debugger hooks used by the execution core
//!
//! Only frame restart is modelled: the debugger marks a frame and raises an
//! uncatchable exception. The unwinder diverts to the restart trampoline once
//! it reaches the marked frame.

use crate::frames::FrameId;
use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct Debug {
    restart_frame: Mutex<Option<FrameId>>,
}

impl Debug {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the next unwind to restart `frame` instead of looking for a handler
    pub fn request_restart_frame(&self, frame: FrameId) {
        *self.restart_frame.lock() = Some(frame);
    }

    pub fn restart_frame(&self) -> Option<FrameId> {
        *self.restart_frame.lock()
    }

    pub fn should_restart_frame(&self, frame: FrameId) -> bool {
        self.restart_frame() == Some(frame)
    }

    pub fn clear_restart_frame(&self) {
        *self.restart_frame.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_request() {
        let debug = Debug::new();
        assert!(!debug.should_restart_frame(FrameId(0x10)));
        debug.request_restart_frame(FrameId(0x10));
        assert!(debug.should_restart_frame(FrameId(0x10)));
        assert!(!debug.should_restart_frame(FrameId(0x20)));
        debug.clear_restart_frame();
        assert_eq!(debug.restart_frame(), None);
    }
}
