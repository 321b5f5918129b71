use super::{SegmentId, StackFrame, StackSegment};
use crate::code::CodeLookup;

/// Walks one stack segment from the innermost frame outwards
pub struct StackFrameIterator<'a> {
    segment: &'a StackSegment,
    code: &'a dyn CodeLookup,
    remaining: usize,
}

impl<'a> StackFrameIterator<'a> {
    pub fn new(segment: &'a StackSegment, code: &'a dyn CodeLookup) -> Self {
        Self {
            segment,
            code,
            remaining: segment.frames().len(),
        }
    }

    pub fn segment(&self) -> SegmentId {
        self.segment.id()
    }

    /// Whether every frame has been produced
    pub fn done(&self) -> bool {
        self.remaining == 0
    }
}

impl<'a> Iterator for StackFrameIterator<'a> {
    type Item = StackFrame<'a>;

    fn next(&mut self) -> Option<StackFrame<'a>> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let raw = &self.segment.frames()[self.remaining];
        let code = self.code.lookup_code(raw.pc);
        Some(StackFrame::new(raw, code, self.segment.id()))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}
