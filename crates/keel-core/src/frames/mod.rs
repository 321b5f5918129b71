//! Stack frames
//!
//! A [`RawFrame`] is what sits on the stack; a [`StackFrame`] is the typed
//! view the walker produces for it, combining the frame marker with the code
//! found at the frame's pc:
//!
//! | marker                 | code at pc                    | frame type       |
//! |------------------------|-------------------------------|------------------|
//! | Entry / ConstructEntry | entry trampoline              | `Entry`          |
//! | Exit                   | runtime call stub             | `Exit`           |
//! | JavaScript             | interpreter trampoline        | `Interpreted`    |
//! | JavaScript             | baseline code                 | `Baseline`       |
//! | JavaScript             | maglev / turbofan code        | `Optimized`      |
//! | JavaScript             | other builtin                 | `Builtin`        |
//! | Stub                   | any                           | `Stub`           |
//! | BuiltinContinuation…   | continuation builtin          | `Continuation…`  |
//! | Native                 | none                          | `Native`         |

mod iterator;
mod raw;
mod summary;

pub use iterator::StackFrameIterator;
pub use raw::{
    FrameMarker, FrameSpec, JumpBufferState, RawFrame, SegmentId, SegmentedStack, StackSegment,
    FIXED_FRAME_SIZE_ABOVE_FP, INTERPRETER_FIXED_FRAME_SIZE_FROM_FP, STACK_HANDLER_SIZE,
};
pub use summary::FrameSummary;

use crate::code::{Address, Builtin, Code, CodeKind, RangeMatch, POINTER_SIZE};
use crate::heap::ObjectHeap;
use std::sync::Arc;

/// Stable identity of a frame for the duration of its activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub Address);

/// Concrete frame type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackFrameType {
    Entry,
    ConstructEntry,
    Exit,
    Interpreted,
    Baseline,
    Maglev,
    Turbofan,
    Builtin,
    Stub,
    BuiltinContinuationWithCatch,
    Native,
}

/// State shared by every frame view
#[derive(Debug, Clone)]
pub struct CommonFrame<'a> {
    raw: &'a RawFrame,
    code: Option<Arc<Code>>,
    segment: SegmentId,
}

impl<'a> CommonFrame<'a> {
    pub fn raw(&self) -> &'a RawFrame {
        self.raw
    }

    pub fn id(&self) -> FrameId {
        FrameId(self.raw.fp)
    }

    pub fn fp(&self) -> Address {
        self.raw.fp
    }

    pub fn sp(&self) -> Address {
        self.raw.sp
    }

    pub fn pc(&self) -> Address {
        self.raw.pc
    }

    pub fn segment(&self) -> SegmentId {
        self.segment
    }

    /// Code containing the pc
    pub fn code(&self) -> Option<&Arc<Code>> {
        self.code.as_ref()
    }

    /// Offset of the pc into the frame's code
    pub fn pc_offset(&self) -> u32 {
        self.code.as_ref().map_or(0, |c| c.pc_offset(self.raw.pc))
    }
}

/// Entry frame: native code calling managed code
#[derive(Debug, Clone)]
pub struct EntryFrame<'a>(pub CommonFrame<'a>);

impl EntryFrame<'_> {
    /// Index of the handler this frame installed
    pub fn handler_index(&self) -> Option<usize> {
        self.0.raw.handler
    }
}

/// Interpreted or baseline frame
#[derive(Debug, Clone)]
pub struct UnoptimizedFrame<'a>(pub CommonFrame<'a>);

impl UnoptimizedFrame<'_> {
    pub fn register_count(&self) -> usize {
        self.0.raw.registers.len()
    }

    /// Current bytecode offset. Baseline frames derive it from the pc.
    pub fn bytecode_offset(&self) -> u32 {
        match self.0.code() {
            Some(code) if code.kind() == CodeKind::Baseline => code
                .bytecode_offset_for_pc(self.0.raw.pc)
                .unwrap_or(self.0.raw.bytecode_offset),
            _ => self.0.raw.bytecode_offset,
        }
    }

    /// Innermost handler range covering the current bytecode offset
    pub fn lookup_handler_in_table(&self) -> Option<RangeMatch> {
        let bytecode = self.0.raw.bytecode.as_ref()?;
        bytecode.handler_table.lookup_range(self.bytecode_offset())
    }

    /// Stack pointer a handler in this frame resumes with
    pub fn handler_sp(&self) -> Address {
        self.0.raw.fp
            - INTERPRETER_FIXED_FRAME_SIZE_FROM_FP
            - self.register_count() * POINTER_SIZE
    }
}

/// Maglev or turbofan frame
#[derive(Debug, Clone)]
pub struct OptimizedFrame<'a>(pub CommonFrame<'a>);

impl OptimizedFrame<'_> {
    /// Handler offset for the current return address
    pub fn lookup_handler_in_table(&self) -> Option<u32> {
        let code = self.0.code()?;
        code.handler_table().lookup_return(self.0.pc_offset())
    }

    /// Stack pointer a handler in this frame resumes with
    pub fn handler_sp(&self) -> Address {
        let slots = self.0.code().map_or(0, |c| c.stack_slots() as usize);
        self.0.raw.fp + FIXED_FRAME_SIZE_ABOVE_FP - slots * POINTER_SIZE
    }
}

/// A builtin called like a managed function
#[derive(Debug, Clone)]
pub struct BuiltinFrame<'a>(pub CommonFrame<'a>);

/// A stub frame
#[derive(Debug, Clone)]
pub struct StubFrame<'a>(pub CommonFrame<'a>);

impl StubFrame<'_> {
    /// Only turbofanned builtins with a handler table can catch in a stub frame
    pub fn lookup_handler_in_table(&self) -> Option<u32> {
        let code = self.0.code()?;
        if code.kind() != CodeKind::Builtin
            || !code.is_turbofanned()
            || code.handler_table().is_empty()
        {
            return None;
        }
        code.handler_table().lookup_return(self.0.pc_offset())
    }
}

/// Continuation of a builtin that catches exceptions
#[derive(Debug, Clone)]
pub struct ContinuationFrame<'a>(pub CommonFrame<'a>);

/// A typed view of one stack frame
#[derive(Debug, Clone)]
pub enum StackFrame<'a> {
    Entry(EntryFrame<'a>),
    ConstructEntry(EntryFrame<'a>),
    Exit(CommonFrame<'a>),
    Interpreted(UnoptimizedFrame<'a>),
    Baseline(UnoptimizedFrame<'a>),
    Optimized(OptimizedFrame<'a>),
    Builtin(BuiltinFrame<'a>),
    Stub(StubFrame<'a>),
    BuiltinContinuationWithCatch(ContinuationFrame<'a>),
    Native(CommonFrame<'a>),
}

impl<'a> StackFrame<'a> {
    /// Classify a raw frame by its marker and the code at its pc
    pub fn new(raw: &'a RawFrame, code: Option<Arc<Code>>, segment: SegmentId) -> Self {
        let common = CommonFrame { raw, code, segment };
        match raw.marker {
            FrameMarker::Entry => StackFrame::Entry(EntryFrame(common)),
            FrameMarker::ConstructEntry => StackFrame::ConstructEntry(EntryFrame(common)),
            FrameMarker::Exit => StackFrame::Exit(common),
            FrameMarker::Stub => StackFrame::Stub(StubFrame(common)),
            FrameMarker::BuiltinContinuationWithCatch => {
                StackFrame::BuiltinContinuationWithCatch(ContinuationFrame(common))
            }
            FrameMarker::Native => StackFrame::Native(common),
            FrameMarker::JavaScript => {
                let Some(kind) = common.code.as_ref().map(|c| (c.kind(), c.builtin())) else {
                    crate::fatal::fatal_error(crate::fatal::FatalError::InvariantViolation(
                        format!("managed frame at pc {:#x} has no code", raw.pc),
                    ));
                };
                match kind {
                    (CodeKind::Builtin, Some(Builtin::InterpreterEntryTrampoline))
                    | (CodeKind::Builtin, Some(Builtin::InterpreterEnterAtBytecode)) => {
                        StackFrame::Interpreted(UnoptimizedFrame(common))
                    }
                    (CodeKind::Baseline, _) => StackFrame::Baseline(UnoptimizedFrame(common)),
                    (CodeKind::Maglev, _) | (CodeKind::Turbofan, _) => {
                        StackFrame::Optimized(OptimizedFrame(common))
                    }
                    (CodeKind::Builtin, _) | (CodeKind::Stub, _) => {
                        StackFrame::Builtin(BuiltinFrame(common))
                    }
                }
            }
        }
    }

    pub fn common(&self) -> &CommonFrame<'a> {
        match self {
            StackFrame::Entry(f) | StackFrame::ConstructEntry(f) => &f.0,
            StackFrame::Exit(f) | StackFrame::Native(f) => f,
            StackFrame::Interpreted(f) | StackFrame::Baseline(f) => &f.0,
            StackFrame::Optimized(f) => &f.0,
            StackFrame::Builtin(f) => &f.0,
            StackFrame::Stub(f) => &f.0,
            StackFrame::BuiltinContinuationWithCatch(f) => &f.0,
        }
    }

    pub fn frame_type(&self) -> StackFrameType {
        match self {
            StackFrame::Entry(_) => StackFrameType::Entry,
            StackFrame::ConstructEntry(_) => StackFrameType::ConstructEntry,
            StackFrame::Exit(_) => StackFrameType::Exit,
            StackFrame::Interpreted(_) => StackFrameType::Interpreted,
            StackFrame::Baseline(_) => StackFrameType::Baseline,
            StackFrame::Optimized(f) => match f.0.code().map(|c| c.kind()) {
                Some(CodeKind::Maglev) => StackFrameType::Maglev,
                _ => StackFrameType::Turbofan,
            },
            StackFrame::Builtin(_) => StackFrameType::Builtin,
            StackFrame::Stub(_) => StackFrameType::Stub,
            StackFrame::BuiltinContinuationWithCatch(_) => {
                StackFrameType::BuiltinContinuationWithCatch
            }
            StackFrame::Native(_) => StackFrameType::Native,
        }
    }

    pub fn id(&self) -> FrameId {
        self.common().id()
    }

    pub fn fp(&self) -> Address {
        self.common().fp()
    }

    pub fn raw(&self) -> &'a RawFrame {
        self.common().raw()
    }

    pub fn code(&self) -> Option<&Arc<Code>> {
        self.common().code()
    }

    /// Frames that execute managed code and can be summarized
    pub fn is_java_script(&self) -> bool {
        matches!(
            self,
            StackFrame::Interpreted(_)
                | StackFrame::Baseline(_)
                | StackFrame::Optimized(_)
                | StackFrame::Builtin(_)
        )
    }

    pub fn is_turbofan(&self) -> bool {
        self.frame_type() == StackFrameType::Turbofan
    }

    /// Managed functions active in this frame, outermost first
    pub fn summarize(&self, heap: &ObjectHeap) -> Vec<FrameSummary> {
        summary::summarize(self, heap)
    }
}

/// Visitor over typed frames
///
/// Each method returns `true` to keep walking. Unhandled frame types fall
/// through to [`visit_other`](FrameVisitor::visit_other).
pub trait FrameVisitor<'a> {
    fn visit_entry(&mut self, frame: &EntryFrame<'a>) -> bool {
        self.visit_other(&frame.0)
    }

    fn visit_unoptimized(&mut self, frame: &UnoptimizedFrame<'a>) -> bool {
        self.visit_other(&frame.0)
    }

    fn visit_optimized(&mut self, frame: &OptimizedFrame<'a>) -> bool {
        self.visit_other(&frame.0)
    }

    fn visit_builtin(&mut self, frame: &BuiltinFrame<'a>) -> bool {
        self.visit_other(&frame.0)
    }

    fn visit_stub(&mut self, frame: &StubFrame<'a>) -> bool {
        self.visit_other(&frame.0)
    }

    fn visit_continuation(&mut self, frame: &ContinuationFrame<'a>) -> bool {
        self.visit_other(&frame.0)
    }

    fn visit_other(&mut self, _frame: &CommonFrame<'a>) -> bool {
        true
    }
}

impl<'a> StackFrame<'a> {
    /// Dispatch to the visitor method for this frame's type
    pub fn accept<V: FrameVisitor<'a> + ?Sized>(&self, visitor: &mut V) -> bool {
        match self {
            StackFrame::Entry(f) | StackFrame::ConstructEntry(f) => visitor.visit_entry(f),
            StackFrame::Interpreted(f) | StackFrame::Baseline(f) => visitor.visit_unoptimized(f),
            StackFrame::Optimized(f) => visitor.visit_optimized(f),
            StackFrame::Builtin(f) => visitor.visit_builtin(f),
            StackFrame::Stub(f) => visitor.visit_stub(f),
            StackFrame::BuiltinContinuationWithCatch(f) => visitor.visit_continuation(f),
            StackFrame::Exit(f) | StackFrame::Native(f) => visitor.visit_other(f),
        }
    }
}
