//! Machine stack model
//!
//! Each thread owns a [`SegmentedStack`]. Its first segment is the thread's
//! native stack; further segments are switchable stacks (used by stack
//! switching for suspended computations) chained to a parent.
//!
//! ```text
//!   high addresses
//!   ┌───────────────────────┐ ◄─ segment base
//!   │ entry frame           │     frames[0]   (outermost)
//!   ├───────────────────────┤
//!   │ interpreted frame     │     frames[1]
//!   ├───────────────────────┤
//!   │ exit frame            │     frames[2]   (innermost)
//!   ├───────────────────────┤ ◄─ cursor (current sp)
//!   │                       │
//!   low addresses
//! ```
//!
//! Addresses are positions within the thread's stack reservation. Native
//! scopes (external try-catch blocks) take space from the same cursor, so
//! their addresses interleave correctly with frame addresses.

use crate::code::{Address, BytecodeArray, Code, POINTER_SIZE};
use crate::value::Value;
use std::sync::Arc;

/// Saved frame pointer and return address sit above fp
pub const FIXED_FRAME_SIZE_ABOVE_FP: usize = 2 * POINTER_SIZE;
/// Context, function, bytecode array and bytecode offset slots below fp
pub const INTERPRETER_FIXED_FRAME_SIZE_FROM_FP: usize = 4 * POINTER_SIZE;
/// Size of a stack handler record
pub const STACK_HANDLER_SIZE: usize = 2 * POINTER_SIZE;

const ENTRY_FRAME_SLOTS: usize = 6;
const EXIT_FRAME_SLOTS: usize = 2;
const TYPED_FRAME_SLOTS: usize = 4;

/// Highest address of the first segment on every thread
const STACK_BASE: Address = 0x7ff0_0000_0000;
/// Address space given to each segment
const SEGMENT_SPAN: usize = 0x10_0000;

/// How a frame was pushed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameMarker {
    /// Native code calling into managed code
    Entry,
    /// Native code invoking a constructor
    ConstructEntry,
    /// Managed code calling out to the runtime
    Exit,
    /// A managed frame; its code decides the concrete type
    JavaScript,
    /// A stub built on top of a builtin
    Stub,
    /// Continuation of a builtin that catches exceptions
    BuiltinContinuationWithCatch,
    /// Embedder code with no managed state
    Native,
}

/// One frame as stored on the stack
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub marker: FrameMarker,
    pub fp: Address,
    pub sp: Address,
    pub pc: Address,
    /// Stack pointer of the caller, restored on pop
    pub caller_sp: Address,
    pub function: Value,
    pub receiver: Value,
    pub context: Value,
    /// Interpreter register file
    pub registers: Vec<Value>,
    pub bytecode: Option<Arc<BytecodeArray>>,
    pub bytecode_offset: u32,
    /// Entry frames: index of the handler they installed
    pub handler: Option<usize>,
    /// Continuation frames: where a caught exception is delivered
    pub exception: Value,
    pub is_constructor: bool,
    slots: usize,
}

impl RawFrame {
    /// Slots between fp and sp
    pub fn slot_count(&self) -> usize {
        self.slots
    }
}

/// Description of a frame to push
#[derive(Debug, Clone)]
pub struct FrameSpec {
    frame: RawFrame,
    /// Optimized frames size themselves relative to fp + fixed part
    optimized: bool,
}

impl FrameSpec {
    fn new(marker: FrameMarker, pc: Address, slots: usize) -> Self {
        Self {
            frame: RawFrame {
                marker,
                fp: 0,
                sp: 0,
                pc,
                caller_sp: 0,
                function: Value::undefined(),
                receiver: Value::undefined(),
                context: Value::undefined(),
                registers: Vec::new(),
                bytecode: None,
                bytecode_offset: 0,
                handler: None,
                exception: Value::the_hole(),
                is_constructor: false,
                slots,
            },
            optimized: false,
        }
    }

    /// Entry frame returning into the entry trampoline
    pub fn entry(trampoline: &Code) -> Self {
        Self::new(
            FrameMarker::Entry,
            trampoline.instruction_start(),
            ENTRY_FRAME_SLOTS,
        )
    }

    pub fn construct_entry(trampoline: &Code) -> Self {
        Self::new(
            FrameMarker::ConstructEntry,
            trampoline.instruction_start(),
            ENTRY_FRAME_SLOTS,
        )
    }

    /// Exit frame returning into the runtime call stub
    pub fn exit(centry: &Code) -> Self {
        Self::new(FrameMarker::Exit, centry.instruction_start(), EXIT_FRAME_SLOTS)
    }

    /// Interpreter frame. `pc` points into the interpreter trampoline.
    pub fn interpreted(
        trampoline: &Code,
        function: Value,
        bytecode: Arc<BytecodeArray>,
        bytecode_offset: u32,
    ) -> Self {
        let registers = bytecode.register_count as usize;
        let mut spec = Self::new(
            FrameMarker::JavaScript,
            trampoline.instruction_start() + 16,
            INTERPRETER_FIXED_FRAME_SIZE_FROM_FP / POINTER_SIZE + registers,
        );
        spec.frame.function = function;
        spec.frame.registers = vec![Value::undefined(); registers];
        spec.frame.bytecode = Some(bytecode);
        spec.frame.bytecode_offset = bytecode_offset;
        spec
    }

    /// Baseline frame positioned at `bytecode_offset`
    pub fn baseline(
        code: &Code,
        function: Value,
        bytecode: Arc<BytecodeArray>,
        bytecode_offset: u32,
    ) -> Self {
        let registers = bytecode.register_count as usize;
        let pc = code
            .pc_for_bytecode_offset(bytecode_offset)
            .unwrap_or_else(|| code.instruction_start());
        let mut spec = Self::new(
            FrameMarker::JavaScript,
            pc,
            INTERPRETER_FIXED_FRAME_SIZE_FROM_FP / POINTER_SIZE + registers,
        );
        spec.frame.function = function;
        spec.frame.registers = vec![Value::undefined(); registers];
        spec.frame.bytecode = Some(bytecode);
        spec.frame.bytecode_offset = bytecode_offset;
        spec
    }

    /// Optimized frame returning to `pc_offset` within `code`
    pub fn optimized(code: &Code, function: Value, pc_offset: u32) -> Self {
        let mut spec = Self::new(
            FrameMarker::JavaScript,
            code.instruction_start() + pc_offset as usize,
            (code.stack_slots() as usize).max(FIXED_FRAME_SIZE_ABOVE_FP / POINTER_SIZE),
        );
        spec.frame.function = function;
        spec.optimized = true;
        spec
    }

    /// Frame of a builtin called as a managed function
    pub fn builtin(code: &Code, function: Value, pc_offset: u32) -> Self {
        let mut spec = Self::new(
            FrameMarker::JavaScript,
            code.instruction_start() + pc_offset as usize,
            TYPED_FRAME_SLOTS,
        );
        spec.frame.function = function;
        spec
    }

    pub fn stub(code: &Code, pc_offset: u32) -> Self {
        Self::new(
            FrameMarker::Stub,
            code.instruction_start() + pc_offset as usize,
            TYPED_FRAME_SLOTS,
        )
    }

    pub fn continuation_with_catch(code: &Code) -> Self {
        Self::new(
            FrameMarker::BuiltinContinuationWithCatch,
            code.instruction_start() + 8,
            TYPED_FRAME_SLOTS,
        )
    }

    /// Embedder frame; `pc` is outside any managed code
    pub fn native(pc: Address) -> Self {
        Self::new(FrameMarker::Native, pc, TYPED_FRAME_SLOTS)
    }

    pub fn with_receiver(mut self, receiver: Value) -> Self {
        self.frame.receiver = receiver;
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.frame.context = context;
        self
    }

    /// Set an interpreter register
    pub fn with_register(mut self, index: usize, value: Value) -> Self {
        if index >= self.frame.registers.len() {
            self.frame.registers.resize(index + 1, Value::undefined());
        }
        self.frame.registers[index] = value;
        self
    }

    pub fn as_constructor(mut self) -> Self {
        self.frame.is_constructor = true;
        self
    }

    pub fn marker(&self) -> FrameMarker {
        self.frame.marker
    }
}

/// Identifier of a stack segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentId(pub u32);

/// Lifecycle of a switchable stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpBufferState {
    Active,
    Inactive,
    Suspended,
    Retired,
}

/// A contiguous stack
#[derive(Debug, Clone)]
pub struct StackSegment {
    id: SegmentId,
    base: Address,
    cursor: Address,
    frames: Vec<RawFrame>,
    state: JumpBufferState,
    parent: Option<SegmentId>,
}

impl StackSegment {
    fn new(id: SegmentId, base: Address, parent: Option<SegmentId>) -> Self {
        Self {
            id,
            base,
            cursor: base,
            frames: Vec::new(),
            state: JumpBufferState::Active,
            parent,
        }
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn base(&self) -> Address {
        self.base
    }

    /// Current stack pointer
    pub fn cursor(&self) -> Address {
        self.cursor
    }

    pub fn state(&self) -> JumpBufferState {
        self.state
    }

    pub fn parent(&self) -> Option<SegmentId> {
        self.parent
    }

    /// Frames, outermost first
    pub fn frames(&self) -> &[RawFrame] {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut [RawFrame] {
        &mut self.frames
    }

    pub fn frame_by_fp(&self, fp: Address) -> Option<&RawFrame> {
        self.frames.iter().find(|f| f.fp == fp)
    }

    pub fn frame_by_fp_mut(&mut self, fp: Address) -> Option<&mut RawFrame> {
        self.frames.iter_mut().find(|f| f.fp == fp)
    }

    fn push(&mut self, spec: FrameSpec) -> &RawFrame {
        let FrameSpec { mut frame, optimized } = spec;
        frame.caller_sp = self.cursor;
        frame.fp = self.cursor - FIXED_FRAME_SIZE_ABOVE_FP;
        frame.sp = if optimized {
            frame.fp + FIXED_FRAME_SIZE_ABOVE_FP - frame.slots * POINTER_SIZE
        } else {
            frame.fp - frame.slots * POINTER_SIZE
        };
        self.cursor = frame.sp;
        self.frames.push(frame);
        let last = self.frames.len() - 1;
        &self.frames[last]
    }

    fn pop(&mut self) -> Option<RawFrame> {
        let frame = self.frames.pop()?;
        self.cursor = frame.caller_sp;
        Some(frame)
    }
}

/// All stack segments of one thread
#[derive(Debug, Clone)]
pub struct SegmentedStack {
    segments: Vec<StackSegment>,
    active: usize,
}

impl Default for SegmentedStack {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentedStack {
    pub fn new() -> Self {
        Self {
            segments: vec![StackSegment::new(SegmentId(0), STACK_BASE, None)],
            active: 0,
        }
    }

    pub fn active(&self) -> &StackSegment {
        &self.segments[self.active]
    }

    pub fn active_mut(&mut self) -> &mut StackSegment {
        &mut self.segments[self.active]
    }

    pub fn segment(&self, id: SegmentId) -> Option<&StackSegment> {
        self.segments.iter().find(|s| s.id == id)
    }

    pub fn segments(&self) -> &[StackSegment] {
        &self.segments
    }

    pub fn segments_mut(&mut self) -> &mut [StackSegment] {
        &mut self.segments
    }

    pub fn push(&mut self, spec: FrameSpec) -> &RawFrame {
        self.active_mut().push(spec)
    }

    pub fn pop(&mut self) -> Option<RawFrame> {
        self.active_mut().pop()
    }

    /// Total frames across every live segment
    pub fn depth(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| s.state != JumpBufferState::Retired)
            .map(|s| s.frames.len())
            .sum()
    }

    /// Take `size` bytes of native stack for a scope object
    pub fn reserve_native(&mut self, size: usize) -> Address {
        let segment = self.active_mut();
        segment.cursor -= size;
        segment.cursor
    }

    /// Give back native stack taken by [`reserve_native`](Self::reserve_native).
    /// Only the most recent reservation can be returned.
    pub fn release_native(&mut self, address: Address, size: usize) {
        let segment = self.active_mut();
        if segment.cursor == address {
            segment.cursor += size;
        }
    }

    /// Start a new segment that returns to the active one
    pub fn switch_to_new_segment(&mut self) -> SegmentId {
        let id = SegmentId(self.segments.len() as u32);
        let base = STACK_BASE - self.segments.len() * SEGMENT_SPAN;
        let parent = self.active().id;
        self.active_mut().state = JumpBufferState::Inactive;
        self.segments.push(StackSegment::new(id, base, Some(parent)));
        self.active = self.segments.len() - 1;
        id
    }

    /// Retire the active segment and resume its parent
    pub fn switch_to_parent(&mut self) -> Option<SegmentId> {
        let parent = self.active().parent?;
        let index = self.segments.iter().position(|s| s.id == parent)?;
        self.active_mut().state = JumpBufferState::Retired;
        self.segments[index].state = JumpBufferState::Active;
        self.active = index;
        Some(parent)
    }

    /// Suspend the active segment and resume its parent, keeping frames
    pub fn suspend_to_parent(&mut self) -> Option<SegmentId> {
        let parent = self.active().parent?;
        let index = self.segments.iter().position(|s| s.id == parent)?;
        self.active_mut().state = JumpBufferState::Suspended;
        self.segments[index].state = JumpBufferState::Active;
        self.active = index;
        Some(parent)
    }
}
