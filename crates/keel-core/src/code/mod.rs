//! Code objects
//!
//! Every frame on the machine stack is executing some [`Code`]: a builtin
//! from the embedded blob, baseline code, or optimized code. Interpreted
//! frames run the interpreter trampoline builtin and carry their
//! [`BytecodeArray`] separately.
//!
//! Code is immutable once installed except for the deoptimization mark,
//! which other threads may set concurrently.

mod builtins;
mod function;
mod handler_table;
mod registry;

pub use builtins::{Builtin, Builtins};
pub use function::{BytecodeArray, FunctionOrigin, Script, SharedFunctionInfo, SourcePositionTable};
pub use handler_table::{HandlerPrediction, HandlerTable, RangeEntry, RangeMatch, ReturnEntry};
pub use registry::{CodeLookup, CodeRange, CodeRegistry};

use crate::value::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A machine address
pub type Address = usize;

/// The null address
pub const NULL_ADDRESS: Address = 0;

/// Size of a machine word
pub const POINTER_SIZE: usize = 8;

/// Kind of machine code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeKind {
    /// Part of the embedded builtins blob
    Builtin,
    /// Generated from bytecode without optimization
    Baseline,
    /// Mid-tier optimized code
    Maglev,
    /// Top-tier optimized code
    Turbofan,
    /// Hand-written stubs that are not builtins
    Stub,
}

impl CodeKind {
    /// Code that may have been speculatively optimized
    pub fn can_deoptimize(self) -> bool {
        matches!(self, CodeKind::Maglev | CodeKind::Turbofan)
    }

    pub fn is_optimized(self) -> bool {
        self.can_deoptimize()
    }
}

/// One frame reconstructed from optimized code at a call site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslatedFrame {
    pub function: Value,
    pub receiver: Value,
    pub bytecode_offset: u32,
    pub is_constructor: bool,
}

/// Deoptimization data for one return address, outermost frame first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeoptPoint {
    pub pc_offset: u32,
    pub frames: Vec<TranslatedFrame>,
}

/// Description of code to install
#[derive(Debug, Clone)]
pub struct CodeDesc {
    pub kind: CodeKind,
    pub builtin: Option<Builtin>,
    pub instruction_size: u32,
    pub stack_slots: u32,
    pub handler_table: HandlerTable,
    pub is_turbofanned: bool,
    pub catch_prediction: HandlerPrediction,
    pub deopt_points: Vec<DeoptPoint>,
    /// Baseline code: (bytecode offset, pc offset) pairs, ordered
    pub bytecode_pc_map: Vec<(u32, u32)>,
    pub function: Option<Arc<SharedFunctionInfo>>,
}

impl CodeDesc {
    pub fn new(kind: CodeKind, instruction_size: u32) -> Self {
        Self {
            kind,
            builtin: None,
            instruction_size,
            stack_slots: 0,
            handler_table: HandlerTable::new(),
            is_turbofanned: matches!(kind, CodeKind::Turbofan),
            catch_prediction: HandlerPrediction::Uncaught,
            deopt_points: Vec::new(),
            bytecode_pc_map: Vec::new(),
            function: None,
        }
    }

    pub fn with_handler_table(mut self, table: HandlerTable) -> Self {
        self.handler_table = table;
        self
    }

    pub fn with_stack_slots(mut self, slots: u32) -> Self {
        self.stack_slots = slots;
        self
    }

    pub fn with_function(mut self, function: Arc<SharedFunctionInfo>) -> Self {
        self.function = Some(function);
        self
    }

    pub fn with_deopt_point(mut self, pc_offset: u32, frames: Vec<TranslatedFrame>) -> Self {
        let at = self
            .deopt_points
            .partition_point(|p| p.pc_offset < pc_offset);
        self.deopt_points.insert(at, DeoptPoint { pc_offset, frames });
        self
    }

    pub fn with_bytecode_pc_map(mut self, map: Vec<(u32, u32)>) -> Self {
        self.bytecode_pc_map = map;
        self
    }
}

/// Installed machine code
#[derive(Debug)]
pub struct Code {
    kind: CodeKind,
    builtin: Option<Builtin>,
    instruction_start: Address,
    instruction_size: u32,
    constant_pool: Address,
    stack_slots: u32,
    handler_table: HandlerTable,
    is_turbofanned: bool,
    catch_prediction: HandlerPrediction,
    marked_for_deoptimization: AtomicBool,
    deopt_points: Vec<DeoptPoint>,
    bytecode_pc_map: Vec<(u32, u32)>,
    function: Option<Arc<SharedFunctionInfo>>,
}

impl Code {
    /// Place code described by `desc` at `instruction_start`. The constant
    /// pool immediately follows the instructions.
    pub(crate) fn install(desc: CodeDesc, instruction_start: Address) -> Self {
        Self {
            kind: desc.kind,
            builtin: desc.builtin,
            instruction_start,
            instruction_size: desc.instruction_size,
            constant_pool: instruction_start + desc.instruction_size as usize,
            stack_slots: desc.stack_slots,
            handler_table: desc.handler_table,
            is_turbofanned: desc.is_turbofanned,
            catch_prediction: desc.catch_prediction,
            marked_for_deoptimization: AtomicBool::new(false),
            deopt_points: desc.deopt_points,
            bytecode_pc_map: desc.bytecode_pc_map,
            function: desc.function,
        }
    }

    pub fn kind(&self) -> CodeKind {
        self.kind
    }

    pub fn builtin(&self) -> Option<Builtin> {
        self.builtin
    }

    pub fn is_builtin(&self, builtin: Builtin) -> bool {
        self.builtin == Some(builtin)
    }

    pub fn instruction_start(&self) -> Address {
        self.instruction_start
    }

    pub fn instruction_end(&self) -> Address {
        self.instruction_start + self.instruction_size as usize
    }

    pub fn instruction_size(&self) -> u32 {
        self.instruction_size
    }

    pub fn contains(&self, pc: Address) -> bool {
        self.instruction_start <= pc && pc < self.instruction_end()
    }

    pub fn constant_pool(&self) -> Address {
        self.constant_pool
    }

    pub fn stack_slots(&self) -> u32 {
        self.stack_slots
    }

    pub fn handler_table(&self) -> &HandlerTable {
        &self.handler_table
    }

    pub fn is_turbofanned(&self) -> bool {
        self.is_turbofanned
    }

    pub fn builtin_catch_prediction(&self) -> HandlerPrediction {
        self.catch_prediction
    }

    pub fn function(&self) -> Option<&Arc<SharedFunctionInfo>> {
        self.function.as_ref()
    }

    pub fn marked_for_deoptimization(&self) -> bool {
        self.marked_for_deoptimization.load(Ordering::Acquire)
    }

    pub fn set_marked_for_deoptimization(&self, marked: bool) {
        self.marked_for_deoptimization.store(marked, Ordering::Release);
    }

    /// Offset of `pc` from the start of the instructions
    pub fn pc_offset(&self, pc: Address) -> u32 {
        pc.saturating_sub(self.instruction_start) as u32
    }

    /// Inlined frames at the given return pc offset
    pub fn deopt_point(&self, pc_offset: u32) -> Option<&DeoptPoint> {
        let at = self
            .deopt_points
            .partition_point(|p| p.pc_offset <= pc_offset);
        at.checked_sub(1).map(|i| &self.deopt_points[i])
    }

    /// Baseline code: machine pc for a bytecode offset
    pub fn pc_for_bytecode_offset(&self, bytecode_offset: u32) -> Option<Address> {
        self.bytecode_pc_map
            .iter()
            .find(|(b, _)| *b == bytecode_offset)
            .map(|(_, pc)| self.instruction_start + *pc as usize)
    }

    /// Baseline code: bytecode offset for a machine pc
    pub fn bytecode_offset_for_pc(&self, pc: Address) -> Option<u32> {
        let offset = self.pc_offset(pc);
        self.bytecode_pc_map
            .iter()
            .filter(|(_, p)| *p <= offset)
            .max_by_key(|(_, p)| *p)
            .map(|(b, _)| *b)
    }
}

/// Either bytecode or machine code, as seen in a frame summary
#[derive(Debug, Clone)]
pub enum AbstractCode {
    Bytecode(Arc<BytecodeArray>),
    Code(Arc<Code>),
}

impl AbstractCode {
    pub fn is_builtin(&self) -> bool {
        matches!(self, AbstractCode::Code(code) if code.kind() == CodeKind::Builtin)
    }

    pub fn source_position(&self, code_offset: u32) -> Option<u32> {
        match self {
            AbstractCode::Bytecode(bytecode) => bytecode.source_positions.source_position(code_offset),
            AbstractCode::Code(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_places_constant_pool_after_instructions() {
        let code = Code::install(CodeDesc::new(CodeKind::Turbofan, 64), 0x1000);
        assert_eq!(code.instruction_start(), 0x1000);
        assert_eq!(code.constant_pool(), 0x1040);
        assert!(code.contains(0x103f));
        assert!(!code.contains(0x1040));
        assert!(code.is_turbofanned());
        assert!(code.kind().can_deoptimize());
    }

    #[test]
    fn test_deopt_mark() {
        let code = Code::install(CodeDesc::new(CodeKind::Maglev, 16), 0x2000);
        assert!(!code.marked_for_deoptimization());
        code.set_marked_for_deoptimization(true);
        assert!(code.marked_for_deoptimization());
    }

    #[test]
    fn test_deopt_point_lookup() {
        let frame = TranslatedFrame {
            function: Value::undefined(),
            receiver: Value::undefined(),
            bytecode_offset: 3,
            is_constructor: false,
        };
        let desc = CodeDesc::new(CodeKind::Turbofan, 128)
            .with_deopt_point(40, vec![frame])
            .with_deopt_point(8, vec![frame, frame]);
        let code = Code::install(desc, 0x3000);
        assert_eq!(code.deopt_point(40).unwrap().frames.len(), 1);
        assert_eq!(code.deopt_point(20).unwrap().frames.len(), 2);
        assert!(code.deopt_point(4).is_none());
    }

    #[test]
    fn test_baseline_pc_mapping() {
        let desc = CodeDesc::new(CodeKind::Baseline, 100)
            .with_bytecode_pc_map(vec![(0, 0), (4, 16), (9, 40)]);
        let code = Code::install(desc, 0x4000);
        assert_eq!(code.pc_for_bytecode_offset(4), Some(0x4010));
        assert_eq!(code.pc_for_bytecode_offset(5), None);
        assert_eq!(code.bytecode_offset_for_pc(0x4020), Some(4));
    }
}
