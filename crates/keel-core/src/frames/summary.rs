//! Frame summaries: the managed functions a physical frame represents
//!
//! Optimized frames may stand for several inlined functions. Summaries come
//! back outermost first, so the innermost active function is the last entry.

use super::StackFrame;
use crate::code::{AbstractCode, SharedFunctionInfo};
use crate::heap::ObjectHeap;
use crate::value::Value;
use std::sync::Arc;

/// One managed function activation
#[derive(Debug, Clone)]
pub struct FrameSummary {
    pub receiver: Value,
    pub function: Value,
    pub abstract_code: AbstractCode,
    /// Bytecode offset, or pc offset for builtins
    pub code_offset: u32,
    pub is_constructor: bool,
}

impl FrameSummary {
    pub fn shared(&self, heap: &ObjectHeap) -> Option<Arc<SharedFunctionInfo>> {
        heap.function(self.function).map(|f| Arc::clone(&f.shared))
    }

    pub fn source_position(&self) -> Option<u32> {
        self.abstract_code.source_position(self.code_offset)
    }
}

fn bytecode_summary(
    heap: &ObjectHeap,
    function: Value,
    receiver: Value,
    code_offset: u32,
    is_constructor: bool,
) -> Option<FrameSummary> {
    let shared = &heap.function(function)?.shared;
    Some(FrameSummary {
        receiver,
        function,
        abstract_code: AbstractCode::Bytecode(Arc::clone(&shared.bytecode)),
        code_offset,
        is_constructor,
    })
}

pub(super) fn summarize(frame: &StackFrame<'_>, heap: &ObjectHeap) -> Vec<FrameSummary> {
    let raw = frame.raw();
    match frame {
        StackFrame::Interpreted(f) | StackFrame::Baseline(f) => {
            let bytecode = raw
                .bytecode
                .clone()
                .or_else(|| heap.function(raw.function).map(|fun| Arc::clone(&fun.shared.bytecode)));
            bytecode
                .map(|bytecode| FrameSummary {
                    receiver: raw.receiver,
                    function: raw.function,
                    abstract_code: AbstractCode::Bytecode(bytecode),
                    code_offset: f.bytecode_offset(),
                    is_constructor: raw.is_constructor,
                })
                .into_iter()
                .collect()
        }
        StackFrame::Optimized(f) => {
            let point = f.0.code().and_then(|c| c.deopt_point(f.0.pc_offset()));
            match point {
                Some(point) => point
                    .frames
                    .iter()
                    .enumerate()
                    .filter_map(|(i, t)| {
                        // The outermost translated frame owns the physical receiver
                        let receiver = if i == 0 { raw.receiver } else { t.receiver };
                        bytecode_summary(heap, t.function, receiver, t.bytecode_offset, t.is_constructor)
                    })
                    .collect(),
                None => bytecode_summary(heap, raw.function, raw.receiver, 0, raw.is_constructor)
                    .into_iter()
                    .collect(),
            }
        }
        StackFrame::Builtin(f) => match f.0.code() {
            Some(code) => vec![FrameSummary {
                receiver: raw.receiver,
                function: raw.function,
                abstract_code: AbstractCode::Code(Arc::clone(code)),
                code_offset: f.0.pc_offset(),
                is_constructor: raw.is_constructor,
            }],
            None => Vec::new(),
        },
        _ => Vec::new(),
    }
}
