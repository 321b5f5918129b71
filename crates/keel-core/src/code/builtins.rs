//! Builtins living in the embedded blob
//!
//! The set of builtins is fixed at build time. Their instructions are laid out
//! back to back in the blob's code section; the [`Builtins`] table maps each
//! one to its installed [`Code`] once an isolate has a blob.

use super::{Address, Code, CodeDesc, CodeKind, CodeRegistry, HandlerPrediction, HandlerTable};
use crate::blob::EmbeddedBlob;
use std::sync::Arc;

/// Builtin identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum Builtin {
    JSEntry,
    JSConstructEntry,
    CEntry,
    InterpreterEntryTrampoline,
    InterpreterEnterAtBytecode,
    RestartFrameTrampoline,
    JavaScriptBuiltinContinuationWithCatch,
    ArrayJoin,
    PromiseConstructor,
    AsyncFunctionAwait,
    AsyncFunctionAwaitResolveClosure,
    AsyncFunctionAwaitRejectClosure,
    AsyncGeneratorAwaitResolveClosure,
    AsyncGeneratorAwaitRejectClosure,
    AsyncGeneratorYieldWithAwaitResolveClosure,
    PromiseAllResolveElementClosure,
    PromiseAllSettledResolveElementClosure,
    PromiseAnyRejectElementClosure,
    PromiseCapabilityDefaultResolve,
    PromiseCapabilityDefaultReject,
    PromiseAll,
    PromiseAllSettled,
    PromiseAny,
}

impl Builtin {
    pub const ALL: [Builtin; 23] = [
        Builtin::JSEntry,
        Builtin::JSConstructEntry,
        Builtin::CEntry,
        Builtin::InterpreterEntryTrampoline,
        Builtin::InterpreterEnterAtBytecode,
        Builtin::RestartFrameTrampoline,
        Builtin::JavaScriptBuiltinContinuationWithCatch,
        Builtin::ArrayJoin,
        Builtin::PromiseConstructor,
        Builtin::AsyncFunctionAwait,
        Builtin::AsyncFunctionAwaitResolveClosure,
        Builtin::AsyncFunctionAwaitRejectClosure,
        Builtin::AsyncGeneratorAwaitResolveClosure,
        Builtin::AsyncGeneratorAwaitRejectClosure,
        Builtin::AsyncGeneratorYieldWithAwaitResolveClosure,
        Builtin::PromiseAllResolveElementClosure,
        Builtin::PromiseAllSettledResolveElementClosure,
        Builtin::PromiseAnyRejectElementClosure,
        Builtin::PromiseCapabilityDefaultResolve,
        Builtin::PromiseCapabilityDefaultReject,
        Builtin::PromiseAll,
        Builtin::PromiseAllSettled,
        Builtin::PromiseAny,
    ];

    pub const COUNT: usize = Self::ALL.len();

    /// Offset of the handler that entry trampolines install for calls out of native code
    pub const ENTRY_HANDLER_OFFSET: u32 = 96;

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Builtin::JSEntry => "JSEntry",
            Builtin::JSConstructEntry => "JSConstructEntry",
            Builtin::CEntry => "CEntry",
            Builtin::InterpreterEntryTrampoline => "InterpreterEntryTrampoline",
            Builtin::InterpreterEnterAtBytecode => "InterpreterEnterAtBytecode",
            Builtin::RestartFrameTrampoline => "RestartFrameTrampoline",
            Builtin::JavaScriptBuiltinContinuationWithCatch => {
                "JavaScriptBuiltinContinuationWithCatch"
            }
            Builtin::ArrayJoin => "ArrayPrototypeJoin",
            Builtin::PromiseConstructor => "PromiseConstructor",
            Builtin::AsyncFunctionAwait => "AsyncFunctionAwait",
            Builtin::AsyncFunctionAwaitResolveClosure => "AsyncFunctionAwaitResolveClosure",
            Builtin::AsyncFunctionAwaitRejectClosure => "AsyncFunctionAwaitRejectClosure",
            Builtin::AsyncGeneratorAwaitResolveClosure => "AsyncGeneratorAwaitResolveClosure",
            Builtin::AsyncGeneratorAwaitRejectClosure => "AsyncGeneratorAwaitRejectClosure",
            Builtin::AsyncGeneratorYieldWithAwaitResolveClosure => {
                "AsyncGeneratorYieldWithAwaitResolveClosure"
            }
            Builtin::PromiseAllResolveElementClosure => "PromiseAllResolveElementClosure",
            Builtin::PromiseAllSettledResolveElementClosure => {
                "PromiseAllSettledResolveElementClosure"
            }
            Builtin::PromiseAnyRejectElementClosure => "PromiseAnyRejectElementClosure",
            Builtin::PromiseCapabilityDefaultResolve => "PromiseCapabilityDefaultResolve",
            Builtin::PromiseCapabilityDefaultReject => "PromiseCapabilityDefaultReject",
            Builtin::PromiseAll => "PromiseAll",
            Builtin::PromiseAllSettled => "PromiseAllSettled",
            Builtin::PromiseAny => "PromiseAny",
        }
    }

    /// Size of the builtin's instructions in the blob
    pub fn instruction_size(self) -> u32 {
        match self {
            Builtin::JSEntry | Builtin::JSConstructEntry => 128,
            Builtin::InterpreterEntryTrampoline => 256,
            Builtin::RestartFrameTrampoline => 32,
            Builtin::PromiseConstructor
            | Builtin::ArrayJoin
            | Builtin::PromiseAll
            | Builtin::PromiseAllSettled
            | Builtin::PromiseAny => 160,
            _ => 64,
        }
    }

    /// Whether the builtin was generated by the optimizing backend
    pub fn is_turbofanned(self) -> bool {
        !matches!(
            self,
            Builtin::JSEntry
                | Builtin::JSConstructEntry
                | Builtin::CEntry
                | Builtin::InterpreterEntryTrampoline
                | Builtin::InterpreterEnterAtBytecode
                | Builtin::RestartFrameTrampoline
                | Builtin::JavaScriptBuiltinContinuationWithCatch
        )
    }

    /// How exceptions escaping into this builtin are expected to be handled
    pub fn catch_prediction(self) -> HandlerPrediction {
        match self {
            Builtin::PromiseConstructor => HandlerPrediction::Promise,
            Builtin::AsyncFunctionAwait => HandlerPrediction::AsyncAwait,
            _ => HandlerPrediction::Uncaught,
        }
    }

    fn handler_table(self) -> HandlerTable {
        let mut table = HandlerTable::new();
        match self {
            Builtin::JSEntry | Builtin::JSConstructEntry => {
                table.push_return(0, Self::ENTRY_HANDLER_OFFSET);
            }
            Builtin::PromiseConstructor => {
                table.push_return(40, 120);
            }
            Builtin::AsyncFunctionAwait => {
                table.push_return(24, 48);
            }
            _ => {}
        }
        table
    }

    pub(crate) fn descriptor(self) -> CodeDesc {
        let mut desc = CodeDesc::new(CodeKind::Builtin, self.instruction_size())
            .with_handler_table(self.handler_table());
        desc.builtin = Some(self);
        desc.is_turbofanned = self.is_turbofanned();
        desc.catch_prediction = self.catch_prediction();
        desc
    }
}

/// Installed builtins for one isolate
#[derive(Debug)]
pub struct Builtins {
    codes: Vec<Arc<Code>>,
}

impl Builtins {
    /// Install every builtin from `blob` into `registry`
    pub fn install(blob: &EmbeddedBlob, registry: &CodeRegistry) -> Self {
        let codes = Builtin::ALL
            .iter()
            .map(|&builtin| {
                let start = blob.instruction_start_of(builtin);
                registry.insert_at(builtin.descriptor(), start)
            })
            .collect();
        Self { codes }
    }

    pub fn code(&self, builtin: Builtin) -> &Arc<Code> {
        &self.codes[builtin.index()]
    }

    pub fn entry(&self, builtin: Builtin) -> Address {
        self.code(builtin).instruction_start()
    }

    /// Which builtin, if any, contains `pc`
    pub fn lookup(&self, pc: Address) -> Option<Builtin> {
        self.codes
            .iter()
            .find(|code| code.contains(pc))
            .and_then(|code| code.builtin())
    }

    /// Unregister every builtin from `registry`
    pub fn uninstall(&self, registry: &CodeRegistry) {
        for code in &self.codes {
            registry.remove(code.instruction_start());
        }
    }
}
