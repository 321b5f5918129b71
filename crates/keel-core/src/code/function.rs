//! Function metadata shared by every closure of the same source function

use super::handler_table::HandlerTable;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// A compiled source unit
#[derive(Debug)]
pub struct Script {
    id: u32,
    name: String,
    source: String,
    line_ends: Vec<u32>,
}

impl Script {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Arc<Self> {
        static NEXT_ID: AtomicU32 = AtomicU32::new(1);
        let source = source.into();
        let line_ends = source
            .char_indices()
            .filter(|(_, c)| *c == '\n')
            .map(|(i, _)| i as u32)
            .collect();
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            source,
            line_ends,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// 1-based line and column of a source position
    pub fn line_and_column(&self, position: u32) -> (u32, u32) {
        let line = self.line_ends.partition_point(|&end| end < position);
        let line_start = if line == 0 {
            0
        } else {
            self.line_ends[line - 1] + 1
        };
        (line as u32 + 1, position.saturating_sub(line_start) + 1)
    }
}

/// Maps code offsets to source positions
#[derive(Debug, Clone, Default)]
pub struct SourcePositionTable {
    entries: Vec<(u32, u32)>,
}

impl SourcePositionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that code at `code_offset` and after maps to `source_position`
    pub fn add(&mut self, code_offset: u32, source_position: u32) -> &mut Self {
        let at = self.entries.partition_point(|(o, _)| *o <= code_offset);
        self.entries.insert(at, (code_offset, source_position));
        self
    }

    pub fn source_position(&self, code_offset: u32) -> Option<u32> {
        let at = self.entries.partition_point(|(o, _)| *o <= code_offset);
        at.checked_sub(1).map(|i| self.entries[i].1)
    }
}

/// Interpreter bytecode for one function
#[derive(Debug, Default)]
pub struct BytecodeArray {
    pub length: u32,
    pub register_count: u32,
    pub handler_table: HandlerTable,
    pub source_positions: SourcePositionTable,
}

impl BytecodeArray {
    pub fn new(length: u32, register_count: u32) -> Self {
        Self {
            length,
            register_count,
            ..Default::default()
        }
    }

    pub fn with_handler_table(mut self, table: HandlerTable) -> Self {
        self.handler_table = table;
        self
    }

    pub fn with_source_positions(mut self, positions: SourcePositionTable) -> Self {
        self.source_positions = positions;
        self
    }
}

/// Where a function came from, which decides stack-trace visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionOrigin {
    /// Ordinary user code
    User,
    /// Runtime-internal code written in the managed language
    Native,
    /// Function exposed through the embedder API
    Api,
    /// A builtin implemented in the embedded blob
    Builtin,
}

/// Per-source-function metadata
#[derive(Debug)]
pub struct SharedFunctionInfo {
    pub name: String,
    pub origin: FunctionOrigin,
    pub is_strict: bool,
    pub script: Option<Arc<Script>>,
    pub bytecode: Arc<BytecodeArray>,
    /// Source position of the function itself, used when no offset is known
    pub start_position: u32,
}

impl SharedFunctionInfo {
    pub fn new(name: impl Into<String>, bytecode: BytecodeArray) -> Self {
        Self {
            name: name.into(),
            origin: FunctionOrigin::User,
            is_strict: false,
            script: None,
            bytecode: Arc::new(bytecode),
            start_position: 0,
        }
    }

    pub fn with_script(mut self, script: Arc<Script>) -> Self {
        self.script = Some(script);
        self
    }

    pub fn with_origin(mut self, origin: FunctionOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn strict(mut self) -> Self {
        self.is_strict = true;
        self
    }

    pub fn is_user_code(&self) -> bool {
        self.origin == FunctionOrigin::User && self.script.is_some()
    }
}
