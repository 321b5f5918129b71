//! Stack trace capture
//!
//! A trace is built innermost first. Physical frames are summarized into
//! the managed functions they stand for, filtered for visibility, and then
//! optionally extended with the async frames found by following the promise
//! the current code will settle (see `async_stack`).
//!
//! Once a strict-mode function has been seen, every deeper frame is poisoned:
//! its function and receiver are no longer exposed.

use super::async_stack::{capture_async_stack_trace, AsyncIntrinsics};
use super::thread_local_top::ThreadLocalTop;
use super::WalkEnv;
use crate::code::{AbstractCode, Script};
use crate::fatal::{fatal_error, FatalError};
use crate::frames::{FrameSummary, StackFrameIterator};
use crate::heap::{Generator, ObjectHeap};
use crate::value::Value;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Which of the innermost frames to leave out of a trace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSkipMode {
    SkipNone,
    /// Skip the innermost visible frame
    SkipFirst,
    /// Skip every frame up to and including the first activation of the
    /// given function
    SkipUntilSeen(Value),
}

/// Promise combinator an async frame was captured in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseCombinator {
    All,
    AllSettled,
    Any,
}

impl PromiseCombinator {
    pub fn name(self) -> &'static str {
        match self {
            PromiseCombinator::All => "Promise.all",
            PromiseCombinator::AllSettled => "Promise.allSettled",
            PromiseCombinator::Any => "Promise.any",
        }
    }
}

/// One entry of a captured stack trace
#[derive(Debug, Clone)]
pub struct CallSiteInfo {
    receiver: Value,
    function: Value,
    pub function_name: String,
    pub script: Option<Arc<Script>>,
    /// Bytecode offset, pc offset for builtins
    pub code_offset: u32,
    pub source_position: Option<u32>,
    pub is_async: bool,
    pub is_strict: bool,
    pub is_constructor: bool,
    /// Combinator and element index for `Promise.all` style frames
    pub promise_combinator: Option<(PromiseCombinator, u32)>,
}

impl CallSiteInfo {
    /// The receiver, or undefined if the frame is poisoned
    pub fn receiver(&self) -> Value {
        if self.is_strict {
            Value::undefined()
        } else {
            self.receiver
        }
    }

    /// The function, or undefined if the frame is poisoned
    pub fn function(&self) -> Value {
        if self.is_strict {
            Value::undefined()
        } else {
            self.function
        }
    }

    pub fn script_name(&self) -> Option<&str> {
        self.script.as_deref().map(Script::name)
    }

    /// 1-based line and column
    pub fn line_and_column(&self) -> Option<(u32, u32)> {
        let script = self.script.as_ref()?;
        Some(script.line_and_column(self.source_position?))
    }

    pub fn is_promise_combinator(&self) -> bool {
        self.promise_combinator.is_some()
    }
}

impl fmt::Display for CallSiteInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some((combinator, index)) = self.promise_combinator {
            return write!(f, "async {} (index {})", combinator.name(), index);
        }
        if self.is_async {
            f.write_str("async ")?;
        }
        if self.is_constructor {
            f.write_str("new ")?;
        }
        let name = if self.function_name.is_empty() {
            "<anonymous>"
        } else {
            &self.function_name
        };
        match (self.script_name(), self.line_and_column()) {
            (Some(script), Some((line, column))) => {
                write!(f, "{name} ({script}:{line}:{column})")
            }
            (Some(script), None) => write!(f, "{name} ({script})"),
            (None, _) => write!(f, "{name} (native)"),
        }
    }
}

/// Frame record of a detailed stack trace, resolved to source coordinates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrameInfo {
    pub function_name: String,
    pub script_name: Option<String>,
    pub line: u32,
    pub column: u32,
    pub is_constructor: bool,
}

/// Knobs for a stack trace capture
#[derive(Debug, Clone, Copy)]
pub struct StackTraceOptions {
    pub limit: usize,
    pub skip_mode: FrameSkipMode,
    pub show_builtins: bool,
    pub async_stack_traces: bool,
}

impl Default for StackTraceOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            skip_mode: FrameSkipMode::SkipNone,
            show_builtins: false,
            async_stack_traces: true,
        }
    }
}

/// Accumulates call sites, applying the skip mode, visibility and strict
/// poisoning rules
pub struct CallSiteBuilder<'h> {
    heap: &'h ObjectHeap,
    limit: usize,
    mode: FrameSkipMode,
    skip_next_frame: bool,
    show_builtins: bool,
    encountered_strict_function: bool,
    elements: Vec<CallSiteInfo>,
}

impl<'h> CallSiteBuilder<'h> {
    pub fn new(heap: &'h ObjectHeap, options: &StackTraceOptions) -> Self {
        Self {
            heap,
            limit: options.limit,
            mode: options.skip_mode,
            skip_next_frame: options.skip_mode != FrameSkipMode::SkipNone,
            show_builtins: options.show_builtins,
            encountered_strict_function: false,
            elements: Vec::new(),
        }
    }

    pub fn heap(&self) -> &'h ObjectHeap {
        self.heap
    }

    pub fn full(&self) -> bool {
        self.elements.len() >= self.limit
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn build(self) -> Vec<CallSiteInfo> {
        self.elements
    }

    /// Append the innermost-first summaries of one physical frame
    pub fn append_summary(&mut self, summary: &FrameSummary) {
        if self.full() || !self.is_visible(summary.function, &summary.abstract_code) {
            return;
        }
        if !self.should_include(summary.function) {
            return;
        }
        let is_strict = self.is_strict_frame(summary.function);
        let (function_name, script) = self.describe_function(summary.function, &summary.abstract_code);
        self.elements.push(CallSiteInfo {
            receiver: summary.receiver,
            function: summary.function,
            function_name,
            script,
            code_offset: summary.code_offset,
            source_position: summary.source_position(),
            is_async: false,
            is_strict,
            is_constructor: summary.is_constructor,
            promise_combinator: None,
        });
    }

    /// Append a frame for an async function or generator suspended at an
    /// `await`
    pub fn append_async_frame(&mut self, generator: &Generator) {
        let function = generator.function;
        let Some(shared) = self.heap.function(function).map(|f| Arc::clone(&f.shared)) else {
            return;
        };
        let code = AbstractCode::Bytecode(Arc::clone(&shared.bytecode));
        if self.full() || !self.is_visible(function, &code) {
            return;
        }
        let is_strict = self.is_strict_frame(function);
        let offset = generator.input_or_debug_pos;
        self.elements.push(CallSiteInfo {
            receiver: generator.receiver,
            function,
            function_name: shared.name.clone(),
            script: shared.script.clone(),
            code_offset: offset,
            source_position: code.source_position(offset),
            is_async: true,
            is_strict,
            is_constructor: false,
            promise_combinator: None,
        });
    }

    /// Append a frame for a pending element of a promise combinator
    pub fn append_promise_combinator_frame(
        &mut self,
        element_function: Value,
        combinator: PromiseCombinator,
        combinator_function: Value,
    ) {
        if self.full() {
            return;
        }
        let Some(element) = self.heap.function(element_function) else {
            return;
        };
        // Element closures are numbered from one
        let index = element.identity_hash.saturating_sub(1);
        self.elements.push(CallSiteInfo {
            receiver: Value::undefined(),
            function: combinator_function,
            function_name: combinator.name().to_owned(),
            script: None,
            code_offset: 0,
            source_position: None,
            is_async: true,
            is_strict: false,
            is_constructor: false,
            promise_combinator: Some((combinator, index)),
        });
    }

    fn should_include(&mut self, function: Value) -> bool {
        if !self.skip_next_frame {
            return true;
        }
        match self.mode {
            FrameSkipMode::SkipNone => true,
            FrameSkipMode::SkipFirst => {
                self.skip_next_frame = false;
                false
            }
            FrameSkipMode::SkipUntilSeen(caller) => {
                if function == caller {
                    self.skip_next_frame = false;
                }
                false
            }
        }
    }

    fn is_visible(&self, function: Value, code: &AbstractCode) -> bool {
        if self.show_builtins {
            return true;
        }
        if code.is_builtin() {
            return false;
        }
        self.heap
            .function(function)
            .map_or(false, |f| f.shared.is_user_code())
    }

    fn is_strict_frame(&mut self, function: Value) -> bool {
        if !self.encountered_strict_function {
            self.encountered_strict_function = self
                .heap
                .function(function)
                .map_or(false, |f| f.shared.is_strict);
        }
        self.encountered_strict_function
    }

    fn describe_function(&self, function: Value, code: &AbstractCode) -> (String, Option<Arc<Script>>) {
        if let Some(f) = self.heap.function(function) {
            return (f.shared.name.clone(), f.shared.script.clone());
        }
        match code {
            AbstractCode::Code(code) => (
                code.builtin().map_or_else(String::new, |b| b.name().to_owned()),
                None,
            ),
            AbstractCode::Bytecode(_) => (String::new(), None),
        }
    }
}

fn visit_physical_stack(top: &ThreadLocalTop, env: &WalkEnv<'_>, builder: &mut CallSiteBuilder<'_>) {
    for frame in StackFrameIterator::new(top.stack().active(), env.code) {
        if builder.full() {
            break;
        }
        if !frame.is_java_script() {
            continue;
        }
        for summary in frame.summarize(env.heap).iter().rev() {
            builder.append_summary(summary);
        }
    }
}

/// Capture the managed frames of the current thread, innermost first
pub fn capture_simple_stack_trace(
    top: &ThreadLocalTop,
    env: &WalkEnv<'_>,
    options: &StackTraceOptions,
    intrinsics: &AsyncIntrinsics,
) -> Vec<CallSiteInfo> {
    let mut builder = CallSiteBuilder::new(env.heap, options);
    visit_physical_stack(top, env, &mut builder);
    if options.async_stack_traces && !builder.full() {
        capture_async_stack_trace(top, intrinsics, &mut builder);
    }
    builder.build()
}

/// Capture the current stack resolved to script coordinates
pub fn capture_detailed_stack_trace(
    top: &ThreadLocalTop,
    env: &WalkEnv<'_>,
    limit: usize,
) -> Vec<StackFrameInfo> {
    let options = StackTraceOptions {
        limit,
        async_stack_traces: false,
        ..StackTraceOptions::default()
    };
    let mut builder = CallSiteBuilder::new(env.heap, &options);
    visit_physical_stack(top, env, &mut builder);
    builder
        .build()
        .into_iter()
        .map(|site| {
            let (line, column) = site.line_and_column().unwrap_or((0, 0));
            StackFrameInfo {
                script_name: site.script_name().map(str::to_owned),
                function_name: site.function_name,
                line,
                column,
                is_constructor: site.is_constructor,
            }
        })
        .collect()
}

/// Renders stack traces, detecting a trace requested while one is being
/// rendered on the same thread
///
/// The first nested request gets whatever has been rendered so far; a
/// second one is fatal. Each attached thread owns one printer.
#[derive(Debug, Default)]
pub struct StackTracePrinter {
    nesting_level: AtomicU32,
    incomplete: Mutex<String>,
}

/// Lowers the nesting level again, even when a line source panics
struct NestingGuard<'a>(&'a AtomicU32);

impl Drop for NestingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl StackTracePrinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn render<I>(&self, lines: I) -> String
    where
        I: IntoIterator<Item = String>,
    {
        let level = self.nesting_level.fetch_add(1, Ordering::AcqRel);
        let _guard = NestingGuard(&self.nesting_level);
        match level {
            0 => {
                self.incomplete.lock().clear();
                for line in lines {
                    let mut buffer = self.incomplete.lock();
                    buffer.push_str(&line);
                    buffer.push('\n');
                }
                std::mem::take(&mut *self.incomplete.lock())
            }
            1 => {
                tracing::warn!("attempt to print stack while printing stack (double fault)");
                self.incomplete.lock().clone()
            }
            n => fatal_error(FatalError::StackTraceDoubleFault(n)),
        }
    }

    pub fn nesting_level(&self) -> u32 {
        self.nesting_level.load(Ordering::Acquire)
    }
}

/// Format call sites the way they appear in error stacks
pub fn format_call_sites<'a>(header: &str, sites: &'a [CallSiteInfo]) -> impl Iterator<Item = String> + 'a {
    std::iter::once(header.to_owned()).chain(sites.iter().map(|site| format!("    at {site}")))
}
