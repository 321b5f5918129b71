//! Keel Core - execution-context manager for the Keel runtime
//!
//! This crate owns everything that sits between an embedder and running
//! managed code:
//! - Isolates (execution contexts) and their lifecycle
//! - Per-thread execution state and the thread data table
//! - Stack walking across interpreted, baseline, optimized and native frames
//! - Exception dispatch (unwinding to the nearest applicable handler)
//! - Catch prediction and async stack stitching for debugging
//! - The embedded builtins blob registry
//!
//! ```text
//!   embedder ──► Isolate::allocate ──► init ──► enter ─┐
//!                                                       │ run managed code
//!   embedder ◄── dispose ◄── deinit ◄── exit ◄──────────┘
//! ```

#![warn(rust_2018_idioms)]

pub mod blob;
pub mod code;
pub mod debug;
pub mod execution;
pub mod fatal;
pub mod frames;
pub mod heap;
pub mod isolate;
pub mod platform;
pub mod snapshot;
pub mod value;

pub use blob::{BlobError, EmbeddedBlob, EmbeddedBlobRegistry};
pub use code::{Address, Builtin, Code, CodeKind, HandlerTable, NULL_ADDRESS};
pub use execution::{
    CallSiteInfo, CatchPrediction, ExceptionHandlerType, ExternalTryCatch, FrameSkipMode,
    PendingHandler, ThreadLocalTop, TryCatchId,
};
pub use fatal::{fatal_error, FatalError};
pub use heap::{ObjectHeap, ObjectId};
pub use isolate::{Isolate, IsolateError, IsolateId, IsolateOptions, IsolateResult};
pub use platform::{Platform, ProcessOptions};
pub use value::Value;
