//! `netdbg`: an interactive debugger engine for managed .NET processes,
//! driven over ICorDebug via the native loader shim `libdbgshim.so`.
//!
//! The stdio JSON-RPC tool protocol, project-build invocation, and process
//! registration installer are external collaborators (§1) and live outside
//! this crate; `netdbg` exposes the fifteen tool operations as plain async
//! methods on [`engine::DebugEngine`] for a transport layer to wrap.

pub mod config;
pub mod error;
pub mod log;
pub mod model;
pub mod pdb;
pub mod shim;
pub mod sink;
pub mod value;

pub mod engine;

pub use config::Config;
pub use engine::{DebugEngine, EngineStatus};
pub use error::EngineError;
pub use model::{
    BreakpointId, DebugEvent, Module, OutputStream, SessionState, StackFrame, StopReason, ThreadId, VariableInfo,
};
