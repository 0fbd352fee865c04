//! The data model shared by every component (§3).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

pub type BreakpointId = u32;
pub type ThreadId = u32;
pub type MethodToken = u32;
pub type TypeToken = u32;

/// `methodToken = 0x06000000 | row`.
pub const METHOD_TOKEN_TAG: u32 = 0x0600_0000;

pub fn method_token_row(token: MethodToken) -> u32 {
    token & 0x00FF_FFFF
}

pub fn method_token_from_row(row: u32) -> MethodToken {
    METHOD_TOKEN_TAG | (row & 0x00FF_FFFF)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Running,
    Stopped,
    Exited,
    Attached,
}

/// One loaded module; a path may recur across generations but never twice
/// within one generation (§3 invariant).
#[derive(Debug, Clone)]
pub struct Module {
    pub path: PathBuf,
    /// Opaque native module handle, owned by the engine thread only.
    pub handle: NativeHandle,
    /// Monotonic load order within the generation; used only for stable
    /// iteration in `status` responses (SPEC_FULL §3 expansion).
    pub load_sequence: u32,
}

/// A type-erased handle to a native COM object. The engine thread is the
/// only place that ever dereferences the pointer inside.
#[derive(Debug, Clone, Copy)]
pub struct NativeHandle(pub usize);

#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub id: BreakpointId,
    pub module_path: PathBuf,
    pub source_file: String,
    pub line: u32,
    pub resolved: bool,
    pub method_token: Option<MethodToken>,
    pub il_offset: Option<u32>,
    pub native_handle: Option<NativeHandle>,
    pub hit_count: u32,
}

impl Breakpoint {
    pub fn pending(id: BreakpointId, module_path: PathBuf, source_file: String, line: u32) -> Self {
        Breakpoint {
            id,
            module_path,
            source_file,
            line,
            resolved: false,
            method_token: None,
            il_offset: None,
            native_handle: None,
            hit_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    Step,
    Pause,
    Break,
}

#[derive(Debug, Clone)]
pub enum DebugEvent {
    ModuleLoaded(PathBuf),
    BreakpointHit {
        breakpoint_id: BreakpointId,
        thread_id: ThreadId,
        top_frame: Option<StackFrame>,
    },
    Stopped {
        reason: StopReason,
        thread_id: ThreadId,
        top_frame: Option<StackFrame>,
    },
    Exception {
        type_name: String,
        message: String,
        is_unhandled: bool,
        thread_id: ThreadId,
    },
    Output {
        text: String,
        stream: OutputStream,
    },
    /// Terminal: no resume follows, no further events are produced.
    Exited {
        code: i32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableInfo {
    pub name: String,
    pub type_name: String,
    pub value: String,
    #[serde(default)]
    pub children: Vec<VariableInfo>,
    /// Opaque id correlating this node across re-fetches. `0` means "no
    /// children" (SPEC_FULL §3 expansion).
    #[serde(default)]
    pub variables_reference: u64,
}

pub mod sentinel {
    pub const NULL: &str = "null";
    pub const CIRCULAR: &str = "<circular reference>";
    pub const MAX_DEPTH: &str = "<max depth>";
    pub const NOT_AVAILABLE: &str = "<not available>";
    pub const COMPUTED: &str = "<computed>";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackFrame {
    pub index: u32,
    pub method_name: String,
    pub source_file: Option<String>,
    pub line: Option<u32>,
    /// Sequence point start column, when the PDB carries one (SPEC_FULL §4.B
    /// expansion). Absent for hidden or debug-info-less frames.
    pub column: Option<u32>,
    pub il_offset: u32,
}

/// Session-scoped state owned exclusively by the engine thread (§3, §5).
/// Mutation outside the engine thread happens only through the
/// `breakpoint_token_index` under `breakpoint_index_mutex`.
pub struct Session {
    pub state: SessionState,
    pub process_id: Option<u32>,
    pub process_name: Option<String>,
    pub first_chance_exceptions: bool,
    pub modules: HashMap<PathBuf, Module>,
    pub active_breakpoints: HashMap<BreakpointId, Breakpoint>,
    pub pending_breakpoints: Vec<Breakpoint>,
    pub next_breakpoint_id: BreakpointId,
    /// Monotonically increasing; bumped on every `Disconnect` (§3, §8-3).
    pub generation: u64,
    pub next_variables_reference: u64,
}

impl Default for Session {
    fn default() -> Self {
        Session {
            state: SessionState::Idle,
            process_id: None,
            process_name: None,
            first_chance_exceptions: false,
            modules: HashMap::new(),
            active_breakpoints: HashMap::new(),
            pending_breakpoints: Vec::new(),
            next_breakpoint_id: 1,
            generation: 0,
            next_variables_reference: 1,
        }
    }
}

impl Session {
    /// Clears all session-owned state in place and bumps the generation,
    /// per the session-reuse invariants (§4.E, §8-3). Does not touch the
    /// sink's index or keep-alive table; callers do that separately.
    pub fn reset_for_new_generation(&mut self) {
        let next_gen = self.generation + 1;
        *self = Session::default();
        self.generation = next_gen;
    }

    pub fn allocate_breakpoint_id(&mut self) -> BreakpointId {
        let id = self.next_breakpoint_id;
        self.next_breakpoint_id += 1;
        id
    }

    pub fn allocate_variables_reference(&mut self) -> u64 {
        let r = self.next_variables_reference;
        self.next_variables_reference += 1;
        r
    }
}
