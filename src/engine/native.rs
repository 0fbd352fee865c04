//! The seam between the Debug Engine's logic and the live ICorDebug session
//! (§4.E). Mirrors the `value::NativeValue` trait's split: the engine's
//! command handling, breakpoint bookkeeping, and session-reuse invariants
//! are written once against this trait and are exercised in tests with a
//! recording fake; `engine::com` supplies the real vtable-backed
//! implementation that calls into the `cordb` pointer the shim hands back.
//!
//! ICorDebug itself is an external dependency with a fixed contract (§1) —
//! this trait only names the operations §4.E actually drives (resolve,
//! breakpoint, step, enumerate, inspect), not the full interface family.

use crate::error::EngineError;
use crate::model::{MethodToken, NativeHandle, ThreadId, TypeToken};
use crate::value::NativeValue;
use std::path::PathBuf;

/// One stack frame as reported directly by the native API, before PDB
/// enrichment (§4.E `GetStackTrace`: "for each IL frame, read instruction
/// pointer via `GetIP`... Non-IL frames are reported with their hex token").
#[derive(Debug, Clone)]
pub struct NativeFrameInfo {
    pub index: u32,
    pub is_il_frame: bool,
    pub method_token: Option<MethodToken>,
    pub module_path: Option<PathBuf>,
    pub il_offset: u32,
}

/// The operations the Debug Engine's owner thread performs against the live
/// native debug session. Every method is synchronous and must only be
/// invoked from the owner thread (§5 shared-resource policy).
pub trait NativeController: Send + Sync {
    /// `SetManagedHandler(sink)`, called once right after `Initialize` in
    /// the startup callback (§4.E launch sequence step 7).
    fn set_managed_handler(&self) -> Result<(), EngineError>;

    /// The synchronous `Stop(timeout)` entry point backing `Pause`
    /// (SPEC_FULL §4.E expansion).
    fn stop(&self, timeout_ms: u32) -> Result<(), EngineError>;

    /// Resumes the process. `out_of_band` resumes only out-of-band events;
    /// the engine always passes `false` (normal continue).
    fn continue_process(&self, out_of_band: bool) -> Result<(), EngineError>;

    /// Best-effort terminate, used by `Disconnect`'s kill-after-grace path
    /// (§5 resource lifetimes).
    fn terminate(&self, exit_code: i32) -> Result<(), EngineError>;

    /// Single-element-buffer thread enumeration (§4.E: "native-array
    /// marshalling through source-generated wrappers is fragile").
    fn enumerate_threads(&self) -> Result<Vec<ThreadId>, EngineError>;

    fn resolve_function(&self, module: NativeHandle, method_token: MethodToken) -> Result<NativeHandle, EngineError>;
    fn create_breakpoint(&self, function: NativeHandle, il_offset: u32) -> Result<NativeHandle, EngineError>;
    fn activate_breakpoint(&self, breakpoint: NativeHandle, active: bool) -> Result<(), EngineError>;
    fn release_breakpoint(&self, breakpoint: NativeHandle) -> Result<(), EngineError>;

    /// Creates a stepper on the active frame of `thread`, configured per
    /// §4.E: intercept mask NONE, unmapped-stop mask NONE ("emphatically
    /// not STOP_UNMANAGED, which causes step-out to fail").
    fn create_stepper(&self, thread: ThreadId) -> Result<NativeHandle, EngineError>;
    fn step(&self, stepper: NativeHandle, step_in: bool) -> Result<(), EngineError>;
    fn step_out(&self, stepper: NativeHandle) -> Result<(), EngineError>;

    fn stack_frames(&self, thread: ThreadId) -> Result<Vec<NativeFrameInfo>, EngineError>;

    /// Iterates local slots starting at 0, stopping at the sentinel
    /// `IL variable not available` HRESULT (§4.E `GetLocals`).
    fn locals(&self, thread: ThreadId, frame_index: u32) -> Result<Vec<(u32, Box<dyn NativeValue>)>, EngineError>;

    fn static_field(
        &self,
        thread: ThreadId,
        frame_index: u32,
        type_token: TypeToken,
        field_name: &str,
    ) -> Result<Box<dyn NativeValue>, EngineError>;

    /// Name-only lookup among the active frame's locals, used by
    /// `Evaluate` when the expression has no dot (§4.E).
    fn lookup_local(&self, thread: ThreadId, frame_index: u32, name: &str) -> Result<Box<dyn NativeValue>, EngineError>;
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use parking_lot::Mutex;

    /// Records every call it receives, in order, for assertions on
    /// sequencing (e.g. stepper configuration, breakpoint activation
    /// order) without needing a real native session.
    #[derive(Default)]
    pub struct RecordingController {
        pub calls: Mutex<Vec<String>>,
        pub threads: Mutex<Vec<ThreadId>>,
        pub frames: Mutex<Vec<NativeFrameInfo>>,
        pub next_handle: Mutex<usize>,
    }

    impl RecordingController {
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().push(call.into());
        }

        fn fresh_handle(&self) -> NativeHandle {
            let mut next = self.next_handle.lock();
            *next += 1;
            NativeHandle(*next)
        }
    }

    impl NativeController for RecordingController {
        fn set_managed_handler(&self) -> Result<(), EngineError> {
            self.record("set_managed_handler");
            Ok(())
        }
        fn stop(&self, timeout_ms: u32) -> Result<(), EngineError> {
            self.record(format!("stop({timeout_ms})"));
            Ok(())
        }
        fn continue_process(&self, out_of_band: bool) -> Result<(), EngineError> {
            self.record(format!("continue_process({out_of_band})"));
            Ok(())
        }
        fn terminate(&self, exit_code: i32) -> Result<(), EngineError> {
            self.record(format!("terminate({exit_code})"));
            Ok(())
        }
        fn enumerate_threads(&self) -> Result<Vec<ThreadId>, EngineError> {
            self.record("enumerate_threads");
            Ok(self.threads.lock().clone())
        }
        fn resolve_function(&self, _module: NativeHandle, method_token: MethodToken) -> Result<NativeHandle, EngineError> {
            self.record(format!("resolve_function({method_token:#010x})"));
            Ok(self.fresh_handle())
        }
        fn create_breakpoint(&self, _function: NativeHandle, il_offset: u32) -> Result<NativeHandle, EngineError> {
            self.record(format!("create_breakpoint(offset={il_offset})"));
            Ok(self.fresh_handle())
        }
        fn activate_breakpoint(&self, breakpoint: NativeHandle, active: bool) -> Result<(), EngineError> {
            self.record(format!("activate_breakpoint({}, {active})", breakpoint.0));
            Ok(())
        }
        fn release_breakpoint(&self, breakpoint: NativeHandle) -> Result<(), EngineError> {
            self.record(format!("release_breakpoint({})", breakpoint.0));
            Ok(())
        }
        fn create_stepper(&self, thread: ThreadId) -> Result<NativeHandle, EngineError> {
            self.record(format!("create_stepper({thread})"));
            Ok(self.fresh_handle())
        }
        fn step(&self, stepper: NativeHandle, step_in: bool) -> Result<(), EngineError> {
            self.record(format!("step({}, step_in={step_in})", stepper.0));
            Ok(())
        }
        fn step_out(&self, stepper: NativeHandle) -> Result<(), EngineError> {
            self.record(format!("step_out({})", stepper.0));
            Ok(())
        }
        fn stack_frames(&self, thread: ThreadId) -> Result<Vec<NativeFrameInfo>, EngineError> {
            self.record(format!("stack_frames({thread})"));
            Ok(self.frames.lock().clone())
        }
        fn locals(&self, thread: ThreadId, frame_index: u32) -> Result<Vec<(u32, Box<dyn NativeValue>)>, EngineError> {
            self.record(format!("locals({thread}, {frame_index})"));
            Ok(Vec::new())
        }
        fn static_field(
            &self,
            thread: ThreadId,
            frame_index: u32,
            type_token: TypeToken,
            field_name: &str,
        ) -> Result<Box<dyn NativeValue>, EngineError> {
            self.record(format!("static_field({thread}, {frame_index}, {type_token:#x}, {field_name})"));
            Err(EngineError::ValueRead("no static fields in test fixture".to_string()))
        }
        fn lookup_local(&self, thread: ThreadId, frame_index: u32, name: &str) -> Result<Box<dyn NativeValue>, EngineError> {
            self.record(format!("lookup_local({thread}, {frame_index}, {name})"));
            Err(EngineError::ValueRead(format!("no local named {name}")))
        }
    }
}
