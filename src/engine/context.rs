//! Owner-thread-exclusive state and the logic that runs against it: session
//! lifecycle, breakpoint resolution, stepping, inspection (§4.E). Every
//! method here executes on the Debug Engine's single dedicated thread; nth
//! of this reaches across threads except through `sink` (self-mutexed) and
//! the oneshot reply each command closure holds.

use crate::config::Config;
use crate::engine::native::NativeController;
use crate::error::EngineError;
use crate::model::{
    method_token_row, Breakpoint, BreakpointId, MethodToken, Module, NativeHandle, Session, SessionState, StackFrame,
    ThreadId, VariableInfo,
};
use crate::pdb::PdbReader;
use crate::sink::CallbackSink;
use crate::value::ValueReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// State owned exclusively by the Debug Engine's native-API thread (§3, §5).
pub struct EngineContext {
    pub session: Session,
    pub pdb: Arc<PdbReader>,
    pub sink: Arc<CallbackSink>,
    pub config: Config,
    pub controller: Option<Arc<dyn NativeController>>,
    /// Auxiliary process spawned for `launch_test` (the `dotnet test` host);
    /// tracked alongside the attached debuggee pid for `Disconnect` cleanup
    /// (§4.E test-process launch).
    pub auxiliary_child: Option<std::process::Child>,
}

impl EngineContext {
    pub fn new(pdb: Arc<PdbReader>, sink: Arc<CallbackSink>, config: Config) -> Self {
        EngineContext {
            session: Session::default(),
            pdb,
            sink,
            config,
            controller: None,
            auxiliary_child: None,
        }
    }

    fn controller(&self) -> Result<&Arc<dyn NativeController>, EngineError> {
        self.controller.as_ref().ok_or(EngineError::NoSession)
    }

    fn require_stopped(&self) -> Result<(), EngineError> {
        if self.session.state != SessionState::Stopped {
            return Err(EngineError::NotStopped);
        }
        Ok(())
    }

    /// `SetBreakpoint`: resolve via PDB, activate if the module is already
    /// loaded, otherwise queue as pending (§4.E breakpoint resolution).
    pub fn set_breakpoint(&mut self, dll_path: &Path, source_file: &str, line: u32) -> Result<BreakpointId, EngineError> {
        if self.session.state == SessionState::Idle || self.session.state == SessionState::Exited {
            return Err(EngineError::NoSession);
        }

        let id = self.session.allocate_breakpoint_id();

        match self.pdb.find_location(dll_path, source_file, line) {
            Ok(location) => {
                let module = self
                    .session
                    .modules
                    .values()
                    .find(|m| module_matches(&m.path, dll_path));

                let mut bp = Breakpoint::pending(id, dll_path.to_path_buf(), source_file.to_string(), line);
                bp.method_token = Some(location.method_token);
                bp.il_offset = Some(location.il_offset);

                if let Some(module) = module {
                    self.activate(&mut bp, module.handle)?;
                    self.session.active_breakpoints.insert(id, bp);
                } else {
                    self.session.pending_breakpoints.push(bp);
                }
            }
            Err(EngineError::LocationNotFound(_, _)) => {
                // not yet resolvable (e.g. module not loaded, PDB absent);
                // keep as pending with no token, resolved on module load.
                self.session
                    .pending_breakpoints
                    .push(Breakpoint::pending(id, dll_path.to_path_buf(), source_file.to_string(), line));
            }
            Err(e) => return Err(e),
        }

        Ok(id)
    }

    fn activate(&self, bp: &mut Breakpoint, module: NativeHandle) -> Result<(), EngineError> {
        let controller = self.controller()?;
        let method_token = bp.method_token.expect("activate called only with a resolved token");
        let function = controller.resolve_function(module, method_token)?;
        let native_bp = controller.create_breakpoint(function, bp.il_offset.unwrap_or(0))?;
        controller.activate_breakpoint(native_bp, true)?;
        bp.native_handle = Some(native_bp);
        bp.resolved = true;
        self.sink.index_breakpoint(method_token, bp.id);
        Ok(())
    }

    pub fn remove_breakpoint(&mut self, id: BreakpointId) -> Result<(), EngineError> {
        if let Some(bp) = self.session.active_breakpoints.remove(&id) {
            if let Some(handle) = bp.native_handle {
                self.controller()?.release_breakpoint(handle)?;
            }
            if let Some(token) = bp.method_token {
                self.sink.remove_breakpoint_index(token);
            }
            return Ok(());
        }
        let before = self.session.pending_breakpoints.len();
        self.session.pending_breakpoints.retain(|bp| bp.id != id);
        if self.session.pending_breakpoints.len() == before {
            return Err(EngineError::BreakpointNotFound(id));
        }
        Ok(())
    }

    /// Resolves every pending breakpoint targeting `module_path` (§4.E: "On
    /// `ModuleLoaded` callback, under the module-mutex, resolve all pending
    /// entries for this module path").
    pub fn on_module_loaded(&mut self, module_path: PathBuf, handle: NativeHandle, load_sequence: u32) {
        self.session.modules.insert(
            module_path.clone(),
            Module {
                path: module_path.clone(),
                handle,
                load_sequence,
            },
        );

        let (matching, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.session.pending_breakpoints)
            .into_iter()
            .partition(|bp| module_matches(&module_path, &bp.module_path));
        self.session.pending_breakpoints = rest;

        for mut bp in matching {
            let resolution = if bp.method_token.is_some() {
                Ok(())
            } else {
                self.pdb
                    .find_location(&module_path, &bp.source_file, bp.line)
                    .map(|loc| {
                        bp.method_token = Some(loc.method_token);
                        bp.il_offset = Some(loc.il_offset);
                    })
            };

            match resolution.and_then(|_| self.activate(&mut bp, handle)) {
                Ok(()) => {
                    self.session.active_breakpoints.insert(bp.id, bp);
                }
                Err(e) => {
                    log::debug!(target: "netdbg::engine", "breakpoint {} still unresolved after module load: {e}", bp.id);
                    self.session.pending_breakpoints.push(bp);
                }
            }
        }
    }

    pub fn continue_(&mut self) -> Result<(), EngineError> {
        self.require_stopped()?;
        self.controller()?.continue_process(false)?;
        self.session.state = SessionState::Running;
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), EngineError> {
        let timeout_ms = self.config.pause_timeout.as_millis() as u32;
        self.controller()?.stop(timeout_ms)?;
        self.session.state = SessionState::Stopped;
        Ok(())
    }

    pub fn step(&mut self, thread: ThreadId, step_in: bool) -> Result<(), EngineError> {
        self.require_stopped()?;
        let controller = self.controller()?;
        let stepper = controller.create_stepper(thread)?;
        controller.step(stepper, step_in)?;
        controller.continue_process(false)?;
        self.session.state = SessionState::Running;
        Ok(())
    }

    pub fn step_out(&mut self, thread: ThreadId) -> Result<(), EngineError> {
        self.require_stopped()?;
        let controller = self.controller()?;
        let stepper = controller.create_stepper(thread)?;
        controller.step_out(stepper)?;
        controller.continue_process(false)?;
        self.session.state = SessionState::Running;
        Ok(())
    }

    pub fn list_threads(&self) -> Result<Vec<ThreadId>, EngineError> {
        self.controller()?.enumerate_threads()
    }

    /// `GetStackTrace`: walk native frames, attach source/line via
    /// `ReverseLookup`, degrade per-frame on failure (§4.E).
    pub fn stack_trace(&self, thread: ThreadId) -> Result<Vec<StackFrame>, EngineError> {
        let native_frames = self.controller()?.stack_frames(thread)?;
        let mut frames = Vec::with_capacity(native_frames.len());
        for nf in native_frames {
            frames.push(self.enrich_frame(nf));
        }
        Ok(frames)
    }

    pub fn top_frame(&self, thread: ThreadId) -> Option<StackFrame> {
        let controller = self.controller().ok()?;
        let native_frames = controller.stack_frames(thread).ok()?;
        native_frames.into_iter().next().map(|nf| self.enrich_frame(nf))
    }

    fn enrich_frame(&self, nf: crate::engine::native::NativeFrameInfo) -> StackFrame {
        if !nf.is_il_frame {
            return StackFrame {
                index: nf.index,
                method_name: format!("{:#010x}", nf.method_token.unwrap_or(0)),
                source_file: None,
                line: None,
                column: None,
                il_offset: nf.il_offset,
            };
        }

        let (method_name, source_file, line, column) = match (nf.method_token, &nf.module_path) {
            (Some(token), Some(module)) => {
                let location = self.pdb.reverse_lookup(module, token, nf.il_offset).unwrap_or(None);
                let method_name = method_display_name(token);
                match location {
                    Some((file, line, column)) => (
                        method_name,
                        Some(basename(&file)),
                        Some(line),
                        column,
                    ),
                    None => (method_name, None, None, None),
                }
            }
            (Some(token), None) => (method_display_name(token), None, None, None),
            (None, _) => ("unknown".to_string(), None, None, None),
        };

        StackFrame {
            index: nf.index,
            method_name,
            source_file,
            line,
            column,
            il_offset: nf.il_offset,
        }
    }

    /// `GetLocals`: locals off the active frame plus best-effort static
    /// fields of the declaring type (§4.E).
    pub fn locals(&self, thread: ThreadId) -> Result<Vec<VariableInfo>, EngineError> {
        self.require_stopped()?;
        let controller = self.controller()?;
        let frames = controller.stack_frames(thread)?;
        let top = frames.first().ok_or(EngineError::FrameNotFound(0))?;

        let raw_locals = controller.locals(thread, 0)?;
        let names = match (top.method_token, &top.module_path) {
            (Some(token), Some(module)) => self.pdb.get_local_names(module, token).unwrap_or_default(),
            _ => Default::default(),
        };

        let mut reader = ValueReader::new();
        let mut out = Vec::with_capacity(raw_locals.len());
        for (slot, value) in raw_locals {
            let name = names.get(&slot).cloned().unwrap_or_else(|| format!("local_{slot}"));
            out.push(reader.read(&name, value.as_ref()));
        }

        if let (Some(token), Some(module)) = (top.method_token, &top.module_path) {
            if let Ok(type_token) = self.pdb.get_method_declaring_type_token(module, token) {
                let statics = self.static_fields(thread, module, type_token);
                out.extend(statics.into_iter().map(|(name, value)| reader.read(&name, value.as_ref())));
            }
        }

        Ok(out)
    }

    /// Best-effort static-field append for `GetLocals` (§4.C "Static
    /// fields"): enumerates the declaring type's static field names from PE
    /// metadata, then reads each through the live per-class accessor with
    /// the current frame (so thread-static fields resolve correctly). A
    /// field that fails to read is skipped rather than aborting the rest.
    fn static_fields(
        &self,
        thread: ThreadId,
        module: &Path,
        type_token: crate::model::TypeToken,
    ) -> Vec<(String, Box<dyn crate::value::NativeValue>)> {
        let controller = match &self.controller {
            Some(c) => c,
            None => return Vec::new(),
        };
        let names = self.pdb.get_static_field_names(module, type_token).unwrap_or_default();
        names
            .into_iter()
            .filter_map(|name| {
                let value = controller.static_field(thread, 0, type_token, &name).ok()?;
                Some((name, value))
            })
            .collect()
    }

    /// `Evaluate`: dotted expression tries static `Type.Field` first,
    /// otherwise a name-only local lookup (§4.E).
    pub fn evaluate(&self, thread: ThreadId, expression: &str) -> Result<VariableInfo, EngineError> {
        self.require_stopped()?;
        let controller = self.controller()?;
        let frames = controller.stack_frames(thread)?;
        let top = frames.first().ok_or(EngineError::FrameNotFound(0))?;

        let mut reader = ValueReader::new();

        if let Some((type_name, field_name)) = expression.rsplit_once('.') {
            if let Some(module) = &top.module_path {
                if let Ok(Some(type_token)) = self.pdb.find_type_by_name(module, type_name) {
                    let value = controller.static_field(thread, 0, type_token, field_name)?;
                    return Ok(reader.read(expression, value.as_ref()));
                }
            }
        }

        let value = controller.lookup_local(thread, 0, expression)?;
        Ok(reader.read(expression, value.as_ref()))
    }

    pub fn list_modules(&self) -> Vec<Module> {
        let mut modules: Vec<_> = self.session.modules.values().cloned().collect();
        modules.sort_by_key(|m| m.load_sequence);
        modules
    }

    /// Session-reuse teardown (§4.E session-reuse invariants, §8-3): called
    /// by `Disconnect` before a fresh `Launch`/`Attach` begins.
    pub fn disconnect(&mut self) -> Result<(), EngineError> {
        self.sink.mark_disconnecting();

        if let Some(controller) = &self.controller {
            let _ = controller.terminate(0);
        }
        self.controller = None;

        if let Some(mut child) = self.auxiliary_child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }

        crate::shim::clear_keep_alive();
        self.session.reset_for_new_generation();
        Ok(())
    }
}

fn module_matches(loaded: &Path, wanted: &Path) -> bool {
    if loaded == wanted {
        return true;
    }
    loaded.file_name() == wanted.file_name()
}

fn method_display_name(token: MethodToken) -> String {
    format!("method_{:#x}", method_token_row(token))
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::native::test_support::RecordingController;
    use tokio::sync::mpsc::unbounded_channel;

    fn ctx_with_recording() -> (EngineContext, Arc<RecordingController>) {
        let pdb = Arc::new(PdbReader::new());
        let sink = Arc::new(CallbackSink::new());
        let (tx, _rx) = unbounded_channel();
        sink.begin_generation(1, tx, false);
        let mut ctx = EngineContext::new(pdb, sink, Config::default());
        ctx.session.state = SessionState::Stopped;
        let controller = Arc::new(RecordingController::default());
        ctx.controller = Some(controller.clone());
        (ctx, controller)
    }

    #[test]
    fn step_configures_stepper_then_continues() {
        let (mut ctx, controller) = ctx_with_recording();
        ctx.step(1, true).unwrap();
        let calls = controller.calls.lock();
        assert_eq!(calls.as_slice(), &["create_stepper(1)", "step(1, step_in=true)", "continue_process(false)"]);
    }

    #[test]
    fn step_requires_stopped_session() {
        let (mut ctx, _controller) = ctx_with_recording();
        ctx.session.state = SessionState::Running;
        assert!(matches!(ctx.step(1, false), Err(EngineError::NotStopped)));
    }

    #[test]
    fn remove_unknown_breakpoint_is_not_found() {
        let (mut ctx, _controller) = ctx_with_recording();
        assert!(matches!(ctx.remove_breakpoint(999), Err(EngineError::BreakpointNotFound(999))));
    }

    #[test]
    fn disconnect_clears_controller_and_bumps_generation() {
        let (mut ctx, _controller) = ctx_with_recording();
        let before_gen = ctx.session.generation;
        ctx.disconnect().unwrap();
        assert!(ctx.controller.is_none());
        assert_eq!(ctx.session.generation, before_gen + 1);
        assert_eq!(ctx.session.state, SessionState::Idle);
    }

    #[test]
    fn module_matches_same_basename_different_dir() {
        assert!(module_matches(Path::new("/a/b/App.dll"), Path::new("/x/y/App.dll")));
        assert!(!module_matches(Path::new("/a/b/App.dll"), Path::new("/a/b/Other.dll")));
    }
}
