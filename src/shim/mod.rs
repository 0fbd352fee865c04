//! Dynamic binding to the native loader shim `libdbgshim.so` (§4.A).
//!
//! The shim exposes five entry points. We bind them lazily through
//! `libloading`, in the spirit of the function-pointer-table idiom used by
//! dynamically-loaded system libraries elsewhere in the ecosystem (see
//! DESIGN.md), generalized to Linux `dlopen` rather than `LoadLibraryA`.

use crate::error::EngineError;
use libloading::{Library, Symbol};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::c_void;
use std::path::Path;

/// Native signature: `HRESULT CreateProcessForLaunch(LPWSTR lpCommandLine, BOOL bSuspendProcess,
/// LPVOID lpEnvironment, LPCWSTR lpCurrentDirectory, PDWORD pProcessId, HANDLE* pResumeHandle)`.
type CreateProcessForLaunchFn =
    unsafe extern "C" fn(*const u16, i32, *mut c_void, *const u16, *mut u32, *mut *mut c_void) -> i32;

/// `HRESULT RegisterForRuntimeStartup(DWORD dwProcessId, PSTARTUP_CALLBACK pfnCallback,
/// PVOID parameter, PVOID* ppUnregisterToken)`.
type RegisterForRuntimeStartupFn =
    unsafe extern "C" fn(u32, StartupCallback, *mut c_void, *mut *mut c_void) -> i32;

/// `HRESULT ResumeProcess(HANDLE hResumeHandle)`.
type ResumeProcessFn = unsafe extern "C" fn(*mut c_void) -> i32;

/// `HRESULT CloseResumeHandle(HANDLE hResumeHandle)`.
type CloseResumeHandleFn = unsafe extern "C" fn(*mut c_void) -> i32;

/// `VOID UnregisterForRuntimeStartup(PVOID unregisterToken)`.
type UnregisterForRuntimeStartupFn = unsafe extern "C" fn(*mut c_void) -> i32;

/// The shim's native startup callback ABI: `(IUnknown* pCordb, PVOID parameter, HRESULT hr)`.
pub type StartupCallback = unsafe extern "C" fn(*mut c_void, *mut c_void, i32);

pub struct ShimLoader {
    _lib: Library,
    create_process_for_launch: CreateProcessForLaunchFn,
    register_for_runtime_startup: RegisterForRuntimeStartupFn,
    resume_process: ResumeProcessFn,
    close_resume_handle: CloseResumeHandleFn,
    unregister_for_runtime_startup: UnregisterForRuntimeStartupFn,
}

/// Opaque resume handle returned by `CreateProcessForLaunch`; owned by the
/// engine thread, closed exactly once.
#[derive(Debug, Clone, Copy)]
pub struct ResumeHandle(pub(crate) *mut c_void);
unsafe impl Send for ResumeHandle {}

#[derive(Debug, Clone, Copy)]
pub struct UnregisterToken(pub(crate) *mut c_void);
unsafe impl Send for UnregisterToken {}

/// The state the startup callback closure needs, pinned for the session's
/// lifetime per §4.A's critical contract: the shim may invoke the callback
/// on its own thread seconds after registration, so its backing storage
/// must outlive the call that registered it.
pub struct StartupCallbackState {
    pub generation: u64,
    pub on_startup: Box<dyn FnOnce(*mut c_void, i32) + Send>,
}

/// Process-wide keep-alive table, analogous to the teacher's
/// `LOGGER_SWITCHER` static-with-interior-mutability pattern (`src/log.rs`).
/// The session writes an entry before `RegisterForRuntimeStartup` and the
/// engine clears it on disconnect; nothing here should ever be dropped
/// while a registration backed by it might still fire.
static KEEP_ALIVE: Lazy<Mutex<HashMap<u32, StartupCallbackState>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Registers `state` under `pid` so its closure survives until
/// `take_keep_alive` removes it. Returns the raw pointer to pass as the
/// shim's `parameter` argument; the pointer is only ever dereferenced by
/// `dispatch_startup_callback`, never escaped further.
pub fn install_keep_alive(pid: u32, state: StartupCallbackState) -> *mut c_void {
    let mut table = KEEP_ALIVE.lock();
    table.insert(pid, state);
    pid as usize as *mut c_void
}

/// Removes and returns the keep-alive entry for `pid`, if still present.
/// A later removal for a superseded generation is a deliberate no-op: the
/// entry for a new generation with the same pid (vanishingly unlikely, but
/// not impossible across very short-lived processes) simply never matched.
pub fn take_keep_alive(pid: u32) -> Option<StartupCallbackState> {
    KEEP_ALIVE.lock().remove(&pid)
}

/// Clears every pending keep-alive entry; called on `Disconnect` so a
/// stale registration from a prior generation can never fire into a live
/// session (§4.E session-reuse invariants).
pub fn clear_keep_alive() {
    KEEP_ALIVE.lock().clear();
}

/// The native ABI entry point the shim actually calls. It recovers the
/// `parameter` (our pid-derived key) and dispatches the stored closure.
/// Declared `extern "C"` so its address can be handed to
/// `RegisterForRuntimeStartup` as a bare function pointer.
pub unsafe extern "C" fn dispatch_startup_callback(cordb: *mut c_void, parameter: *mut c_void, hr: i32) {
    let pid = parameter as usize as u32;
    if let Some(state) = take_keep_alive(pid) {
        (state.on_startup)(cordb, hr);
    } else {
        log::warn!(target: "netdbg::shim", "startup callback fired for unknown or already-consumed pid {pid}");
    }
}

impl ShimLoader {
    /// Opens `path` and binds all five entry points eagerly; a missing
    /// library or missing symbol is fatal at session creation (§4.A).
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        if !path.is_file() {
            return Err(EngineError::ShimNotFound(path.display().to_string()));
        }
        let lib = unsafe { Library::new(path) }?;
        unsafe {
            let create_process_for_launch: Symbol<CreateProcessForLaunchFn> = lib
                .get(b"CreateProcessForLaunch\0")
                .map_err(|_| EngineError::ShimSymbolNotFound("CreateProcessForLaunch"))?;
            let register_for_runtime_startup: Symbol<RegisterForRuntimeStartupFn> = lib
                .get(b"RegisterForRuntimeStartup\0")
                .map_err(|_| EngineError::ShimSymbolNotFound("RegisterForRuntimeStartup"))?;
            let resume_process: Symbol<ResumeProcessFn> = lib
                .get(b"ResumeProcess\0")
                .map_err(|_| EngineError::ShimSymbolNotFound("ResumeProcess"))?;
            let close_resume_handle: Symbol<CloseResumeHandleFn> = lib
                .get(b"CloseResumeHandle\0")
                .map_err(|_| EngineError::ShimSymbolNotFound("CloseResumeHandle"))?;
            let unregister_for_runtime_startup: Symbol<UnregisterForRuntimeStartupFn> = lib
                .get(b"UnregisterForRuntimeStartup\0")
                .map_err(|_| EngineError::ShimSymbolNotFound("UnregisterForRuntimeStartup"))?;

            let create_process_for_launch = *create_process_for_launch;
            let register_for_runtime_startup = *register_for_runtime_startup;
            let resume_process = *resume_process;
            let close_resume_handle = *close_resume_handle;
            let unregister_for_runtime_startup = *unregister_for_runtime_startup;

            Ok(ShimLoader {
                _lib: lib,
                create_process_for_launch,
                register_for_runtime_startup,
                resume_process,
                close_resume_handle,
                unregister_for_runtime_startup,
            })
        }
    }

    /// Must be called only from the engine's owned native-API thread.
    pub fn create_process_for_launch(&self, cmdline_utf16: &[u16]) -> Result<(u32, ResumeHandle), EngineError> {
        let mut pid: u32 = 0;
        let mut handle: *mut c_void = std::ptr::null_mut();
        let hr = unsafe {
            (self.create_process_for_launch)(
                cmdline_utf16.as_ptr(),
                1,
                std::ptr::null_mut(),
                std::ptr::null(),
                &mut pid,
                &mut handle,
            )
        };
        if hr < 0 {
            return Err(EngineError::NativeCall("CreateProcessForLaunch", hr as u32));
        }
        Ok((pid, ResumeHandle(handle)))
    }

    pub fn register_for_runtime_startup(&self, pid: u32, parameter: *mut c_void) -> Result<UnregisterToken, EngineError> {
        let mut token: *mut c_void = std::ptr::null_mut();
        let hr = unsafe { (self.register_for_runtime_startup)(pid, dispatch_startup_callback, parameter, &mut token) };
        if hr < 0 {
            return Err(EngineError::NativeCall("RegisterForRuntimeStartup", hr as u32));
        }
        Ok(UnregisterToken(token))
    }

    pub fn resume_process(&self, handle: ResumeHandle) -> Result<(), EngineError> {
        let hr = unsafe { (self.resume_process)(handle.0) };
        if hr < 0 {
            return Err(EngineError::NativeCall("ResumeProcess", hr as u32));
        }
        Ok(())
    }

    pub fn close_resume_handle(&self, handle: ResumeHandle) -> Result<(), EngineError> {
        let hr = unsafe { (self.close_resume_handle)(handle.0) };
        if hr < 0 {
            return Err(EngineError::NativeCall("CloseResumeHandle", hr as u32));
        }
        Ok(())
    }

    pub fn unregister_for_runtime_startup(&self, token: UnregisterToken) -> Result<(), EngineError> {
        let hr = unsafe { (self.unregister_for_runtime_startup)(token.0) };
        if hr < 0 {
            return Err(EngineError::NativeCall("UnregisterForRuntimeStartup", hr as u32));
        }
        Ok(())
    }
}
