use crate::model::{BreakpointId, ThreadId};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // --------------------------------- config errors ----------------------------------------------
    #[error("native debug shim not found at {0}")]
    ShimNotFound(String),
    #[error("shim symbol not found: {0}")]
    ShimSymbolNotFound(&'static str),
    #[error("invalid dll path: {0}")]
    InvalidDllPath(String),
    #[error(transparent)]
    Config(#[from] ConfigError),

    // --------------------------------- session-state errors ----------------------------------------
    #[error("a session is already running")]
    AlreadyRunning,
    #[error("no active session")]
    NoSession,
    #[error("session is not stopped")]
    NotStopped,
    #[error("thread {0} not found")]
    ThreadNotFound(ThreadId),
    #[error("frame {0} not found")]
    FrameNotFound(u32),
    #[error("breakpoint {0} not found")]
    BreakpointNotFound(BreakpointId),

    // --------------------------------- native errors ----------------------------------------------
    #[error("native call {0} failed with hresult {1:#010x}")]
    NativeCall(&'static str, u32),
    #[error("target process desynchronized (CORDBG_E_PROCESS_NOT_SYNCHRONIZED)")]
    ProcessNotSynchronized,
    #[error("il local variable not available (CORDBG_E_IL_VAR_NOT_AVAILABLE)")]
    IlVarNotAvailable,
    #[error("libloading error: {0}")]
    LibLoading(#[from] libloading::Error),

    // --------------------------------- pdb / metadata errors ----------------------------------------
    #[error("no debug information for {0}")]
    NoDebugInformation(String),
    #[error("source location not found: {0}:{1}")]
    LocationNotFound(String, u32),
    #[error("metadata error: {0}")]
    Metadata(String),

    // --------------------------------- value reader errors ------------------------------------------
    #[error("value read failed: {0}")]
    ValueRead(String),

    // --------------------------------- process / io errors -------------------------------------------
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("process spawn failed: {0}")]
    Spawn(String),
    #[error("test host handshake timed out after {0:?}")]
    TestHostTimeout(std::time::Duration),
    #[error(transparent)]
    RegEx(#[from] regex::Error),

    // --------------------------------- build errors --------------------------------------------------
    #[error("dotnet build failed: {0}")]
    BuildFailed(String),

    // --------------------------------- engine internals -----------------------------------------------
    #[error("engine thread panicked")]
    EngineThreadPanicked,
    #[error("engine thread is gone")]
    EngineThreadGone,
    #[error("operation cancelled")]
    Cancelled,
    #[error("other: {0}")]
    Other(anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid netdbg.toml: {0}")]
    Toml(#[from] toml::de::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether this error should end the session (vs. be surfaced as a single
    /// failed tool response with the session left intact).
    pub fn is_fatal(&self) -> bool {
        match self {
            EngineError::ShimNotFound(_) => true,
            EngineError::ShimSymbolNotFound(_) => true,
            EngineError::InvalidDllPath(_) => false,
            EngineError::Config(_) => true,
            EngineError::AlreadyRunning => false,
            EngineError::NoSession => false,
            EngineError::NotStopped => false,
            EngineError::ThreadNotFound(_) => false,
            EngineError::FrameNotFound(_) => false,
            EngineError::BreakpointNotFound(_) => false,
            EngineError::NativeCall(_, _) => true,
            EngineError::ProcessNotSynchronized => true,
            EngineError::IlVarNotAvailable => false,
            EngineError::LibLoading(_) => true,
            EngineError::NoDebugInformation(_) => false,
            EngineError::LocationNotFound(_, _) => false,
            EngineError::Metadata(_) => false,
            EngineError::ValueRead(_) => false,
            EngineError::Io(_) => false,
            EngineError::Spawn(_) => true,
            EngineError::TestHostTimeout(_) => true,
            EngineError::RegEx(_) => false,
            EngineError::BuildFailed(_) => true,
            EngineError::EngineThreadPanicked => true,
            EngineError::EngineThreadGone => true,
            EngineError::Cancelled => false,
            EngineError::Other(_) => false,
        }
    }
}

/// Transforms a `Result` into an `Option`, logging the error at the given level.
#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "netdbg", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "netdbg", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Per-item inspection failures: log as a warning, degrade to a sentinel.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Expected-to-sometimes-fail paths (e.g. PDB absent): log at debug only.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
