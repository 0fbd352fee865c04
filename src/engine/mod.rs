//! The Debug Engine (§4.E): a single dedicated OS thread owning every
//! native-API call and all structured session state, reached from async
//! callers through a command channel of closures and an event channel of
//! `DebugEvent`s.
//!
//! Grounded in the teacher's `ui::dap::mod::debugger_thread` +
//! `DebuggerCommand` shape (a owner thread draining a command channel,
//! dispatching to a `Debugger` by variant) generalized from a hand-rolled
//! `DebuggerCommand` enum to a boxed-closure command queue (§4.E, §9: "never
//! dispatch native calls from a work-stealing pool") and from
//! `std::sync::mpsc` to a `tokio::sync::oneshot` reply per command so the
//! public surface is `async fn` (§5 expansion).

pub mod com;
pub mod com_value;
pub mod context;
pub mod launch;
pub mod native;

use crate::config::Config;
use crate::engine::context::EngineContext;
use crate::engine::native::NativeController;
use crate::error::EngineError;
use crate::model::{
    BreakpointId, DebugEvent, Module, SessionState, StackFrame, StopReason, ThreadId, VariableInfo,
};
use crate::pdb::PdbReader;
use crate::shim::{self, ShimLoader, StartupCallbackState};
use crate::sink::CallbackSink;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

/// A unit of work marshaled onto the owner thread. Boxed so the command
/// channel carries one uniform type regardless of the operation (§4.E
/// concurrency model: "a command channel (queue of closures)").
type Command = Box<dyn FnOnce(&mut EngineContext) + Send>;

/// Response to `launch`/`attach`/`disconnect`/`status` (§6).
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub state: SessionState,
    pub process_id: Option<u32>,
    pub process_name: Option<String>,
}

/// The public facade: one per debugging session-capable process. Cloning is
/// cheap (everything behind `Arc`); every clone shares the same owner
/// thread and event stream.
#[derive(Clone)]
pub struct DebugEngine {
    inner: Arc<Inner>,
}

struct Inner {
    cmd_tx: std_mpsc::Sender<Command>,
    events: AsyncMutex<mpsc::UnboundedReceiver<DebugEvent>>,
    sink: Arc<CallbackSink>,
    shim: Arc<ShimLoader>,
    pdb: Arc<PdbReader>,
    config: Config,
    generation: AtomicU64,
    /// Kept only so the thread is joined (well, dropped) together with the
    /// rest of the engine; nothing ever reads its result.
    _owner_thread: std::thread::JoinHandle<()>,
}

impl DebugEngine {
    /// Starts the owner thread and opens the shim. Fatal per §4.A/§7 if the
    /// shim cannot be found or is missing a required symbol.
    pub fn new(config: Config) -> Result<Self, EngineError> {
        let shim_path = config
            .resolve_shim_path()
            .ok_or_else(|| EngineError::ShimNotFound("no shim path configured and none found in default locations".to_string()))?;
        let shim = Arc::new(ShimLoader::open(&shim_path)?);
        let pdb = Arc::new(PdbReader::new());
        let sink = Arc::new(CallbackSink::new());

        let (cmd_tx, cmd_rx) = std_mpsc::channel::<Command>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        sink.begin_generation(0, event_tx, config.first_chance_exceptions_default);

        let mut ctx = EngineContext::new(pdb.clone(), sink.clone(), config.clone());
        let owner_thread = std::thread::Builder::new()
            .name("netdbg-engine".to_string())
            .spawn(move || run_owner_thread(&mut ctx, cmd_rx))
            .map_err(EngineError::Io)?;

        Ok(DebugEngine {
            inner: Arc::new(Inner {
                cmd_tx,
                events: AsyncMutex::new(event_rx),
                sink,
                shim,
                pdb,
                config,
                generation: AtomicU64::new(0),
                _owner_thread: owner_thread,
            }),
        })
    }

    /// Marshals `f` onto the owner thread and awaits its reply, honoring
    /// `cancel` at the await point only (§5: "cancellation does NOT
    /// interrupt in-flight native calls").
    async fn call<T, F>(&self, f: F, cancel: &CancellationToken) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&mut EngineContext) -> Result<T, EngineError> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let cmd: Command = Box::new(move |ctx| {
            let _ = tx.send(f(ctx));
        });
        self.inner.cmd_tx.send(cmd).map_err(|_| EngineError::EngineThreadGone)?;

        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            result = rx => result.map_err(|_| EngineError::EngineThreadGone)?,
        }
    }

    async fn call_uncancellable<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&mut EngineContext) -> Result<T, EngineError> + Send + 'static,
    {
        self.call(f, &CancellationToken::new()).await
    }

    // ---------------------------------------------------------------- launch

    /// `launch` (§6, §4.E launch sequence steps 1-8).
    pub async fn launch(
        &self,
        project_path: PathBuf,
        app_dll_path: Option<PathBuf>,
        first_chance_exceptions: bool,
        cancel: &CancellationToken,
    ) -> Result<EngineStatus, EngineError> {
        self.call(
            move |ctx| {
                if !matches!(ctx.session.state, SessionState::Idle | SessionState::Exited) {
                    return Err(EngineError::AlreadyRunning);
                }
                Ok(())
            },
            cancel,
        )
        .await?;

        // step 1: external build, off the owner thread (it is a slow
        // blocking call that does not touch native state).
        let dll_path = match app_dll_path {
            Some(p) => p,
            None => launch::build_project(&project_path)?,
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        {
            let mut guard = self.inner.events.lock().await;
            *guard = event_rx;
        }
        self.inner.sink.begin_generation(generation, event_tx, first_chance_exceptions);

        let shim = self.inner.shim.clone();
        let cmdline = widestring::U16CString::from_str(format!("dotnet {}", dll_path.display()))
            .map_err(|e| EngineError::InvalidDllPath(e.to_string()))?;

        let (pid, resume_handle) = shim.create_process_for_launch(cmdline.as_slice_with_nul())?;

        let pdb = self.inner.pdb.clone();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<Arc<dyn NativeController>, EngineError>>();
        let parameter = shim::install_keep_alive(
            pid,
            StartupCallbackState {
                generation,
                on_startup: Box::new(move |cordb, hr| {
                    let result = if hr < 0 {
                        Err(EngineError::NativeCall("RuntimeStartupCallback", hr as u32))
                    } else {
                        let controller: Arc<dyn NativeController> = Arc::new(unsafe { com::ComController::new(cordb, pdb.clone()) });
                        controller.set_managed_handler().map(|_| controller)
                    };
                    let _ = ready_tx.send(result);
                }),
            },
        );
        shim.register_for_runtime_startup(pid, parameter)?;
        shim.resume_process(resume_handle)?;
        shim.close_resume_handle(resume_handle)?;

        let controller = ready_rx
            .recv_timeout(std::time::Duration::from_secs(10))
            .map_err(|_| EngineError::TestHostTimeout(std::time::Duration::from_secs(10)))??;

        self.call(
            move |ctx| {
                ctx.controller = Some(controller);
                ctx.session.process_id = Some(pid);
                ctx.session.state = SessionState::Running;
                Ok(())
            },
            cancel,
        )
        .await?;

        self.status(cancel).await
    }

    /// `attach` (§4.E attach sequence).
    pub async fn attach(&self, process_id: u32, cancel: &CancellationToken) -> Result<EngineStatus, EngineError> {
        self.call(
            |ctx| {
                if !matches!(ctx.session.state, SessionState::Idle | SessionState::Exited) {
                    return Err(EngineError::AlreadyRunning);
                }
                Ok(())
            },
            cancel,
        )
        .await?;

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        {
            let mut guard = self.inner.events.lock().await;
            *guard = event_rx;
        }
        self.inner.sink.begin_generation(generation, event_tx, self.inner.config.first_chance_exceptions_default);

        let shim = self.inner.shim.clone();
        let pdb = self.inner.pdb.clone();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<Arc<dyn NativeController>, EngineError>>();
        let parameter = shim::install_keep_alive(
            process_id,
            StartupCallbackState {
                generation,
                on_startup: Box::new(move |cordb, hr| {
                    let result = if hr < 0 {
                        Err(EngineError::NativeCall("RuntimeStartupCallback", hr as u32))
                    } else {
                        let controller: Arc<dyn NativeController> = Arc::new(unsafe { com::ComController::new(cordb, pdb.clone()) });
                        controller.set_managed_handler().map(|_| controller)
                    };
                    let _ = ready_tx.send(result);
                }),
            },
        );

        // "a freshly started target may not yet have loaded the CLR"; a
        // small retry loop is permitted upstream (§4.E attach sequence).
        let mut attempt = 0;
        loop {
            match shim.register_for_runtime_startup(process_id, parameter) {
                Ok(_) => break,
                Err(_) if attempt < 5 => {
                    attempt += 1;
                    std::thread::sleep(std::time::Duration::from_millis(200));
                }
                Err(e) => return Err(e),
            }
        }

        let controller = ready_rx
            .recv_timeout(std::time::Duration::from_secs(10))
            .map_err(|_| EngineError::TestHostTimeout(std::time::Duration::from_secs(10)))??;

        self.call(
            move |ctx| {
                ctx.controller = Some(controller);
                ctx.session.process_id = Some(process_id);
                ctx.session.state = SessionState::Attached;
                Ok(())
            },
            cancel,
        )
        .await?;

        self.status(cancel).await
    }

    /// `launch_test` (§4.E test-process launch).
    pub async fn launch_test(
        &self,
        project_path: PathBuf,
        filter: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<EngineStatus, EngineError> {
        launch::build_project(&project_path)?;
        let mut child = launch::spawn_test_host(&project_path, filter.as_deref())?;

        let stdout = child.stdout.take().ok_or_else(|| EngineError::Spawn("test host has no stdout".to_string()))?;
        let test_host_timeout = self.inner.config.test_host_timeout;
        let pid = launch::wait_for_test_host_pid(std::io::BufReader::new(stdout), test_host_timeout)?;

        let status = self.attach(pid, cancel).await?;

        self.call_uncancellable(move |ctx| {
            ctx.auxiliary_child = Some(child);
            Ok(())
        })
        .await?;

        Ok(status)
    }

    /// `disconnect` (§4.E session-reuse invariants, §5 resource lifetimes:
    /// attempt clean stop, kill after the configured grace period).
    pub async fn disconnect(&self, cancel: &CancellationToken) -> Result<EngineStatus, EngineError> {
        let grace = self.inner.config.disconnect_kill_grace;
        let pid = self
            .call(|ctx| Ok(ctx.session.process_id), cancel)
            .await?;

        if let Some(pid) = pid {
            let _ = self.call(|ctx| ctx.pause(), cancel).await;
            let deadline = std::time::Instant::now() + grace;
            while std::time::Instant::now() < deadline {
                if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_err() {
                    break; // process already gone
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
            let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGKILL);
        }

        self.call(|ctx| ctx.disconnect(), cancel).await?;
        self.status(cancel).await
    }

    pub async fn status(&self, cancel: &CancellationToken) -> Result<EngineStatus, EngineError> {
        self.call(
            |ctx| {
                Ok(EngineStatus {
                    state: ctx.session.state,
                    process_id: ctx.session.process_id,
                    process_name: ctx.session.process_name.clone(),
                })
            },
            cancel,
        )
        .await
    }

    // ------------------------------------------------------------ breakpoints

    pub async fn set_breakpoint(
        &self,
        dll_path: PathBuf,
        source_file: String,
        line: u32,
        cancel: &CancellationToken,
    ) -> Result<BreakpointId, EngineError> {
        self.call(move |ctx| ctx.set_breakpoint(&dll_path, &source_file, line), cancel).await
    }

    pub async fn remove_breakpoint(&self, id: BreakpointId, cancel: &CancellationToken) -> Result<(), EngineError> {
        self.call(move |ctx| ctx.remove_breakpoint(id), cancel).await
    }

    // ------------------------------------------------------------- execution

    pub async fn continue_(&self, cancel: &CancellationToken) -> Result<DebugEvent, EngineError> {
        self.call(|ctx| ctx.continue_(), cancel).await?;
        self.next_event(cancel).await
    }

    pub async fn step_over(&self, thread_id: ThreadId, cancel: &CancellationToken) -> Result<DebugEvent, EngineError> {
        self.call(move |ctx| ctx.step(thread_id, false), cancel).await?;
        self.next_event(cancel).await
    }

    pub async fn step_into(&self, thread_id: ThreadId, cancel: &CancellationToken) -> Result<DebugEvent, EngineError> {
        self.call(move |ctx| ctx.step(thread_id, true), cancel).await?;
        self.next_event(cancel).await
    }

    pub async fn step_out(&self, thread_id: ThreadId, cancel: &CancellationToken) -> Result<DebugEvent, EngineError> {
        self.call(move |ctx| ctx.step_out(thread_id), cancel).await?;
        self.next_event(cancel).await
    }

    /// `Pause` (SPEC_FULL §4.E expansion): synchronous `Stop`, then
    /// self-authors a `Stopped(reason: pause)` event since the native API
    /// does not always raise a callback for a programmatic stop.
    pub async fn pause(&self, cancel: &CancellationToken) -> Result<EngineStatus, EngineError> {
        self.call(|ctx| ctx.pause(), cancel).await?;
        let (thread_id, top_frame) = self
            .call(
                |ctx| {
                    let thread_id = ctx.list_threads().ok().and_then(|t| t.into_iter().next()).unwrap_or(0);
                    Ok((thread_id, ctx.top_frame(thread_id)))
                },
                cancel,
            )
            .await?;
        log::trace!(target: "netdbg::engine", "synthesizing Stopped(reason=pause) for thread {thread_id}");
        let _ = self.inner.sink_emit_self_authored(DebugEvent::Stopped {
            reason: StopReason::Pause,
            thread_id,
            top_frame,
        });
        self.status(cancel).await
    }

    // ------------------------------------------------------------ inspection

    pub async fn variables(&self, thread_id: ThreadId, cancel: &CancellationToken) -> Result<Vec<VariableInfo>, EngineError> {
        self.call(move |ctx| ctx.locals(thread_id), cancel).await
    }

    pub async fn stacktrace(&self, thread_id: ThreadId, cancel: &CancellationToken) -> Result<Vec<StackFrame>, EngineError> {
        self.call(move |ctx| ctx.stack_trace(thread_id), cancel).await
    }

    /// `stacktrace` with `thread_id == 0`: all threads (§6).
    pub async fn stacktrace_all(&self, cancel: &CancellationToken) -> Result<Vec<(ThreadId, Vec<StackFrame>)>, EngineError> {
        self.call(
            |ctx| {
                let threads = ctx.list_threads()?;
                let mut out = Vec::with_capacity(threads.len());
                for t in threads {
                    match ctx.stack_trace(t) {
                        Ok(frames) => out.push((t, frames)),
                        Err(e) => {
                            log::debug!(target: "netdbg::engine", "stacktrace for thread {t} degraded: {e}");
                            out.push((t, Vec::new()));
                        }
                    }
                }
                Ok(out)
            },
            cancel,
        )
        .await
    }

    pub async fn evaluate(&self, thread_id: ThreadId, expression: String, cancel: &CancellationToken) -> Result<VariableInfo, EngineError> {
        self.call(move |ctx| ctx.evaluate(thread_id, &expression), cancel).await
    }

    pub async fn threads(&self, cancel: &CancellationToken) -> Result<Vec<ThreadId>, EngineError> {
        self.call(|ctx| ctx.list_threads(), cancel).await
    }

    /// `ListModules` (SPEC_FULL §4.E expansion).
    pub async fn list_modules(&self, cancel: &CancellationToken) -> Result<Vec<Module>, EngineError> {
        self.call(|ctx| Ok(ctx.list_modules()), cancel).await
    }

    /// Awaits the next event, enriching `BreakpointHit`/`Stopped` with a top
    /// frame and bumping the breakpoint's hit counter — both require a
    /// native-thread round trip, so they happen here rather than in the
    /// Sink (§3 Breakpoint "additionally tracks hit_count").
    pub async fn next_event(&self, cancel: &CancellationToken) -> Result<DebugEvent, EngineError> {
        let event = {
            let mut guard = self.inner.events.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                ev = guard.recv() => ev.ok_or(EngineError::NoSession)?,
            }
        };
        self.enrich(event, cancel).await
    }

    async fn enrich(&self, event: DebugEvent, cancel: &CancellationToken) -> Result<DebugEvent, EngineError> {
        match event {
            DebugEvent::BreakpointHit { breakpoint_id, thread_id, .. } => {
                let top_frame = self.call(move |ctx| Ok(ctx.top_frame(thread_id)), cancel).await.unwrap_or(None);
                let _ = self
                    .call(
                        move |ctx| {
                            if let Some(bp) = ctx.session.active_breakpoints.get_mut(&breakpoint_id) {
                                bp.hit_count += 1;
                            }
                            Ok(())
                        },
                        cancel,
                    )
                    .await;
                Ok(DebugEvent::BreakpointHit { breakpoint_id, thread_id, top_frame })
            }
            DebugEvent::Stopped { reason, thread_id, .. } => {
                let top_frame = self.call(move |ctx| Ok(ctx.top_frame(thread_id)), cancel).await.unwrap_or(None);
                Ok(DebugEvent::Stopped { reason, thread_id, top_frame })
            }
            other => Ok(other),
        }
    }
}

impl Inner {
    /// Pause's synthesized event is written directly to the channel the
    /// Sink is currently holding, outside the Sink's own `dispatch` path —
    /// this is the engine's "one deliberate self-authored event" (SPEC_FULL
    /// §4.E expansion). We go through the sink rather than a private
    /// channel handle so a concurrently-arriving genuine callback and this
    /// synthesized event still total-order on the same underlying queue.
    fn sink_emit_self_authored(&self, event: DebugEvent) -> Result<(), EngineError> {
        self.sink.emit_self_authored(event);
        Ok(())
    }
}

fn run_owner_thread(ctx: &mut EngineContext, cmd_rx: std_mpsc::Receiver<Command>) {
    while let Ok(cmd) = cmd_rx.recv() {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cmd(ctx)));
        if result.is_err() {
            log::error!(target: "netdbg::engine", "owner-thread command panicked; session state may be inconsistent");
        }
    }
    log::debug!(target: "netdbg::engine", "owner thread exiting: command channel closed");
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn engine_status_is_plain_data() {
        let status = EngineStatus {
            state: SessionState::Idle,
            process_id: None,
            process_name: None,
        };
        assert_eq!(status.state, SessionState::Idle);
    }
}
