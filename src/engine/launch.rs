//! External-process plumbing for the launch sequence: the `dotnet build`
//! invocation, stdout/stderr forwarding into `Output` events, and the
//! test-host PID handshake (§4.E launch sequence step 1, test-process
//! launch). Grounded in the teacher's stdout/stderr reader-thread pattern
//! (`ui/dap/mod.rs::debugger_thread`'s `os_pipe` readers) but rebuilt on
//! `std::process::Child`'s own piped stdio, since we have no ptrace'd
//! `Child<Installed>` of our own to borrow pipes from (see DESIGN.md:
//! `os_pipe` dropped).

use crate::error::EngineError;
use crate::model::{DebugEvent, OutputStream};
use regex::Regex;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;

/// Invokes `dotnet build` against `project_path` and derives the compiled
/// DLL path from its output directory (§4.E launch sequence step 1). The
/// project-build invocation itself is an external collaborator (§1); this
/// is the thin call-and-parse wrapper the Engine needs to get a DLL path.
pub fn build_project(project_path: &Path) -> Result<PathBuf, EngineError> {
    let output = Command::new("dotnet")
        .arg("build")
        .arg(project_path)
        .arg("--nologo")
        .output()
        .map_err(|e| EngineError::BuildFailed(format!("failed to spawn dotnet build: {e}")))?;

    if !output.status.success() {
        return Err(EngineError::BuildFailed(String::from_utf8_lossy(&output.stderr).into_owned()));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    derive_output_dll(project_path, &stdout)
}

/// `dotnet build` prints a line like
/// `  MyApp -> /path/to/bin/Debug/net8.0/MyApp.dll` for the built assembly;
/// fall back to a conventional `bin/Debug/*/<ProjectName>.dll` probe if the
/// output format changes across SDK versions.
fn derive_output_dll(project_path: &Path, build_stdout: &str) -> Result<PathBuf, EngineError> {
    static ARROW_RE: once_cell::sync::Lazy<Regex> =
        once_cell::sync::Lazy::new(|| Regex::new(r"->\s*(\S+\.dll)\s*$").unwrap());

    for line in build_stdout.lines() {
        if let Some(caps) = ARROW_RE.captures(line.trim()) {
            let dll = PathBuf::from(&caps[1]);
            if dll.is_file() {
                return Ok(dll);
            }
        }
    }

    let project_dir = if project_path.is_dir() {
        project_path.to_path_buf()
    } else {
        project_path.parent().map(Path::to_path_buf).unwrap_or_default()
    };
    let project_name = project_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .ok_or_else(|| EngineError::InvalidDllPath(project_path.display().to_string()))?;

    for config in ["Debug", "Release"] {
        let bin_dir = project_dir.join("bin").join(config);
        if let Ok(entries) = std::fs::read_dir(&bin_dir) {
            for entry in entries.flatten() {
                let candidate = entry.path().join(format!("{project_name}.dll"));
                if candidate.is_file() {
                    return Ok(candidate);
                }
            }
        }
    }

    Err(EngineError::BuildFailed(format!(
        "could not locate build output for {}",
        project_path.display()
    )))
}

/// Spawns two reader threads forwarding `child`'s stdout/stderr lines as
/// `Output` events, matching ICorDebug's own per-write granularity
/// (SPEC_FULL §4.D expansion: no client-side coalescing).
pub fn forward_child_output(child: &mut Child, events: UnboundedSender<DebugEvent>) {
    if let Some(stdout) = child.stdout.take() {
        spawn_line_reader(stdout, OutputStream::Stdout, events.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_line_reader(stderr, OutputStream::Stderr, events);
    }
}

fn spawn_line_reader(reader: impl std::io::Read + Send + 'static, stream: OutputStream, events: UnboundedSender<DebugEvent>) {
    std::thread::spawn(move || {
        let mut lines = BufReader::new(reader);
        loop {
            let mut line = String::new();
            match lines.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let _ = events.send(DebugEvent::Output { text: line, stream });
                }
            }
        }
    });
}

/// `VSTEST_HOST_DEBUG=1` / `VSTEST_DEBUG_NOBP=1` test-host launch (§4.E
/// test-process launch). The second variable "suppresses a secondary
/// programmatic break in the test host that would otherwise leave the host
/// perpetually stopped".
pub fn spawn_test_host(project_path: &Path, filter: Option<&str>) -> Result<Child, EngineError> {
    let mut cmd = Command::new("dotnet");
    cmd.arg("test").arg(project_path);
    if let Some(filter) = filter {
        cmd.arg("--filter").arg(filter);
    }
    cmd.env("VSTEST_HOST_DEBUG", "1")
        .env("VSTEST_DEBUG_NOBP", "1")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    cmd.spawn().map_err(|e| EngineError::Spawn(e.to_string()))
}

/// Extracts the reported test-host PID from a line of `dotnet test` stdout
/// (regex on `Process Id: N`, §4.E test-process launch).
pub fn parse_test_host_pid(line: &str) -> Option<u32> {
    static PID_RE: once_cell::sync::Lazy<Regex> = once_cell::sync::Lazy::new(|| Regex::new(r"Process Id:\s*(\d+)").unwrap());
    PID_RE.captures(line).and_then(|c| c.get(1)).and_then(|m| m.as_str().parse().ok())
}

/// Reads `reader` line-by-line until `parse_test_host_pid` matches or
/// `timeout` elapses (§5 "25 seconds for PID parsing").
pub fn wait_for_test_host_pid(mut reader: impl BufRead, timeout: Duration) -> Result<u32, EngineError> {
    let deadline = Instant::now() + timeout;
    let mut line = String::new();
    loop {
        if Instant::now() > deadline {
            return Err(EngineError::TestHostTimeout(timeout));
        }
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => return Err(EngineError::TestHostTimeout(timeout)),
            Ok(_) => {
                if let Some(pid) = parse_test_host_pid(&line) {
                    return Ok(pid);
                }
            }
            Err(e) => return Err(EngineError::Io(e)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_process_id_line() {
        assert_eq!(parse_test_host_pid("Starting test execution, Process Id: 4242"), Some(4242));
        assert_eq!(parse_test_host_pid("no pid here"), None);
    }

    #[test]
    fn derives_dll_from_build_arrow_output() {
        let dir = std::env::temp_dir().join(format!("netdbg-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let dll = dir.join("MyApp.dll");
        std::fs::write(&dll, b"").unwrap();
        let stdout = format!("  MyApp -> {}\n", dll.display());
        let resolved = derive_output_dll(Path::new("MyApp.csproj"), &stdout).unwrap();
        assert_eq!(resolved, dll);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn wait_for_test_host_pid_times_out_on_silent_stream() {
        let reader = std::io::Cursor::new(b"nothing useful here\n".to_vec());
        let result = wait_for_test_host_pid(reader, Duration::from_millis(1));
        assert!(matches!(result, Err(EngineError::TestHostTimeout(_))));
    }
}
