//! Engine configuration: environment overrides layered over an optional
//! `netdbg.toml`, matching the teacher's own `toml`/`serde`-based config
//! layer (see DESIGN.md).

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_SHIM_PATH: &str = "NETDBG_SHIM_PATH";
const ENV_PAUSE_TIMEOUT_MS: &str = "NETDBG_PAUSE_TIMEOUT_MS";
const ENV_TEST_HOST_TIMEOUT_S: &str = "NETDBG_TEST_HOST_TIMEOUT_S";
const ENV_DISCONNECT_KILL_GRACE_S: &str = "NETDBG_DISCONNECT_KILL_GRACE_S";
const ENV_FIRST_CHANCE_EXCEPTIONS: &str = "NETDBG_FIRST_CHANCE_EXCEPTIONS";

/// Well-known install roots probed when `shim_path` is unset (SPEC_FULL
/// §4.A expansion).
const DEFAULT_DOTNET_ROOTS: &[&str] = &["/usr/share/dotnet", "/usr/lib/dotnet"];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Explicit path to `libdbgshim.so`. Falls back to `NETDBG_SHIM_PATH`
    /// then to a probe of `DEFAULT_DOTNET_ROOTS`.
    pub shim_path: Option<PathBuf>,
    pub pause_timeout: Duration,
    /// §5: "25 seconds for PID parsing" in the test-launch case.
    pub test_host_timeout: Duration,
    /// §5: "attempt clean stop, if unresponsive within ≈5 seconds kill".
    pub disconnect_kill_grace: Duration,
    pub first_chance_exceptions_default: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            shim_path: None,
            pause_timeout: Duration::from_secs(2),
            test_host_timeout: Duration::from_secs(25),
            disconnect_kill_grace: Duration::from_secs(5),
            first_chance_exceptions_default: false,
        }
    }
}

impl Config {
    /// Load `netdbg.toml` from `path` if it exists, then apply `NETDBG_*`
    /// environment overrides on top.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut cfg = if path.exists() {
            let text = std::fs::read_to_string(path)?;
            toml::from_str(&text)?
        } else {
            Config::default()
        };
        cfg.apply_env();
        Ok(cfg)
    }

    pub fn from_env() -> Self {
        let mut cfg = Config::default();
        cfg.apply_env();
        cfg
    }

    fn apply_env(&mut self) {
        if let Ok(p) = std::env::var(ENV_SHIM_PATH) {
            self.shim_path = Some(PathBuf::from(p));
        }
        if let Ok(ms) = std::env::var(ENV_PAUSE_TIMEOUT_MS) {
            if let Ok(ms) = ms.parse::<u64>() {
                self.pause_timeout = Duration::from_millis(ms);
            }
        }
        if let Ok(s) = std::env::var(ENV_TEST_HOST_TIMEOUT_S) {
            if let Ok(s) = s.parse::<u64>() {
                self.test_host_timeout = Duration::from_secs(s);
            }
        }
        if let Ok(s) = std::env::var(ENV_DISCONNECT_KILL_GRACE_S) {
            if let Ok(s) = s.parse::<u64>() {
                self.disconnect_kill_grace = Duration::from_secs(s);
            }
        }
        if let Ok(v) = std::env::var(ENV_FIRST_CHANCE_EXCEPTIONS) {
            self.first_chance_exceptions_default = matches!(v.as_str(), "1" | "true" | "yes");
        }
    }

    /// Resolve the path to the native loader shim, honoring explicit
    /// config/env first, then probing well-known .NET install roots
    /// (SPEC_FULL §4.A expansion).
    pub fn resolve_shim_path(&self) -> Option<PathBuf> {
        if let Some(p) = &self.shim_path {
            return Some(p.clone());
        }
        for root in DEFAULT_DOTNET_ROOTS {
            let candidate = probe_shared_runtime(Path::new(root));
            if let Some(p) = candidate {
                return Some(p);
            }
        }
        if let Ok(home) = std::env::var("HOME") {
            let candidate = probe_shared_runtime(Path::new(&home).join(".dotnet").as_path());
            if candidate.is_some() {
                return candidate;
            }
        }
        None
    }
}

fn probe_shared_runtime(root: &Path) -> Option<PathBuf> {
    let shared = root.join("shared").join("Microsoft.NETCore.App");
    let mut versions: Vec<_> = std::fs::read_dir(&shared).ok()?.filter_map(|e| e.ok()).collect();
    versions.sort_by_key(|e| e.file_name());
    for entry in versions.into_iter().rev() {
        let candidate = entry.path().join("libdbgshim.so");
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}
