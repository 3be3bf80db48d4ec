//! Supervisor configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Default ceiling on agents that are `running` or `waiting` at once.
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

/// Default executable name for the coding-assistant CLI.
pub const DEFAULT_CLI_PATH: &str = "claude";

/// Fixed pseudo-terminal geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtyGeometry {
    pub cols: u16,
    pub rows: u16,
}

impl Default for PtyGeometry {
    fn default() -> Self {
        Self { cols: 120, rows: 40 }
    }
}

/// Configuration for an [`AgentSupervisor`](crate::supervisor::AgentSupervisor).
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Admission ceiling on `running` + `waiting` agents.
    pub max_concurrent: usize,
    /// Executable for the external CLI (name or path).
    pub cli_path: String,
    /// Extra working directories, passed as `--add-dir <dir>` each.
    pub add_dirs: Vec<PathBuf>,
    /// Working directory for spawned processes; inherits ours when `None`.
    pub working_dir: Option<PathBuf>,
    /// Try a pseudo-terminal before falling back to plain pipes.
    pub use_pty: bool,
    pub pty_geometry: PtyGeometry,
    /// Upper bound on the shell lookup of `cli_path`.
    pub resolve_timeout: Duration,
    /// How long `shutdown` waits for a terminated process before SIGKILL.
    pub stop_grace: Duration,
    /// When set, raw agent output is mirrored to `<log_dir>/<agent-id>.log`.
    pub log_dir: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            cli_path: DEFAULT_CLI_PATH.to_string(),
            add_dirs: Vec::new(),
            working_dir: None,
            use_pty: true,
            pty_geometry: PtyGeometry::default(),
            resolve_timeout: Duration::from_secs(3),
            stop_grace: Duration::from_secs(5),
            log_dir: None,
        }
    }
}

impl SupervisorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn cli_path(mut self, path: impl Into<String>) -> Self {
        self.cli_path = path.into();
        self
    }

    pub fn add_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.add_dirs.push(dir.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Skip the pseudo-terminal attempt and always use piped stdio.
    pub fn no_pty(mut self) -> Self {
        self.use_pty = false;
        self
    }

    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }
}
