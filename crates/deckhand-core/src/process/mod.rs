//! Agent process launching and handles.
//!
//! A run is started by a [`Launcher`]. The production [`SystemLauncher`]
//! tries a pseudo-terminal first and falls back to plain pipes; either way
//! the caller gets a boxed [`ProcessHandle`] and receives output and exit
//! as [`ProcessEvent`]s on the channel it handed in.
//!
//! Background threads own the reading side; the handle only carries what is
//! needed to signal the process and report whether it is still alive.

pub mod piped;
pub mod pty;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

use std::fmt;
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::config::PtyGeometry;
use crate::error::LaunchError;

/// Environment forced onto every child: no color, no output buffering.
pub(crate) const CHILD_ENV: [(&str, &str); 2] = [("FORCE_COLOR", "0"), ("PYTHONUNBUFFERED", "1")];

/// Identifies one launch of one agent. Events from a run that is no longer
/// the agent's current run are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

/// Signal that ended a process: numeric on the piped path, a name on the
/// PTY path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ExitSignal {
    Number(i32),
    Name(String),
}

impl ExitSignal {
    /// SIGTERM or SIGINT, in any of the forms the two launch modes report.
    pub fn is_stop_request(&self) -> bool {
        match self {
            ExitSignal::Number(n) => matches!(n, 2 | 15),
            ExitSignal::Name(name) => matches!(
                name.trim().to_ascii_uppercase().as_str(),
                "SIGTERM" | "SIGINT" | "TERM" | "INT" | "TERMINATED" | "INTERRUPT" | "15" | "2"
            ),
        }
    }
}

impl fmt::Display for ExitSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitSignal::Number(n) => write!(f, "{n}"),
            ExitSignal::Name(name) => f.write_str(name),
        }
    }
}

/// Exit status of an agent process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentExit {
    pub code: Option<i32>,
    pub signal: Option<ExitSignal>,
}

impl AgentExit {
    pub fn with_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    /// Exit 0, 130 (SIGINT) or 143 (SIGTERM), or death by SIGTERM/SIGINT.
    pub fn is_clean(&self) -> bool {
        matches!(self.code, Some(0 | 130 | 143))
            || self.signal.as_ref().is_some_and(ExitSignal::is_stop_request)
    }

    pub(crate) fn code_label(&self) -> String {
        self.code
            .map_or_else(|| "none".to_string(), |c| c.to_string())
    }
}

/// Output and exit notifications from a running process.
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    /// Raw bytes from stdout (or the PTY, which merges both streams).
    Stdout(Vec<u8>),
    /// Raw bytes from stderr (piped mode only).
    Stderr(Vec<u8>),
    Exit(AgentExit),
}

pub type EventSender = Sender<ProcessEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGTERM
    Terminate,
    /// SIGKILL
    Kill,
}

impl StopSignal {
    #[cfg(unix)]
    pub(crate) fn as_libc(self) -> libc::c_int {
        match self {
            StopSignal::Terminate => libc::SIGTERM,
            StopSignal::Kill => libc::SIGKILL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    Pty,
    Piped,
}

/// Capabilities of a live agent process.
pub trait ProcessHandle: Send {
    fn mode(&self) -> LaunchMode;

    fn pid(&self) -> Option<u32>;

    /// Send a signal. Best effort; never blocks waiting for the exit.
    fn kill(&mut self, signal: StopSignal);

    /// Exit recorded by the watcher thread, if the process has ended.
    fn exit_status(&self) -> Option<AgentExit>;

    /// Whether [`kill`](Self::kill) has been called.
    fn is_killed(&self) -> bool;

    fn is_alive(&self) -> bool {
        self.exit_status().is_none() && !self.is_killed()
    }
}

#[derive(Debug, Default)]
struct ExitState {
    exit: Option<AgentExit>,
    killed: bool,
}

/// Exit bookkeeping shared between a handle and its watcher thread.
#[derive(Debug, Clone, Default)]
pub struct ExitTracker {
    state: Arc<Mutex<ExitState>>,
}

impl ExitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ExitState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn record_exit(&self, exit: AgentExit) {
        self.with_state(|s| s.exit = Some(exit));
    }

    pub fn mark_killed(&self) {
        self.with_state(|s| s.killed = true);
    }

    pub fn exit(&self) -> Option<AgentExit> {
        self.with_state(|s| s.exit.clone())
    }

    pub fn killed(&self) -> bool {
        self.with_state(|s| s.killed)
    }
}

/// Everything needed to start one run.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub use_pty: bool,
    pub pty_geometry: PtyGeometry,
}

/// Build the CLI invocation.
///
/// `[--add-dir <dir>]* [--resume <session>]? -p <prompt>` followed by the
/// fixed streaming-output flags.
pub fn build_args(add_dirs: &[PathBuf], resume: Option<&str>, prompt: &str) -> Vec<String> {
    let mut args = Vec::with_capacity(add_dirs.len() * 2 + 11);

    for dir in add_dirs {
        args.push("--add-dir".to_string());
        args.push(dir.display().to_string());
    }

    if let Some(session_id) = resume {
        args.push("--resume".to_string());
        args.push(session_id.to_string());
    }

    args.extend(
        [
            "-p",
            prompt,
            "--output-format",
            "stream-json",
            "--include-partial-messages",
            "--verbose",
            "--permission-mode",
            "bypassPermissions",
        ]
        .map(str::to_string),
    );

    args
}

/// Starts agent processes.
pub trait Launcher: Send + Sync {
    fn launch(
        &self,
        request: &LaunchRequest,
        events: EventSender,
    ) -> Result<Box<dyn ProcessHandle>, LaunchError>;
}

/// PTY first, plain pipes if the PTY cannot be opened or the spawn fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

impl SystemLauncher {
    pub fn new() -> Self {
        Self
    }
}

impl Launcher for SystemLauncher {
    fn launch(
        &self,
        request: &LaunchRequest,
        events: EventSender,
    ) -> Result<Box<dyn ProcessHandle>, LaunchError> {
        if request.use_pty {
            match pty::spawn(request, events.clone()) {
                Ok(process) => return Ok(Box::new(process)),
                Err(e) => log::warn!(
                    "PTY launch of {} failed, falling back to pipes: {}",
                    request.program,
                    e
                ),
            }
        }
        let process = piped::spawn(request, events)?;
        Ok(Box::new(process))
    }
}
