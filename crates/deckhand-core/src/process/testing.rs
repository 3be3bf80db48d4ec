//! In-memory launcher for exercising the supervisor without real processes.
//!
//! Enabled for this crate's tests and, through the `test-support` feature,
//! for downstream crates.

use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    AgentExit, EventSender, ExitSignal, ExitTracker, LaunchMode, LaunchRequest, Launcher,
    ProcessEvent, ProcessHandle, StopSignal,
};
use crate::error::LaunchError;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// A process handle with no process behind it.
///
/// Signals are recorded. When wired to an event channel, a signal the fake
/// obeys also produces the matching [`ProcessEvent::Exit`].
pub struct FakeProcess {
    pid: Option<u32>,
    tracker: ExitTracker,
    signals: Arc<Mutex<Vec<StopSignal>>>,
    events: Option<EventSender>,
    ignore_terminate: bool,
}

impl FakeProcess {
    pub fn new(pid: Option<u32>) -> Self {
        Self {
            pid,
            tracker: ExitTracker::new(),
            signals: Arc::default(),
            events: None,
            ignore_terminate: false,
        }
    }
}

impl ProcessHandle for FakeProcess {
    fn mode(&self) -> LaunchMode {
        LaunchMode::Piped
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn kill(&mut self, signal: StopSignal) {
        self.tracker.mark_killed();
        lock(&self.signals).push(signal);

        if self.tracker.exit().is_some() {
            return;
        }
        let number = match signal {
            StopSignal::Terminate if self.ignore_terminate => return,
            StopSignal::Terminate => 15,
            StopSignal::Kill => 9,
        };
        let exit = AgentExit {
            code: None,
            signal: Some(ExitSignal::Number(number)),
        };
        self.tracker.record_exit(exit.clone());
        if let Some(ref events) = self.events {
            let _ = events.send(ProcessEvent::Exit(exit));
        }
    }

    fn exit_status(&self) -> Option<AgentExit> {
        self.tracker.exit()
    }

    fn is_killed(&self) -> bool {
        self.tracker.killed()
    }
}

/// Test-side view of one fake launch.
#[derive(Clone)]
pub struct FakeRun {
    pub request: LaunchRequest,
    events: EventSender,
    tracker: ExitTracker,
    signals: Arc<Mutex<Vec<StopSignal>>>,
}

impl FakeRun {
    /// Emit raw stdout bytes, as a reader thread would.
    pub fn stdout(&self, text: &str) {
        let _ = self.events.send(ProcessEvent::Stdout(text.as_bytes().to_vec()));
    }

    pub fn stderr(&self, text: &str) {
        let _ = self.events.send(ProcessEvent::Stderr(text.as_bytes().to_vec()));
    }

    /// End the process with the given status.
    pub fn exit(&self, exit: AgentExit) {
        self.tracker.record_exit(exit.clone());
        let _ = self.events.send(ProcessEvent::Exit(exit));
    }

    pub fn exit_code(&self, code: i32) {
        self.exit(AgentExit::with_code(code));
    }

    /// Signals delivered to this run, in order.
    pub fn signals(&self) -> Vec<StopSignal> {
        lock(&self.signals).clone()
    }
}

#[derive(Default)]
struct FakeState {
    runs: Vec<FakeRun>,
    fail_with: Option<String>,
    ignore_terminate: bool,
}

/// A [`Launcher`] that hands out [`FakeProcess`]es.
///
/// Clones share state, so a test can keep one while the supervisor owns
/// another.
#[derive(Clone, Default)]
pub struct FakeLauncher {
    state: Arc<Mutex<FakeState>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following launch fail with this message.
    pub fn fail_with(&self, message: impl Into<String>) {
        lock(&self.state).fail_with = Some(message.into());
    }

    pub fn succeed(&self) {
        lock(&self.state).fail_with = None;
    }

    /// Processes launched from now on survive SIGTERM and only die on SIGKILL.
    pub fn ignore_terminate(&self) {
        lock(&self.state).ignore_terminate = true;
    }

    pub fn launches(&self) -> usize {
        lock(&self.state).runs.len()
    }

    pub fn run(&self, index: usize) -> Option<FakeRun> {
        lock(&self.state).runs.get(index).cloned()
    }

    pub fn last_run(&self) -> Option<FakeRun> {
        lock(&self.state).runs.last().cloned()
    }
}

impl Launcher for FakeLauncher {
    fn launch(
        &self,
        request: &LaunchRequest,
        events: EventSender,
    ) -> Result<Box<dyn ProcessHandle>, LaunchError> {
        let mut state = lock(&self.state);
        if let Some(ref message) = state.fail_with {
            return Err(LaunchError::Spawn(message.clone()));
        }

        let pid = 10_000 + state.runs.len() as u32;
        let process = FakeProcess {
            pid: Some(pid),
            tracker: ExitTracker::new(),
            signals: Arc::default(),
            events: Some(events.clone()),
            ignore_terminate: state.ignore_terminate,
        };
        state.runs.push(FakeRun {
            request: request.clone(),
            events,
            tracker: process.tracker.clone(),
            signals: Arc::clone(&process.signals),
        });
        Ok(Box::new(process))
    }
}
