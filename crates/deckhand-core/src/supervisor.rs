//! The agent registry and everything that drives it.
//!
//! [`AgentSupervisor`] owns every [`Agent`] behind one mutex. Each public
//! operation takes the lock, runs a lifecycle transition to completion and
//! releases it before anything slow happens: executable lookup runs before
//! the lock is taken, and sink delivery after it is released.
//!
//! Each launch gets a [`RunId`] and a forwarding thread that drains the
//! run's [`ProcessEvent`] channel. Lines are logged and forwarded in receipt
//! order; state changes they imply (session id, approval) and the final exit
//! resolution only apply while the run is still the agent's current one, so
//! a process that was stopped and replaced cannot clobber its successor.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crate::agents::agent::ActiveRun;
use crate::agents::{decode_line, Agent, AgentId, AgentView, LineSplitter};
use crate::config::SupervisorConfig;
use crate::error::SupervisorError;
use crate::logging::{self, LogHandle};
use crate::process::{
    build_args, AgentExit, LaunchRequest, Launcher, ProcessEvent, RunId, StopSignal,
    SystemLauncher,
};
use crate::shell;
use crate::sink::{self, NotificationSink};

/// Prompt for a resumed run when the approver gives none.
pub const DEFAULT_CONTINUE_MESSAGE: &str = "Approved. Please continue with the plan.";

/// How long to keep reading output that was still in flight when the exit
/// was reported.
const EXIT_DRAIN: Duration = Duration::from_millis(200);

const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn label(self) -> &'static str {
        match self {
            Stream::Stdout => "STDOUT",
            Stream::Stderr => "STDERR",
        }
    }
}

#[derive(Default)]
struct Registry {
    next_seq: u64,
    next_run: u64,
    /// Insertion order.
    agents: Vec<Agent>,
}

impl Registry {
    fn find(&self, id: &AgentId) -> Result<&Agent, SupervisorError> {
        self.agents
            .iter()
            .find(|a| a.id() == id)
            .ok_or_else(|| SupervisorError::NotFound(id.clone()))
    }

    fn find_mut(&mut self, id: &AgentId) -> Result<&mut Agent, SupervisorError> {
        self.agents
            .iter_mut()
            .find(|a| a.id() == id)
            .ok_or_else(|| SupervisorError::NotFound(id.clone()))
    }

    fn slots_in_use(&self) -> usize {
        self.agents
            .iter()
            .filter(|a| a.status().holds_slot())
            .count()
    }

    fn allocate_run(&mut self) -> RunId {
        self.next_run += 1;
        RunId(self.next_run)
    }
}

struct Inner {
    config: SupervisorConfig,
    launcher: Arc<dyn Launcher>,
    sink: Arc<dyn NotificationSink>,
    registry: Mutex<Registry>,
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, agent_id: &AgentId, line: Option<String>) {
        if let Some(line) = line {
            sink::deliver(self.sink.as_ref(), agent_id, &line);
        }
    }

    /// Log one complete output line and apply what it implies.
    fn handle_line(&self, agent_id: &AgentId, run: RunId, stream: Stream, line: String) {
        let logged = match stream {
            Stream::Stdout => line,
            Stream::Stderr => format!("ERROR: {line}"),
        };

        {
            let mut registry = self.registry();
            let Ok(agent) = registry.find_mut(agent_id) else {
                return;
            };
            if stream == Stream::Stdout && agent.current_run() == Some(run) {
                agent.apply_record(&decode_line(&logged));
            }
            agent.push_log(logged.clone());
        }

        sink::deliver(self.sink.as_ref(), agent_id, &logged);
    }

    fn handle_exit(&self, agent_id: &AgentId, run: RunId, exit: &AgentExit) {
        let summary = {
            let mut registry = self.registry();
            let Ok(agent) = registry.find_mut(agent_id) else {
                return;
            };
            if agent.current_run() != Some(run) {
                log::debug!("Ignoring exit of stale {} for {}: {:?}", run, agent_id, exit);
                return;
            }
            agent.resolve_exit(exit);
            log::info!(
                "{} exited (code {:?}, signal {:?}), now {:?}",
                agent_id,
                exit.code,
                exit.signal,
                agent.status()
            );
            agent.logs().last().map(str::to_string)
        };
        self.notify(agent_id, summary);
    }
}

/// Per-run reader state, owned by the forwarding thread.
struct Forwarder {
    inner: Arc<Inner>,
    agent_id: AgentId,
    run: RunId,
    stdout: LineSplitter,
    stderr: LineSplitter,
    transcript: LogHandle,
}

impl Forwarder {
    fn spawn(inner: Arc<Inner>, agent_id: AgentId, run: RunId, events: Receiver<ProcessEvent>) {
        let transcript = logging::open_log_file(inner.config.log_dir.as_deref(), agent_id.as_str());
        let forwarder = Forwarder {
            inner,
            agent_id,
            run,
            stdout: LineSplitter::new(),
            stderr: LineSplitter::new(),
            transcript,
        };
        thread::spawn(move || forwarder.run(events));
    }

    fn run(mut self, events: Receiver<ProcessEvent>) {
        loop {
            match events.recv() {
                Ok(ProcessEvent::Exit(exit)) => {
                    self.drain(&events);
                    self.flush();
                    logging::log_line(&self.transcript, "EXIT", &format!("{:?}", exit));
                    self.inner.handle_exit(&self.agent_id, self.run, &exit);
                    return;
                }
                Ok(event) => self.output(event),
                Err(_) => {
                    // Every sender is gone without an exit report.
                    self.flush();
                    return;
                }
            }
        }
    }

    /// Output can still be in the pipe when the exit is reported. A
    /// descendant that keeps the pipe open and writing is cut off at the
    /// deadline.
    fn drain(&mut self, events: &Receiver<ProcessEvent>) {
        let deadline = Instant::now() + EXIT_DRAIN;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            match events.recv_timeout(remaining) {
                Ok(ProcessEvent::Exit(_)) => {}
                Ok(event) => self.output(event),
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn output(&mut self, event: ProcessEvent) {
        let (stream, lines) = match event {
            ProcessEvent::Stdout(bytes) => (Stream::Stdout, self.stdout.feed(&bytes)),
            ProcessEvent::Stderr(bytes) => (Stream::Stderr, self.stderr.feed(&bytes)),
            ProcessEvent::Exit(_) => return,
        };
        for line in lines {
            self.line(stream, line);
        }
    }

    fn flush(&mut self) {
        if let Some(line) = self.stdout.flush() {
            self.line(Stream::Stdout, line);
        }
        if let Some(line) = self.stderr.flush() {
            self.line(Stream::Stderr, line);
        }
    }

    fn line(&self, stream: Stream, line: String) {
        logging::log_line(&self.transcript, stream.label(), &line);
        self.inner.handle_line(&self.agent_id, self.run, stream, line);
    }
}

/// What a launch is for.
enum RunKind {
    Fresh,
    Resume { message: String },
}

/// In-memory registry of supervised agents.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct AgentSupervisor {
    inner: Arc<Inner>,
}

impl AgentSupervisor {
    pub fn new(
        config: SupervisorConfig,
        launcher: Arc<dyn Launcher>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                launcher,
                sink,
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    /// Supervisor that launches real processes.
    pub fn with_system_launcher(config: SupervisorConfig, sink: Arc<dyn NotificationSink>) -> Self {
        Self::new(config, Arc::new(SystemLauncher::new()), sink)
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// Create an idle agent, optionally starting it right away.
    ///
    /// Fails with [`SupervisorError::CapacityReached`] when the running and
    /// waiting agents already fill the ceiling; nothing is created then.
    /// With `auto_start`, the admission check, creation and launch happen
    /// under one registry lock, so concurrent spawns cannot overshoot.
    pub async fn spawn(
        &self,
        work_key: Option<String>,
        auto_start: bool,
    ) -> Result<AgentView, SupervisorError> {
        let program = if auto_start && work_key.is_some() {
            Some(self.resolve_program().await)
        } else {
            None
        };

        let max = self.inner.config.max_concurrent;
        let (id, view, line) = {
            let mut registry = self.inner.registry();
            if registry.slots_in_use() >= max {
                return Err(SupervisorError::CapacityReached { max });
            }
            registry.next_seq += 1;
            let agent = Agent::new(AgentId::from_seq(registry.next_seq), work_key);
            let id = agent.id().clone();
            log::info!("Created {} (work: {:?})", id, agent.work_key());
            registry.agents.push(agent);

            match program {
                Some(program) => {
                    let (view, line) =
                        self.launch_locked(&mut registry, &id, RunKind::Fresh, program)?;
                    (id, view, line)
                }
                None => {
                    let view = registry.find(&id)?.to_view();
                    (id, view, None)
                }
            }
        };

        self.inner.notify(&id, line);
        Ok(view)
    }

    pub fn get_agent(&self, id: &AgentId) -> Result<AgentView, SupervisorError> {
        self.with_agent(id, Agent::to_view)
    }

    /// All agents in creation order.
    pub fn list_agents(&self) -> Vec<AgentView> {
        self.inner
            .registry()
            .agents
            .iter()
            .map(Agent::to_view)
            .collect()
    }

    /// Read an agent under the registry lock.
    pub fn with_agent<R>(
        &self,
        id: &AgentId,
        f: impl FnOnce(&Agent) -> R,
    ) -> Result<R, SupervisorError> {
        let registry = self.inner.registry();
        registry.find(id).map(f)
    }

    pub fn logs(&self, id: &AgentId) -> Result<Vec<String>, SupervisorError> {
        self.with_agent(id, |a| a.logs().to_vec())
    }

    /// Number of agents holding an admission slot.
    pub fn active_count(&self) -> usize {
        self.inner.registry().slots_in_use()
    }

    pub fn len(&self) -> usize {
        self.inner.registry().agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rebind the work key. Does not start anything.
    pub fn assign_work(
        &self,
        id: &AgentId,
        work_key: impl Into<String>,
    ) -> Result<AgentView, SupervisorError> {
        let mut registry = self.inner.registry();
        let agent = registry.find_mut(id)?;
        agent.assign_work(work_key.into());
        Ok(agent.to_view())
    }

    /// Start a fresh run on the bound work key.
    ///
    /// Returns once the process exists. A launch failure is not an error
    /// here: the agent goes to `error` and the cause is logged.
    pub async fn start_agent(&self, id: &AgentId) -> Result<AgentView, SupervisorError> {
        self.with_agent(id, Agent::check_startable)??;
        self.launch(id, RunKind::Fresh).await
    }

    /// Resume the agent's session with `message`, or the default
    /// continuation prompt.
    pub async fn approve_and_continue(
        &self,
        id: &AgentId,
        message: Option<String>,
    ) -> Result<AgentView, SupervisorError> {
        self.with_agent(id, Agent::check_resumable)??;
        let message = message
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CONTINUE_MESSAGE.to_string());
        self.launch(id, RunKind::Resume { message }).await
    }

    async fn resolve_program(&self) -> String {
        let config = &self.inner.config;
        shell::resolve_executable(&config.cli_path, config.resolve_timeout).await
    }

    async fn launch(&self, id: &AgentId, kind: RunKind) -> Result<AgentView, SupervisorError> {
        let program = self.resolve_program().await;
        let (view, line) = {
            let mut registry = self.inner.registry();
            self.launch_locked(&mut registry, id, kind, program)?
        };

        self.inner.notify(id, line);
        Ok(view)
    }

    /// Start a run while the caller holds the registry lock.
    ///
    /// Returns the agent's view and the log line to deliver once the lock is
    /// released.
    fn launch_locked(
        &self,
        registry: &mut Registry,
        id: &AgentId,
        kind: RunKind,
        program: String,
    ) -> Result<(AgentView, Option<String>), SupervisorError> {
        let config = &self.inner.config;
        let run = registry.allocate_run();
        let agent = registry.find_mut(id)?;

        // The caller's precondition check could have raced another caller.
        let (resume, prompt) = match kind {
            RunKind::Fresh => (None, format!("work on {}", agent.check_startable()?)),
            RunKind::Resume { message } => (Some(agent.check_resumable()?), message),
        };
        agent.prepare_run(resume.is_some());

        let request = LaunchRequest {
            program,
            args: build_args(&config.add_dirs, resume.as_deref(), &prompt),
            working_dir: config.working_dir.clone(),
            use_pty: config.use_pty,
            pty_geometry: config.pty_geometry,
        };

        let (events_tx, events_rx) = mpsc::channel();
        match self.inner.launcher.launch(&request, events_tx) {
            Ok(handle) => {
                log::info!(
                    "Started {} ({}, {:?}, pid {:?}){}",
                    id,
                    run,
                    handle.mode(),
                    handle.pid(),
                    if resume.is_some() { " resuming session" } else { "" }
                );
                agent.begin_run(ActiveRun { run, handle });
                Forwarder::spawn(Arc::clone(&self.inner), id.clone(), run, events_rx);
            }
            Err(e) => {
                log::error!("Failed to start {}: {}", id, e);
                agent.fail_launch(&e);
            }
        }
        Ok((agent.to_view(), agent.logs().last().map(str::to_string)))
    }

    /// Detach the process and return the agent to idle.
    ///
    /// The process is sent SIGTERM and not waited for; its eventual exit is
    /// ignored.
    pub fn stop_agent(&self, id: &AgentId) -> Result<AgentView, SupervisorError> {
        let (view, detached) = {
            let mut registry = self.inner.registry();
            let agent = registry.find_mut(id)?;
            let detached = agent.stop();
            (agent.to_view(), detached)
        };

        if let Some(mut active) = detached {
            log::info!("Stopping {} ({}, pid {:?})", id, active.run, active.handle.pid());
            active.handle.kill(StopSignal::Terminate);
        }
        Ok(view)
    }

    /// Stop every agent that has a process.
    ///
    /// Each process gets SIGTERM; whatever has not exited after the
    /// configured grace period gets SIGKILL. Safe to call more than once.
    pub async fn shutdown(&self) {
        let mut detached: Vec<(AgentId, ActiveRun)> = {
            let mut registry = self.inner.registry();
            registry
                .agents
                .iter_mut()
                .filter(|agent| agent.has_process())
                .filter_map(|agent| agent.stop().map(|run| (agent.id().clone(), run)))
                .collect()
        };
        if detached.is_empty() {
            return;
        }

        log::info!("Shutting down {} agent process(es)", detached.len());
        for (_, active) in detached.iter_mut() {
            active.handle.kill(StopSignal::Terminate);
        }

        let deadline = Instant::now() + self.inner.config.stop_grace;
        while Instant::now() < deadline
            && detached
                .iter()
                .any(|(_, active)| active.handle.exit_status().is_none())
        {
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }

        for (id, active) in detached.iter_mut() {
            if active.handle.exit_status().is_none() {
                log::warn!(
                    "{} (pid {:?}) ignored SIGTERM, killing",
                    id,
                    active.handle.pid()
                );
                active.handle.kill(StopSignal::Kill);
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
