//! Agent state transitions.
//!
//! Every mutation of an [`Agent`] goes through here. Each method runs to
//! completion without suspending, so a caller holding the registry lock
//! always leaves the agent in a consistent state.
//!
//! ```text
//!   idle ──start──▶ running ──approval text──▶ waiting ──approve──▶ running
//!    ▲                 │  ╲                       │
//!    │                 │   ╲─clean exit──▶ idle   │
//!    └──────stop───────┴──── abnormal exit ──▶ error ──start──▶ running
//! ```

use chrono::Utc;

use crate::agents::agent::{ActiveRun, Agent, AgentStatus};
use crate::agents::parser::OutputRecord;
use crate::error::{LaunchError, SupervisorError};
use crate::process::AgentExit;

/// Phase description shown while an approval is pending.
pub const AWAITING_APPROVAL: &str = "Awaiting approval";

impl Agent {
    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub(crate) fn push_log(&mut self, line: String) {
        self.logs.push(line);
        self.touch();
    }

    pub(crate) fn assign_work(&mut self, work_key: String) {
        self.work_key = Some(work_key);
        self.touch();
    }

    /// Preconditions for a fresh run. Returns the bound work key.
    pub(crate) fn check_startable(&self) -> Result<String, SupervisorError> {
        if self.active.is_some() {
            return Err(SupervisorError::AlreadyRunning(self.id.clone()));
        }
        self.work_key
            .clone()
            .ok_or_else(|| SupervisorError::NoWorkAssigned(self.id.clone()))
    }

    /// Preconditions for a resumed run. Returns the session to resume.
    pub(crate) fn check_resumable(&self) -> Result<String, SupervisorError> {
        if self.active.is_some() {
            return Err(SupervisorError::AlreadyRunning(self.id.clone()));
        }
        self.session_id
            .clone()
            .ok_or_else(|| SupervisorError::MissingSessionId(self.id.clone()))
    }

    fn clear_approval(&mut self) {
        self.awaiting_approval = false;
        self.phase_description = None;
    }

    /// Prepare for a launch: clears any pending approval. A fresh run also
    /// forgets the previous session; a resume keeps it.
    pub(crate) fn prepare_run(&mut self, resume: bool) {
        self.clear_approval();
        if !resume {
            self.session_id = None;
        }
        self.touch();
    }

    /// Attach a freshly launched process.
    pub(crate) fn begin_run(&mut self, active: ActiveRun) {
        let pid = active.handle.pid();
        self.active = Some(active);
        self.status = AgentStatus::Running;
        self.clear_approval();
        self.push_log(format!(
            "[{}] Agent started (pid: {})",
            Utc::now().to_rfc3339(),
            pid.map_or_else(|| "unknown".to_string(), |p| p.to_string())
        ));
    }

    /// Neither launch mode produced a process.
    pub(crate) fn fail_launch(&mut self, err: &LaunchError) {
        self.active = None;
        self.status = AgentStatus::Error;
        self.clear_approval();
        self.push_log(format!("ERROR: Failed to start agent: {err}"));
    }

    /// Apply the state changes a decoded line implies. Returns true if
    /// anything changed.
    pub(crate) fn apply_record(&mut self, record: &OutputRecord) -> bool {
        let mut changed = false;

        if let Some(sid) = record.session_id() {
            if self.session_id.as_deref() != Some(sid) {
                self.session_id = Some(sid.to_string());
                changed = true;
            }
        }

        if record.requests_approval() && !self.awaiting_approval {
            self.awaiting_approval = true;
            self.status = AgentStatus::Waiting;
            self.phase_description = Some(AWAITING_APPROVAL.to_string());
            changed = true;
        }

        if changed {
            self.touch();
        }
        changed
    }

    /// Resolve a process exit. Detaches the handle and logs a summary.
    pub(crate) fn resolve_exit(&mut self, exit: &AgentExit) {
        self.active = None;

        let clean = exit.is_clean();
        self.status = match (clean, self.awaiting_approval) {
            (true, true) => AgentStatus::Waiting,
            (true, false) => AgentStatus::Idle,
            (false, _) => AgentStatus::Error,
        };
        if !clean {
            self.clear_approval();
        }

        let mut line = format!("Process exited with code {}", exit.code_label());
        if let Some(ref signal) = exit.signal {
            line.push_str(&format!(", signal {signal}"));
        }
        if clean {
            line.push_str(if self.awaiting_approval {
                " — awaiting approval."
            } else {
                " — agent stopped."
            });
        }
        self.push_log(line);
    }

    /// Detach the current process (if any) and return to idle. The caller
    /// is responsible for signalling the returned run.
    pub(crate) fn stop(&mut self) -> Option<ActiveRun> {
        let detached = self.active.take();
        self.status = AgentStatus::Idle;
        self.clear_approval();
        self.touch();
        detached
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::agent::AgentId;
    use crate::agents::parser::decode_line;
    use crate::process::testing::FakeProcess;
    use crate::process::{ExitSignal, RunId};

    fn agent_with_work() -> Agent {
        Agent::new(AgentId::from("agent-1"), Some("X-1".to_string()))
    }

    fn running_agent() -> Agent {
        let mut agent = agent_with_work();
        agent.begin_run(ActiveRun {
            run: RunId(1),
            handle: Box::new(FakeProcess::new(Some(4242))),
        });
        agent
    }

    fn exit_code(code: i32) -> AgentExit {
        AgentExit {
            code: Some(code),
            signal: None,
        }
    }

    mod preconditions {
        use super::*;

        #[test]
        fn start_requires_work_key() {
            let agent = Agent::new(AgentId::from("agent-1"), None);
            assert!(matches!(
                agent.check_startable(),
                Err(SupervisorError::NoWorkAssigned(_))
            ));
            assert_eq!(agent.status(), AgentStatus::Idle);
        }

        #[test]
        fn start_rejected_while_process_attached() {
            let agent = running_agent();
            assert!(matches!(
                agent.check_startable(),
                Err(SupervisorError::AlreadyRunning(_))
            ));
            assert!(agent.has_process());
        }

        #[test]
        fn resume_requires_session_id() {
            let agent = agent_with_work();
            assert!(matches!(
                agent.check_resumable(),
                Err(SupervisorError::MissingSessionId(_))
            ));
        }

        #[test]
        fn resume_returns_session() {
            let mut agent = agent_with_work();
            agent.session_id = Some("sess-1".into());
            assert_eq!(agent.check_resumable().unwrap(), "sess-1");
        }
    }

    mod runs {
        use super::*;

        #[test]
        fn begin_run_sets_running_and_logs_pid() {
            let agent = running_agent();
            assert_eq!(agent.status(), AgentStatus::Running);
            assert!(!agent.awaiting_approval());
            assert!(agent.has_process());
            assert!(agent.logs().last().unwrap().ends_with("Agent started (pid: 4242)"));
        }

        #[test]
        fn unknown_pid_is_marked() {
            let mut agent = agent_with_work();
            agent.begin_run(ActiveRun {
                run: RunId(1),
                handle: Box::new(FakeProcess::new(None)),
            });
            assert!(agent.logs().last().unwrap().ends_with("(pid: unknown)"));
        }

        #[test]
        fn fresh_run_forgets_session_but_resume_keeps_it() {
            let mut agent = agent_with_work();
            agent.session_id = Some("old".into());
            agent.prepare_run(true);
            assert_eq!(agent.session_id(), Some("old"));
            agent.prepare_run(false);
            assert_eq!(agent.session_id(), None);
        }

        #[test]
        fn launch_failure_marks_error() {
            let mut agent = agent_with_work();
            agent.fail_launch(&LaunchError::Spawn("No such file or directory".into()));
            assert_eq!(agent.status(), AgentStatus::Error);
            assert!(!agent.has_process());
            assert!(agent.logs().last().unwrap().starts_with("ERROR:"));
        }
    }

    mod records {
        use super::*;

        #[test]
        fn session_id_is_last_write_wins() {
            let mut agent = running_agent();
            assert!(agent.apply_record(&decode_line(r#"{"session_id":"abc123"}"#)));
            assert_eq!(agent.session_id(), Some("abc123"));
            assert!(agent.apply_record(&decode_line(r#"{"session_id":"def456"}"#)));
            assert_eq!(agent.session_id(), Some("def456"));
        }

        #[test]
        fn approval_text_enters_waiting_once() {
            let mut agent = running_agent();
            let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Status: AWAITING APPROVAL"}]}}"#;

            assert!(agent.apply_record(&decode_line(line)));
            assert_eq!(agent.status(), AgentStatus::Waiting);
            assert!(agent.awaiting_approval());
            assert_eq!(agent.phase_description(), Some(AWAITING_APPROVAL));

            let before = agent.updated_at();
            assert!(!agent.apply_record(&decode_line(line)));
            assert_eq!(agent.status(), AgentStatus::Waiting);
            assert!(agent.awaiting_approval());
            assert_eq!(agent.updated_at(), before);
        }

        #[test]
        fn unrecognized_line_changes_nothing() {
            let mut agent = running_agent();
            assert!(!agent.apply_record(&decode_line("Compiling foo v0.1.0")));
            assert_eq!(agent.status(), AgentStatus::Running);
        }
    }

    mod exits {
        use super::*;

        #[test]
        fn clean_exit_while_awaiting_approval_stays_waiting() {
            let mut agent = running_agent();
            agent.apply_record(&decode_line(r#"{"type":"result","result":"Do you approve this plan?"}"#));

            agent.resolve_exit(&exit_code(0));
            assert_eq!(agent.status(), AgentStatus::Waiting);
            assert!(agent.awaiting_approval());
            assert!(!agent.has_process());
            assert_eq!(
                agent.logs().last(),
                Some("Process exited with code 0 — awaiting approval.")
            );
        }

        #[test]
        fn clean_exit_without_approval_goes_idle() {
            let mut agent = running_agent();
            agent.resolve_exit(&exit_code(0));
            assert_eq!(agent.status(), AgentStatus::Idle);
            assert_eq!(
                agent.logs().last(),
                Some("Process exited with code 0 — agent stopped.")
            );
        }

        #[test]
        fn terminate_and_interrupt_codes_are_clean() {
            for code in [130, 143] {
                let mut agent = running_agent();
                agent.resolve_exit(&exit_code(code));
                assert_eq!(agent.status(), AgentStatus::Idle, "code {code}");
            }
        }

        #[test]
        fn terminating_signal_is_clean() {
            let mut agent = running_agent();
            agent.resolve_exit(&AgentExit {
                code: None,
                signal: Some(ExitSignal::Number(15)),
            });
            assert_eq!(agent.status(), AgentStatus::Idle);
            assert_eq!(
                agent.logs().last(),
                Some("Process exited with code none, signal 15 — agent stopped.")
            );
        }

        #[test]
        fn abnormal_exit_is_error_regardless_of_approval() {
            let mut agent = running_agent();
            agent.apply_record(&decode_line(r#"{"type":"result","result":"needs approval"}"#));

            agent.resolve_exit(&exit_code(1));
            assert_eq!(agent.status(), AgentStatus::Error);
            assert!(!agent.awaiting_approval());
            assert!(!agent.has_process());
            assert_eq!(agent.logs().last(), Some("Process exited with code 1"));
        }
    }

    mod stop {
        use super::*;

        #[test]
        fn stop_detaches_and_resets() {
            let mut agent = running_agent();
            agent.apply_record(&decode_line(r#"{"type":"result","result":"Awaiting approval"}"#));

            let detached = agent.stop();
            assert!(detached.is_some());
            assert_eq!(agent.status(), AgentStatus::Idle);
            assert!(!agent.awaiting_approval());
            assert_eq!(agent.phase_description(), None);
            assert!(!agent.has_process());
        }

        #[test]
        fn stop_without_process_still_resets() {
            let mut agent = agent_with_work();
            agent.status = AgentStatus::Error;
            assert!(agent.stop().is_none());
            assert_eq!(agent.status(), AgentStatus::Idle);
        }
    }
}
