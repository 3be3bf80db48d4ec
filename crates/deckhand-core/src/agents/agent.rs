//! The Agent record and its external view.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::process::{ProcessHandle, RunId};

/// Maximum number of raw output lines kept per agent.
pub const LOG_CAPACITY: usize = 1000;

/// Stable agent identifier (`agent-<n>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub(crate) fn from_seq(seq: u64) -> Self {
        Self(format!("agent-{seq}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Running,
    Waiting,
    Error,
}

impl AgentStatus {
    /// Whether an agent in this status occupies an admission slot.
    pub fn holds_slot(self) -> bool {
        matches!(self, AgentStatus::Running | AgentStatus::Waiting)
    }
}

/// Ring buffer of raw output lines, oldest evicted first.
#[derive(Debug, Clone, Default)]
pub struct LogBuffer {
    lines: VecDeque<String>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == LOG_CAPACITY {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn last(&self) -> Option<&str> {
        self.lines.back().map(String::as_str)
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

/// The process currently attached to an agent, tagged with its run.
pub(crate) struct ActiveRun {
    pub run: RunId,
    pub handle: Box<dyn ProcessHandle>,
}

/// A supervised agent.
///
/// The process handle is private to the crate: callers only ever see an
/// [`AgentView`].
pub struct Agent {
    pub(crate) id: AgentId,
    pub(crate) status: AgentStatus,
    pub(crate) work_key: Option<String>,
    pub(crate) session_id: Option<String>,
    pub(crate) awaiting_approval: bool,
    pub(crate) phase_description: Option<String>,
    pub(crate) active: Option<ActiveRun>,
    pub(crate) logs: LogBuffer,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
}

impl Agent {
    pub(crate) fn new(id: AgentId, work_key: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: AgentStatus::Idle,
            work_key,
            session_id: None,
            awaiting_approval: false,
            phase_description: None,
            active: None,
            logs: LogBuffer::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn status(&self) -> AgentStatus {
        self.status
    }

    pub fn work_key(&self) -> Option<&str> {
        self.work_key.as_deref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn awaiting_approval(&self) -> bool {
        self.awaiting_approval
    }

    pub fn phase_description(&self) -> Option<&str> {
        self.phase_description.as_deref()
    }

    pub fn logs(&self) -> &LogBuffer {
        &self.logs
    }

    pub fn has_process(&self) -> bool {
        self.active.is_some()
    }

    pub(crate) fn current_run(&self) -> Option<RunId> {
        self.active.as_ref().map(|a| a.run)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Snapshot for callers and the broadcast layer.
    pub fn to_view(&self) -> AgentView {
        let handle = self.active.as_ref().map(|a| &a.handle);
        AgentView {
            id: self.id.clone(),
            status: self.status,
            work_key: self.work_key.clone(),
            session_id: self.session_id.clone(),
            awaiting_approval: self.awaiting_approval,
            phase_description: self.phase_description.clone(),
            process_alive: handle.is_some_and(|h| h.is_alive()),
            pid: handle.and_then(|h| h.pid()),
            logs: self.logs.to_vec(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("work_key", &self.work_key)
            .field("session_id", &self.session_id)
            .field("awaiting_approval", &self.awaiting_approval)
            .field("run", &self.current_run())
            .field("logs", &self.logs.len())
            .finish()
    }
}

/// Serializable view of an agent. Never carries the process handle; exposes
/// `processAlive` and `pid` instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentView {
    pub id: AgentId,
    pub status: AgentStatus,
    #[serde(rename = "issueKey")]
    pub work_key: Option<String>,
    pub session_id: Option<String>,
    pub awaiting_approval: bool,
    pub phase_description: Option<String>,
    /// Goes false as soon as the process has exited or been signalled. The
    /// status follows once the remaining output is drained, up to 200ms
    /// later, so check `status` before acting on a finished run.
    pub process_alive: bool,
    pub pid: Option<u32>,
    pub logs: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
