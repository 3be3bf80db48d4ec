//! Error types for supervision operations.
//!
//! `SupervisorError` covers the synchronous rejections: the call fails before
//! any agent state is touched. `LaunchError` never reaches the caller of
//! `start_agent`; it is folded into the agent's `error` status instead.

use thiserror::Error;

use crate::agents::AgentId;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Agent not found: {0}")]
    NotFound(AgentId),

    #[error("Max concurrent agents reached ({max})")]
    CapacityReached { max: usize },

    #[error("Agent {0} is already running")]
    AlreadyRunning(AgentId),

    #[error("Cannot start agent {0} without assigned work")]
    NoWorkAssigned(AgentId),

    #[error("Agent {0} has no session id to resume")]
    MissingSessionId(AgentId),
}

impl SupervisorError {
    /// True for the unknown-agent case, which the route layer reports as 404.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SupervisorError::NotFound(_))
    }
}

/// Failure to bring up a child process in either launch mode.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Failed to open PTY: {0}")]
    Pty(String),

    #[error("Failed to spawn: {0}")]
    Spawn(String),
}
