//! # deckhand-core
//!
//! Supervision of coding-assistant CLI processes.
//!
//! An [`AgentSupervisor`] keeps every agent in memory, admits new runs up to
//! a concurrency ceiling, launches the CLI on a pseudo-terminal (or plain
//! pipes), interprets its stream-json output and resolves its exit. Every
//! raw output line is handed to a [`NotificationSink`]; the [`EventBus`]
//! is the sink the HTTP layer uses.
//!
//! ## Key Concepts
//!
//! - **Agent**: one supervised CLI process slot, bound to at most one work key
//! - **Run**: one launch of an agent's process; only the current run may
//!   change the agent's state
//! - **Approval gate**: the `waiting` status, entered when the assistant asks
//!   for a human decision

pub mod agents;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod logging;
pub mod process;
pub mod shell;
pub mod sink;
pub mod supervisor;

pub use agents::{AgentId, AgentStatus, AgentView};
pub use config::SupervisorConfig;
pub use error::{LaunchError, SupervisorError};
pub use event_bus::{BroadcastEvent, EventBus};
pub use process::{Launcher, SystemLauncher};
pub use sink::{NoopSink, NotificationSink};
pub use supervisor::{AgentSupervisor, DEFAULT_CONTINUE_MESSAGE};
