//! Agent state: the record, its transitions, and output interpretation.

pub mod agent;
pub mod lifecycle;
pub mod parser;

pub use agent::{Agent, AgentId, AgentStatus, AgentView, LogBuffer, LOG_CAPACITY};
pub use lifecycle::AWAITING_APPROVAL;
pub use parser::{decode_line, LineSplitter, OutputRecord};
