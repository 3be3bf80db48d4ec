//! Delivery of raw output lines to whoever is listening.

use std::panic::{self, AssertUnwindSafe};

use crate::agents::AgentId;

/// Receives every raw output line of every agent, in receipt order per agent.
///
/// Called from the per-run forwarding thread after the line's state change
/// (if any) has been applied. Implementations must not block for long.
pub trait NotificationSink: Send + Sync {
    fn on_log_line(&self, agent_id: &AgentId, line: &str);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl NotificationSink for NoopSink {
    fn on_log_line(&self, _agent_id: &AgentId, _line: &str) {}
}

/// Invoke the sink, swallowing a panic so it cannot take the forwarder down.
pub(crate) fn deliver(sink: &dyn NotificationSink, agent_id: &AgentId, line: &str) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| sink.on_log_line(agent_id, line)));
    if result.is_err() {
        log::warn!("Notification sink panicked on a line from {}", agent_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Panicking;

    impl NotificationSink for Panicking {
        fn on_log_line(&self, _agent_id: &AgentId, _line: &str) {
            panic!("subscriber exploded");
        }
    }

    #[derive(Default)]
    struct Capture(Mutex<Vec<String>>);

    impl NotificationSink for Capture {
        fn on_log_line(&self, agent_id: &AgentId, line: &str) {
            self.0.lock().unwrap().push(format!("{agent_id}: {line}"));
        }
    }

    #[test]
    fn panicking_sink_is_contained() {
        deliver(&Panicking, &AgentId::from("agent-1"), "hello");
    }

    #[test]
    fn lines_reach_the_sink() {
        let sink = Capture::default();
        deliver(&sink, &AgentId::from("agent-2"), "one");
        deliver(&sink, &AgentId::from("agent-2"), "two");
        assert_eq!(*sink.0.lock().unwrap(), vec!["agent-2: one", "agent-2: two"]);
    }

    #[test]
    fn noop_accepts_anything() {
        NoopSink.on_log_line(&AgentId::from("agent-1"), "ignored");
    }
}
