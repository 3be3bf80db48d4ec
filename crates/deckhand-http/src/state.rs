//! Shared state for the HTTP handlers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use deckhand_core::{AgentSupervisor, EventBus};

/// State available to every handler.
pub struct AppState {
    pub supervisor: AgentSupervisor,
    /// Bus the supervisor's log lines go to; handlers publish state events here.
    pub event_bus: Arc<EventBus>,
    ws_clients: AtomicUsize,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(supervisor: AgentSupervisor, event_bus: Arc<EventBus>) -> Self {
        Self {
            supervisor,
            event_bus,
            ws_clients: AtomicUsize::new(0),
        }
    }

    pub fn ws_client_count(&self) -> usize {
        self.ws_clients.load(Ordering::Relaxed)
    }

    /// Count a WebSocket client for as long as the guard lives.
    pub(crate) fn track_ws_client(self: &Arc<Self>) -> WsClientGuard {
        self.ws_clients.fetch_add(1, Ordering::Relaxed);
        WsClientGuard {
            state: Arc::clone(self),
        }
    }
}

pub(crate) struct WsClientGuard {
    state: SharedState,
}

impl Drop for WsClientGuard {
    fn drop(&mut self) {
        self.state.ws_clients.fetch_sub(1, Ordering::Relaxed);
    }
}
