use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use visor_core::ids::SessionId;
use visor_display::DisplayArbiter;

#[derive(Clone, Copy, Debug, Default)]
struct Modes {
    listening: bool,
    copilot: bool,
}

/// One connected device session: its display arbiter and mutable mode
/// flags.
pub struct BridgeSession {
    pub id: SessionId,
    pub display: DisplayArbiter,
    modes: Mutex<Modes>,
}

impl BridgeSession {
    pub fn new(id: SessionId, display: DisplayArbiter) -> Self {
        Self {
            id,
            display,
            modes: Mutex::new(Modes::default()),
        }
    }

    pub fn listening(&self) -> bool {
        self.modes.lock().listening
    }

    pub fn copilot(&self) -> bool {
        self.modes.lock().copilot
    }

    pub fn set_listening(&self, on: bool) {
        self.modes.lock().listening = on;
    }

    /// Flip the mic flag; returns the new value.
    pub fn toggle_listening(&self) -> bool {
        let mut modes = self.modes.lock();
        modes.listening = !modes.listening;
        modes.listening
    }

    /// Flip copilot mode; returns the new value.
    pub fn toggle_copilot(&self) -> bool {
        let mut modes = self.modes.lock();
        modes.copilot = !modes.copilot;
        modes.copilot
    }

    /// Dashboard summary line for the current mode.
    pub fn dashboard_line(&self) -> &'static str {
        let modes = self.modes.lock();
        if modes.copilot {
            "Visor: Copilot"
        } else if modes.listening {
            "Visor: Listening..."
        } else {
            "Visor: Ready"
        }
    }
}

/// Registry of active device sessions.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<BridgeSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: Arc<BridgeSession>) {
        tracing::info!(session_id = %session.id, "session registered");
        self.sessions.insert(session.id.clone(), session);
    }

    pub fn unregister(&self, id: &SessionId) {
        if self.sessions.remove(id).is_some() {
            tracing::info!(session_id = %id, "session removed");
        }
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<BridgeSession>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().to_string()).collect()
    }

    pub fn all(&self) -> Vec<Arc<BridgeSession>> {
        self.sessions.iter().map(|e| Arc::clone(e.value())).collect()
    }
}
