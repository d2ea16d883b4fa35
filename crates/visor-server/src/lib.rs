//! Session wiring and the outward control plane: the per-session
//! orchestrator that connects device events to the transport and the
//! display, plus the HTTP surface for external triggering.

pub mod http;
pub mod orchestrator;
pub mod sessions;

use std::sync::Arc;

use tokio::sync::mpsc;

use visor_core::device::DeviceEvent;
use visor_core::ids::SessionId;
use visor_core::turn::TurnPort;
use visor_display::{ArbiterConfig, DisplayArbiter, DisplaySurface};

pub use http::{start_control_plane, ControlPlaneConfig, ControlPlaneHandle};
pub use orchestrator::{OrchestratorConfig, SessionOrchestrator};
pub use sessions::{BridgeSession, SessionRegistry};

/// A session attached by the device SDK integration.
pub struct AttachedSession {
    pub session: Arc<BridgeSession>,
    /// Where the SDK glue delivers transcription, head, and
    /// notification events.
    pub events: mpsc::Sender<DeviceEvent>,
    registry: Arc<SessionRegistry>,
    handle: orchestrator::OrchestratorHandle,
}

impl AttachedSession {
    /// Tear the session down (device disconnected).
    pub fn detach(self) {
        self.handle.abort();
        self.registry.unregister(&self.session.id);
    }
}

/// Entry point for the device SDK collaborator: wire a new device
/// session into the bridge. The SDK supplies the rendering surface and
/// feeds `DeviceEvent`s into the returned channel.
pub fn attach_session(
    registry: &Arc<SessionRegistry>,
    surface: Arc<dyn DisplaySurface>,
    port: Arc<dyn TurnPort>,
    arbiter_config: ArbiterConfig,
    orchestrator_config: OrchestratorConfig,
) -> AttachedSession {
    let display = DisplayArbiter::new(surface, arbiter_config);
    let session = Arc::new(BridgeSession::new(SessionId::new(), display));
    registry.register(Arc::clone(&session));

    let (events_tx, events_rx) = mpsc::channel(64);
    let handle = SessionOrchestrator::start(
        Arc::clone(&session),
        port,
        orchestrator_config,
        events_rx,
    );

    AttachedSession {
        session,
        events: events_tx,
        registry: Arc::clone(registry),
        handle,
    }
}
