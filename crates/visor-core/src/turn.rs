use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::errors::BridgeError;

/// Fired once if a turn is still unresolved at the soft timeout, so the
/// caller can show a "still waiting" hint without the turn resolving.
pub type WaitingSignal = oneshot::Sender<()>;

/// The seam between turn producers (orchestrator, input batcher) and the
/// gateway transport. Producers depend on this trait so they can be tested
/// against a scripted implementation.
#[async_trait]
pub trait TurnPort: Send + Sync {
    /// Submit one conversational turn and wait for its outcome. Never
    /// fails: disconnection, timeouts, and declined replies all come back
    /// as text (possibly empty) for classification by the caller.
    async fn submit_turn(&self, message: String, waiting: Option<WaitingSignal>) -> String;

    /// Fire a backend control message with no reply expected.
    async fn send_command(&self, message: String) -> Result<(), BridgeError>;

    /// Resolve every outstanding turn with empty text. Returns how many
    /// were resolved.
    async fn cancel_all(&self) -> usize;

    fn is_connected(&self) -> bool;
}
