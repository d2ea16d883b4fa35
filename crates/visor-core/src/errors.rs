use std::time::Duration;

/// Typed error hierarchy for the bridge.
/// Distinguishes failures the caller must see from failures that degrade
/// to a canned display message or get swallowed on cosmetic paths.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BridgeError {
    /// No usable connection to the gateway. Turn submission converts this
    /// into the canned offline reply instead of surfacing it.
    #[error("gateway not connected")]
    TransportUnavailable,

    /// The socket closed while requests were outstanding.
    #[error("transport closed")]
    TransportClosed,

    /// No response envelope for a request within the bound.
    #[error("request {method} timed out after {timeout:?}")]
    RequestTimeout { method: String, timeout: Duration },

    /// The gateway refused the versioned handshake.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// Malformed or unexpected envelope. The message is discarded; the
    /// connection stays up.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A rendering call failed. Swallowed for cosmetic paths (dashboard),
    /// surfaced for primary ones.
    #[error("display unavailable: {0}")]
    DisplayUnavailable(String),
}

impl BridgeError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::TransportUnavailable => "transport_unavailable",
            Self::TransportClosed => "transport_closed",
            Self::RequestTimeout { .. } => "request_timeout",
            Self::HandshakeRejected(_) => "handshake_rejected",
            Self::Protocol(_) => "protocol_error",
            Self::DisplayUnavailable(_) => "display_unavailable",
        }
    }

    /// True for errors that only mean "try again once the link is back";
    /// connection loss is never fatal to the bridge.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::TransportUnavailable | Self::TransportClosed)
    }
}
