//! Error taxonomy for the realtime core
//!
//! Four failure classes with distinct propagation rules:
//! - handshake rejection is fatal and surfaced, never auto-retried
//! - transport drops feed the reconnect state machine only
//! - parse failures are isolated per frame, the connection stays up
//! - sends while disconnected are always reported to the caller

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Credential or identity rejected during the connect handshake.
    #[error("handshake rejected: {0}")]
    Handshake(String),

    /// Unexpected transport failure; drives the backoff loop.
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// A single inbound frame failed classification/decoding. The frame is
    /// dropped and logged; the connection is unaffected.
    #[error("unclassifiable frame on topic {topic}: {source}")]
    Parse {
        topic: String,
        #[source]
        source: serde_json::Error,
    },

    /// Outbound action attempted while the link is not connected.
    #[error("cannot {action}: not connected")]
    SendWithoutConnection { action: &'static str },

    /// History fetch failed; existing state is left untouched.
    #[error("history fetch failed: {0}")]
    History(#[from] reqwest::Error),
}

impl RealtimeError {
    /// Whether the reconnect loop may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}
