//! Error kinds surfaced at the session boundary.
//!
//! Fatal errors during `prepare`/`start` unwind cleanly and are returned to
//! the caller. Errors during streaming are logged, counted, and recovered
//! locally where possible; user-visible failure is a single disconnect
//! notification.

use crate::media::Codec;

/// Errors reported by [`crate::HostSession`] and [`crate::ViewerSession`].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Socket creation or bind failed. Fatal to the session.
    #[error("transport bind failed: {0}")]
    TransportBindFailure(#[source] std::io::Error),

    /// No ICE candidate pair succeeded within the deadline. Fatal.
    #[error("ICE connectivity checks timed out")]
    IceTimeout,

    /// DTLS handshake errored or timed out. Fatal.
    #[error("DTLS handshake failed: {0}")]
    DtlsHandshakeFailure(String),

    /// Peer's protocol version tag was absent or different. Fatal.
    #[error("protocol version mismatch (expected CS01)")]
    ProtocolVersionMismatch,

    /// Requested codec is not advertised by the encoder hardware.
    #[error("codec not supported by encoder: {0:?}")]
    CodecUnsupported(Codec),

    /// Video capture backend failed to initialize. Fatal for video;
    /// the audio equivalent merely disables audio.
    #[error("capture initialization failed: {0}")]
    CaptureInitFailure(String),

    /// The viewer exhausted its reconnect budget.
    #[error("reconnect budget exhausted")]
    ReconnectGiveUp,

    /// Operation is not valid in the session's current state.
    #[error("invalid session state: {0}")]
    InvalidState(&'static str),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;
