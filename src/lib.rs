//! screenlink: low-latency peer-to-peer desktop streaming core.
//!
//! A *host* captures its screen and audio, encodes them in real time, and
//! streams them to a *viewer* which decodes, renders, and forwards input
//! events back. The crate implements the transport and control core:
//!
//! - Real-time streaming pipeline with precise frame pacing (host) and a
//!   receive → reassemble → decode → render pipeline (viewer).
//! - Adaptive congestion control: AIMD bitrate, resolution/FPS ladder
//!   walking, and FEC adjustment driven by viewer feedback.
//! - Loss-resilient UDP transport: MTU fragmentation, selective
//!   retransmission (NACK), XOR FEC, DTLS 1.2 encryption.
//! - NAT traversal: ICE-lite gathering with STUN server-reflexive
//!   discovery and magic-probe connectivity checks.
//!
//! Platform-specific collaborators (screen/audio capture, hardware codecs,
//! rendering, input injection) are consumed through the traits in
//! [`media`]; signaling (candidate and fingerprint exchange) is left to the
//! embedding application.

pub mod error;
pub mod media;
pub mod p2p;
pub mod protocol;
pub mod qos;
pub mod session;
pub mod transport;
pub mod util;

pub use error::SessionError;
pub use session::{HostSession, SessionState, ViewerSession};
