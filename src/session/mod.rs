//! Session orchestration: lifecycle, component wiring, and the pipeline
//! tasks for the host and viewer endpoints.

pub mod clipboard;
pub mod host;
pub mod input;
pub mod viewer;


use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::media::Codec;
use crate::p2p::Candidate;

pub use clipboard::ClipboardSync;
pub use host::{HostConfig, HostSession, HostStats};
pub use input::{InputSender, InputSink};
pub use viewer::{QualityPreset, ViewerConfig, ViewerSession};

/// Session lifecycle states.
///
/// Outside `Streaming`, no worker task holds a reference to any
/// releasable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Prepared,
    Connecting,
    Streaming,
    Stopping,
}

/// Resolved peer addressing for `start`: where to send, and optionally a
/// fixed local bind (tests, multi-homed hosts). The remote address comes
/// from the signaling/ICE layer.
#[derive(Debug, Clone, Copy)]
pub struct PeerInfo {
    pub remote: SocketAddr,
    pub local_bind: Option<SocketAddr>,
}

impl PeerInfo {
    pub fn new(remote: SocketAddr) -> Self {
        PeerInfo {
            remote,
            local_bind: None,
        }
    }
}

/// Everything one side publishes through signaling after `prepare`:
/// identity, DTLS fingerprint, and the gathered candidates. The core
/// produces and consumes this; transporting it is the embedder's job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub session_id: String,
    pub dtls_fingerprint: String,
    pub candidates: Vec<Candidate>,
    pub codec: Codec,
}

impl SessionDescriptor {
    /// JSON form for the signaling channel.
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> anyhow::Result<SessionDescriptor> {
        Ok(serde_json::from_str(json)?)
    }
}
