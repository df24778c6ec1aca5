//! Input event forwarding.
//!
//! The viewer serializes each captured event and sends it immediately as
//! a standalone datagram, no batching, for lowest latency. The host
//! decodes arriving input/controller packets and forwards them to an
//! [`InputSink`], the platform injection backend supplied by the
//! embedder.

use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;

use crate::protocol::{ControllerPacket, InputEvent};
use crate::transport::UdpTransport;

/// Host-side consumer of remote input. Implementations inject into the
/// local desktop; injection itself is out of the core's scope.
pub trait InputSink: Send + Sync {
    fn on_input(&self, event: InputEvent);
    fn on_controller(&self, state: &ControllerPacket);
}

/// Viewer-side sender.
pub struct InputSender {
    transport: Arc<UdpTransport>,
    packets_sent: AtomicU64,
    controller_seq: AtomicU16,
}

impl InputSender {
    pub fn new(transport: Arc<UdpTransport>) -> Self {
        InputSender {
            transport,
            packets_sent: AtomicU64::new(0),
            controller_seq: AtomicU16::new(0),
        }
    }

    pub async fn send_event(&self, event: InputEvent) -> Result<()> {
        self.transport.send_control(&event.serialize()).await?;
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Send a full-state controller snapshot, stamping the next sequence.
    pub async fn send_controller_state(&self, mut state: ControllerPacket) -> Result<()> {
        state.sequence = self.controller_seq.fetch_add(1, Ordering::Relaxed);
        self.transport.send_control(&state.serialize()).await?;
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }
}
