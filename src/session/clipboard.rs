//! Bidirectional clipboard text sync with ACK-based reliable delivery.
//!
//! Text is capped at 64 KiB UTF-8. Each transfer carries a sequence
//! number; the receiver replies with an ACK and the sender retries every
//! 200 ms up to 3 times. Text that was just received from the peer is not
//! echoed back (origin tracking breaks the loop).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::time::Instant;

use crate::protocol::input::{ClipAckPacket, ClipboardDirection, ClipboardPacket};
use crate::protocol::CLIPBOARD_MAX_BYTES;
use crate::transport::UdpTransport;

const RETRY_INTERVAL: Duration = Duration::from_millis(200);
const MAX_RETRIES: u32 = 3;

struct PendingTransfer {
    seq: u16,
    packet: Vec<u8>,
    sent_at: Instant,
    retries: u32,
}

struct SyncState {
    send_seq: u16,
    pending: Option<PendingTransfer>,
    /// Last text received from the peer; offering it back is suppressed.
    last_remote_text: Option<String>,
}

type RemoteTextCallback = Box<dyn Fn(String) + Send + Sync>;

pub struct ClipboardSync {
    /// Direction stamped on outgoing packets.
    direction: ClipboardDirection,
    state: Mutex<SyncState>,
    on_remote_text: Mutex<Option<RemoteTextCallback>>,
}

impl ClipboardSync {
    pub fn new(direction: ClipboardDirection) -> Self {
        ClipboardSync {
            direction,
            state: Mutex::new(SyncState {
                send_seq: 0,
                pending: None,
                last_remote_text: None,
            }),
            on_remote_text: Mutex::new(None),
        }
    }

    /// Register the callback invoked with text arriving from the peer
    /// (the embedder writes it to the local clipboard).
    pub fn set_on_remote_text(&self, cb: RemoteTextCallback) {
        *self.on_remote_text.lock().unwrap() = Some(cb);
    }

    /// Offer locally changed clipboard text for transfer. Oversized text
    /// is truncated at the wire cap; text identical to what the peer just
    /// sent is suppressed.
    pub async fn send_text(&self, transport: &UdpTransport, text: &str) -> Result<()> {
        let packet = {
            let mut s = self.state.lock().unwrap();

            if s.last_remote_text.as_deref() == Some(text) {
                return Ok(());
            }

            let mut owned = text.to_string();
            if owned.len() > CLIPBOARD_MAX_BYTES {
                let mut cut = CLIPBOARD_MAX_BYTES;
                while !owned.is_char_boundary(cut) {
                    cut -= 1;
                }
                owned.truncate(cut);
            }

            let seq = s.send_seq;
            s.send_seq = s.send_seq.wrapping_add(1);

            let wire = ClipboardPacket {
                direction: self.direction,
                sequence: seq,
                text: owned,
            }
            .serialize();

            s.pending = Some(PendingTransfer {
                seq,
                packet: wire.clone(),
                sent_at: Instant::now(),
                retries: 0,
            });
            wire
        };

        transport.send_control(&packet).await
    }

    /// Handle an arriving clipboard packet; returns the ACK to send back.
    pub fn on_packet(&self, data: &[u8]) -> Option<Vec<u8>> {
        let packet = match ClipboardPacket::parse(data) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!("bad clipboard packet: {}", e);
                return None;
            }
        };

        {
            let mut s = self.state.lock().unwrap();
            s.last_remote_text = Some(packet.text.clone());
        }

        if let Some(cb) = self.on_remote_text.lock().unwrap().as_ref() {
            cb(packet.text);
        }

        Some(
            ClipAckPacket {
                ack_sequence: packet.sequence,
            }
            .serialize(),
        )
    }

    /// Handle an arriving ACK.
    pub fn on_ack(&self, data: &[u8]) {
        let Ok(ack) = ClipAckPacket::parse(data) else {
            return;
        };
        let mut s = self.state.lock().unwrap();
        if s.pending.as_ref().is_some_and(|p| p.seq == ack.ack_sequence) {
            s.pending = None;
        }
    }

    /// Resend the pending transfer if its retry interval elapsed; gives up
    /// after the retry budget. Called periodically from the receive loop.
    pub async fn poll_retry(&self, transport: &UdpTransport) -> Result<()> {
        let packet = {
            let mut s = self.state.lock().unwrap();
            let Some(pending) = s.pending.as_mut() else {
                return Ok(());
            };
            if pending.sent_at.elapsed() < RETRY_INTERVAL {
                return Ok(());
            }
            if pending.retries >= MAX_RETRIES {
                tracing::warn!(
                    "clipboard transfer seq {} abandoned after {} retries",
                    pending.seq,
                    pending.retries
                );
                s.pending = None;
                return Ok(());
            }
            pending.retries += 1;
            pending.sent_at = Instant::now();
            pending.packet.clone()
        };

        transport.send_control(&packet).await
    }

    pub fn has_pending(&self) -> bool {
        self.state.lock().unwrap().pending.is_some()
    }
}

pub use crate::protocol::input::ClipboardDirection as Direction;

/// Convenience constructors matching the endpoint roles.
impl ClipboardSync {
    pub fn for_host() -> Arc<Self> {
        Arc::new(ClipboardSync::new(ClipboardDirection::HostToViewer))
    }

    pub fn for_viewer() -> Arc<Self> {
        Arc::new(ClipboardSync::new(ClipboardDirection::ViewerToHost))
    }
}
