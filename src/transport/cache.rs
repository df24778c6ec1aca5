//! Retransmission cache: a fixed ring of recently sent packets keyed by
//! sequence number.
//!
//! Packets are cached pre-DTLS, so retransmissions re-traverse the
//! encryption layer. On wrap the oldest entry is overwritten; no explicit
//! freeing is needed because consumers copy the bytes they need before the
//! next send on that slot.

use std::sync::Mutex;

/// Ring capacity in slots.
pub const PACKET_CACHE_SIZE: usize = 512;

#[derive(Default, Clone)]
struct CachedPacket {
    data: Vec<u8>,
    seq: u16,
    valid: bool,
}

pub struct RetransmitCache {
    slots: Mutex<Vec<CachedPacket>>,
}

impl Default for RetransmitCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RetransmitCache {
    pub fn new() -> Self {
        RetransmitCache {
            slots: Mutex::new(vec![CachedPacket::default(); PACKET_CACHE_SIZE]),
        }
    }

    /// Store the serialized packet for `seq`, overwriting whatever occupied
    /// the slot.
    pub fn cache(&self, seq: u16, data: &[u8]) {
        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[seq as usize % PACKET_CACHE_SIZE];
        slot.data.clear();
        slot.data.extend_from_slice(data);
        slot.seq = seq;
        slot.valid = true;
    }

    /// Fetch the cached bytes for `seq` if the slot still holds that exact
    /// sequence (it may have been overwritten by a newer packet).
    pub fn lookup(&self, seq: u16) -> Option<Vec<u8>> {
        let slots = self.slots.lock().unwrap();
        let slot = &slots[seq as usize % PACKET_CACHE_SIZE];
        if slot.valid && slot.seq == seq {
            Some(slot.data.clone())
        } else {
            None
        }
    }
}
