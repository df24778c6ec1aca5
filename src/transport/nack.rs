//! Selective retransmission requester (viewer side).
//!
//! Tracks incoming sequence numbers in a sliding window and detects gaps.
//! A 5 ms scan emits standalone NACK packets for up to 10 missing
//! sequences per cycle; a sequence is abandoned after `max_retries`
//! requests or once it falls more than 500 sequence units behind the
//! high-water mark. The current missing set is also published to the stats
//! reporter for inclusion in periodic feedback.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::udp::UdpTransport;
use crate::protocol;

/// Scan period for the gap-check task.
pub const NACK_SCAN_INTERVAL: Duration = Duration::from_millis(5);

/// Maximum NACKed sequences per scan cycle.
const MAX_NACKS_PER_CYCLE: usize = 10;

/// Received-window bound.
const RECEIVED_WINDOW: usize = 1000;

/// Sequences older than this (relative to the high-water mark) are
/// abandoned.
const MAX_SEQ_AGE: i16 = 500;

struct TrackerState {
    received: BTreeSet<u16>,
    highest_seq: u16,
    first_packet: bool,
    retries: HashMap<u16, u32>,
    max_retries: u32,
}

pub struct NackTracker {
    state: Mutex<TrackerState>,
    nacks_sent: AtomicU64,
}

impl Default for NackTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl NackTracker {
    pub fn new() -> Self {
        NackTracker {
            state: Mutex::new(TrackerState {
                received: BTreeSet::new(),
                highest_seq: 0,
                first_packet: true,
                retries: HashMap::new(),
                max_retries: 3,
            }),
            nacks_sent: AtomicU64::new(0),
        }
    }

    pub fn set_max_retries(&self, n: u32) {
        self.state.lock().unwrap().max_retries = n;
    }

    /// Record an arriving sequence number (original or retransmitted).
    pub fn on_packet_received(&self, seq: u16) {
        let mut s = self.state.lock().unwrap();

        if s.first_packet {
            s.highest_seq = seq;
            s.first_packet = false;
        }

        s.received.insert(seq);

        // Advance the high-water mark with signed delta arithmetic so the
        // 2^16 wrap is handled.
        let delta = seq.wrapping_sub(s.highest_seq) as i16;
        if delta > 0 {
            s.highest_seq = seq;
        }

        // It arrived (possibly via retransmit) -- stop chasing it.
        s.retries.remove(&seq);

        while s.received.len() > RECEIVED_WINDOW {
            let lowest = *s.received.iter().next().unwrap();
            s.received.remove(&lowest);
        }
    }

    /// Sequences currently being chased, for the stats reporter.
    pub fn missing_sequences(&self) -> Vec<u16> {
        let s = self.state.lock().unwrap();
        let mut missing: Vec<u16> = s.retries.keys().copied().collect();
        missing.sort_unstable();
        missing
    }

    pub fn nacks_sent(&self) -> u64 {
        self.nacks_sent.load(Ordering::Relaxed)
    }

    /// One gap-scan cycle: find up to 10 missing sequences between the
    /// lowest retained and the highest seen, bump their retry counters, and
    /// return them for NACK transmission. Empty result means no packet is
    /// sent this cycle.
    pub fn scan(&self) -> Vec<u16> {
        let mut s = self.state.lock().unwrap();

        if s.first_packet || s.received.is_empty() {
            return Vec::new();
        }

        let mut lowest = *s.received.iter().next().unwrap();
        let range = s.highest_seq.wrapping_sub(lowest) as i16;
        if range <= 0 {
            return Vec::new();
        }
        if range > MAX_SEQ_AGE {
            lowest = s.highest_seq.wrapping_sub(MAX_SEQ_AGE as u16);
        }

        let mut missing = Vec::new();
        let mut seq = lowest;
        while seq != s.highest_seq {
            if !s.received.contains(&seq) {
                let retries = s.retries.get(&seq).copied().unwrap_or(0);
                if retries >= s.max_retries {
                    s.retries.remove(&seq);
                } else {
                    missing.push(seq);
                    if missing.len() >= MAX_NACKS_PER_CYCLE {
                        break;
                    }
                }
            }
            seq = seq.wrapping_add(1);
        }

        for seq in &missing {
            *s.retries.entry(*seq).or_insert(0) += 1;
        }

        // Drop retry entries that have aged out of the window.
        let highest = s.highest_seq;
        s.retries
            .retain(|seq, _| (highest.wrapping_sub(*seq) as i16) <= MAX_SEQ_AGE);

        missing
    }

    /// Run the 5 ms gap-check loop, sending standalone NACKs through the
    /// transport. The caller owns the task handle and aborts it on stop.
    pub async fn run(self: Arc<Self>, transport: Arc<UdpTransport>) {
        let mut tick = tokio::time::interval(NACK_SCAN_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tick.tick().await;

            let missing = self.scan();
            if let Some(packet) = protocol::build_nack(&missing) {
                self.nacks_sent
                    .fetch_add(missing.len() as u64, Ordering::Relaxed);
                tracing::trace!("NACK for {} sequences (first={})", missing.len(), missing[0]);
                if let Err(e) = transport.send_control(&packet).await {
                    tracing::debug!("NACK send failed: {}", e);
                }
            }
        }
    }
}
