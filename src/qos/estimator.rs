//! Bandwidth estimation from per-packet send/receive timing.
//!
//! A map of in-flight packets keyed by sequence is matched against
//! acknowledgements (the viewer's feedback high-water mark). Completed
//! timing pairs form a one-second sliding window whose byte total yields
//! the throughput estimate; one-way delay deltas feed a Kalman-filtered
//! delay gradient used by the congestion controller.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use super::kalman::KalmanFilter;
use crate::util::now_us;

/// Sliding window span.
const WINDOW_DURATION_US: u64 = 1_000_000;

/// Pending entries older than this are garbage-collected on insert.
const PENDING_MAX_AGE_US: u64 = 5_000_000;

struct SentPacket {
    bytes: usize,
    send_time_us: u64,
}

struct TimingPair {
    recv_time_us: u64,
    bytes: usize,
}

struct EstimatorState {
    pending: HashMap<u16, SentPacket>,
    window: VecDeque<TimingPair>,
    delay_filter: KalmanFilter,
    last_owd_us: i64,
    last_owd_time_us: u64,
    latest_rtt_us: u64,
    estimated_bw_kbps: u32,
}

pub struct BandwidthEstimator {
    state: Mutex<EstimatorState>,
}

impl Default for BandwidthEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl BandwidthEstimator {
    pub fn new() -> Self {
        BandwidthEstimator {
            state: Mutex::new(EstimatorState {
                pending: HashMap::new(),
                window: VecDeque::new(),
                delay_filter: KalmanFilter::new(1e-3, 0.1),
                last_owd_us: 0,
                last_owd_time_us: 0,
                latest_rtt_us: 0,
                estimated_bw_kbps: 20_000,
            }),
        }
    }

    /// Record a sent data packet. Opportunistically GCs stale entries the
    /// peer never acknowledged.
    pub fn on_packet_sent(&self, seq: u16, bytes: usize, send_time_us: u64) {
        let mut s = self.state.lock().unwrap();
        s.pending.insert(seq, SentPacket {
            bytes,
            send_time_us,
        });

        let now = now_us();
        s.pending
            .retain(|_, p| now.saturating_sub(p.send_time_us) <= PENDING_MAX_AGE_US);
    }

    /// Record an acknowledgement for a sent packet. Unmatched or duplicate
    /// ACKs are silently discarded.
    pub fn on_ack_received(&self, seq: u16, recv_time_us: u64) {
        let mut s = self.state.lock().unwrap();

        let Some(sent) = s.pending.remove(&seq) else {
            return;
        };

        let rtt_us = recv_time_us.saturating_sub(sent.send_time_us);
        s.latest_rtt_us = rtt_us;

        // One-way delay approximated as RTT/2 (no clock sync with peer).
        let owd_us = (rtt_us / 2) as i64;
        if s.last_owd_time_us > 0 {
            let delta_owd_us = owd_us - s.last_owd_us;
            let delta_time_us = recv_time_us.saturating_sub(s.last_owd_time_us);
            if delta_time_us > 0 {
                // Gradient in ms of delay per second of elapsed time.
                let gradient =
                    (delta_owd_us as f64 / 1000.0) / (delta_time_us as f64 / 1_000_000.0);
                s.delay_filter.update(gradient);
            }
        }
        s.last_owd_us = owd_us;
        s.last_owd_time_us = recv_time_us;

        s.window.push_back(TimingPair {
            recv_time_us,
            bytes: sent.bytes,
        });

        let cutoff = recv_time_us.saturating_sub(WINDOW_DURATION_US);
        while s.window.front().is_some_and(|p| p.recv_time_us < cutoff) {
            s.window.pop_front();
        }

        if s.window.len() >= 2 {
            let span_us = s.window.back().unwrap().recv_time_us - s.window.front().unwrap().recv_time_us;
            if span_us > 0 {
                let total_bytes: usize = s.window.iter().map(|p| p.bytes).sum();
                let kbps = (total_bytes as f64 * 8.0 * 1_000_000.0) / (span_us as f64 * 1000.0);
                s.estimated_bw_kbps = kbps as u32;
            }
        }
    }

    /// Estimated available bandwidth in kbps.
    pub fn bandwidth_kbps(&self) -> u32 {
        self.state.lock().unwrap().estimated_bw_kbps
    }

    /// Smoothed one-way delay gradient in ms/s. Positive means delay is
    /// building (congestion).
    pub fn delay_gradient(&self) -> f64 {
        self.state.lock().unwrap().delay_filter.estimate()
    }

    pub fn latest_rtt_us(&self) -> u64 {
        self.state.lock().unwrap().latest_rtt_us
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bandwidth_from_window() {
        let est = BandwidthEstimator::new();

        // 100 packets of 1250 bytes over 100 ms => 1_000_000 bits / 0.1 s
        // = 10 Mbps.
        for i in 0..100u16 {
            let t = (i as u64) * 1000;
            est.on_packet_sent(i, 1250, t);
            est.on_ack_received(i, t + 5_000);
        }
        let bw = est.bandwidth_kbps();
        assert!(
            (9_000..=11_500).contains(&bw),
            "bandwidth {} kbps out of range",
            bw
        );
    }

    #[test]
    fn test_rtt_tracking() {
        let est = BandwidthEstimator::new();
        est.on_packet_sent(0, 100, 1_000);
        est.on_ack_received(0, 21_000);
        assert_eq!(est.latest_rtt_us(), 20_000);
    }

    #[test]
    fn test_unmatched_ack_discarded() {
        let est = BandwidthEstimator::new();
        est.on_ack_received(99, 1_000);
        assert_eq!(est.latest_rtt_us(), 0);
    }

    #[test]
    fn test_duplicate_ack_discarded() {
        let est = BandwidthEstimator::new();
        est.on_packet_sent(0, 100, 0);
        est.on_ack_received(0, 10_000);
        let rtt = est.latest_rtt_us();
        est.on_ack_received(0, 99_000);
        assert_eq!(est.latest_rtt_us(), rtt);
    }

    #[test]
    fn test_rising_delay_positive_gradient() {
        let est = BandwidthEstimator::new();
        // RTT grows 2 ms per packet, 10 ms apart => OWD gradient
        // 1 ms / 10 ms = 100 ms/s.
        for i in 0..50u16 {
            let sent = (i as u64) * 10_000;
            est.on_packet_sent(i, 500, sent);
            est.on_ack_received(i, sent + 10_000 + (i as u64) * 2_000);
        }
        assert!(
            est.delay_gradient() > 1.0,
            "gradient={}",
            est.delay_gradient()
        );
    }

    #[test]
    fn test_stable_delay_near_zero_gradient() {
        let est = BandwidthEstimator::new();
        for i in 0..50u16 {
            let sent = (i as u64) * 10_000;
            est.on_packet_sent(i, 500, sent);
            est.on_ack_received(i, sent + 8_000);
        }
        assert!(
            est.delay_gradient().abs() < 0.5,
            "gradient={}",
            est.delay_gradient()
        );
    }
}
