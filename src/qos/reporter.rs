//! Viewer-side statistics collection and periodic QoS feedback.
//!
//! Every arriving video packet updates loss accounting (signed 16-bit
//! delta arithmetic over expected vs. received), RFC 3550 interarrival
//! jitter, a bounded packet window for bandwidth, and a Kalman-filtered
//! one-way delay gradient. A background task serializes the summary into
//! a QoS feedback packet every 200 ms, folding in the NACK tracker's
//! current missing set.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::protocol::{QosFeedback, VideoHeader, QOS_FEEDBACK_MAX_NACKS, VIDEO_HEADER_SIZE};
use crate::transport::{NackTracker, UdpTransport};

/// Feedback emission period.
pub const FEEDBACK_INTERVAL: Duration = Duration::from_millis(200);

/// Bounded packet-arrival history.
const MAX_RECENT_PACKETS: usize = 1000;

const KALMAN_Q: f64 = 0.001;
const KALMAN_R: f64 = 0.1;

struct PacketRecord {
    seq: u16,
    sender_timestamp_us: u32,
    recv_time_us: u64,
    size: u32,
}

struct ReporterState {
    recent: VecDeque<PacketRecord>,

    expected_seq: u16,
    total_expected: u64,
    total_received: u64,
    first_packet: bool,

    jitter: f64,
    last_transit: i64,
    jitter_initialized: bool,

    kalman_estimate: f64,
    kalman_variance: f64,

    decode_time_ms: f64,
    render_time_ms: f64,
}

/// Viewer statistics snapshot for the control surface.
#[derive(Debug, Clone, Default)]
pub struct ViewerStats {
    pub bitrate_kbps: f64,
    pub fps: f64,
    pub packet_loss: f64,
    pub jitter_ms: f64,
    pub decode_time_ms: f64,
    pub render_time_ms: f64,
    pub frames_decoded: u64,
    pub frames_dropped: u64,
    pub packets_received: u64,
    pub connection_type: &'static str,
}

pub struct StatsReporter {
    state: Mutex<ReporterState>,
    frames_decoded: AtomicU64,
    frames_dropped: AtomicU64,
}

impl Default for StatsReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsReporter {
    pub fn new() -> Self {
        StatsReporter {
            state: Mutex::new(ReporterState {
                recent: VecDeque::new(),
                expected_seq: 0,
                total_expected: 0,
                total_received: 0,
                first_packet: true,
                jitter: 0.0,
                last_transit: 0,
                jitter_initialized: false,
                kalman_estimate: 0.0,
                kalman_variance: 1.0,
                decode_time_ms: 0.0,
                render_time_ms: 0.0,
            }),
            frames_decoded: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }

    /// Record one arriving video packet.
    pub fn on_packet_received(&self, header: &VideoHeader, recv_time_us: u64) {
        let mut s = self.state.lock().unwrap();

        if s.first_packet {
            s.expected_seq = header.sequence;
            s.first_packet = false;
        }

        s.total_received += 1;

        // Expected-count accounting with wraparound via signed deltas.
        // Negative delta means a reordered or retransmitted packet that
        // was already counted as expected.
        let delta = header.sequence.wrapping_sub(s.expected_seq) as i16;
        if delta > 0 {
            s.total_expected += delta as u64;
            s.expected_seq = header.sequence.wrapping_add(1);
        } else if delta == 0 {
            s.total_expected += 1;
            s.expected_seq = s.expected_seq.wrapping_add(1);
        }

        // RFC 3550 interarrival jitter: J += (|D| - J) / 16.
        let transit = recv_time_us as i64 - header.timestamp_us as i64;
        if s.jitter_initialized {
            let d = (transit - s.last_transit).abs() as f64;
            s.jitter += (d - s.jitter) / 16.0;
        } else {
            s.jitter_initialized = true;
        }
        s.last_transit = transit;

        // One-way delay delta between the two most recent packets feeds
        // the delay-gradient filter.
        if let Some(prev) = s.recent.back() {
            let prev_delay = prev.recv_time_us as i64 - prev.sender_timestamp_us as i64;
            let curr_delay = recv_time_us as i64 - header.timestamp_us as i64;
            let measurement = (curr_delay - prev_delay) as f64;

            let predicted = s.kalman_variance + KALMAN_Q;
            let gain = predicted / (predicted + KALMAN_R);
            s.kalman_estimate += gain * (measurement - s.kalman_estimate);
            s.kalman_variance = (1.0 - gain) * predicted;
        }

        s.recent.push_back(PacketRecord {
            seq: header.sequence,
            sender_timestamp_us: header.timestamp_us,
            recv_time_us,
            size: header.payload_length + VIDEO_HEADER_SIZE as u32,
        });
        while s.recent.len() > MAX_RECENT_PACKETS {
            s.recent.pop_front();
        }
    }

    pub fn set_decode_time_ms(&self, ms: f64) {
        self.state.lock().unwrap().decode_time_ms = ms;
    }

    pub fn set_render_time_ms(&self, ms: f64) {
        self.state.lock().unwrap().render_time_ms = ms;
    }

    pub fn on_frame_decoded(&self) {
        self.frames_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Build the feedback packet from current state plus the NACK
    /// tracker's missing set.
    pub fn build_feedback(&self, nack: &NackTracker) -> QosFeedback {
        let mut missing = nack.missing_sequences();
        missing.truncate(QOS_FEEDBACK_MAX_NACKS);

        let s = self.state.lock().unwrap();

        QosFeedback {
            last_seq: s.recent.back().map(|p| p.seq).unwrap_or(0),
            bandwidth_kbps: Self::bandwidth_kbps(&s) as u32,
            loss_x10000: (Self::loss_ratio(&s) * 10_000.0) as u16,
            jitter_us: s.jitter.min(u16::MAX as f64) as u16,
            delay_gradient_us: s.kalman_estimate as i32,
            nack_seqs: missing,
            decode_time_us: (s.decode_time_ms * 1000.0) as u32,
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed) as u32,
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed) as u32,
        }
    }

    /// Snapshot for the control surface.
    pub fn stats(&self) -> ViewerStats {
        let s = self.state.lock().unwrap();

        let fps = {
            let decoded = self.frames_decoded.load(Ordering::Relaxed);
            match (s.recent.front(), s.recent.back()) {
                (Some(first), Some(last)) if decoded > 0 => {
                    let span = last.recv_time_us.saturating_sub(first.recv_time_us);
                    if span > 0 {
                        let fps = decoded as f64 / (span as f64 / 1e6);
                        if fps > 300.0 {
                            0.0
                        } else {
                            fps
                        }
                    } else {
                        0.0
                    }
                }
                _ => 0.0,
            }
        };

        ViewerStats {
            bitrate_kbps: Self::bandwidth_kbps(&s),
            fps,
            packet_loss: Self::loss_ratio(&s),
            jitter_ms: s.jitter / 1000.0,
            decode_time_ms: s.decode_time_ms,
            render_time_ms: s.render_time_ms,
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            packets_received: s.total_received,
            connection_type: "p2p",
        }
    }

    /// Run the 200 ms feedback loop. The owning session aborts the task
    /// on stop.
    pub async fn run(self: Arc<Self>, nack: Arc<NackTracker>, transport: Arc<UdpTransport>) {
        let mut tick = tokio::time::interval(FEEDBACK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tick.tick().await;
            let feedback = self.build_feedback(&nack);
            if let Err(e) = transport.send_control(&feedback.serialize()).await {
                tracing::debug!("feedback send failed: {}", e);
            }
        }
    }

    fn loss_ratio(s: &ReporterState) -> f64 {
        if s.total_expected == 0 {
            return 0.0;
        }
        let lost = s.total_expected.saturating_sub(s.total_received);
        lost as f64 / s.total_expected as f64
    }

    fn bandwidth_kbps(s: &ReporterState) -> f64 {
        let (Some(first), Some(last)) = (s.recent.front(), s.recent.back()) else {
            return 0.0;
        };
        let span_us = last.recv_time_us.saturating_sub(first.recv_time_us);
        if span_us == 0 {
            return 0.0;
        }
        let total_bytes: u64 = s.recent.iter().map(|p| p.size as u64).sum();
        (total_bytes as f64 * 8.0) / (span_us as f64 / 1e6) / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::Codec;

    fn header(seq: u16, timestamp_us: u32, len: u32) -> VideoHeader {
        VideoHeader {
            codec: Codec::H264,
            sequence: seq,
            timestamp_us,
            frame_number: 0,
            fragment_index: 0,
            fragment_total: 1,
            payload_length: len,
            is_keyframe: false,
            end_of_frame: true,
        }
    }

    #[test]
    fn test_no_packets_zero_loss() {
        let r = StatsReporter::new();
        assert_eq!(r.stats().packet_loss, 0.0);
    }

    #[test]
    fn test_loss_counts_gaps() {
        let r = StatsReporter::new();
        // 10 expected, seqs 3 and 7 missing.
        for seq in 0..10u16 {
            if seq == 3 || seq == 7 {
                continue;
            }
            r.on_packet_received(&header(seq, 0, 100), (seq as u64) * 1000);
        }
        let loss = r.stats().packet_loss;
        assert!((loss - 0.2).abs() < 1e-9, "loss={}", loss);
    }

    #[test]
    fn test_loss_handles_wraparound() {
        let r = StatsReporter::new();
        r.on_packet_received(&header(65534, 0, 100), 0);
        r.on_packet_received(&header(65535, 0, 100), 1000);
        r.on_packet_received(&header(0, 0, 100), 2000);
        r.on_packet_received(&header(1, 0, 100), 3000);
        assert_eq!(r.stats().packet_loss, 0.0);
    }

    #[test]
    fn test_retransmit_does_not_inflate_expected() {
        let r = StatsReporter::new();
        r.on_packet_received(&header(0, 0, 100), 0);
        r.on_packet_received(&header(1, 0, 100), 1000);
        r.on_packet_received(&header(0, 0, 100), 2000); // late retransmit
        let s = r.state.lock().unwrap();
        assert_eq!(s.total_expected, 2);
        assert_eq!(s.total_received, 3);
    }

    #[test]
    fn test_jitter_zero_for_perfect_timing() {
        let r = StatsReporter::new();
        for i in 0..20u16 {
            // Constant transit: recv = send + 5000.
            r.on_packet_received(&header(i, i as u32 * 10_000, 100), i as u64 * 10_000 + 5_000);
        }
        assert!(r.stats().jitter_ms < 0.01);
    }

    #[test]
    fn test_jitter_grows_with_variance() {
        let r = StatsReporter::new();
        for i in 0..50u16 {
            let wobble = if i % 2 == 0 { 0 } else { 8_000 };
            r.on_packet_received(
                &header(i, i as u32 * 10_000, 100),
                i as u64 * 10_000 + 5_000 + wobble,
            );
        }
        assert!(r.stats().jitter_ms > 1.0);
    }

    #[test]
    fn test_bandwidth_estimate() {
        let r = StatsReporter::new();
        // 100 packets, 1232-byte payloads (1250 on the wire), 1 ms apart:
        // ~101 Mbps over the 99 ms span.
        for i in 0..100u16 {
            r.on_packet_received(
                &header(i, 0, 1250 - VIDEO_HEADER_SIZE as u32),
                i as u64 * 1000,
            );
        }
        let kbps = r.stats().bitrate_kbps;
        assert!((90_000.0..120_000.0).contains(&kbps), "kbps={}", kbps);
    }

    #[test]
    fn test_feedback_includes_missing_set() {
        let r = StatsReporter::new();
        let nack = NackTracker::new();

        nack.on_packet_received(0);
        nack.on_packet_received(2);
        let _ = nack.scan(); // registers 1 as chased

        r.on_packet_received(&header(0, 0, 100), 0);
        r.on_packet_received(&header(2, 0, 100), 1000);

        let fb = r.build_feedback(&nack);
        assert_eq!(fb.nack_seqs, vec![1]);
        assert_eq!(fb.last_seq, 2);
        assert!(fb.loss_x10000 > 0);
    }

    #[test]
    fn test_decode_and_frame_counters() {
        let r = StatsReporter::new();
        r.set_decode_time_ms(7.5);
        r.on_frame_decoded();
        r.on_frame_decoded();
        r.on_frame_dropped();

        let nack = NackTracker::new();
        let fb = r.build_feedback(&nack);
        assert_eq!(fb.decode_time_us, 7_500);
        assert_eq!(fb.frames_decoded, 2);
        assert_eq!(fb.frames_dropped, 1);
    }

    #[test]
    fn test_positive_gradient_for_growing_delay() {
        let r = StatsReporter::new();
        for i in 0..50u16 {
            // Transit grows 500 us per packet.
            r.on_packet_received(
                &header(i, i as u32 * 10_000, 100),
                i as u64 * 10_000 + 5_000 + i as u64 * 500,
            );
        }
        let fb = r.build_feedback(&NackTracker::new());
        assert!(fb.delay_gradient_us > 0, "gradient={}", fb.delay_gradient_us);
    }
}
