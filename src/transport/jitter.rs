//! Jitter buffer: fragment reassembly and ordered frame release.
//!
//! Each video frame arrives as one or more fragments keyed by
//! `frame_number`. A frame is complete when all `fragment_total` fragments
//! are present; complete frames are released in `frame_number` order once
//! they have aged past the target buffer depth (or immediately under
//! backpressure). Incomplete frames older than the maximum age are dropped
//! so one lost fragment cannot stall the pipeline.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::protocol::VideoHeader;
use crate::util::now_us;

/// Frames behind the release pointer by more than this are discarded
/// (signed 16-bit delta, handles wrap).
const MAX_BEHIND: i16 = -100;

/// Skip-ahead window: a complete frame at most this far ahead can trigger
/// loss declaration for the frames in between.
const MAX_AHEAD: i16 = 100;

/// Complete frames queued past this count force release regardless of age.
const BACKPRESSURE_COMPLETE: usize = 3;

/// Total assemblies cap; the oldest is evicted on overflow.
const MAX_ASSEMBLIES: usize = 100;

/// Default maximum age for an incomplete frame before it is dropped.
const DEFAULT_MAX_FRAME_AGE_MS: u64 = 150;

struct FrameAssembly {
    header: VideoHeader,
    fragments: Vec<Vec<u8>>,
    received: u32,
    fragment_total: u32,
    first_arrival_us: u64,
    complete: bool,
}

impl FrameAssembly {
    fn is_complete(&self) -> bool {
        self.fragment_total > 0 && self.received >= self.fragment_total
    }
}

struct BufferState {
    frames: BTreeMap<u16, FrameAssembly>,
    next_release: u16,
    first_frame: bool,
    target_depth_ms: u64,
    max_frame_age_ms: u64,
    frames_dropped: u64,
}

pub struct JitterBuffer {
    state: Mutex<BufferState>,
}

impl Default for JitterBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl JitterBuffer {
    pub fn new() -> Self {
        JitterBuffer {
            state: Mutex::new(BufferState {
                frames: BTreeMap::new(),
                next_release: 0,
                first_frame: true,
                target_depth_ms: 20,
                max_frame_age_ms: DEFAULT_MAX_FRAME_AGE_MS,
                frames_dropped: 0,
            }),
        }
    }

    /// Push one received fragment.
    pub fn push(&self, header: VideoHeader, payload: &[u8]) {
        let mut s = self.state.lock().unwrap();

        let frag_idx = header.fragment_index as usize;
        let frag_total = header.fragment_total as usize;

        if frag_total == 0 || frag_idx >= frag_total {
            tracing::warn!(
                "jitter: invalid fragment {}/{} for frame {}",
                header.fragment_index,
                header.fragment_total,
                header.frame_number
            );
            return;
        }

        if s.first_frame {
            s.next_release = header.frame_number;
            s.first_frame = false;
        }

        // Too old relative to the release pointer (signed 16-bit delta
        // handles wrap at 65536). Retransmissions arriving after release
        // land here.
        let delta = header.frame_number.wrapping_sub(s.next_release) as i16;
        if delta < MAX_BEHIND {
            return;
        }

        let assembly = s
            .frames
            .entry(header.frame_number)
            .or_insert_with(|| FrameAssembly {
                header,
                fragments: vec![Vec::new(); frag_total],
                received: 0,
                fragment_total: frag_total as u32,
                first_arrival_us: now_us(),
                complete: false,
            });

        if frag_idx >= assembly.fragments.len() || !assembly.fragments[frag_idx].is_empty() {
            return; // duplicate or inconsistent total
        }

        assembly.fragments[frag_idx] = payload.to_vec();
        assembly.received += 1;
        if assembly.is_complete() {
            assembly.complete = true;
        }

        Self::expire_locked(&mut s);
    }

    /// Pop the next frame in order, if one is releasable.
    pub fn pop(&self) -> Option<(VideoHeader, Vec<u8>)> {
        let mut s = self.state.lock().unwrap();

        let now = now_us();
        let mut key = s.next_release;

        if !s.frames.contains_key(&key) {
            // The expected frame is absent. If a complete frame a little
            // ahead has aged past the target depth, declare the gap lost
            // and skip to it.
            let next_release = s.next_release;
            let candidate = s
                .frames
                .iter()
                .filter_map(|(k, a)| {
                    let gap = k.wrapping_sub(next_release) as i16;
                    (gap > 0 && gap < MAX_AHEAD && a.complete).then_some((gap, *k))
                })
                .min();

            let (gap, ahead_key) = candidate?;
            let age_ms = (now.saturating_sub(s.frames[&ahead_key].first_arrival_us)) / 1000;
            if age_ms < s.target_depth_ms {
                return None;
            }
            s.frames_dropped += gap as u64;
            s.next_release = ahead_key;
            key = ahead_key;
        }

        let assembly = s.frames.get(&key)?;
        let age_ms = (now.saturating_sub(assembly.first_arrival_us)) / 1000;

        if !assembly.complete {
            if age_ms < s.max_frame_age_ms {
                return None; // wait for more fragments
            }
            tracing::debug!(
                "jitter: dropping incomplete frame {} ({}/{} fragments, age {} ms)",
                key,
                assembly.received,
                assembly.fragment_total,
                age_ms
            );
            s.frames.remove(&key);
            s.frames_dropped += 1;
            s.next_release = s.next_release.wrapping_add(1);
            return None;
        }

        // Hold until the target depth, unless enough complete frames have
        // queued up behind it (backpressure override).
        let complete_count = s.frames.values().filter(|a| a.complete).count();
        if age_ms < s.target_depth_ms && complete_count < BACKPRESSURE_COMPLETE {
            return None;
        }

        let assembly = s.frames.remove(&key).unwrap();
        s.next_release = s.next_release.wrapping_add(1);

        let total: usize = assembly.fragments.iter().map(Vec::len).sum();
        let mut data = Vec::with_capacity(total);
        for frag in &assembly.fragments {
            data.extend_from_slice(frag);
        }

        Some((assembly.header, data))
    }

    /// Buffer depth estimated from the oldest assembly's arrival time.
    pub fn depth_ms(&self) -> u64 {
        let s = self.state.lock().unwrap();
        s.frames
            .values()
            .map(|a| a.first_arrival_us)
            .min()
            .map(|oldest| now_us().saturating_sub(oldest) / 1000)
            .unwrap_or(0)
    }

    pub fn set_target_depth_ms(&self, ms: u64) {
        self.state.lock().unwrap().target_depth_ms = ms;
        tracing::debug!("jitter: target depth {} ms", ms);
    }

    pub fn complete_frame_count(&self) -> usize {
        let s = self.state.lock().unwrap();
        s.frames.values().filter(|a| a.complete).count()
    }

    pub fn frames_dropped(&self) -> u64 {
        self.state.lock().unwrap().frames_dropped
    }

    /// Clear all buffered frames (used on reconnect to drop stale data).
    pub fn flush(&self) {
        let mut s = self.state.lock().unwrap();
        s.frames.clear();
        s.first_frame = true;
    }

    fn expire_locked(s: &mut BufferState) {
        let now = now_us();
        let max_age_us = s.max_frame_age_ms * 1000;

        let expired: Vec<u16> = s
            .frames
            .iter()
            .filter(|(_, a)| !a.complete && now.saturating_sub(a.first_arrival_us) > max_age_us)
            .map(|(k, _)| *k)
            .collect();
        for key in expired {
            s.frames.remove(&key);
            s.frames_dropped += 1;
        }

        while s.frames.len() > MAX_ASSEMBLIES {
            let oldest = *s.frames.keys().next().unwrap();
            tracing::warn!("jitter: overflow, dropping frame {}", oldest);
            s.frames.remove(&oldest);
            s.frames_dropped += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::Codec;

    fn header(frame: u16, idx: u8, total: u8, len: u32) -> VideoHeader {
        VideoHeader {
            codec: Codec::H264,
            sequence: 0,
            timestamp_us: 0,
            frame_number: frame,
            fragment_index: idx,
            fragment_total: total,
            payload_length: len,
            is_keyframe: false,
            end_of_frame: idx + 1 == total,
        }
    }

    fn immediate() -> JitterBuffer {
        let jb = JitterBuffer::new();
        jb.set_target_depth_ms(0);
        jb
    }

    #[test]
    fn test_single_fragment_release() {
        let jb = immediate();
        jb.push(header(0, 0, 1, 4), &[1, 2, 3, 4]);

        let (hdr, data) = jb.pop().unwrap();
        assert_eq!(hdr.frame_number, 0);
        assert_eq!(data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_reassembly_out_of_order() {
        let jb = immediate();
        jb.push(header(0, 2, 3, 2), &[5, 6]);
        jb.push(header(0, 0, 3, 2), &[1, 2]);
        assert!(jb.pop().is_none());
        jb.push(header(0, 1, 3, 2), &[3, 4]);

        let (_, data) = jb.pop().unwrap();
        assert_eq!(data, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_assembled_length_equals_fragment_sum() {
        let jb = immediate();
        let payloads: [&[u8]; 3] = [&[1; 10], &[2; 7], &[3; 3]];
        for (i, p) in payloads.iter().enumerate() {
            jb.push(header(0, i as u8, 3, p.len() as u32), p);
        }
        let (_, data) = jb.pop().unwrap();
        assert_eq!(data.len(), 20);
    }

    #[test]
    fn test_invalid_fragment_index_rejected() {
        let jb = immediate();
        jb.push(header(0, 3, 3, 1), &[9]);
        jb.push(header(0, 5, 3, 1), &[9]);
        assert_eq!(jb.complete_frame_count(), 0);
        assert!(jb.pop().is_none());
    }

    #[test]
    fn test_duplicate_fragment_dropped() {
        let jb = immediate();
        jb.push(header(0, 0, 2, 1), &[1]);
        jb.push(header(0, 0, 2, 1), &[1]);
        assert_eq!(jb.complete_frame_count(), 0);
    }

    #[test]
    fn test_in_order_release() {
        let jb = immediate();
        jb.push(header(0, 0, 1, 1), &[0]);
        jb.push(header(1, 0, 1, 1), &[1]);
        jb.push(header(2, 0, 1, 1), &[2]);

        assert_eq!(jb.pop().unwrap().0.frame_number, 0);
        assert_eq!(jb.pop().unwrap().0.frame_number, 1);
        assert_eq!(jb.pop().unwrap().0.frame_number, 2);
        assert!(jb.pop().is_none());
    }

    #[test]
    fn test_wraparound_release_in_order() {
        let jb = immediate();
        jb.push(header(65535, 0, 1, 1), &[0xFF]);
        jb.push(header(0, 0, 1, 1), &[0x00]);

        assert_eq!(jb.pop().unwrap().0.frame_number, 65535);
        assert_eq!(jb.pop().unwrap().0.frame_number, 0);
    }

    #[test]
    fn test_old_frame_behind_release_pointer_discarded() {
        let jb = immediate();
        jb.push(header(500, 0, 1, 1), &[1]);
        assert_eq!(jb.pop().unwrap().0.frame_number, 500);

        // 300 is more than 100 behind the release pointer now.
        jb.push(header(300, 0, 1, 1), &[2]);
        assert_eq!(jb.complete_frame_count(), 0);
    }

    #[test]
    fn test_backpressure_overrides_depth() {
        let jb = JitterBuffer::new();
        jb.set_target_depth_ms(10_000); // effectively "hold forever"
        for frame in 0..4u16 {
            jb.push(header(frame, 0, 1, 1), &[frame as u8]);
        }
        // Three or more complete frames queued forces release.
        assert!(jb.pop().is_some());
    }

    #[test]
    fn test_skip_ahead_counts_dropped() {
        let jb = immediate();
        jb.push(header(0, 0, 1, 1), &[0]);
        assert!(jb.pop().is_some());

        // Frame 1 never arrives; frame 2 is complete and aged.
        jb.push(header(2, 0, 1, 1), &[2]);
        let popped = jb.pop().unwrap();
        assert_eq!(popped.0.frame_number, 2);
        assert_eq!(jb.frames_dropped(), 1);
    }

    #[test]
    fn test_flush_clears_state() {
        let jb = immediate();
        jb.push(header(7, 0, 2, 1), &[1]);
        jb.flush();
        assert_eq!(jb.complete_frame_count(), 0);
        // After flush the next frame re-seeds the release pointer.
        jb.push(header(100, 0, 1, 1), &[1]);
        assert_eq!(jb.pop().unwrap().0.frame_number, 100);
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let jb = immediate();
        for frame in 0..150u16 {
            // Incomplete assemblies (1 of 2 fragments).
            jb.push(header(frame, 0, 2, 1), &[0]);
        }
        let s = jb.state.lock().unwrap();
        assert!(s.frames.len() <= MAX_ASSEMBLIES);
    }
}
