//! XOR-based forward error correction.
//!
//! Data packets are grouped (default 5 per group) and parity packets are
//! generated by XOR-ing pairs: parity `i` covers fragments `2i mod N` and
//! `(2i+1) mod N`, zero-padded to the longer of the two. Each parity packet
//! can recover a single loss when the other fragment of its pair arrives.
//! The redundancy ratio is set by the QoS controller.

use std::sync::Mutex;

/// Lower bound for the group size.
pub const FEC_MIN_GROUP: usize = 2;

/// Upper bound for the group size.
pub const FEC_MAX_GROUP: usize = 48;

/// XOR two buffers, zero-padding to the longer one.
pub fn xor_padded(a: &[u8], b: &[u8]) -> Vec<u8> {
    let len = a.len().max(b.len());
    let mut out = vec![0u8; len];
    for (i, byte) in a.iter().enumerate() {
        out[i] ^= byte;
    }
    for (i, byte) in b.iter().enumerate() {
        out[i] ^= byte;
    }
    out
}

/// Indices of the data fragments covered by parity packet `fec_index` in a
/// group of `group_size` fragments.
pub fn parity_pair(fec_index: usize, group_size: usize) -> (usize, usize) {
    (
        (fec_index * 2) % group_size,
        (fec_index * 2 + 1) % group_size,
    )
}

pub struct FecEncoder {
    inner: Mutex<FecState>,
}

struct FecState {
    redundancy_ratio: f32,
    group_size: usize,
    group_id: u8,
}

impl Default for FecEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FecEncoder {
    pub fn new() -> Self {
        FecEncoder {
            inner: Mutex::new(FecState {
                redundancy_ratio: 0.2,
                group_size: 5,
                group_id: 0,
            }),
        }
    }

    /// Generate parity packets for a group of serialized data packets.
    /// Returns the parity payloads and the group id assigned to this group.
    pub fn encode(&self, data_packets: &[Vec<u8>]) -> (Vec<Vec<u8>>, u8) {
        let mut state = self.inner.lock().unwrap();
        let group_id = state.group_id;
        state.group_id = state.group_id.wrapping_add(1);

        if data_packets.is_empty() {
            return (Vec::new(), group_id);
        }

        let wanted = ((data_packets.len() as f32 * state.redundancy_ratio).ceil() as usize).max(1);

        // Pair-wise XOR caps the useful parity count at N/2; a lone packet
        // is simply duplicated.
        let max_pairs = data_packets.len() / 2;
        if max_pairs == 0 {
            return (vec![data_packets[0].clone()], group_id);
        }
        let count = wanted.min(max_pairs);

        let mut parity = Vec::with_capacity(count);
        for i in 0..count {
            let (a, b) = parity_pair(i, data_packets.len());
            parity.push(xor_padded(&data_packets[a], &data_packets[b]));
        }

        tracing::trace!(
            "FEC: {} parity packets for {} data packets (group {})",
            parity.len(),
            data_packets.len(),
            group_id
        );
        (parity, group_id)
    }

    /// Set the redundancy ratio, clamped to [0, 1].
    pub fn set_redundancy_ratio(&self, ratio: f32) {
        let mut state = self.inner.lock().unwrap();
        state.redundancy_ratio = ratio.clamp(0.0, 1.0);
    }

    pub fn redundancy_ratio(&self) -> f32 {
        self.inner.lock().unwrap().redundancy_ratio
    }

    /// Set the group size, clamped to [2, 48].
    pub fn set_group_size(&self, size: usize) {
        let mut state = self.inner.lock().unwrap();
        state.group_size = size.clamp(FEC_MIN_GROUP, FEC_MAX_GROUP);
    }

    pub fn group_size(&self) -> usize {
        self.inner.lock().unwrap().group_size
    }
}

// ---------------------------------------------------------------------------
// Viewer-side recovery
// ---------------------------------------------------------------------------

use super::cache::RetransmitCache;
use crate::protocol::{FecHeader, VideoHeader};

/// Reconstructs lost video fragments from XOR parity (viewer side).
///
/// Raw serialized video packets are retained in a sequence-keyed ring.
/// When a parity packet arrives, the sequences of its group are derived
/// from the parity's own sequence (data fragments occupy the `group_size`
/// sequences immediately before the first parity packet); if exactly one
/// member of the parity's pair is missing, its full wire packet is
/// rebuilt by XOR and handed back for normal video dispatch.
#[derive(Default)]
pub struct FecRecovery {
    store: RetransmitCache,
}

impl FecRecovery {
    pub fn new() -> Self {
        FecRecovery {
            store: RetransmitCache::new(),
        }
    }

    /// Retain the raw bytes of a received (or recovered) video packet.
    pub fn on_video_packet(&self, seq: u16, raw: &[u8]) {
        self.store.cache(seq, raw);
    }

    /// Attempt recovery from a parity packet. Returns the reconstructed
    /// header and payload of a previously missing fragment, if any.
    pub fn on_fec_packet(&self, header: &FecHeader, parity: &[u8]) -> Option<(VideoHeader, Vec<u8>)> {
        let n = header.group_size as u16;
        if n == 0 {
            return None;
        }

        // Data fragments sit on the sequences immediately before the
        // parity run: parity i has sequence base + n + i.
        let base = header
            .sequence
            .wrapping_sub(n)
            .wrapping_sub(header.fec_index as u16);

        if n == 1 {
            // Single-fragment groups carry a verbatim duplicate.
            if self.store.lookup(base).is_some() {
                return None;
            }
            return self.rebuild(base, parity.to_vec());
        }

        let (ia, ib) = parity_pair(header.fec_index as usize, n as usize);
        let seq_a = base.wrapping_add(ia as u16);
        let seq_b = base.wrapping_add(ib as u16);

        match (self.store.lookup(seq_a), self.store.lookup(seq_b)) {
            (Some(have), None) => self.rebuild(seq_b, xor_padded(parity, &have)),
            (None, Some(have)) => self.rebuild(seq_a, xor_padded(parity, &have)),
            _ => None, // both present (nothing lost) or both lost (unrecoverable)
        }
    }

    fn rebuild(&self, seq: u16, padded: Vec<u8>) -> Option<(VideoHeader, Vec<u8>)> {
        match VideoHeader::parse_prefix(&padded) {
            Ok((header, payload)) if header.sequence == seq => {
                tracing::debug!(
                    "FEC recovered seq {} (frame {}, fragment {}/{})",
                    seq,
                    header.frame_number,
                    header.fragment_index,
                    header.fragment_total
                );
                let payload = payload.to_vec();
                self.store.cache(seq, &padded[..]);
                Some((header, payload))
            }
            _ => {
                tracing::debug!("FEC recovery for seq {} produced an invalid packet", seq);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_loss_recovery() {
        let fragments: Vec<Vec<u8>> = vec![
            vec![1, 2, 3, 4],
            vec![5, 6, 7],
            vec![8, 9, 10, 11],
            vec![12, 13],
            vec![14, 15, 16],
        ];

        let fec = FecEncoder::new();
        fec.set_redundancy_ratio(0.2);
        let (parity, _) = fec.encode(&fragments);
        assert_eq!(parity.len(), 1);

        // Parity 0 covers fragments 0 and 1. Lose fragment 0; recover it
        // from parity XOR fragment 1, truncated to the original length.
        let recovered = xor_padded(&parity[0], &fragments[1]);
        assert_eq!(&recovered[..fragments[0].len()], &fragments[0][..]);
    }

    #[test]
    fn test_recovery_of_shorter_pair_member() {
        let fragments: Vec<Vec<u8>> = vec![vec![0xAA; 100], vec![0x55; 40]];
        let fec = FecEncoder::new();
        fec.set_redundancy_ratio(1.0);
        let (parity, _) = fec.encode(&fragments);

        let recovered = xor_padded(&parity[0], &fragments[0]);
        assert_eq!(&recovered[..40], &fragments[1][..]);
        // Padding region XORs back to zero.
        assert!(recovered[40..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_parity_count_follows_ratio() {
        let fragments: Vec<Vec<u8>> = (0..10).map(|i| vec![i as u8; 8]).collect();
        let fec = FecEncoder::new();

        fec.set_redundancy_ratio(0.2);
        assert_eq!(fec.encode(&fragments).0.len(), 2);

        fec.set_redundancy_ratio(1.0);
        // Capped at N/2 pairs.
        assert_eq!(fec.encode(&fragments).0.len(), 5);
    }

    #[test]
    fn test_single_fragment_duplicated() {
        let fec = FecEncoder::new();
        let (parity, _) = fec.encode(&[vec![9, 9, 9]]);
        assert_eq!(parity, vec![vec![9, 9, 9]]);
    }

    #[test]
    fn test_group_id_increments_and_wraps() {
        let fec = FecEncoder::new();
        let (_, first) = fec.encode(&[vec![1], vec![2]]);
        let (_, second) = fec.encode(&[vec![1], vec![2]]);
        assert_eq!(second, first.wrapping_add(1));
    }

    #[test]
    fn test_ratio_and_group_clamping() {
        let fec = FecEncoder::new();
        fec.set_redundancy_ratio(7.5);
        assert_eq!(fec.redundancy_ratio(), 1.0);
        fec.set_redundancy_ratio(-1.0);
        assert_eq!(fec.redundancy_ratio(), 0.0);

        fec.set_group_size(1);
        assert_eq!(fec.group_size(), FEC_MIN_GROUP);
        fec.set_group_size(100);
        assert_eq!(fec.group_size(), FEC_MAX_GROUP);
    }

    #[test]
    fn test_parity_pair_mapping() {
        assert_eq!(parity_pair(0, 5), (0, 1));
        assert_eq!(parity_pair(1, 5), (2, 3));
        assert_eq!(parity_pair(2, 5), (4, 0));
    }

    mod recovery {
        use super::*;
        use crate::media::Codec;

        /// Serialize a realistic fragment group the way the transport does.
        fn group(frame: u16, first_seq: u16, payloads: &[&[u8]]) -> Vec<Vec<u8>> {
            payloads
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    VideoHeader {
                        codec: Codec::H264,
                        sequence: first_seq.wrapping_add(i as u16),
                        timestamp_us: 0,
                        frame_number: frame,
                        fragment_index: i as u8,
                        fragment_total: payloads.len() as u8,
                        payload_length: p.len() as u32,
                        is_keyframe: false,
                        end_of_frame: i + 1 == payloads.len(),
                    }
                    .serialize(p)
                })
                .collect()
        }

        #[test]
        fn test_recover_lost_first_fragment() {
            let payloads: [&[u8]; 5] = [&[1; 40], &[2; 33], &[3; 40], &[4; 40], &[5; 12]];
            let packets = group(1, 0, &payloads);

            let fec = FecEncoder::new();
            fec.set_redundancy_ratio(0.2);
            let (parity, group_id) = fec.encode(&packets);
            assert_eq!(parity.len(), 1);

            let recovery = FecRecovery::new();
            // Seq 0 is lost; the rest arrive.
            for (i, pkt) in packets.iter().enumerate().skip(1) {
                recovery.on_video_packet(i as u16, pkt);
            }

            let fec_header = FecHeader {
                sequence: 5,
                group_id,
                group_size: 5,
                fec_index: 0,
                frame_number_low: 1,
            };
            let (header, payload) = recovery.on_fec_packet(&fec_header, &parity[0]).unwrap();
            assert_eq!(header.sequence, 0);
            assert_eq!(header.fragment_index, 0);
            assert_eq!(payload, payloads[0]);
        }

        #[test]
        fn test_no_recovery_when_pair_complete() {
            let payloads: [&[u8]; 2] = [&[7; 10], &[8; 10]];
            let packets = group(0, 0, &payloads);

            let fec = FecEncoder::new();
            fec.set_redundancy_ratio(1.0);
            let (parity, group_id) = fec.encode(&packets);

            let recovery = FecRecovery::new();
            recovery.on_video_packet(0, &packets[0]);
            recovery.on_video_packet(1, &packets[1]);

            let fec_header = FecHeader {
                sequence: 2,
                group_id,
                group_size: 2,
                fec_index: 0,
                frame_number_low: 0,
            };
            assert!(recovery.on_fec_packet(&fec_header, &parity[0]).is_none());
        }

        #[test]
        fn test_no_recovery_when_both_lost() {
            let payloads: [&[u8]; 2] = [&[7; 10], &[8; 10]];
            let packets = group(0, 0, &payloads);

            let fec = FecEncoder::new();
            fec.set_redundancy_ratio(1.0);
            let (parity, group_id) = fec.encode(&packets);

            let recovery = FecRecovery::new();
            let fec_header = FecHeader {
                sequence: 2,
                group_id,
                group_size: 2,
                fec_index: 0,
                frame_number_low: 0,
            };
            assert!(recovery.on_fec_packet(&fec_header, &parity[0]).is_none());
        }

        #[test]
        fn test_recovery_across_sequence_wrap() {
            let payloads: [&[u8]; 2] = [&[1; 20], &[2; 20]];
            let packets = group(100, 65535, &payloads); // seqs 65535, 0

            let fec = FecEncoder::new();
            fec.set_redundancy_ratio(1.0);
            let (parity, group_id) = fec.encode(&packets);

            let recovery = FecRecovery::new();
            recovery.on_video_packet(0, &packets[1]); // seq 65535 lost

            let fec_header = FecHeader {
                sequence: 1, // 65535, 0 data; parity at 1
                group_id,
                group_size: 2,
                fec_index: 0,
                frame_number_low: 100,
            };
            let (header, payload) = recovery.on_fec_packet(&fec_header, &parity[0]).unwrap();
            assert_eq!(header.sequence, 65535);
            assert_eq!(payload, payloads[0]);
        }
    }
}
