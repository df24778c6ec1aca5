//! Media and control packet codecs.
//!
//! Video header layout (18 bytes, big-endian):
//! ```text
//! ver_type(1) frame_type(1) codec(1) sequence(2) timestamp_us(4)
//! frame_number(2) fragment_index(1) fragment_total(1) payload_length(4)
//! flags(1)
//! ```
//! followed by `payload_length` bytes of encoded bitstream.
//!
//! Audio header (10 bytes):
//! ```text
//! ver_type(1) channel_id(1) sequence(2) timestamp_us(4) payload_length(2)
//! ```
//!
//! FEC header (7 bytes):
//! ```text
//! type(0xFC) sequence(2) group_id(1) group_size(1) fec_index(1)
//! frame_number_low(1)
//! ```

use anyhow::{bail, Result};

use super::PacketType;
use crate::media::Codec;

/// Target MTU: total UDP payload limit per datagram.
pub const MTU: usize = 1400;

/// Serialized video header size in bytes.
pub const VIDEO_HEADER_SIZE: usize = 18;

/// Serialized audio header size in bytes.
pub const AUDIO_HEADER_SIZE: usize = 10;

/// Serialized FEC header size in bytes.
pub const FEC_HEADER_SIZE: usize = 7;

/// Maximum encoded payload carried by one video fragment.
pub const MAX_VIDEO_PAYLOAD: usize = MTU - VIDEO_HEADER_SIZE;

/// Keyframe flag (bit 0 of the video header flags byte).
pub const VIDEO_FLAG_KEYFRAME: u8 = 0x01;

/// End-of-frame flag (bit 1), set on the last fragment of a frame.
pub const VIDEO_FLAG_END_OF_FRAME: u8 = 0x02;

/// NACK sequence numbers that fit in one QoS feedback packet.
pub const QOS_FEEDBACK_MAX_NACKS: usize = 64;

/// Base QoS feedback size before the extended NACK list and trailer.
const QOS_FEEDBACK_BASE_SIZE: usize = 22;

/// Trailing client-load fields: decode_time_us(4) + frames_decoded(4) +
/// frames_dropped(4).
const QOS_FEEDBACK_TRAILER_SIZE: usize = 12;

// ---------------------------------------------------------------------------
// Video
// ---------------------------------------------------------------------------

/// Parsed or to-be-serialized video fragment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoHeader {
    pub codec: Codec,
    pub sequence: u16,
    pub timestamp_us: u32,
    pub frame_number: u16,
    pub fragment_index: u8,
    pub fragment_total: u8,
    pub payload_length: u32,
    pub is_keyframe: bool,
    pub end_of_frame: bool,
}

impl VideoHeader {
    /// Serialize header + payload into one wire packet.
    pub fn serialize(&self, payload: &[u8]) -> Vec<u8> {
        debug_assert_eq!(payload.len() as u32, self.payload_length);

        let mut buf = Vec::with_capacity(VIDEO_HEADER_SIZE + payload.len());
        buf.push(PacketType::Video.dispatch_byte());
        buf.push(0); // frame_type: 0 = progressive
        buf.push(self.codec as u8);
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.timestamp_us.to_be_bytes());
        buf.extend_from_slice(&self.frame_number.to_be_bytes());
        buf.push(self.fragment_index);
        buf.push(self.fragment_total);
        buf.extend_from_slice(&self.payload_length.to_be_bytes());
        let mut flags = 0u8;
        if self.is_keyframe {
            flags |= VIDEO_FLAG_KEYFRAME;
        }
        if self.end_of_frame {
            flags |= VIDEO_FLAG_END_OF_FRAME;
        }
        buf.push(flags);
        buf.extend_from_slice(payload);
        buf
    }

    /// Parse a video packet whose buffer may carry trailing bytes beyond
    /// the payload (FEC-recovered packets are padded to the longer pair
    /// member). The payload slice is truncated to `payload_length`.
    pub fn parse_prefix(data: &[u8]) -> Result<(VideoHeader, &[u8])> {
        if data.len() < VIDEO_HEADER_SIZE {
            bail!("video packet too short: {} bytes", data.len());
        }
        let payload_length =
            u32::from_be_bytes([data[13], data[14], data[15], data[16]]) as usize;
        if data.len() < VIDEO_HEADER_SIZE + payload_length {
            bail!("video payload truncated");
        }
        let exact = &data[..VIDEO_HEADER_SIZE + payload_length];
        Self::parse(exact)
    }

    /// Parse a video packet; returns the header and the payload slice.
    pub fn parse(data: &[u8]) -> Result<(VideoHeader, &[u8])> {
        if data.len() < VIDEO_HEADER_SIZE {
            bail!("video packet too short: {} bytes", data.len());
        }
        if PacketType::identify(data) != Some(PacketType::Video) {
            bail!("not a video packet (first byte 0x{:02X})", data[0]);
        }

        let codec = Codec::from_wire(data[2])?;
        let sequence = u16::from_be_bytes([data[3], data[4]]);
        let timestamp_us = u32::from_be_bytes([data[5], data[6], data[7], data[8]]);
        let frame_number = u16::from_be_bytes([data[9], data[10]]);
        let fragment_index = data[11];
        let fragment_total = data[12];
        let payload_length = u32::from_be_bytes([data[13], data[14], data[15], data[16]]);
        let flags = data[17];

        let payload = &data[VIDEO_HEADER_SIZE..];
        if payload.len() != payload_length as usize {
            bail!(
                "video payload length mismatch: header says {}, got {}",
                payload_length,
                payload.len()
            );
        }

        Ok((
            VideoHeader {
                codec,
                sequence,
                timestamp_us,
                frame_number,
                fragment_index,
                fragment_total,
                payload_length,
                is_keyframe: flags & VIDEO_FLAG_KEYFRAME != 0,
                end_of_frame: flags & VIDEO_FLAG_END_OF_FRAME != 0,
            },
            payload,
        ))
    }
}

// ---------------------------------------------------------------------------
// Audio
// ---------------------------------------------------------------------------

/// Audio packet header. The payload is one Opus frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioHeader {
    pub channel_id: u8,
    pub sequence: u16,
    pub timestamp_us: u32,
}

impl AudioHeader {
    pub fn serialize(&self, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(AUDIO_HEADER_SIZE + payload.len());
        buf.push(PacketType::Audio.dispatch_byte());
        buf.push(self.channel_id);
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.timestamp_us.to_be_bytes());
        buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    pub fn parse(data: &[u8]) -> Result<(AudioHeader, &[u8])> {
        if data.len() < AUDIO_HEADER_SIZE {
            bail!("audio packet too short: {} bytes", data.len());
        }
        if PacketType::identify(data) != Some(PacketType::Audio) {
            bail!("not an audio packet");
        }

        let channel_id = data[1];
        let sequence = u16::from_be_bytes([data[2], data[3]]);
        let timestamp_us = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let payload_length = u16::from_be_bytes([data[8], data[9]]) as usize;

        let payload = &data[AUDIO_HEADER_SIZE..];
        if payload.len() != payload_length {
            bail!(
                "audio payload length mismatch: header says {}, got {}",
                payload_length,
                payload.len()
            );
        }

        Ok((
            AudioHeader {
                channel_id,
                sequence,
                timestamp_us,
            },
            payload,
        ))
    }
}

// ---------------------------------------------------------------------------
// QoS feedback
// ---------------------------------------------------------------------------

/// Periodic viewer → host feedback summary, sent every ~200 ms.
///
/// Wire layout: `type(1) flags(1) last_seq(2) bw_kbps(4) loss_x10000(2)
/// jitter_us(2) delay_gradient_us(4 signed) nack_count(2) nack_seq_0(2)
/// nack_seq_1(2)`, then `(nack_count - 2)` extra 16-bit sequences when
/// `nack_count > 2` (bounded at 64), then the client-load trailer
/// `decode_time_us(4) frames_decoded(4) frames_dropped(4)`. The trailer is
/// parsed tolerantly: packets without it decode with zeroed load fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QosFeedback {
    pub last_seq: u16,
    pub bandwidth_kbps: u32,
    pub loss_x10000: u16,
    pub jitter_us: u16,
    pub delay_gradient_us: i32,
    pub nack_seqs: Vec<u16>,
    pub decode_time_us: u32,
    pub frames_decoded: u32,
    pub frames_dropped: u32,
}

impl QosFeedback {
    pub fn serialize(&self) -> Vec<u8> {
        let nack_count = self.nack_seqs.len().min(QOS_FEEDBACK_MAX_NACKS);
        let extra = nack_count.saturating_sub(2);

        let mut buf =
            Vec::with_capacity(QOS_FEEDBACK_BASE_SIZE + extra * 2 + QOS_FEEDBACK_TRAILER_SIZE);
        buf.push(PacketType::QosFeedback.dispatch_byte());
        buf.push(0); // flags
        buf.extend_from_slice(&self.last_seq.to_be_bytes());
        buf.extend_from_slice(&self.bandwidth_kbps.to_be_bytes());
        buf.extend_from_slice(&self.loss_x10000.to_be_bytes());
        buf.extend_from_slice(&self.jitter_us.to_be_bytes());
        buf.extend_from_slice(&self.delay_gradient_us.to_be_bytes());
        buf.extend_from_slice(&(nack_count as u16).to_be_bytes());
        buf.extend_from_slice(&self.nack_seqs.first().copied().unwrap_or(0).to_be_bytes());
        buf.extend_from_slice(&self.nack_seqs.get(1).copied().unwrap_or(0).to_be_bytes());
        for seq in self.nack_seqs.iter().take(nack_count).skip(2) {
            buf.extend_from_slice(&seq.to_be_bytes());
        }
        buf.extend_from_slice(&self.decode_time_us.to_be_bytes());
        buf.extend_from_slice(&self.frames_decoded.to_be_bytes());
        buf.extend_from_slice(&self.frames_dropped.to_be_bytes());
        buf
    }

    pub fn parse(data: &[u8]) -> Result<QosFeedback> {
        if data.len() < QOS_FEEDBACK_BASE_SIZE {
            bail!("QoS feedback too short: {} bytes", data.len());
        }
        if PacketType::identify(data) != Some(PacketType::QosFeedback) {
            bail!("not a QoS feedback packet");
        }

        let last_seq = u16::from_be_bytes([data[2], data[3]]);
        let bandwidth_kbps = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let loss_x10000 = u16::from_be_bytes([data[8], data[9]]);
        let jitter_us = u16::from_be_bytes([data[10], data[11]]);
        let delay_gradient_us = i32::from_be_bytes([data[12], data[13], data[14], data[15]]);
        let nack_count = u16::from_be_bytes([data[16], data[17]]) as usize;
        let nack_count = nack_count.min(QOS_FEEDBACK_MAX_NACKS);

        let mut nack_seqs = Vec::with_capacity(nack_count);
        if nack_count > 0 {
            nack_seqs.push(u16::from_be_bytes([data[18], data[19]]));
        }
        if nack_count > 1 {
            nack_seqs.push(u16::from_be_bytes([data[20], data[21]]));
        }
        let mut pos = QOS_FEEDBACK_BASE_SIZE;
        for _ in 2..nack_count {
            if pos + 2 > data.len() {
                break;
            }
            nack_seqs.push(u16::from_be_bytes([data[pos], data[pos + 1]]));
            pos += 2;
        }

        // Client-load trailer, absent in minimal packets.
        let (decode_time_us, frames_decoded, frames_dropped) =
            if pos + QOS_FEEDBACK_TRAILER_SIZE <= data.len() {
                (
                    u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]),
                    u32::from_be_bytes([
                        data[pos + 4],
                        data[pos + 5],
                        data[pos + 6],
                        data[pos + 7],
                    ]),
                    u32::from_be_bytes([
                        data[pos + 8],
                        data[pos + 9],
                        data[pos + 10],
                        data[pos + 11],
                    ]),
                )
            } else {
                (0, 0, 0)
            };

        Ok(QosFeedback {
            last_seq,
            bandwidth_kbps,
            loss_x10000,
            jitter_us,
            delay_gradient_us,
            nack_seqs,
            decode_time_us,
            frames_decoded,
            frames_dropped,
        })
    }

    pub fn loss_ratio(&self) -> f32 {
        self.loss_x10000 as f32 / 10000.0
    }
}

// ---------------------------------------------------------------------------
// NACK
// ---------------------------------------------------------------------------

/// Build a standalone NACK packet: `type(1) count(1) seq_0(2) .. seq_n(2)`.
/// Returns `None` for an empty list (a zero-byte NACK list must not produce
/// a packet).
pub fn build_nack(seqs: &[u16]) -> Option<Vec<u8>> {
    if seqs.is_empty() {
        return None;
    }
    let count = seqs.len().min(255);
    let mut buf = Vec::with_capacity(2 + count * 2);
    buf.push(PacketType::Nack.dispatch_byte());
    buf.push(count as u8);
    for seq in &seqs[..count] {
        buf.extend_from_slice(&seq.to_be_bytes());
    }
    Some(buf)
}

/// Parse a standalone NACK packet into the requested sequence numbers.
pub fn parse_nack(data: &[u8]) -> Result<Vec<u16>> {
    if data.len() < 2 {
        bail!("NACK packet too short: {} bytes", data.len());
    }
    if PacketType::identify(data) != Some(PacketType::Nack) {
        bail!("not a NACK packet");
    }
    let count = data[1] as usize;
    if data.len() < 2 + count * 2 {
        bail!("NACK packet truncated: {} seqs, {} bytes", count, data.len());
    }
    let mut seqs = Vec::with_capacity(count);
    for i in 0..count {
        seqs.push(u16::from_be_bytes([data[2 + i * 2], data[3 + i * 2]]));
    }
    Ok(seqs)
}

// ---------------------------------------------------------------------------
// FEC
// ---------------------------------------------------------------------------

/// FEC parity packet header. The payload is the XOR of two data fragments
/// of the group, zero-padded to the longer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FecHeader {
    pub sequence: u16,
    pub group_id: u8,
    /// Number of data fragments in the protected group.
    pub group_size: u8,
    pub fec_index: u8,
    /// Low byte of the protected frame's number.
    pub frame_number_low: u8,
}

impl FecHeader {
    pub fn serialize(&self, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FEC_HEADER_SIZE + payload.len());
        buf.push(PacketType::Fec.dispatch_byte());
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.push(self.group_id);
        buf.push(self.group_size);
        buf.push(self.fec_index);
        buf.push(self.frame_number_low);
        buf.extend_from_slice(payload);
        buf
    }

    pub fn parse(data: &[u8]) -> Result<(FecHeader, &[u8])> {
        if data.len() < FEC_HEADER_SIZE {
            bail!("FEC packet too short: {} bytes", data.len());
        }
        if PacketType::identify(data) != Some(PacketType::Fec) {
            bail!("not a FEC packet");
        }
        Ok((
            FecHeader {
                sequence: u16::from_be_bytes([data[1], data[2]]),
                group_id: data[3],
                group_size: data[4],
                fec_index: data[5],
                frame_number_low: data[6],
            },
            &data[FEC_HEADER_SIZE..],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_video_header() -> VideoHeader {
        VideoHeader {
            codec: Codec::H264,
            sequence: 42,
            timestamp_us: 1_234_567,
            frame_number: 7,
            fragment_index: 2,
            fragment_total: 5,
            payload_length: 3,
            is_keyframe: true,
            end_of_frame: false,
        }
    }

    #[test]
    fn test_video_round_trip() {
        let hdr = sample_video_header();
        let wire = hdr.serialize(&[0xAA, 0xBB, 0xCC]);
        assert_eq!(wire.len(), VIDEO_HEADER_SIZE + 3);
        assert_eq!(wire[0], 0x41); // version 1, tag 0x01

        let (parsed, payload) = VideoHeader::parse(&wire).unwrap();
        assert_eq!(parsed, hdr);
        assert_eq!(payload, &[0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn test_video_length_mismatch_rejected() {
        let hdr = sample_video_header();
        let mut wire = hdr.serialize(&[1, 2, 3]);
        wire.push(0xFF);
        assert!(VideoHeader::parse(&wire).is_err());
    }

    #[test]
    fn test_video_too_short() {
        assert!(VideoHeader::parse(&[0x41, 0, 0]).is_err());
    }

    #[test]
    fn test_audio_round_trip() {
        let hdr = AudioHeader {
            channel_id: 0,
            sequence: 9,
            timestamp_us: 555,
        };
        let opus = vec![0x11; 120];
        let wire = hdr.serialize(&opus);
        assert_eq!(wire[0], 0x42);

        let (parsed, payload) = AudioHeader::parse(&wire).unwrap();
        assert_eq!(parsed, hdr);
        assert_eq!(payload, &opus[..]);
    }

    #[test]
    fn test_qos_feedback_round_trip_small_nack_list() {
        let fb = QosFeedback {
            last_seq: 100,
            bandwidth_kbps: 25_000,
            loss_x10000: 250,
            jitter_us: 1500,
            delay_gradient_us: -42,
            nack_seqs: vec![3, 9],
            decode_time_us: 8000,
            frames_decoded: 600,
            frames_dropped: 2,
        };
        let wire = fb.serialize();
        let parsed = QosFeedback::parse(&wire).unwrap();
        assert_eq!(parsed, fb);
    }

    #[test]
    fn test_qos_feedback_extended_nack_list() {
        let fb = QosFeedback {
            last_seq: 7,
            nack_seqs: (0..20).collect(),
            ..Default::default()
        };
        let parsed = QosFeedback::parse(&fb.serialize()).unwrap();
        assert_eq!(parsed.nack_seqs, fb.nack_seqs);
    }

    #[test]
    fn test_qos_feedback_nack_list_capped_at_64() {
        let fb = QosFeedback {
            nack_seqs: (0..200).collect(),
            ..Default::default()
        };
        let parsed = QosFeedback::parse(&fb.serialize()).unwrap();
        assert_eq!(parsed.nack_seqs.len(), QOS_FEEDBACK_MAX_NACKS);
    }

    #[test]
    fn test_qos_feedback_without_trailer_parses_zeroed() {
        let fb = QosFeedback {
            last_seq: 3,
            bandwidth_kbps: 1000,
            ..Default::default()
        };
        let mut wire = fb.serialize();
        wire.truncate(QOS_FEEDBACK_BASE_SIZE);
        let parsed = QosFeedback::parse(&wire).unwrap();
        assert_eq!(parsed.last_seq, 3);
        assert_eq!(parsed.decode_time_us, 0);
        assert_eq!(parsed.frames_decoded, 0);
    }

    #[test]
    fn test_nack_wire_format() {
        // A single missing seq 1 encodes as {0x20, 0x01, 0x00, 0x01}.
        let wire = build_nack(&[1]).unwrap();
        assert_eq!(wire, vec![0x20, 0x01, 0x00, 0x01]);
        assert_eq!(parse_nack(&wire).unwrap(), vec![1]);
    }

    #[test]
    fn test_empty_nack_list_produces_no_packet() {
        assert!(build_nack(&[]).is_none());
    }

    #[test]
    fn test_fec_round_trip() {
        let hdr = FecHeader {
            sequence: 5,
            group_id: 9,
            group_size: 5,
            fec_index: 0,
            frame_number_low: 1,
        };
        let wire = hdr.serialize(&[0xDE, 0xAD]);
        assert_eq!(wire[0], 0xFC);
        let (parsed, payload) = FecHeader::parse(&wire).unwrap();
        assert_eq!(parsed, hdr);
        assert_eq!(payload, &[0xDE, 0xAD]);
    }

    #[test]
    fn test_fragment_payload_fits_mtu() {
        let hdr = VideoHeader {
            payload_length: MAX_VIDEO_PAYLOAD as u32,
            ..sample_video_header()
        };
        let wire = hdr.serialize(&vec![0u8; MAX_VIDEO_PAYLOAD]);
        assert_eq!(wire.len(), MTU);
    }
}
