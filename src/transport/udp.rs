//! UDP transport: fragmentation, wire assembly, send/receive.
//!
//! Owns the connected UDP socket (all other components do their I/O
//! through it), an optional DTLS context, the video/FEC sequence space,
//! and the retransmission cache. Packets are cached pre-DTLS so NACK
//! retransmissions re-traverse the encryption layer.

use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::net::UdpSocket;

use super::cache::RetransmitCache;
use super::dtls::DtlsContext;
use crate::media::EncodedFrame;
use crate::protocol::{FecHeader, PacketType, VideoHeader, MAX_VIDEO_PAYLOAD};
use crate::qos::BandwidthEstimator;
use crate::util::now_us;

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    dtls: Option<Mutex<DtlsContext>>,
    cache: RetransmitCache,
    seq: AtomicU16,
    bytes_sent: AtomicU64,
    send_errors: AtomicU64,
    /// Host-side estimator notified of every data-packet send.
    estimator: Option<Arc<BandwidthEstimator>>,
}

impl UdpTransport {
    /// Wrap a connected socket. `dtls` must already be established (or
    /// `None` to send in the clear, e.g. under test).
    pub fn new(
        socket: Arc<UdpSocket>,
        dtls: Option<DtlsContext>,
        estimator: Option<Arc<BandwidthEstimator>>,
    ) -> Self {
        UdpTransport {
            socket,
            dtls: dtls.map(Mutex::new),
            cache: RetransmitCache::new(),
            seq: AtomicU16::new(0),
            bytes_sent: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            estimator,
        }
    }

    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    /// Next sequence number in the video/FEC space.
    pub fn current_seq(&self) -> u16 {
        self.seq.load(Ordering::Relaxed)
    }

    pub fn total_bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn send_errors(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }

    /// Fragment an encoded frame to MTU-sized video packets and send them.
    /// Returns the serialized (pre-DTLS) fragments for FEC generation.
    pub async fn send_video_frame(
        &self,
        frame: &EncodedFrame,
        frame_number: u16,
    ) -> Result<Vec<Vec<u8>>> {
        let payload = &frame.data;
        let fragment_total = payload.len().div_ceil(MAX_VIDEO_PAYLOAD).max(1);
        anyhow::ensure!(
            fragment_total <= u8::MAX as usize,
            "frame of {} bytes exceeds {} fragments",
            payload.len(),
            u8::MAX
        );

        let mut packets = Vec::with_capacity(fragment_total);
        for index in 0..fragment_total {
            let offset = index * MAX_VIDEO_PAYLOAD;
            let chunk = &payload[offset..payload.len().min(offset + MAX_VIDEO_PAYLOAD)];

            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            let header = VideoHeader {
                codec: frame.codec,
                sequence: seq,
                timestamp_us: frame.timestamp_us as u32,
                frame_number,
                fragment_index: index as u8,
                fragment_total: fragment_total as u8,
                payload_length: chunk.len() as u32,
                is_keyframe: frame.is_keyframe,
                end_of_frame: index + 1 == fragment_total,
            };

            let packet = header.serialize(chunk);
            self.cache.cache(seq, &packet);
            self.send_data(seq, &packet).await?;
            packets.push(packet);
        }

        Ok(packets)
    }

    /// Send one Opus audio packet. Audio runs its own sequence space and
    /// is not NACK-cached (concealment covers losses).
    pub async fn send_audio_packet(&self, packet: &[u8]) -> Result<()> {
        self.send_raw(packet).await
    }

    /// Send FEC parity packets for a fragment group on fresh sequences.
    pub async fn send_fec_packets(
        &self,
        parity: &[Vec<u8>],
        frame_number: u16,
        group_id: u8,
        group_size: u8,
    ) -> Result<()> {
        for (index, payload) in parity.iter().enumerate() {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            let header = FecHeader {
                sequence: seq,
                group_id,
                group_size,
                fec_index: index as u8,
                frame_number_low: (frame_number & 0xFF) as u8,
            };
            let packet = header.serialize(payload);
            self.cache.cache(seq, &packet);
            self.send_data(seq, &packet).await?;
        }
        Ok(())
    }

    /// Send a pre-built control packet (feedback, NACK, input, clipboard)
    /// without caching or sequence assignment.
    pub async fn send_control(&self, packet: &[u8]) -> Result<()> {
        self.send_raw(packet).await
    }

    /// Retransmit cached packets for the requested sequences, if still in
    /// the ring window.
    pub async fn on_nack_received(&self, seqs: &[u16]) {
        for &seq in seqs {
            match self.cache.lookup(seq) {
                Some(packet) => {
                    if let Err(e) = self.send_raw(&packet).await {
                        tracing::debug!("retransmit of seq {} failed: {}", seq, e);
                    } else {
                        tracing::trace!("retransmitted seq {}", seq);
                    }
                }
                None => tracing::debug!("NACK for seq {} outside cache window", seq),
            }
        }
    }

    /// Receive and decrypt one datagram, non-blocking. Returns the packet
    /// type and plaintext, or `None` when no (application) datagram is
    /// ready.
    pub async fn receive_one(&self) -> Result<Option<(PacketType, Vec<u8>)>> {
        let mut buf = vec![0u8; 65536];
        let n = match self.socket.try_recv(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => return Ok(None),
            Err(e) => return Err(e).context("recv failed"),
        };
        buf.truncate(n);

        let plain = match &self.dtls {
            Some(dtls) => match dtls.lock().unwrap().decrypt(&buf)? {
                Some(p) => p,
                None => return Ok(None),
            },
            None => buf,
        };

        match PacketType::identify(&plain) {
            Some(ty) => Ok(Some((ty, plain))),
            None => {
                tracing::trace!("dropping unknown packet ({} bytes)", plain.len());
                Ok(None)
            }
        }
    }

    /// Gracefully shut down the DTLS session.
    pub async fn shutdown(&self) {
        if let Some(dtls) = &self.dtls {
            let records = dtls.lock().unwrap().shutdown_records();
            for record in records {
                let _ = self.socket.send(&record).await;
            }
        }
    }

    async fn send_data(&self, seq: u16, packet: &[u8]) -> Result<()> {
        if let Some(estimator) = &self.estimator {
            estimator.on_packet_sent(seq, packet.len(), now_us());
        }
        self.send_raw(packet).await
    }

    async fn send_raw(&self, packet: &[u8]) -> Result<()> {
        let wire = match &self.dtls {
            Some(dtls) => dtls.lock().unwrap().encrypt(packet)?,
            None => packet.to_vec(),
        };

        match self.socket.send(&wire).await {
            Ok(n) => {
                self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                // Transient send errors are counted, not fatal; persistent
                // failure surfaces through the liveness/reconnect timers.
                self.send_errors.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("send failed: {}", e);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::Codec;
    use crate::protocol::{parse_nack, MTU};

    async fn pair() -> (Arc<UdpSocket>, Arc<UdpSocket>) {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.connect(b.local_addr().unwrap()).await.unwrap();
        b.connect(a.local_addr().unwrap()).await.unwrap();
        (Arc::new(a), Arc::new(b))
    }

    fn frame_of(len: usize) -> EncodedFrame {
        EncodedFrame {
            data: (0..len).map(|i| i as u8).collect(),
            timestamp_us: 99,
            frame_number: 0,
            is_keyframe: true,
            codec: Codec::H264,
        }
    }

    #[tokio::test]
    async fn test_fragmentation_and_sequences() {
        let (a, b) = pair().await;
        let transport = UdpTransport::new(a, None, None);

        // 8000 bytes => ceil(8000 / 1382) = 6 fragments, seqs 0..=5.
        let packets = transport.send_video_frame(&frame_of(8000), 1).await.unwrap();
        assert_eq!(packets.len(), 6);
        assert_eq!(transport.current_seq(), 6);

        let mut reassembled = Vec::new();
        let mut buf = vec![0u8; 2048];
        for expected_seq in 0u16..6 {
            let n = b.recv(&mut buf).await.unwrap();
            assert!(n <= MTU);
            let (header, payload) = VideoHeader::parse(&buf[..n]).unwrap();
            assert_eq!(header.sequence, expected_seq);
            assert_eq!(header.fragment_total, 6);
            assert_eq!(header.frame_number, 1);
            assert!(header.is_keyframe);
            reassembled.extend_from_slice(payload);
        }
        assert_eq!(reassembled, frame_of(8000).data);
    }

    #[tokio::test]
    async fn test_sequence_continuity_across_frames() {
        let (a, _b) = pair().await;
        let transport = UdpTransport::new(a, None, None);

        transport.send_video_frame(&frame_of(100), 0).await.unwrap();
        transport.send_video_frame(&frame_of(3000), 1).await.unwrap();
        // 1 fragment + 3 fragments.
        assert_eq!(transport.current_seq(), 4);
    }

    #[tokio::test]
    async fn test_nack_retransmits_exact_bytes() {
        let (a, b) = pair().await;
        let transport = UdpTransport::new(a, None, None);

        let packets = transport.send_video_frame(&frame_of(3000), 0).await.unwrap();

        // Drain the original sends.
        let mut buf = vec![0u8; 2048];
        for _ in 0..packets.len() {
            b.recv(&mut buf).await.unwrap();
        }

        transport.on_nack_received(&[1]).await;
        let n = b.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &packets[1][..]);
    }

    #[tokio::test]
    async fn test_nack_outside_window_ignored() {
        let (a, b) = pair().await;
        let transport = UdpTransport::new(a, None, None);

        transport.on_nack_received(&[1000]).await;

        // Nothing should arrive.
        let mut buf = [0u8; 64];
        let result =
            tokio::time::timeout(std::time::Duration::from_millis(50), b.recv(&mut buf)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_receive_one_dispatch() {
        let (a, b) = pair().await;
        let receiver = UdpTransport::new(b, None, None);

        let nack = crate::protocol::build_nack(&[7]).unwrap();
        a.send(&nack).await.unwrap();

        // Give the datagram a moment to land.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let (ty, data) = receiver.receive_one().await.unwrap().unwrap();
        assert_eq!(ty, PacketType::Nack);
        assert_eq!(parse_nack(&data).unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn test_receive_one_empty_socket() {
        let (_a, b) = pair().await;
        let receiver = UdpTransport::new(b, None, None);
        assert!(receiver.receive_one().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bytes_sent_counter() {
        let (a, _b) = pair().await;
        let transport = UdpTransport::new(a, None, None);
        transport.send_video_frame(&frame_of(100), 0).await.unwrap();
        assert!(transport.total_bytes_sent() > 100);
    }
}
