//! Host session: capture → encode → fragment → send, with adaptive QoS.
//!
//! Task layout while streaming:
//! - streaming task: frame pacing, capture, encode, fragment + FEC send
//! - audio task: capture callback → Opus encode → audio packets
//! - receive task: feedback → QoS, NACK → retransmit cache, clipboard,
//!   input dispatch

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{ClipboardSync, InputSink, PeerInfo, SessionDescriptor, SessionState};
use crate::error::{Result, SessionError};
use crate::media::{
    AudioCapture, AudioEncoder, CaptureDevice, Codec, EncoderConfig, VideoEncoder,
};
use crate::p2p::{Candidate, IceAgent, IceConfig};
use crate::protocol::{self, AudioHeader, InputEvent, PacketType, QosFeedback};
use crate::qos::{
    BandwidthEstimator, FeedbackSample, QosController, QosPreset, Resolution, StreamProfile,
};
use crate::transport::{DtlsContext, DtlsRole, FecEncoder, UdpTransport};
use crate::util::now_us;

/// EMA weight for capture/encode timing stats.
const TIMING_EMA_ALPHA: f32 = 0.1;

/// Busy-wait tail of the frame pacing sleep.
const PACING_SPIN_US: u64 = 500;

/// Idle sleep in the receive loop.
const RECV_IDLE: Duration = Duration::from_millis(1);

/// Clipboard retry poll period inside the receive loop.
const CLIPBOARD_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub codec: Codec,
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: u32,
    pub fps: u32,
    pub profile: StreamProfile,
    pub stun_servers: Vec<String>,
    /// Overrides ICE interface enumeration (tests, multi-homed hosts).
    pub ice_bind_addrs: Option<Vec<SocketAddr>>,
    pub vpn_mode: bool,
    /// Encoding pauses when no feedback arrives for this long.
    pub viewer_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            codec: Codec::H264,
            width: 1920,
            height: 1080,
            bitrate_kbps: 20_000,
            fps: 60,
            profile: StreamProfile::Balanced,
            stun_servers: Vec::new(),
            ice_bind_addrs: None,
            vpn_mode: false,
            viewer_timeout: Duration::from_secs(15),
        }
    }
}

/// Control-surface statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct HostStats {
    pub bitrate_kbps: u32,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub loss: f32,
    pub jitter_ms: f32,
    pub rtt_ms: f32,
    pub capture_ms: f32,
    pub encode_ms: f32,
    pub bytes_sent: u64,
    pub frames_sent: u64,
    pub fec_ratio: f32,
    pub connection_type: &'static str,
    pub profile: String,
}

struct HostShared {
    last_feedback_us: AtomicU64,
    viewer_alive: AtomicBool,
    force_idr: AtomicBool,
    frames_sent: AtomicU64,
    avg_capture_ms: Mutex<f32>,
    avg_encode_ms: Mutex<f32>,
}

pub struct HostSession {
    state: SessionState,
    config: HostConfig,
    session_id: String,

    capture: Arc<Mutex<Box<dyn CaptureDevice>>>,
    encoder: Arc<dyn VideoEncoder>,
    audio: Option<(Box<dyn AudioCapture>, Box<dyn AudioEncoder>)>,
    input_sink: Option<Arc<dyn InputSink>>,

    fec: Option<Arc<FecEncoder>>,
    estimator: Option<Arc<BandwidthEstimator>>,
    qos: Option<Arc<Mutex<QosController>>>,
    dtls: Option<DtlsContext>,
    ice: Option<IceAgent>,
    transport: Option<Arc<UdpTransport>>,
    clipboard: Arc<ClipboardSync>,

    shared: Arc<HostShared>,
    tasks: Vec<JoinHandle<()>>,
}

impl HostSession {
    pub fn new(capture: Box<dyn CaptureDevice>, encoder: Arc<dyn VideoEncoder>) -> Self {
        HostSession {
            state: SessionState::Idle,
            config: HostConfig::default(),
            session_id: String::new(),
            capture: Arc::new(Mutex::new(capture)),
            encoder,
            audio: None,
            input_sink: None,
            fec: None,
            estimator: None,
            qos: None,
            dtls: None,
            ice: None,
            transport: None,
            clipboard: ClipboardSync::for_host(),
            shared: Arc::new(HostShared {
                last_feedback_us: AtomicU64::new(0),
                viewer_alive: AtomicBool::new(true),
                force_idr: AtomicBool::new(false),
                frames_sent: AtomicU64::new(0),
                avg_capture_ms: Mutex::new(0.0),
                avg_encode_ms: Mutex::new(0.0),
            }),
            tasks: Vec::new(),
        }
    }

    /// Attach the audio pipeline. Audio failures are non-fatal: without a
    /// working capture the session simply streams video only.
    pub fn with_audio(
        mut self,
        capture: Box<dyn AudioCapture>,
        encoder: Box<dyn AudioEncoder>,
    ) -> Self {
        self.audio = Some((capture, encoder));
        self
    }

    pub fn set_input_sink(&mut self, sink: Arc<dyn InputSink>) {
        self.input_sink = Some(sink);
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn clipboard(&self) -> &Arc<ClipboardSync> {
        &self.clipboard
    }

    /// Idle → Prepared: validate hardware, configure the encoder, build
    /// FEC and the DTLS identity, gather ICE candidates, reset counters.
    pub async fn prepare(&mut self, config: HostConfig) -> Result<SessionDescriptor> {
        if self.state != SessionState::Idle {
            return Err(SessionError::InvalidState("prepare requires Idle"));
        }

        if !self.encoder.is_codec_supported(config.codec) {
            return Err(SessionError::CodecUnsupported(config.codec));
        }

        self.capture
            .lock()
            .unwrap()
            .initialize(0)
            .map_err(|e| SessionError::CaptureInitFailure(e.to_string()))?;

        let native = Resolution::new(config.width, config.height);
        let preset = QosPreset::for_profile(config.profile, native);

        let encoder_config = EncoderConfig {
            codec: config.codec,
            width: config.width,
            height: config.height,
            bitrate_kbps: config.bitrate_kbps,
            max_bitrate_kbps: preset.max_bitrate_kbps,
            min_bitrate_kbps: preset.min_bitrate_kbps,
            fps: config.fps,
            gop_length: config.fps * 2,
            enable_intra_refresh: true,
            intra_refresh_period: config.fps,
        };
        self.encoder
            .initialize(&encoder_config)
            .map_err(SessionError::Other)?;
        tracing::info!(
            "encoder configured: {}x{} {} @ {} kbps, {} fps",
            config.width,
            config.height,
            config.codec.name(),
            config.bitrate_kbps,
            config.fps
        );

        let fec = Arc::new(FecEncoder::new());
        fec.set_redundancy_ratio(preset.min_fec_ratio);

        let estimator = Arc::new(BandwidthEstimator::new());

        let mut qos = QosController::new(self.encoder.clone(), fec.clone(), estimator.clone());
        qos.set_base_config(encoder_config);
        qos.apply_preset(preset);
        if config.vpn_mode {
            qos.set_vpn_mode(true);
        }

        let dtls = DtlsContext::new(DtlsRole::Server).map_err(SessionError::Other)?;
        tracing::info!("DTLS fingerprint: {}", dtls.fingerprint());

        let mut ice = IceAgent::new(IceConfig {
            stun_servers: config.stun_servers.clone(),
            bind_addrs: config.ice_bind_addrs.clone(),
        });
        let candidates = ice
            .gather_candidates()
            .await
            .map_err(SessionError::Other)?;
        tracing::info!("ICE gathered {} candidates", candidates.len());

        self.session_id = uuid::Uuid::new_v4().to_string();
        self.shared.frames_sent.store(0, Ordering::Relaxed);
        self.shared.force_idr.store(false, Ordering::Relaxed);
        *self.shared.avg_capture_ms.lock().unwrap() = 0.0;
        *self.shared.avg_encode_ms.lock().unwrap() = 0.0;

        let descriptor = SessionDescriptor {
            session_id: self.session_id.clone(),
            dtls_fingerprint: dtls.fingerprint().to_string(),
            candidates,
            codec: config.codec,
        };

        self.fec = Some(fec);
        self.estimator = Some(estimator);
        self.qos = Some(Arc::new(Mutex::new(qos)));
        self.dtls = Some(dtls);
        self.ice = Some(ice);
        self.config = config;
        self.state = SessionState::Prepared;

        tracing::info!("session {} prepared", self.session_id);
        Ok(descriptor)
    }

    /// Inject a remote candidate received via signaling.
    pub fn add_remote_candidate(&self, candidate: Candidate) -> Result<()> {
        match &self.ice {
            Some(ice) => {
                ice.add_remote_candidate(candidate);
                Ok(())
            }
            None => Err(SessionError::InvalidState("no ICE agent; call prepare")),
        }
    }

    /// Run connectivity checks against the injected remote candidates and
    /// return the selected peer addressing for `start`.
    pub async fn check_connectivity(&self) -> Result<PeerInfo> {
        let ice = self
            .ice
            .as_ref()
            .ok_or(SessionError::InvalidState("no ICE agent; call prepare"))?;
        let result = ice
            .check_connectivity()
            .await
            .map_err(|_| SessionError::IceTimeout)?;
        Ok(PeerInfo {
            remote: result.remote.addr(),
            local_bind: Some(result.local.addr()),
        })
    }

    /// Prepared → Connecting → Streaming: open the socket, run the DTLS
    /// handshake and protocol-version exchange, wire the transport, and
    /// spawn the worker tasks.
    pub async fn start(&mut self, peer: PeerInfo) -> Result<()> {
        if self.state != SessionState::Prepared {
            return Err(SessionError::InvalidState("start requires Prepared"));
        }
        self.state = SessionState::Connecting;

        // Release the gathering sockets so a fixed local bind is free.
        self.ice = None;

        let bind = peer
            .local_bind
            .unwrap_or_else(|| "0.0.0.0:0".parse().unwrap());
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(SessionError::TransportBindFailure)?;
        socket
            .connect(peer.remote)
            .await
            .map_err(SessionError::TransportBindFailure)?;
        tracing::info!("peer address: {}", peer.remote);
        let socket = Arc::new(socket);

        let mut dtls = self
            .dtls
            .take()
            .ok_or(SessionError::InvalidState("missing DTLS context"))?;

        match dtls.handshake(&socket).await {
            Ok(()) => {}
            Err(e) => {
                self.state = SessionState::Prepared;
                return Err(SessionError::DtlsHandshakeFailure(e.to_string()));
            }
        }
        match dtls.exchange_version_tag(&socket).await {
            Ok(true) => tracing::info!("protocol version verified: CS01"),
            Ok(false) => {
                self.state = SessionState::Prepared;
                return Err(SessionError::ProtocolVersionMismatch);
            }
            Err(e) => {
                self.state = SessionState::Prepared;
                return Err(SessionError::DtlsHandshakeFailure(e.to_string()));
            }
        }

        let estimator = self.estimator.clone().expect("prepared");
        let transport = Arc::new(UdpTransport::new(
            socket,
            Some(dtls),
            Some(estimator.clone()),
        ));

        self.shared.last_feedback_us.store(now_us(), Ordering::Relaxed);
        self.shared.viewer_alive.store(true, Ordering::Relaxed);

        let qos = self.qos.clone().expect("prepared");
        let fec = self.fec.clone().expect("prepared");

        self.tasks.push(tokio::spawn(streaming_loop(
            self.capture.clone(),
            self.encoder.clone(),
            transport.clone(),
            fec,
            qos.clone(),
            self.shared.clone(),
            self.config.viewer_timeout,
        )));

        if let Some((audio_capture, audio_encoder)) = self.audio.take() {
            self.tasks.push(tokio::spawn(audio_loop(
                audio_capture,
                audio_encoder,
                transport.clone(),
            )));
        }

        self.tasks.push(tokio::spawn(receive_loop(
            transport.clone(),
            qos,
            estimator,
            self.shared.clone(),
            self.clipboard.clone(),
            self.input_sink.clone(),
        )));

        self.transport = Some(transport);
        self.state = SessionState::Streaming;
        tracing::info!("streaming started for session {}", self.session_id);
        Ok(())
    }

    /// Stop the session. Idempotent; tears down tasks in reverse
    /// dependency order and releases every per-session resource.
    pub async fn stop(&mut self) {
        if self.state == SessionState::Idle {
            return;
        }
        tracing::info!("stopping session {}", self.session_id);
        self.state = SessionState::Stopping;

        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }

        if let Some(transport) = self.transport.take() {
            transport.shutdown().await;
        }

        self.encoder.flush();
        self.encoder.release();
        self.capture.lock().unwrap().release();

        self.qos = None;
        self.fec = None;
        self.estimator = None;
        self.dtls = None;
        self.ice = None;
        self.audio = None;

        self.state = SessionState::Idle;
        tracing::info!("session stopped");
    }

    /// Request an IDR at the next encode.
    pub fn force_idr(&self) {
        self.shared.force_idr.store(true, Ordering::Relaxed);
        tracing::info!("IDR frame requested");
    }

    /// Mid-session bitrate/fps change. Only valid while streaming.
    pub fn reconfigure(&self, bitrate_kbps: u32, fps: u32) -> Result<()> {
        if self.state != SessionState::Streaming {
            return Err(SessionError::InvalidState("reconfigure requires Streaming"));
        }
        let qos = self.qos.as_ref().expect("streaming");
        qos.lock()
            .unwrap()
            .manual_reconfigure(bitrate_kbps, fps)
            .map_err(SessionError::Other)?;
        tracing::info!("encoder reconfigured: {} kbps, {} fps", bitrate_kbps, fps);
        Ok(())
    }

    /// Switch the streaming profile at runtime. Only valid while
    /// streaming.
    pub fn set_profile(&mut self, profile: StreamProfile) -> Result<()> {
        if self.state != SessionState::Streaming {
            return Err(SessionError::InvalidState("set_profile requires Streaming"));
        }
        let native = Resolution::new(self.config.width, self.config.height);
        let preset = QosPreset::for_profile(profile, native);
        self.qos
            .as_ref()
            .expect("streaming")
            .lock()
            .unwrap()
            .apply_preset(preset);
        self.config.profile = profile;
        tracing::info!("profile changed to {}", profile.as_str());
        Ok(())
    }

    /// Register the callback fired when QoS changes the streaming
    /// resolution, so the embedder can resize the capture chain.
    pub fn set_on_resolution_change(
        &self,
        cb: Box<dyn Fn(u32, u32) + Send + Sync>,
    ) -> Result<()> {
        let qos = self
            .qos
            .as_ref()
            .ok_or(SessionError::InvalidState("call prepare first"))?;
        qos.lock().unwrap().set_resolution_change_callback(cb);
        Ok(())
    }

    /// Offer local clipboard text to the viewer.
    pub async fn send_clipboard_text(&self, text: &str) -> Result<()> {
        let transport = self
            .transport
            .as_ref()
            .ok_or(SessionError::InvalidState("clipboard requires Streaming"))?;
        self.clipboard
            .send_text(transport, text)
            .await
            .map_err(SessionError::Other)
    }

    pub fn stats(&self) -> HostStats {
        let mut stats = HostStats {
            connection_type: "p2p",
            capture_ms: *self.shared.avg_capture_ms.lock().unwrap(),
            encode_ms: *self.shared.avg_encode_ms.lock().unwrap(),
            frames_sent: self.shared.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self
                .transport
                .as_ref()
                .map(|t| t.total_bytes_sent())
                .unwrap_or(0),
            ..HostStats::default()
        };

        if let Some(qos) = &self.qos {
            let snapshot = qos.lock().unwrap().snapshot();
            stats.bitrate_kbps = snapshot.bitrate_kbps;
            stats.fps = snapshot.fps;
            stats.width = snapshot.width;
            stats.height = snapshot.height;
            stats.loss = snapshot.loss_rate;
            stats.jitter_ms = snapshot.jitter_us as f32 / 1000.0;
            stats.rtt_ms = snapshot.rtt_us as f32 / 1000.0;
            stats.fec_ratio = snapshot.fec_ratio;
            stats.profile = snapshot.profile_name;
        }

        stats
    }
}

impl Drop for HostSession {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Worker loops
// ---------------------------------------------------------------------------

async fn streaming_loop(
    capture: Arc<Mutex<Box<dyn CaptureDevice>>>,
    encoder: Arc<dyn VideoEncoder>,
    transport: Arc<UdpTransport>,
    fec: Arc<FecEncoder>,
    qos: Arc<Mutex<QosController>>,
    shared: Arc<HostShared>,
    viewer_timeout: Duration,
) {
    tracing::info!("streaming loop started");
    let mut frame_number: u16 = 0;

    loop {
        let frame_start = now_us();

        let fps = qos.lock().unwrap().snapshot().fps.max(1);
        let interval_us = 1_000_000u64 / fps as u64;

        // Viewer liveness: pause encoding while feedback is absent, force
        // an IDR on resume so the viewer can resynchronize.
        let last_feedback = shared.last_feedback_us.load(Ordering::Relaxed);
        if now_us().saturating_sub(last_feedback) > viewer_timeout.as_micros() as u64 {
            if shared.viewer_alive.swap(false, Ordering::Relaxed) {
                tracing::warn!(
                    "no feedback for {:?}, pausing encoding",
                    viewer_timeout
                );
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            continue;
        } else if !shared.viewer_alive.swap(true, Ordering::Relaxed) {
            tracing::info!("viewer feedback resumed, resuming encoding");
            encoder.force_idr();
        }

        if shared.force_idr.swap(false, Ordering::Relaxed) {
            encoder.force_idr();
        }

        let capture_start = now_us();
        let captured = { capture.lock().unwrap().capture_frame() };
        let frame = match captured {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("capture failed: {}", e);
                tokio::time::sleep(Duration::from_millis(1)).await;
                continue;
            }
        };
        let capture_ms = (now_us() - capture_start) as f32 / 1000.0;

        if !frame.is_new_frame {
            pace(frame_start, interval_us).await;
            continue;
        }

        let encode_start = now_us();
        let encoded = match encoder.encode(&frame, frame_number) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!("encode failed for frame {}: {}", frame_number, e);
                continue;
            }
        };
        let encode_ms = (now_us() - encode_start) as f32 / 1000.0;

        {
            let mut avg = shared.avg_capture_ms.lock().unwrap();
            *avg = *avg * (1.0 - TIMING_EMA_ALPHA) + capture_ms * TIMING_EMA_ALPHA;
        }
        {
            let mut avg = shared.avg_encode_ms.lock().unwrap();
            *avg = *avg * (1.0 - TIMING_EMA_ALPHA) + encode_ms * TIMING_EMA_ALPHA;
        }

        match transport.send_video_frame(&encoded, frame_number).await {
            Ok(packets) => {
                if packets.len() > 1 {
                    let (parity, group_id) = fec.encode(&packets);
                    if !parity.is_empty() {
                        if let Err(e) = transport
                            .send_fec_packets(&parity, frame_number, group_id, packets.len() as u8)
                            .await
                        {
                            tracing::debug!("FEC send failed: {}", e);
                        }
                    }
                }
                shared.frames_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => tracing::debug!("video send failed: {}", e),
        }

        frame_number = frame_number.wrapping_add(1);
        pace(frame_start, interval_us).await;
    }
}

/// Sleep out the frame interval, busy-waiting the final stretch to keep
/// pacing jitter below the scheduler's wakeup granularity.
async fn pace(frame_start_us: u64, interval_us: u64) {
    let elapsed = now_us().saturating_sub(frame_start_us);
    if elapsed >= interval_us {
        return;
    }
    let remaining = interval_us - elapsed;
    if remaining > PACING_SPIN_US {
        tokio::time::sleep(Duration::from_micros(remaining - PACING_SPIN_US)).await;
    }
    while now_us().saturating_sub(frame_start_us) < interval_us {
        std::hint::spin_loop();
    }
}

async fn audio_loop(
    mut capture: Box<dyn AudioCapture>,
    mut encoder: Box<dyn AudioEncoder>,
    transport: Arc<UdpTransport>,
) {
    if let Err(e) = capture.initialize() {
        tracing::warn!("audio capture init failed, audio disabled: {}", e);
        return;
    }

    let channels = capture.channels().max(1) as usize;
    let samples_per_packet = encoder.frame_size() * channels;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Vec<f32>>();
    if let Err(e) = capture.start(Box::new(move |pcm| {
        let _ = tx.send(pcm.to_vec());
    })) {
        tracing::warn!("audio capture start failed, audio disabled: {}", e);
        return;
    }
    tracing::info!(
        "audio loop started ({} ch, {} samples/packet)",
        channels,
        samples_per_packet
    );

    let mut pending: Vec<f32> = Vec::new();
    let mut audio_seq: u16 = 0;

    while let Some(chunk) = rx.recv().await {
        pending.extend_from_slice(&chunk);

        while pending.len() >= samples_per_packet {
            let frame: Vec<f32> = pending.drain(..samples_per_packet).collect();
            match encoder.encode(&frame) {
                Ok(opus) => {
                    let packet = AudioHeader {
                        channel_id: 0,
                        sequence: audio_seq,
                        timestamp_us: now_us() as u32,
                    }
                    .serialize(&opus);
                    if let Err(e) = transport.send_audio_packet(&packet).await {
                        tracing::debug!("audio send failed: {}", e);
                    }
                    audio_seq = audio_seq.wrapping_add(1);
                }
                Err(e) => tracing::debug!("audio encode failed: {}", e),
            }
        }
    }

    capture.stop();
    tracing::info!("audio loop stopped after {} packets", audio_seq);
}

async fn receive_loop(
    transport: Arc<UdpTransport>,
    qos: Arc<Mutex<QosController>>,
    estimator: Arc<BandwidthEstimator>,
    shared: Arc<HostShared>,
    clipboard: Arc<ClipboardSync>,
    input_sink: Option<Arc<dyn InputSink>>,
) {
    tracing::info!("feedback receive loop started");
    let mut last_clipboard_poll = Instant::now();

    loop {
        match transport.receive_one().await {
            Ok(Some((ty, data))) => match ty {
                PacketType::QosFeedback => {
                    let Ok(feedback) = QosFeedback::parse(&data) else {
                        continue;
                    };
                    shared.last_feedback_us.store(now_us(), Ordering::Relaxed);
                    estimator.on_ack_received(feedback.last_seq, now_us());

                    let sample = FeedbackSample {
                        received_packets: 10_000u32.saturating_sub(feedback.loss_x10000 as u32),
                        lost_packets: feedback.loss_x10000 as u32,
                        jitter_us: feedback.jitter_us as u32,
                        rtt_us: estimator.latest_rtt_us() as u32,
                        decode_time_us: feedback.decode_time_us,
                        frames_dropped: feedback.frames_dropped,
                        last_seq: feedback.last_seq,
                    };
                    qos.lock().unwrap().on_feedback(&sample);

                    if !feedback.nack_seqs.is_empty() {
                        transport.on_nack_received(&feedback.nack_seqs).await;
                    }
                }
                PacketType::Nack => {
                    if let Ok(seqs) = protocol::parse_nack(&data) {
                        transport.on_nack_received(&seqs).await;
                    }
                }
                PacketType::Clipboard => {
                    if let Some(ack) = clipboard.on_packet(&data) {
                        let _ = transport.send_control(&ack).await;
                    }
                }
                PacketType::ClipAck => clipboard.on_ack(&data),
                PacketType::Input => {
                    if let (Some(sink), Ok(event)) = (&input_sink, InputEvent::parse(&data)) {
                        sink.on_input(event);
                    }
                }
                PacketType::Controller => {
                    if let (Some(sink), Ok(state)) =
                        (&input_sink, protocol::ControllerPacket::parse(&data))
                    {
                        sink.on_controller(&state);
                    }
                }
                _ => tracing::trace!("host dropping {:?} packet", ty),
            },
            Ok(None) => tokio::time::sleep(RECV_IDLE).await,
            Err(e) => {
                tracing::debug!("receive error: {}", e);
                tokio::time::sleep(RECV_IDLE).await;
            }
        }

        if last_clipboard_poll.elapsed() >= CLIPBOARD_POLL {
            last_clipboard_poll = Instant::now();
            let _ = clipboard.poll_retry(&transport).await;
        }
    }
}
