//! Viewer session: receive → reassemble → decode → render, with audio
//! playback, NACK/FEC loss repair, and periodic QoS feedback.
//!
//! Task layout while streaming:
//! - receive task: decrypt + dispatch (video → jitter/NACK/stats/FEC,
//!   audio → queue, clipboard)
//! - decode task: drains complete frames in order into the latest-wins
//!   render slot
//! - render task: presents the pending frame
//! - audio task: Opus decode + playback with loss concealment
//! - NACK scan task (5 ms) and stats feedback task (200 ms)
//! - watchdog: reconnect request after 10 s of silence, disconnect after
//!   30 s

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{ClipboardSync, InputSender, PeerInfo, SessionDescriptor, SessionState};
use crate::error::{Result, SessionError};
use crate::media::{AudioDecoder, AudioPlayback, Codec, DecodedFrame, Renderer, VideoDecoder};
use crate::p2p::{Candidate, IceAgent, IceConfig};
use crate::protocol::{AudioHeader, FecHeader, PacketType, VideoHeader};
use crate::qos::{StatsReporter, ViewerStats};
use crate::transport::{DtlsContext, DtlsRole, FecRecovery, JitterBuffer, NackTracker, UdpTransport};
use crate::util::now_us;

const RECV_IDLE: Duration = Duration::from_millis(1);
const DECODE_WAIT: Duration = Duration::from_millis(5);
const RENDER_WAIT: Duration = Duration::from_millis(16);
const AUDIO_WAIT: Duration = Duration::from_millis(5);
const WATCHDOG_TICK: Duration = Duration::from_millis(500);
const CLIPBOARD_POLL: Duration = Duration::from_millis(200);

/// Viewer-side latency/quality trade-off, mapped to the jitter buffer
/// target depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityPreset {
    Performance,
    Balanced,
    Quality,
}

impl QualityPreset {
    pub fn jitter_depth_ms(self) -> u64 {
        match self {
            QualityPreset::Performance => 10,
            QualityPreset::Balanced => 20,
            QualityPreset::Quality => 40,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ViewerConfig {
    pub codec: Codec,
    pub width: u32,
    pub height: u32,
    pub quality: QualityPreset,
    /// Host DTLS fingerprint received out-of-band; the handshake is
    /// rejected when the peer certificate does not match.
    pub host_fingerprint: Option<String>,
    pub stun_servers: Vec<String>,
    pub ice_bind_addrs: Option<Vec<SocketAddr>>,
    /// Silence on the wire for this long triggers a reconnect request.
    pub reconnect_timeout: Duration,
    /// Total silence budget before the session gives up.
    pub reconnect_budget: Duration,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        ViewerConfig {
            codec: Codec::H264,
            width: 1920,
            height: 1080,
            quality: QualityPreset::Balanced,
            host_fingerprint: None,
            stun_servers: Vec::new(),
            ice_bind_addrs: None,
            reconnect_timeout: Duration::from_secs(10),
            reconnect_budget: Duration::from_secs(30),
        }
    }
}

struct ViewerShared {
    last_packet_us: AtomicU64,
}

type EventCallback = Box<dyn Fn() + Send + Sync>;

pub struct ViewerSession {
    state: SessionState,
    config: ViewerConfig,
    session_id: String,

    decoder: Arc<Mutex<Box<dyn VideoDecoder>>>,
    renderer: Arc<Mutex<Box<dyn Renderer>>>,
    audio: Option<(Box<dyn AudioDecoder>, Box<dyn AudioPlayback>)>,

    jitter: Arc<JitterBuffer>,
    nack: Arc<NackTracker>,
    reporter: Arc<StatsReporter>,
    recovery: Arc<FecRecovery>,
    clipboard: Arc<ClipboardSync>,

    dtls: Option<DtlsContext>,
    ice: Option<IceAgent>,
    transport: Option<Arc<UdpTransport>>,
    input: Option<Arc<InputSender>>,

    shared: Arc<ViewerShared>,
    on_disconnect: Arc<Mutex<Option<EventCallback>>>,
    on_reconnect_needed: Arc<Mutex<Option<EventCallback>>>,

    tasks: Vec<JoinHandle<()>>,
}

impl ViewerSession {
    pub fn new(decoder: Box<dyn VideoDecoder>, renderer: Box<dyn Renderer>) -> Self {
        ViewerSession {
            state: SessionState::Idle,
            config: ViewerConfig::default(),
            session_id: String::new(),
            decoder: Arc::new(Mutex::new(decoder)),
            renderer: Arc::new(Mutex::new(renderer)),
            audio: None,
            jitter: Arc::new(JitterBuffer::new()),
            nack: Arc::new(NackTracker::new()),
            reporter: Arc::new(StatsReporter::new()),
            recovery: Arc::new(FecRecovery::new()),
            clipboard: ClipboardSync::for_viewer(),
            dtls: None,
            ice: None,
            transport: None,
            input: None,
            shared: Arc::new(ViewerShared {
                last_packet_us: AtomicU64::new(0),
            }),
            on_disconnect: Arc::new(Mutex::new(None)),
            on_reconnect_needed: Arc::new(Mutex::new(None)),
            tasks: Vec::new(),
        }
    }

    /// Attach the audio pipeline; failures at start are non-fatal.
    pub fn with_audio(
        mut self,
        decoder: Box<dyn AudioDecoder>,
        playback: Box<dyn AudioPlayback>,
    ) -> Self {
        self.audio = Some((decoder, playback));
        self
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

    /// Input sender, available while streaming.
    pub fn input(&self) -> Option<&Arc<InputSender>> {
        self.input.as_ref()
    }

    pub fn set_on_disconnect(&self, cb: EventCallback) {
        *self.on_disconnect.lock().unwrap() = Some(cb);
    }

    pub fn set_on_reconnect_needed(&self, cb: EventCallback) {
        *self.on_reconnect_needed.lock().unwrap() = Some(cb);
    }

    /// Idle → Prepared: initialize decoder/renderer/audio, build the DTLS
    /// identity, gather ICE candidates.
    pub async fn prepare(&mut self, config: ViewerConfig) -> Result<SessionDescriptor> {
        if self.state != SessionState::Idle {
            return Err(SessionError::InvalidState("prepare requires Idle"));
        }

        self.decoder
            .lock()
            .unwrap()
            .initialize(config.codec, config.width, config.height)
            .map_err(SessionError::Other)?;
        self.renderer
            .lock()
            .unwrap()
            .initialize(config.width, config.height)
            .map_err(SessionError::Other)?;

        let audio_ok = match self.audio.as_mut() {
            Some((_, playback)) => match playback.initialize(48_000, 2) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!("audio playback init failed, audio disabled: {}", e);
                    false
                }
            },
            None => true,
        };
        if !audio_ok {
            self.audio = None;
        }

        self.jitter
            .set_target_depth_ms(config.quality.jitter_depth_ms());

        let dtls = DtlsContext::new(DtlsRole::Client).map_err(SessionError::Other)?;

        let mut ice = IceAgent::new(IceConfig {
            stun_servers: config.stun_servers.clone(),
            bind_addrs: config.ice_bind_addrs.clone(),
        });
        let candidates = ice
            .gather_candidates()
            .await
            .map_err(SessionError::Other)?;

        self.session_id = uuid::Uuid::new_v4().to_string();
        let descriptor = SessionDescriptor {
            session_id: self.session_id.clone(),
            dtls_fingerprint: dtls.fingerprint().to_string(),
            candidates,
            codec: config.codec,
        };

        self.dtls = Some(dtls);
        self.ice = Some(ice);
        self.config = config;
        self.state = SessionState::Prepared;
        Ok(descriptor)
    }

    pub fn add_remote_candidate(&self, candidate: Candidate) -> Result<()> {
        match &self.ice {
            Some(ice) => {
                ice.add_remote_candidate(candidate);
                Ok(())
            }
            None => Err(SessionError::InvalidState("no ICE agent; call prepare")),
        }
    }

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

    /// Prepared → Connecting → Streaming.
    pub async fn start(&mut self, peer: PeerInfo) -> Result<()> {
        if self.state != SessionState::Prepared {
            return Err(SessionError::InvalidState("start requires Prepared"));
        }
        self.state = SessionState::Connecting;

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

        // Out-of-band fingerprint verification: the certificate presented
        // in the handshake must match what signaling told us.
        if let Some(expected) = &self.config.host_fingerprint {
            let actual = dtls.peer_fingerprint();
            if actual.as_deref() != Some(expected.as_str()) {
                self.state = SessionState::Prepared;
                return Err(SessionError::DtlsHandshakeFailure(
                    "peer certificate fingerprint mismatch".into(),
                ));
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

        let transport = Arc::new(UdpTransport::new(socket, Some(dtls), None));
        self.input = Some(Arc::new(InputSender::new(transport.clone())));
        self.shared.last_packet_us.store(now_us(), Ordering::Relaxed);

        let decode_notify = Arc::new(Notify::new());
        let render_notify = Arc::new(Notify::new());
        let render_slot: Arc<Mutex<Option<DecodedFrame>>> = Arc::new(Mutex::new(None));
        let (audio_tx, audio_rx) = mpsc::unbounded_channel::<(AudioHeader, Vec<u8>)>();

        // Receive task first: it is also the one stopped first so data
        // ingress halts before subsystems are released.
        self.tasks.push(tokio::spawn(receive_loop(
            transport.clone(),
            self.jitter.clone(),
            self.nack.clone(),
            self.reporter.clone(),
            self.recovery.clone(),
            self.clipboard.clone(),
            self.shared.clone(),
            decode_notify.clone(),
            audio_tx,
        )));

        self.tasks.push(tokio::spawn(decode_loop(
            self.jitter.clone(),
            self.decoder.clone(),
            self.reporter.clone(),
            render_slot.clone(),
            render_notify.clone(),
            decode_notify,
        )));

        self.tasks.push(tokio::spawn(render_loop(
            self.renderer.clone(),
            self.reporter.clone(),
            render_slot,
            render_notify,
        )));

        if let Some((audio_decoder, audio_playback)) = self.audio.take() {
            self.tasks.push(tokio::spawn(audio_loop(
                audio_decoder,
                audio_playback,
                audio_rx,
            )));
        }

        self.tasks
            .push(tokio::spawn(self.nack.clone().run(transport.clone())));
        self.tasks.push(tokio::spawn(
            self.reporter
                .clone()
                .run(self.nack.clone(), transport.clone()),
        ));

        self.tasks.push(tokio::spawn(watchdog_loop(
            self.shared.clone(),
            self.jitter.clone(),
            self.on_reconnect_needed.clone(),
            self.on_disconnect.clone(),
            self.config.reconnect_timeout,
            self.config.reconnect_budget,
        )));

        self.transport = Some(transport);
        self.state = SessionState::Streaming;
        tracing::info!("viewer session started");
        Ok(())
    }

    /// Stop the session. Idempotent. The receive task goes down first to
    /// halt ingress, then the pipeline tasks, then resources.
    pub async fn stop(&mut self) {
        if self.state == SessionState::Idle {
            return;
        }
        tracing::info!("stopping viewer session");
        self.state = SessionState::Stopping;

        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }

        if let Some(transport) = self.transport.take() {
            transport.shutdown().await;
        }

        {
            let mut decoder = self.decoder.lock().unwrap();
            decoder.flush();
            decoder.release();
        }
        self.renderer.lock().unwrap().release();
        self.jitter.flush();
        self.input = None;
        self.dtls = None;
        self.ice = None;
        self.audio = None;

        self.state = SessionState::Idle;
        tracing::info!("viewer session stopped");
    }

    /// Offer local clipboard text to the host.
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

    pub fn stats(&self) -> ViewerStats {
        self.reporter.stats()
    }

    pub fn frames_dropped_in_buffer(&self) -> u64 {
        self.jitter.frames_dropped()
    }
}

impl Drop for ViewerSession {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Worker loops
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn receive_loop(
    transport: Arc<UdpTransport>,
    jitter: Arc<JitterBuffer>,
    nack: Arc<NackTracker>,
    reporter: Arc<StatsReporter>,
    recovery: Arc<FecRecovery>,
    clipboard: Arc<ClipboardSync>,
    shared: Arc<ViewerShared>,
    decode_notify: Arc<Notify>,
    audio_tx: mpsc::UnboundedSender<(AudioHeader, Vec<u8>)>,
) {
    tracing::info!("receive loop started");
    let mut last_clipboard_poll = Instant::now();

    loop {
        match transport.receive_one().await {
            Ok(Some((ty, data))) => {
                shared.last_packet_us.store(now_us(), Ordering::Relaxed);
                match ty {
                    PacketType::Video => {
                        if let Ok((header, payload)) = VideoHeader::parse(&data) {
                            recovery.on_video_packet(header.sequence, &data);
                            reporter.on_packet_received(&header, now_us());
                            nack.on_packet_received(header.sequence);
                            jitter.push(header, payload);
                            decode_notify.notify_one();
                        }
                    }
                    PacketType::Fec => {
                        if let Ok((fec_header, parity)) = FecHeader::parse(&data) {
                            // FEC shares the video sequence space.
                            nack.on_packet_received(fec_header.sequence);
                            if let Some((header, payload)) =
                                recovery.on_fec_packet(&fec_header, parity)
                            {
                                reporter.on_packet_received(&header, now_us());
                                nack.on_packet_received(header.sequence);
                                jitter.push(header, &payload);
                                decode_notify.notify_one();
                            }
                        }
                    }
                    PacketType::Audio => {
                        if let Ok((header, payload)) = AudioHeader::parse(&data) {
                            let _ = audio_tx.send((header, payload.to_vec()));
                        }
                    }
                    PacketType::Clipboard => {
                        if let Some(ack) = clipboard.on_packet(&data) {
                            let _ = transport.send_control(&ack).await;
                        }
                    }
                    PacketType::ClipAck => clipboard.on_ack(&data),
                    _ => tracing::trace!("viewer dropping {:?} packet", ty),
                }
            }
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

async fn decode_loop(
    jitter: Arc<JitterBuffer>,
    decoder: Arc<Mutex<Box<dyn VideoDecoder>>>,
    reporter: Arc<StatsReporter>,
    render_slot: Arc<Mutex<Option<DecodedFrame>>>,
    render_notify: Arc<Notify>,
    decode_notify: Arc<Notify>,
) {
    tracing::info!("decode loop started");

    loop {
        let _ = tokio::time::timeout(DECODE_WAIT, decode_notify.notified()).await;

        while let Some((header, data)) = jitter.pop() {
            let start = now_us();
            let result = { decoder.lock().unwrap().decode(&data) };
            let decode_ms = (now_us() - start) as f64 / 1000.0;

            match result {
                Ok(mut frame) => {
                    frame.timestamp_us = header.timestamp_us as u64;
                    frame.decode_time_ms = decode_ms;
                    reporter.set_decode_time_ms(decode_ms);
                    reporter.on_frame_decoded();

                    // Latest-wins: a still-pending frame is overwritten.
                    *render_slot.lock().unwrap() = Some(frame);
                    render_notify.notify_one();
                }
                Err(e) => {
                    tracing::debug!("decode failed for frame {}: {}", header.frame_number, e);
                    reporter.on_frame_dropped();
                }
            }
        }
    }
}

async fn render_loop(
    renderer: Arc<Mutex<Box<dyn Renderer>>>,
    reporter: Arc<StatsReporter>,
    render_slot: Arc<Mutex<Option<DecodedFrame>>>,
    render_notify: Arc<Notify>,
) {
    tracing::info!("render loop started");

    loop {
        let _ = tokio::time::timeout(RENDER_WAIT, render_notify.notified()).await;

        let frame = render_slot.lock().unwrap().take();
        let Some(frame) = frame else { continue };

        let result = { renderer.lock().unwrap().render_frame(&frame) };
        match result {
            Ok(render_ms) => reporter.set_render_time_ms(render_ms),
            Err(e) => tracing::debug!("render failed: {}", e),
        }
    }
}

async fn audio_loop(
    mut decoder: Box<dyn AudioDecoder>,
    mut playback: Box<dyn AudioPlayback>,
    mut rx: mpsc::UnboundedReceiver<(AudioHeader, Vec<u8>)>,
) {
    tracing::info!("audio loop started");

    loop {
        let first = tokio::time::timeout(AUDIO_WAIT, rx.recv()).await;
        let Ok(first) = first else { continue };
        let Some(first) = first else { return };

        // Batch whatever else is queued behind it.
        let mut packets = vec![first];
        while let Ok(packet) = rx.try_recv() {
            packets.push(packet);
        }

        for (_header, payload) in packets {
            match decoder.decode(&payload) {
                Ok(pcm) => {
                    if let Err(e) = playback.play(&pcm) {
                        tracing::debug!("audio playback failed: {}", e);
                    }
                }
                Err(e) => {
                    // Conceal one frame duration on decode failure.
                    tracing::debug!("audio decode failed, concealing: {}", e);
                    if let Ok(pcm) = decoder.conceal() {
                        let _ = playback.play(&pcm);
                    }
                }
            }
        }
    }
}

async fn watchdog_loop(
    shared: Arc<ViewerShared>,
    jitter: Arc<JitterBuffer>,
    on_reconnect_needed: Arc<Mutex<Option<EventCallback>>>,
    on_disconnect: Arc<Mutex<Option<EventCallback>>>,
    reconnect_timeout: Duration,
    reconnect_budget: Duration,
) {
    let mut reconnect_requested = false;

    loop {
        tokio::time::sleep(WATCHDOG_TICK).await;

        let silence_us = now_us().saturating_sub(shared.last_packet_us.load(Ordering::Relaxed));
        let silence = Duration::from_micros(silence_us);

        if silence >= reconnect_budget {
            tracing::warn!("no data for {:?}, giving up", silence);
            if let Some(cb) = on_disconnect.lock().unwrap().take() {
                cb();
            }
            return;
        }

        if silence >= reconnect_timeout {
            if !reconnect_requested {
                reconnect_requested = true;
                tracing::warn!("no data for {:?}, requesting reconnect", silence);
                jitter.flush();
                if let Some(cb) = on_reconnect_needed.lock().unwrap().as_ref() {
                    cb();
                }
            }
        } else {
            reconnect_requested = false;
        }
    }
}
