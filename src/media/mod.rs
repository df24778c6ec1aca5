//! Collaborator interfaces: capture, codecs, rendering, audio I/O.
//!
//! Platform backends (desktop duplication, hardware encoders, compositor
//! integration, audio devices) live outside the core and plug in through
//! these traits. The core never sees backend-specific types: a captured
//! frame is a pointer-plus-format descriptor, an encoded frame is opaque
//! bytes.

use anyhow::Result;

#[cfg(feature = "opus")]
pub mod opus;

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Supported video codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum Codec {
    H264 = 0,
    Hevc = 1,
    Av1 = 2,
}

impl Codec {
    pub fn from_wire(byte: u8) -> Result<Codec> {
        match byte {
            0 => Ok(Codec::H264),
            1 => Ok(Codec::Hevc),
            2 => Ok(Codec::Av1),
            other => anyhow::bail!("unknown codec byte 0x{:02X}", other),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Codec::H264 => "H.264",
            Codec::Hevc => "HEVC",
            Codec::Av1 => "AV1",
        }
    }
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

/// Pixel layout of a captured surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Bgra8,
    Argb8,
    Nv12,
}

/// One captured desktop frame.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// Frame bytes (or a backend-owned handle flattened to bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub format: FrameFormat,
    pub timestamp_us: u64,
    /// False when the desktop has not changed since the previous grab.
    pub is_new_frame: bool,
}

/// Screen capture backend. Initialized with a GPU index, released on
/// shutdown.
pub trait CaptureDevice: Send {
    fn initialize(&mut self, gpu_index: u32) -> Result<()>;
    fn capture_frame(&mut self) -> Result<CapturedFrame>;
    fn release(&mut self);
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// Encoder initialization / reconfiguration parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderConfig {
    pub codec: Codec,
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: u32,
    pub max_bitrate_kbps: u32,
    pub min_bitrate_kbps: u32,
    pub fps: u32,
    pub gop_length: u32,
    pub enable_intra_refresh: bool,
    pub intra_refresh_period: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        EncoderConfig {
            codec: Codec::H264,
            width: 1920,
            height: 1080,
            bitrate_kbps: 20_000,
            max_bitrate_kbps: 100_000,
            min_bitrate_kbps: 1_000,
            fps: 60,
            gop_length: 120,
            enable_intra_refresh: true,
            intra_refresh_period: 60,
        }
    }
}

/// One encoded access unit.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Vec<u8>,
    pub timestamp_us: u64,
    pub frame_number: u16,
    pub is_keyframe: bool,
    pub codec: Codec,
}

/// Hardware video encoder.
///
/// `reconfigure` and `force_idr` are called from the QoS path while the
/// streaming loop encodes; implementations must make these internally safe
/// (they mutate control state consumed at the next `encode`).
pub trait VideoEncoder: Send + Sync {
    fn initialize(&self, config: &EncoderConfig) -> Result<()>;
    fn encode(&self, frame: &CapturedFrame, frame_number: u16) -> Result<EncodedFrame>;
    fn reconfigure(&self, bitrate_kbps: u32, fps: u32, width: u32, height: u32) -> Result<()>;
    fn force_idr(&self);
    fn flush(&self);
    fn release(&self);
    fn is_codec_supported(&self, codec: Codec) -> bool;
    fn codec_name(&self) -> String;
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// One decoded frame handed to the renderer. `surface` is an opaque
/// backend reference (texture handle or raw pixels).
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub surface: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: FrameFormat,
    pub timestamp_us: u64,
    pub decode_time_ms: f64,
}

/// Hardware or software video decoder.
pub trait VideoDecoder: Send {
    fn initialize(&mut self, codec: Codec, width: u32, height: u32) -> Result<()>;
    fn decode(&mut self, data: &[u8]) -> Result<DecodedFrame>;
    fn flush(&mut self);
    fn release(&mut self);
    fn name(&self) -> String;
}

// ---------------------------------------------------------------------------
// Renderer
// ---------------------------------------------------------------------------

/// Presentation surface. Returns render time in milliseconds.
pub trait Renderer: Send {
    fn initialize(&mut self, width: u32, height: u32) -> Result<()>;
    fn render_frame(&mut self, frame: &DecodedFrame) -> Result<f64>;
    fn resize(&mut self, width: u32, height: u32);
    fn release(&mut self);
}

// ---------------------------------------------------------------------------
// Audio
// ---------------------------------------------------------------------------

/// Callback receiving interleaved f32 PCM at the negotiated rate/channels.
pub type AudioCaptureCallback = Box<dyn FnMut(&[f32]) + Send>;

/// Audio capture backend, callback-driven.
pub trait AudioCapture: Send {
    fn initialize(&mut self) -> Result<()>;
    fn start(&mut self, callback: AudioCaptureCallback) -> Result<()>;
    fn stop(&mut self);
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> u16;
}

/// Audio playback sink accepting interleaved f32 PCM.
pub trait AudioPlayback: Send {
    fn initialize(&mut self, sample_rate: u32, channels: u16) -> Result<()>;
    fn play(&mut self, pcm: &[f32]) -> Result<()>;
    fn stop(&mut self);
}

/// Audio frame encoder (Opus). `frame_size` is samples per channel per
/// packet (e.g. 480 for 10 ms at 48 kHz).
pub trait AudioEncoder: Send {
    fn frame_size(&self) -> usize;
    fn encode(&mut self, pcm: &[f32]) -> Result<Vec<u8>>;
}

/// Audio frame decoder with packet-loss concealment.
pub trait AudioDecoder: Send {
    fn decode(&mut self, packet: &[u8]) -> Result<Vec<f32>>;
    /// Conceal one lost frame, producing synthetic PCM.
    fn conceal(&mut self) -> Result<Vec<f32>>;
    fn channels(&self) -> u16;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_wire_round_trip() {
        for codec in [Codec::H264, Codec::Hevc, Codec::Av1] {
            assert_eq!(Codec::from_wire(codec as u8).unwrap(), codec);
        }
        assert!(Codec::from_wire(9).is_err());
    }

    #[test]
    fn test_default_encoder_config() {
        let cfg = EncoderConfig::default();
        assert_eq!(cfg.gop_length, cfg.fps * 2);
        assert!(cfg.min_bitrate_kbps < cfg.bitrate_kbps);
        assert!(cfg.bitrate_kbps < cfg.max_bitrate_kbps);
    }
}
