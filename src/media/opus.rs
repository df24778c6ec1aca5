//! Opus audio codec backends for the [`AudioEncoder`] / [`AudioDecoder`]
//! traits, built on `audiopus`. 10 ms frames at 48 kHz stereo.

use anyhow::{Context, Result};
use audiopus::coder;
use audiopus::{Application, Channels, SampleRate};

use super::{AudioDecoder, AudioEncoder};

/// Samples per channel per 10 ms frame at 48 kHz.
const FRAME_SIZE: usize = 480;

/// Upper bound for one encoded Opus frame.
const MAX_PACKET: usize = 1500;

pub struct OpusAudioEncoder {
    encoder: coder::Encoder,
    channels: usize,
}

impl OpusAudioEncoder {
    pub fn new(channels: u16) -> Result<Self> {
        let ch = match channels {
            1 => Channels::Mono,
            _ => Channels::Stereo,
        };
        let encoder = coder::Encoder::new(SampleRate::Hz48000, ch, Application::Audio)
            .context("failed to create Opus encoder")?;
        Ok(OpusAudioEncoder {
            encoder,
            channels: channels.max(1) as usize,
        })
    }
}

impl AudioEncoder for OpusAudioEncoder {
    fn frame_size(&self) -> usize {
        FRAME_SIZE
    }

    fn encode(&mut self, pcm: &[f32]) -> Result<Vec<u8>> {
        anyhow::ensure!(
            pcm.len() == FRAME_SIZE * self.channels,
            "expected {} samples, got {}",
            FRAME_SIZE * self.channels,
            pcm.len()
        );
        let mut out = vec![0u8; MAX_PACKET];
        let n = self
            .encoder
            .encode_float(pcm, &mut out)
            .context("Opus encode failed")?;
        out.truncate(n);
        Ok(out)
    }
}

pub struct OpusAudioDecoder {
    decoder: coder::Decoder,
    channels: u16,
}

impl OpusAudioDecoder {
    pub fn new(channels: u16) -> Result<Self> {
        let ch = match channels {
            1 => Channels::Mono,
            _ => Channels::Stereo,
        };
        let decoder = coder::Decoder::new(SampleRate::Hz48000, ch)
            .context("failed to create Opus decoder")?;
        Ok(OpusAudioDecoder {
            decoder,
            channels: channels.max(1),
        })
    }
}

impl AudioDecoder for OpusAudioDecoder {
    fn decode(&mut self, packet: &[u8]) -> Result<Vec<f32>> {
        let mut out = vec![0f32; FRAME_SIZE * self.channels as usize];
        let n = self
            .decoder
            .decode_float(Some(packet), &mut out, false)
            .context("Opus decode failed")?;
        out.truncate(n * self.channels as usize);
        Ok(out)
    }

    fn conceal(&mut self) -> Result<Vec<f32>> {
        let mut out = vec![0f32; FRAME_SIZE * self.channels as usize];
        let n = self
            .decoder
            .decode_float(None, &mut out, false)
            .context("Opus concealment failed")?;
        out.truncate(n * self.channels as usize);
        Ok(out)
    }

    fn channels(&self) -> u16 {
        self.channels
    }
}
