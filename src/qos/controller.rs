//! Adaptive QoS controller (host side).
//!
//! A congestion-control state machine driven by viewer feedback at ~5 Hz:
//!
//! - Kalman-filtered one-way delay gradient detects congestion trends.
//! - AIMD bitrate: additive increase (+5%), multiplicative decrease
//!   (x0.85).
//! - Loss thresholds: >=5% enters DECREASE, >=10% additionally forces an
//!   IDR.
//! - Profile-aware resolution/FPS ladder walking with priority weights.
//! - FEC redundancy scales with the loss band.
//! - Client decode time above 20 ms steps the resolution ladder down
//!   independently of network state (the bottleneck is the viewer's
//!   decoder, not the path).

use std::sync::Arc;

use super::estimator::BandwidthEstimator;
use super::kalman::KalmanFilter;
use super::presets::{QosPreset, Resolution};
use crate::media::{EncoderConfig, VideoEncoder};
use crate::transport::FecEncoder;

const INCREASE_FACTOR: f32 = 1.05;
const DECREASE_FACTOR: f32 = 0.85;
const LOSS_THRESH_LOW: f32 = 0.02;
const LOSS_THRESH_HIGH: f32 = 0.05;
const LOSS_THRESH_IDR: f32 = 0.10;

/// Delay-gradient thresholds in ms/s.
const GRADIENT_OVERUSE: f64 = 5.0;
const GRADIENT_UNDERUSE: f64 = -1.0;

/// Client decode time above this means the viewer's decoder is the
/// bottleneck.
const DECODE_BOTTLENECK_US: u32 = 20_000;

/// Minimum feedback ticks between resolution changes (~2 s at 5 Hz).
const RESOLUTION_CHANGE_COOLDOWN: u32 = 10;

/// EMA weight for the smoothed feedback scalars.
const EMA_ALPHA: f32 = 0.3;

const VPN_GRADIENT_MULTIPLIER: f64 = 1.5;
const VPN_BITRATE_MULTIPLIER: f32 = 0.85;

/// One feedback report normalized for the controller.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedbackSample {
    pub received_packets: u32,
    pub lost_packets: u32,
    pub jitter_us: u32,
    pub rtt_us: u32,
    pub decode_time_us: u32,
    pub frames_dropped: u32,
    pub last_seq: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosState {
    Increase,
    Hold,
    Decrease,
}

impl QosState {
    pub fn name(&self) -> &'static str {
        match self {
            QosState::Increase => "INCREASE",
            QosState::Hold => "HOLD",
            QosState::Decrease => "DECREASE",
        }
    }
}

/// Snapshot of the controller's operating point.
#[derive(Debug, Clone)]
pub struct QosSnapshot {
    pub bitrate_kbps: u32,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub loss_rate: f32,
    pub rtt_us: u32,
    pub jitter_us: u32,
    pub state: QosState,
    pub fec_ratio: f32,
    pub estimated_bw_kbps: u32,
    pub delay_gradient: f64,
    pub decode_time_us: u32,
    pub resolution_step: usize,
    pub fps_step: usize,
    pub profile_name: String,
}

type ResolutionChangeCallback = Box<dyn Fn(u32, u32) + Send + Sync>;

pub struct QosController {
    encoder: Arc<dyn VideoEncoder>,
    fec: Arc<FecEncoder>,
    estimator: Arc<BandwidthEstimator>,

    state: QosState,
    config: EncoderConfig,
    preset: Option<QosPreset>,

    current_bitrate_kbps: u32,
    current_fps: u32,
    current_width: u32,
    current_height: u32,
    resolution_step: usize,
    fps_step: usize,

    vpn_mode: bool,

    feedback_count: u32,
    last_resolution_change_tick: u32,

    // EMAs are seeded from the first sample rather than zero so a single
    // bad report is actionable.
    smoothed_loss: Option<f32>,
    smoothed_rtt: Option<u32>,
    smoothed_jitter: Option<u32>,
    smoothed_decode: Option<u32>,

    delay_filter: KalmanFilter,

    resolution_change_cb: Option<ResolutionChangeCallback>,
}

impl QosController {
    pub fn new(
        encoder: Arc<dyn VideoEncoder>,
        fec: Arc<FecEncoder>,
        estimator: Arc<BandwidthEstimator>,
    ) -> Self {
        QosController {
            encoder,
            fec,
            estimator,
            state: QosState::Hold,
            config: EncoderConfig::default(),
            preset: None,
            current_bitrate_kbps: 20_000,
            current_fps: 60,
            current_width: 1920,
            current_height: 1080,
            resolution_step: 0,
            fps_step: 0,
            vpn_mode: false,
            feedback_count: 0,
            last_resolution_change_tick: 0,
            smoothed_loss: None,
            smoothed_rtt: None,
            smoothed_jitter: None,
            smoothed_decode: None,
            delay_filter: KalmanFilter::new(1e-3, 0.1),
            resolution_change_cb: None,
        }
    }

    /// Establish the baseline encoder configuration.
    pub fn set_base_config(&mut self, config: EncoderConfig) {
        self.current_bitrate_kbps = config.bitrate_kbps;
        self.current_fps = config.fps;
        self.current_width = config.width;
        self.current_height = config.height;
        self.config = config;
    }

    /// Apply a streaming profile preset: replaces the whole
    /// target/floor/ceiling set atomically and re-anchors the ladders.
    pub fn apply_preset(&mut self, preset: QosPreset) {
        let previous = (self.current_width, self.current_height);

        self.current_bitrate_kbps = preset.target_bitrate_kbps;
        self.current_fps = preset.target_fps;
        self.current_width = preset.target_resolution.width;
        self.current_height = preset.target_resolution.height;
        self.resolution_step = preset.resolution_step_for(preset.target_resolution);
        self.fps_step = preset.fps_step_for(preset.target_fps);

        self.config.bitrate_kbps = preset.target_bitrate_kbps;
        self.config.max_bitrate_kbps = preset.max_bitrate_kbps;
        self.config.min_bitrate_kbps = preset.min_bitrate_kbps;
        self.config.fps = preset.target_fps;

        if self.vpn_mode {
            self.current_bitrate_kbps =
                (self.current_bitrate_kbps as f32 * VPN_BITRATE_MULTIPLIER) as u32;
        }

        self.fec.set_redundancy_ratio(preset.min_fec_ratio);

        tracing::info!(
            "QoS: preset {} applied ({} @ {} fps, {} kbps)",
            preset.profile.as_str(),
            preset.target_resolution,
            preset.target_fps,
            self.current_bitrate_kbps
        );
        self.preset = Some(preset);

        if previous != (self.current_width, self.current_height) {
            self.notify_resolution_change();
        }
    }

    pub fn set_resolution_change_callback(&mut self, cb: ResolutionChangeCallback) {
        self.resolution_change_cb = Some(cb);
    }

    /// Operator-driven reconfigure: pin new bitrate/fps targets and apply
    /// them to the encoder immediately.
    pub fn manual_reconfigure(&mut self, bitrate_kbps: u32, fps: u32) -> anyhow::Result<()> {
        self.current_bitrate_kbps = bitrate_kbps;
        self.current_fps = fps;
        self.config.bitrate_kbps = bitrate_kbps;
        self.config.fps = fps;
        if let Some(preset) = &self.preset {
            self.fps_step = preset.fps_step_for(fps);
        }
        self.encoder.reconfigure(
            bitrate_kbps,
            fps,
            self.current_width,
            self.current_height,
        )
    }

    /// Enable VPN-aware tolerances: wider overuse threshold and a reduced
    /// operating bitrate.
    pub fn set_vpn_mode(&mut self, enabled: bool) {
        self.vpn_mode = enabled;
        if enabled {
            self.current_bitrate_kbps =
                (self.current_bitrate_kbps as f32 * VPN_BITRATE_MULTIPLIER) as u32;
            tracing::info!(
                "QoS: VPN mode on, bitrate reduced to {} kbps",
                self.current_bitrate_kbps
            );
        }
    }

    /// Main decision point, invoked on every feedback report (~5 Hz).
    pub fn on_feedback(&mut self, feedback: &FeedbackSample) {
        self.feedback_count += 1;

        let total = feedback.received_packets + feedback.lost_packets;
        let loss_rate = if total > 0 {
            feedback.lost_packets as f32 / total as f32
        } else {
            0.0
        };

        let loss = ema(&mut self.smoothed_loss, loss_rate);
        if feedback.rtt_us > 0 {
            ema_u32(&mut self.smoothed_rtt, feedback.rtt_us);
        }
        ema_u32(&mut self.smoothed_jitter, feedback.jitter_us);
        if feedback.decode_time_us > 0 {
            ema_u32(&mut self.smoothed_decode, feedback.decode_time_us);
        }

        let overuse_thresh = if self.vpn_mode {
            GRADIENT_OVERUSE * VPN_GRADIENT_MULTIPLIER
        } else {
            GRADIENT_OVERUSE
        };
        let gradient = self.delay_filter.update(self.estimator.delay_gradient());

        // Client-side bottleneck: the decoder can't keep up, so shrink the
        // picture rather than the bitrate.
        let decode = self.smoothed_decode.unwrap_or(0);
        if decode > DECODE_BOTTLENECK_US
            && self.preset.is_some()
            && self.feedback_count - self.last_resolution_change_tick >= RESOLUTION_CHANGE_COOLDOWN
        {
            tracing::warn!(
                "QoS: decode bottleneck ({} us), stepping resolution down",
                decode
            );
            self.try_reduce_resolution();
        }

        // Signal priority: loss, then delay gradient, then headroom.
        if loss >= LOSS_THRESH_HIGH {
            if self.state != QosState::Decrease {
                tracing::info!("QoS: entering DECREASE, loss={:.1}%", loss * 100.0);
            }
            self.enter_decrease();
            if loss >= LOSS_THRESH_IDR {
                tracing::warn!("QoS: loss={:.1}%, forcing IDR", loss * 100.0);
                self.encoder.force_idr();
            }
        } else if gradient > overuse_thresh {
            if self.state != QosState::Decrease {
                tracing::info!("QoS: entering DECREASE, gradient={:.2} ms/s", gradient);
            }
            self.enter_decrease();
        } else if loss <= LOSS_THRESH_LOW && gradient < GRADIENT_UNDERUSE {
            if self.state != QosState::Increase {
                tracing::info!(
                    "QoS: entering INCREASE, loss={:.1}% gradient={:.2}",
                    loss * 100.0,
                    gradient
                );
            }
            self.enter_increase();
        } else {
            self.state = QosState::Hold;
        }

        self.adjust_fec(loss);

        if let Err(e) = self.encoder.reconfigure(
            self.current_bitrate_kbps,
            self.current_fps,
            self.current_width,
            self.current_height,
        ) {
            tracing::warn!("QoS: encoder reconfigure failed: {}", e);
        }

        tracing::trace!(
            "QoS: state={} bitrate={} fps={} res={}x{} loss={:.2}% gradient={:.2} decode={}us",
            self.state.name(),
            self.current_bitrate_kbps,
            self.current_fps,
            self.current_width,
            self.current_height,
            loss * 100.0,
            gradient,
            decode
        );
    }

    pub fn snapshot(&self) -> QosSnapshot {
        QosSnapshot {
            bitrate_kbps: self.current_bitrate_kbps,
            fps: self.current_fps,
            width: self.current_width,
            height: self.current_height,
            loss_rate: self.smoothed_loss.unwrap_or(0.0),
            rtt_us: self.smoothed_rtt.unwrap_or(0),
            jitter_us: self.smoothed_jitter.unwrap_or(0),
            state: self.state,
            fec_ratio: self.fec.redundancy_ratio(),
            estimated_bw_kbps: self.estimator.bandwidth_kbps(),
            delay_gradient: self.delay_filter.estimate(),
            decode_time_us: self.smoothed_decode.unwrap_or(0),
            resolution_step: self.resolution_step,
            fps_step: self.fps_step,
            profile_name: self
                .preset
                .as_ref()
                .map(|p| p.profile.as_str().to_string())
                .unwrap_or_default(),
        }
    }

    // -- state transitions --------------------------------------------------

    fn enter_increase(&mut self) {
        self.state = QosState::Increase;

        let (target, max) = match &self.preset {
            Some(p) => (p.target_bitrate_kbps, p.max_bitrate_kbps),
            None => (self.config.bitrate_kbps, self.config.max_bitrate_kbps),
        };

        self.current_bitrate_kbps =
            ((self.current_bitrate_kbps as f32 * INCREASE_FACTOR) as u32).min(max);

        if self.current_bitrate_kbps > (target as f32 * 0.6) as u32 {
            self.try_recover_fps();
        }
        if self.current_bitrate_kbps > (target as f32 * 0.8) as u32 {
            self.try_recover_resolution();
        }
    }

    fn enter_decrease(&mut self) {
        self.state = QosState::Decrease;

        let min = match &self.preset {
            Some(p) => p.min_bitrate_kbps,
            None => self.config.min_bitrate_kbps,
        };

        self.current_bitrate_kbps =
            ((self.current_bitrate_kbps as f32 * DECREASE_FACTOR) as u32).max(min);

        if self.current_bitrate_kbps > min {
            return;
        }

        // At the bitrate floor: the profile's weights decide what to
        // sacrifice next.
        match &self.preset {
            Some(preset) => {
                if preset.fps_weight > preset.quality_weight {
                    self.try_reduce_resolution();
                    if self.current_bitrate_kbps <= min {
                        self.try_reduce_fps();
                    }
                } else {
                    self.try_reduce_fps();
                    if self.current_bitrate_kbps <= min {
                        self.try_reduce_resolution();
                    }
                }
            }
            None => {
                if self.current_fps > 30 {
                    self.current_fps = 30;
                    tracing::warn!(
                        "QoS: bitrate at floor ({} kbps), clamping FPS to 30",
                        self.current_bitrate_kbps
                    );
                }
            }
        }
    }

    // -- ladder walking -----------------------------------------------------

    fn try_reduce_resolution(&mut self) {
        let Some(preset) = &self.preset else { return };
        if preset.resolution_ladder.is_empty() {
            return;
        }
        if self.feedback_count - self.last_resolution_change_tick < RESOLUTION_CHANGE_COOLDOWN {
            return;
        }

        let next = self.resolution_step + 1;
        if let Some(res) = preset.resolution_ladder.get(next).copied() {
            tracing::info!(
                "QoS: resolution {}x{} -> {} (step {} -> {})",
                self.current_width,
                self.current_height,
                res,
                self.resolution_step,
                next
            );
            self.resolution_step = next;
            self.set_resolution(res);
        }
    }

    fn try_recover_resolution(&mut self) {
        let Some(preset) = &self.preset else { return };
        if self.resolution_step == 0 {
            return;
        }
        if self.feedback_count - self.last_resolution_change_tick < RESOLUTION_CHANGE_COOLDOWN {
            return;
        }
        // Conservative profiles never recover resolution automatically.
        if preset.recovery_speed < 0.3 {
            return;
        }

        let prev = self.resolution_step - 1;
        let res = preset.resolution_ladder[prev];
        tracing::info!(
            "QoS: recovering resolution {}x{} -> {} (step {} -> {})",
            self.current_width,
            self.current_height,
            res,
            self.resolution_step,
            prev
        );
        self.resolution_step = prev;
        self.set_resolution(res);
    }

    fn try_reduce_fps(&mut self) {
        let Some(preset) = &self.preset else { return };
        let next = self.fps_step + 1;
        if let Some(&fps) = preset.fps_ladder.get(next) {
            tracing::info!("QoS: FPS {} -> {} (step {} -> {})", self.current_fps, fps, self.fps_step, next);
            self.fps_step = next;
            self.current_fps = fps;
        }
    }

    fn try_recover_fps(&mut self) {
        let Some(preset) = &self.preset else { return };
        if self.fps_step == 0 {
            return;
        }
        let prev = self.fps_step - 1;
        let fps = preset.fps_ladder[prev];
        tracing::info!("QoS: recovering FPS {} -> {}", self.current_fps, fps);
        self.fps_step = prev;
        self.current_fps = fps;
    }

    fn set_resolution(&mut self, res: Resolution) {
        self.current_width = res.width;
        self.current_height = res.height;
        self.last_resolution_change_tick = self.feedback_count;
        self.notify_resolution_change();
    }

    fn notify_resolution_change(&self) {
        if let Some(cb) = &self.resolution_change_cb {
            cb(self.current_width, self.current_height);
        }
    }

    // -- FEC ----------------------------------------------------------------

    fn adjust_fec(&mut self, loss_rate: f32) {
        let (min_fec, max_fec) = match &self.preset {
            Some(p) => (p.min_fec_ratio, p.max_fec_ratio),
            None => (0.02, 0.5),
        };

        let ratio = if loss_rate < 0.02 {
            min_fec
        } else if loss_rate < 0.05 {
            (min_fec * 2.0).min(max_fec)
        } else if loss_rate < 0.10 {
            max_fec * 0.6
        } else {
            max_fec
        };

        self.fec.set_redundancy_ratio(ratio);
    }
}

fn ema(slot: &mut Option<f32>, sample: f32) -> f32 {
    let value = match *slot {
        Some(prev) => EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * prev,
        None => sample,
    };
    *slot = Some(value);
    value
}

fn ema_u32(slot: &mut Option<u32>, sample: u32) -> u32 {
    let value = match *slot {
        Some(prev) => (EMA_ALPHA * sample as f32 + (1.0 - EMA_ALPHA) * prev as f32) as u32,
        None => sample,
    };
    *slot = Some(value);
    value
}
