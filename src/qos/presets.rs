//! Streaming profile presets.
//!
//! Each profile fixes the quality/performance trade-off the adaptive
//! controller works within: target, floor, and ceiling for bitrate, frame
//! rate, and resolution; the step-down ladders; the FEC budget; and the
//! priority weights that decide what gets sacrificed first when the
//! network degrades.

use serde::{Deserialize, Serialize};

use crate::media::Codec;

// ---------------------------------------------------------------------------
// Resolutions and frame rates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Resolution { width, height }
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// 8K requires HEVC or AV1 (H.264 is spec-limited to 4096x4096), as do 5K
/// and the super-ultrawide formats.
pub const RES_8K: Resolution = Resolution::new(7680, 4320);
pub const RES_5K: Resolution = Resolution::new(5120, 2880);
pub const RES_5K_UW: Resolution = Resolution::new(5120, 1440);
pub const RES_4K: Resolution = Resolution::new(3840, 2160);
pub const RES_1440P: Resolution = Resolution::new(2560, 1440);
pub const RES_1080P: Resolution = Resolution::new(1920, 1080);
pub const RES_900P: Resolution = Resolution::new(1600, 900);
pub const RES_720P: Resolution = Resolution::new(1280, 720);

// ---------------------------------------------------------------------------
// Profiles
// ---------------------------------------------------------------------------

/// Operating modes selectable per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamProfile {
    /// Maximum FPS and lowest latency; resolution is sacrificed first.
    Competitive,
    /// Middle ground; adapts both FPS and quality.
    Balanced,
    /// Maximum resolution and quality; frame rate is sacrificed first.
    Cinematic,
    /// Native resolution, 4:4:4 chroma, color-accurate.
    Creative,
    /// Native resolution, AV1, precision work.
    Cad,
    /// Low bandwidth, small screens, cellular-grade loss.
    MobileSaver,
    /// Maximum everything for same-network streaming.
    Lan,
}

impl StreamProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamProfile::Competitive => "Competitive",
            StreamProfile::Balanced => "Balanced",
            StreamProfile::Cinematic => "Cinematic",
            StreamProfile::Creative => "Creative",
            StreamProfile::Cad => "CAD",
            StreamProfile::MobileSaver => "MobileSaver",
            StreamProfile::Lan => "LAN",
        }
    }

    pub fn from_name(name: &str) -> StreamProfile {
        match name.to_ascii_lowercase().as_str() {
            "competitive" => StreamProfile::Competitive,
            "cinematic" => StreamProfile::Cinematic,
            "creative" => StreamProfile::Creative,
            "cad" => StreamProfile::Cad,
            "mobilesaver" | "mobile_saver" | "mobile" => StreamProfile::MobileSaver,
            "lan" => StreamProfile::Lan,
            _ => StreamProfile::Balanced,
        }
    }
}

/// Chroma subsampling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChromaMode {
    Yuv420,
    Yuv444,
}

/// Immutable per-profile configuration consumed by the QoS controller.
#[derive(Debug, Clone, PartialEq)]
pub struct QosPreset {
    pub profile: StreamProfile,

    pub target_fps: u32,
    pub min_fps: u32,
    pub max_fps: u32,

    pub target_resolution: Resolution,
    pub min_resolution: Resolution,

    /// Step-down ladders, ordered highest-first.
    pub resolution_ladder: Vec<Resolution>,
    pub fps_ladder: Vec<u32>,

    pub target_bitrate_kbps: u32,
    pub min_bitrate_kbps: u32,
    pub max_bitrate_kbps: u32,

    /// Viewer jitter buffer depth hint.
    pub jitter_buffer_ms: u32,

    pub max_fec_ratio: f32,
    pub min_fec_ratio: f32,

    /// Higher fps_weight sacrifices resolution first; higher
    /// quality_weight sacrifices FPS first.
    pub fps_weight: f32,
    pub quality_weight: f32,
    pub latency_weight: f32,

    /// 0.0 = conservative recovery, 1.0 = aggressive.
    pub recovery_speed: f32,

    pub preferred_codec: Codec,
    pub chroma: ChromaMode,
}

impl QosPreset {
    /// Build the preset for a profile, taking the host's native resolution
    /// into account for the target.
    pub fn for_profile(profile: StreamProfile, native: Resolution) -> QosPreset {
        match profile {
            StreamProfile::Competitive => QosPreset {
                profile,
                target_fps: 240,
                min_fps: 120,
                max_fps: 240,
                target_resolution: if native.pixel_count() <= RES_1080P.pixel_count() {
                    native
                } else {
                    RES_1080P
                },
                min_resolution: RES_720P,
                resolution_ladder: vec![RES_1080P, RES_900P, RES_720P],
                fps_ladder: vec![240, 165, 144, 120],
                target_bitrate_kbps: 50_000,
                min_bitrate_kbps: 5_000,
                max_bitrate_kbps: 100_000,
                jitter_buffer_ms: 1,
                max_fec_ratio: 0.15,
                min_fec_ratio: 0.02,
                fps_weight: 0.9,
                quality_weight: 0.1,
                latency_weight: 1.0,
                recovery_speed: 0.8,
                preferred_codec: Codec::H264,
                chroma: ChromaMode::Yuv420,
            },

            StreamProfile::Balanced => QosPreset {
                profile,
                target_fps: 120,
                min_fps: 60,
                max_fps: 144,
                target_resolution: if native.pixel_count() >= RES_1440P.pixel_count() {
                    RES_1440P
                } else {
                    native
                },
                min_resolution: RES_720P,
                resolution_ladder: vec![RES_1440P, RES_1080P, RES_900P, RES_720P],
                fps_ladder: vec![144, 120, 60],
                target_bitrate_kbps: 40_000,
                min_bitrate_kbps: 3_000,
                max_bitrate_kbps: 100_000,
                jitter_buffer_ms: 4,
                max_fec_ratio: 0.20,
                min_fec_ratio: 0.03,
                fps_weight: 0.6,
                quality_weight: 0.5,
                latency_weight: 0.7,
                recovery_speed: 0.6,
                preferred_codec: Codec::Hevc,
                chroma: ChromaMode::Yuv420,
            },

            StreamProfile::Cinematic => QosPreset {
                profile,
                target_fps: 60,
                min_fps: 30,
                max_fps: 60,
                target_resolution: native,
                min_resolution: RES_1080P,
                resolution_ladder: vec![RES_8K, RES_5K, RES_4K, RES_1440P, RES_1080P],
                fps_ladder: vec![60, 30],
                target_bitrate_kbps: 80_000,
                min_bitrate_kbps: 10_000,
                max_bitrate_kbps: 200_000,
                jitter_buffer_ms: 8,
                max_fec_ratio: 0.25,
                min_fec_ratio: 0.05,
                fps_weight: 0.2,
                quality_weight: 0.9,
                latency_weight: 0.5,
                recovery_speed: 0.4,
                preferred_codec: Codec::Hevc,
                chroma: ChromaMode::Yuv420,
            },

            StreamProfile::Creative => QosPreset {
                profile,
                target_fps: 60,
                min_fps: 30,
                max_fps: 60,
                target_resolution: native,
                min_resolution: RES_1080P,
                resolution_ladder: vec![RES_8K, RES_5K, RES_4K, RES_1440P, RES_1080P],
                fps_ladder: vec![60, 30],
                target_bitrate_kbps: 60_000,
                min_bitrate_kbps: 10_000,
                max_bitrate_kbps: 200_000,
                jitter_buffer_ms: 8,
                max_fec_ratio: 0.20,
                min_fec_ratio: 0.05,
                fps_weight: 0.2,
                quality_weight: 1.0,
                latency_weight: 0.3,
                recovery_speed: 0.3,
                preferred_codec: Codec::Hevc,
                chroma: ChromaMode::Yuv444,
            },

            StreamProfile::Cad => QosPreset {
                profile,
                target_fps: 60,
                min_fps: 30,
                max_fps: 60,
                target_resolution: native,
                min_resolution: RES_1080P,
                resolution_ladder: vec![RES_8K, RES_5K, RES_4K, RES_1440P, RES_1080P],
                fps_ladder: vec![60, 30],
                target_bitrate_kbps: 40_000,
                min_bitrate_kbps: 5_000,
                max_bitrate_kbps: 120_000,
                jitter_buffer_ms: 10,
                max_fec_ratio: 0.25,
                min_fec_ratio: 0.05,
                fps_weight: 0.1,
                quality_weight: 1.0,
                latency_weight: 0.4,
                recovery_speed: 0.3,
                preferred_codec: Codec::Av1,
                chroma: ChromaMode::Yuv444,
            },

            StreamProfile::MobileSaver => QosPreset {
                profile,
                target_fps: 60,
                min_fps: 30,
                max_fps: 60,
                target_resolution: RES_720P,
                min_resolution: RES_720P,
                resolution_ladder: vec![RES_720P],
                fps_ladder: vec![60, 30],
                target_bitrate_kbps: 10_000,
                min_bitrate_kbps: 2_000,
                max_bitrate_kbps: 20_000,
                jitter_buffer_ms: 8,
                // Cellular-grade loss wants generous FEC.
                max_fec_ratio: 0.30,
                min_fec_ratio: 0.10,
                fps_weight: 0.5,
                quality_weight: 0.3,
                latency_weight: 0.6,
                recovery_speed: 0.5,
                preferred_codec: Codec::H264,
                chroma: ChromaMode::Yuv420,
            },

            StreamProfile::Lan => QosPreset {
                profile,
                target_fps: 240,
                min_fps: 120,
                max_fps: 240,
                target_resolution: native,
                min_resolution: RES_1080P,
                resolution_ladder: vec![RES_8K, RES_5K, RES_5K_UW, RES_4K, RES_1440P, RES_1080P],
                fps_ladder: vec![240, 165, 144, 120],
                target_bitrate_kbps: 150_000,
                min_bitrate_kbps: 20_000,
                max_bitrate_kbps: 300_000,
                jitter_buffer_ms: 1,
                max_fec_ratio: 0.05,
                min_fec_ratio: 0.01,
                fps_weight: 0.8,
                quality_weight: 0.8,
                latency_weight: 1.0,
                recovery_speed: 1.0,
                preferred_codec: Codec::H264,
                chroma: ChromaMode::Yuv420,
            },
        }
    }

    /// Ladder index whose resolution matches the target (first rung not
    /// larger than it). Keeps ladder walking anchored at the operating
    /// point rather than the ladder top.
    pub fn resolution_step_for(&self, res: Resolution) -> usize {
        self.resolution_ladder
            .iter()
            .position(|r| r.pixel_count() <= res.pixel_count())
            .unwrap_or(0)
    }

    /// Ladder index for the current FPS (first rung not above it).
    pub fn fps_step_for(&self, fps: u32) -> usize {
        self.fps_ladder
            .iter()
            .position(|&f| f <= fps)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_profiles_internally_consistent() {
        for profile in [
            StreamProfile::Competitive,
            StreamProfile::Balanced,
            StreamProfile::Cinematic,
            StreamProfile::Creative,
            StreamProfile::Cad,
            StreamProfile::MobileSaver,
            StreamProfile::Lan,
        ] {
            let p = QosPreset::for_profile(profile, RES_1080P);
            assert!(p.min_fps <= p.target_fps && p.target_fps <= p.max_fps);
            assert!(p.min_bitrate_kbps <= p.target_bitrate_kbps);
            assert!(p.target_bitrate_kbps <= p.max_bitrate_kbps);
            assert!(p.min_fec_ratio <= p.max_fec_ratio);
            assert!(!p.resolution_ladder.is_empty());
            assert!(!p.fps_ladder.is_empty());

            // Ladders are ordered highest-first.
            for pair in p.resolution_ladder.windows(2) {
                assert!(pair[0].pixel_count() > pair[1].pixel_count());
            }
            for pair in p.fps_ladder.windows(2) {
                assert!(pair[0] > pair[1]);
            }
        }
    }

    #[test]
    fn test_competitive_prefers_fps() {
        let p = QosPreset::for_profile(StreamProfile::Competitive, RES_1080P);
        assert!(p.fps_weight > p.quality_weight);
    }

    #[test]
    fn test_cinematic_prefers_quality() {
        let p = QosPreset::for_profile(StreamProfile::Cinematic, RES_4K);
        assert!(p.quality_weight > p.fps_weight);
        assert_eq!(p.target_resolution, RES_4K);
    }

    #[test]
    fn test_balanced_caps_target_at_1440p() {
        let p = QosPreset::for_profile(StreamProfile::Balanced, RES_4K);
        assert_eq!(p.target_resolution, RES_1440P);
        let p = QosPreset::for_profile(StreamProfile::Balanced, RES_1080P);
        assert_eq!(p.target_resolution, RES_1080P);
    }

    #[test]
    fn test_resolution_step_anchors_to_target() {
        let p = QosPreset::for_profile(StreamProfile::Balanced, RES_1080P);
        // 1080p sits at ladder index 1; the next rung down is 1600x900.
        let step = p.resolution_step_for(p.target_resolution);
        assert_eq!(p.resolution_ladder[step], RES_1080P);
        assert_eq!(p.resolution_ladder[step + 1], RES_900P);
    }

    #[test]
    fn test_profile_name_round_trip() {
        for profile in [
            StreamProfile::Competitive,
            StreamProfile::Balanced,
            StreamProfile::Cinematic,
            StreamProfile::Creative,
            StreamProfile::Cad,
            StreamProfile::MobileSaver,
            StreamProfile::Lan,
        ] {
            assert_eq!(StreamProfile::from_name(profile.as_str()), profile);
        }
        assert_eq!(
            StreamProfile::from_name("unknown"),
            StreamProfile::Balanced
        );
    }
}
