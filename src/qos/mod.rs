//! Adaptive congestion control: bandwidth estimation, the host-side QoS
//! controller with its profile presets, and the viewer-side stats
//! reporter that closes the feedback loop.

pub mod controller;
pub mod estimator;
pub mod kalman;
pub mod presets;
pub mod reporter;

pub use controller::{FeedbackSample, QosController, QosSnapshot, QosState};
pub use estimator::BandwidthEstimator;
pub use kalman::KalmanFilter;
pub use presets::{QosPreset, Resolution, StreamProfile};
pub use reporter::{StatsReporter, ViewerStats, FEEDBACK_INTERVAL};
