//! 1-D Kalman filter used to smooth delay-gradient measurements.
//!
//! Constant-state model:
//! ```text
//! pred_var = var + Q
//! K        = pred_var / (pred_var + R)
//! est      = est + K * (meas - est)
//! var      = (1 - K) * pred_var
//! ```
//! Smaller Q trusts the model more (smoother output); smaller R trusts
//! measurements more (faster response).

#[derive(Debug, Clone)]
pub struct KalmanFilter {
    estimate: f64,
    variance: f64,
    process_noise: f64,
    measurement_noise: f64,
}

impl Default for KalmanFilter {
    fn default() -> Self {
        KalmanFilter::new(1e-3, 0.1)
    }
}

impl KalmanFilter {
    pub fn new(process_noise: f64, measurement_noise: f64) -> Self {
        KalmanFilter {
            estimate: 0.0,
            variance: 1.0,
            process_noise,
            measurement_noise,
        }
    }

    /// Fold in a measurement; returns the updated estimate.
    pub fn update(&mut self, measurement: f64) -> f64 {
        let predicted_variance = self.variance + self.process_noise;
        let gain = predicted_variance / (predicted_variance + self.measurement_noise);
        self.estimate += gain * (measurement - self.estimate);
        self.variance = (1.0 - gain) * predicted_variance;
        self.estimate
    }

    pub fn estimate(&self) -> f64 {
        self.estimate
    }

    pub fn variance(&self) -> f64 {
        self.variance
    }

    pub fn reset(&mut self) {
        self.estimate = 0.0;
        self.variance = 1.0;
    }
}
