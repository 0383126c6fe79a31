//! Heading fusion from accelerometer and magnetometer samples.
//!
//! The device azimuth comes from the rotation matrix built out of the gravity
//! vector `A` and the geomagnetic vector `E` (both in device coordinates):
//!
//! - `H = E × A` points east
//! - `M = A × H` points north
//! - rows `H`, `M`, `A` form the device-to-world rotation
//!
//! and the azimuth is `atan2(H.y, M.y)`. Both inputs are low-pass filtered
//! first. The platform also reports a magnetometer accuracy level (0-3);
//! readings below the configured level are marked unusable so guidance can
//! suppress its directional hint instead of trusting a bad compass.

use log::debug;
use serde::{Deserialize, Serialize};

use super::SampleProcessor;
use crate::geo_utils::normalize_bearing;

/// Platform-reported magnetometer calibration level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MagnetometerAccuracy {
    Unreliable = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl MagnetometerAccuracy {
    /// Map a platform level; anything above 3 counts as `High`.
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => MagnetometerAccuracy::Unreliable,
            1 => MagnetometerAccuracy::Low,
            2 => MagnetometerAccuracy::Medium,
            _ => MagnetometerAccuracy::High,
        }
    }

    pub fn level(self) -> u8 {
        self as u8
    }
}

/// Raw motion sensor input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotionSample {
    /// m/s², device coordinates
    Accelerometer { values: [f64; 3], timestamp_ms: u64 },
    /// µT, device coordinates
    Magnetometer { values: [f64; 3], timestamp_ms: u64 },
    /// Magnetometer accuracy change
    Accuracy(MagnetometerAccuracy),
}

/// Configuration for heading fusion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadingConfig {
    /// Low-pass weight of each new sample (0-1, lower = smoother).
    /// Default: 0.15
    pub filter_alpha: f64,

    /// Readings below this magnetometer accuracy level are unusable.
    /// Default: 2 (medium)
    pub min_usable_accuracy: u8,

    /// Level assumed until the platform reports one.
    /// Default: 2 (medium)
    pub assumed_accuracy: u8,
}

impl Default for HeadingConfig {
    fn default() -> Self {
        Self {
            filter_alpha: 0.15,
            min_usable_accuracy: 2,
            assumed_accuracy: 2,
        }
    }
}

/// A fused compass heading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeadingReading {
    /// Degrees clockwise from magnetic north, `[0, 360)`
    pub azimuth_deg: f64,
    pub accuracy: MagnetometerAccuracy,
    /// False when the accuracy is below the usable level
    pub usable: bool,
    pub timestamp_ms: u64,
}

/// Accelerometer + magnetometer fusion into a heading stream.
#[derive(Debug, Clone)]
pub struct HeadingFusion {
    config: HeadingConfig,
    gravity: Option<[f64; 3]>,
    geomagnetic: Option<[f64; 3]>,
    accuracy: MagnetometerAccuracy,
    last: Option<HeadingReading>,
}

impl HeadingFusion {
    pub fn new(config: HeadingConfig) -> Self {
        let accuracy = MagnetometerAccuracy::from_level(config.assumed_accuracy);
        Self {
            config,
            gravity: None,
            geomagnetic: None,
            accuracy,
            last: None,
        }
    }

    pub fn accuracy(&self) -> MagnetometerAccuracy {
        self.accuracy
    }

    fn is_usable(&self) -> bool {
        self.accuracy.level() >= self.config.min_usable_accuracy
    }

    fn reading(&mut self, timestamp_ms: u64) -> Option<HeadingReading> {
        let azimuth_deg = compute_azimuth(self.gravity?, self.geomagnetic?)?;
        let reading = HeadingReading {
            azimuth_deg,
            accuracy: self.accuracy,
            usable: self.is_usable(),
            timestamp_ms,
        };
        self.last = Some(reading);
        Some(reading)
    }
}

impl Default for HeadingFusion {
    fn default() -> Self {
        Self::new(HeadingConfig::default())
    }
}

impl SampleProcessor for HeadingFusion {
    type Raw = MotionSample;
    type Output = HeadingReading;
    const NAME: &'static str = "HeadingAdapter";

    fn process(&mut self, raw: MotionSample) -> Option<HeadingReading> {
        let alpha = self.config.filter_alpha.clamp(0.0, 1.0);
        match raw {
            MotionSample::Accelerometer { values, timestamp_ms } => {
                if !values.iter().all(|v| v.is_finite()) {
                    return None;
                }
                self.gravity = Some(low_pass(self.gravity, values, alpha));
                self.reading(timestamp_ms)
            }
            MotionSample::Magnetometer { values, timestamp_ms } => {
                if !values.iter().all(|v| v.is_finite()) {
                    return None;
                }
                self.geomagnetic = Some(low_pass(self.geomagnetic, values, alpha));
                self.reading(timestamp_ms)
            }
            MotionSample::Accuracy(accuracy) => {
                if accuracy == self.accuracy {
                    return None;
                }
                debug!(
                    "[HeadingAdapter] Magnetometer accuracy {:?} -> {:?}",
                    self.accuracy, accuracy
                );
                self.accuracy = accuracy;
                // Re-publish the last heading with the new confidence
                let usable = self.is_usable();
                self.last.as_mut().map(|r| {
                    r.accuracy = accuracy;
                    r.usable = usable;
                    *r
                })
            }
        }
    }
}

fn low_pass(previous: Option<[f64; 3]>, sample: [f64; 3], alpha: f64) -> [f64; 3] {
    match previous {
        None => sample,
        Some(prev) => [
            prev[0] + alpha * (sample[0] - prev[0]),
            prev[1] + alpha * (sample[1] - prev[1]),
            prev[2] + alpha * (sample[2] - prev[2]),
        ],
    }
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn norm(v: [f64; 3]) -> f64 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

/// Row-major device-to-world rotation matrix from gravity and geomagnetic
/// vectors in device coordinates.
///
/// Returns `None` in free fall or when the field is (nearly) parallel to
/// gravity, where no horizontal reference exists.
pub fn rotation_matrix(gravity: [f64; 3], geomagnetic: [f64; 3]) -> Option<[f64; 9]> {
    let h = cross(geomagnetic, gravity);
    let norm_h = norm(h);
    let norm_a = norm(gravity);
    if norm_h < 0.1 || norm_a < 0.1 {
        return None;
    }

    let h = [h[0] / norm_h, h[1] / norm_h, h[2] / norm_h];
    let a = [gravity[0] / norm_a, gravity[1] / norm_a, gravity[2] / norm_a];
    let m = cross(a, h);

    Some([h[0], h[1], h[2], m[0], m[1], m[2], a[0], a[1], a[2]])
}

/// Device azimuth in degrees `[0, 360)` from gravity and geomagnetic vectors.
pub fn compute_azimuth(gravity: [f64; 3], geomagnetic: [f64; 3]) -> Option<f64> {
    let r = rotation_matrix(gravity, geomagnetic)?;
    Some(normalize_bearing(r[1].atan2(r[4]).to_degrees()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const G: [f64; 3] = [0.0, 0.0, 9.81];

    fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
        (a - b).abs() < epsilon
    }

    fn accel(ts: u64) -> MotionSample {
        MotionSample::Accelerometer { values: G, timestamp_ms: ts }
    }

    fn mag(values: [f64; 3], ts: u64) -> MotionSample {
        MotionSample::Magnetometer { values, timestamp_ms: ts }
    }

    #[test]
    fn test_flat_device_cardinal_headings() {
        // Northern-hemisphere field: horizontal component north, vertical down
        assert!(approx_eq(compute_azimuth(G, [0.0, 20.0, -40.0]).unwrap(), 0.0, 1e-9));
        assert!(approx_eq(compute_azimuth(G, [-20.0, 0.0, -40.0]).unwrap(), 90.0, 1e-9));
        assert!(approx_eq(compute_azimuth(G, [0.0, -20.0, -40.0]).unwrap(), 180.0, 1e-9));
        assert!(approx_eq(compute_azimuth(G, [20.0, 0.0, -40.0]).unwrap(), 270.0, 1e-9));
    }

    #[test]
    fn test_tilted_device_keeps_heading() {
        // Device pitched 30 degrees, top still facing north
        let pitch = 30f64.to_radians();
        let gravity = [0.0, 9.81 * pitch.sin(), 9.81 * pitch.cos()];
        // Rotate the north/down field the same way
        let (n, d) = (20.0, -40.0);
        let field = [0.0, n * pitch.cos() + d * pitch.sin(), -n * pitch.sin() + d * pitch.cos()];
        let az = compute_azimuth(gravity, field).unwrap();
        assert!(approx_eq(az, 0.0, 1e-6) || approx_eq(az, 360.0, 1e-6), "azimuth {}", az);
    }

    #[test]
    fn test_degenerate_geometry() {
        assert!(compute_azimuth([0.0, 0.0, 0.0], [0.0, 20.0, -40.0]).is_none());
        assert!(compute_azimuth(G, [0.0, 0.0, -40.0]).is_none());
    }

    #[test]
    fn test_needs_both_vectors() {
        let mut fusion = HeadingFusion::default();
        assert!(fusion.process(accel(1)).is_none());
        let reading = fusion.process(mag([0.0, 20.0, -40.0], 2)).unwrap();
        assert!(approx_eq(reading.azimuth_deg, 0.0, 1e-9));
        assert_eq!(reading.timestamp_ms, 2);
        assert!(reading.usable);
    }

    #[test]
    fn test_low_pass_smooths_jumps() {
        let mut fusion = HeadingFusion::default();
        fusion.process(accel(1));
        fusion.process(mag([0.0, 20.0, -40.0], 2));
        // Sudden east-facing field: filtered heading moves only partway
        let reading = fusion.process(mag([-20.0, 0.0, -40.0], 3)).unwrap();
        assert!(reading.azimuth_deg > 0.0 && reading.azimuth_deg < 45.0);
    }

    #[test]
    fn test_accuracy_gates_usability() {
        let mut fusion = HeadingFusion::default();
        fusion.process(accel(1));
        fusion.process(mag([0.0, 20.0, -40.0], 2));

        let degraded = fusion
            .process(MotionSample::Accuracy(MagnetometerAccuracy::Low))
            .unwrap();
        assert!(!degraded.usable);
        assert_eq!(degraded.accuracy, MagnetometerAccuracy::Low);

        // Same level again publishes nothing
        assert!(fusion.process(MotionSample::Accuracy(MagnetometerAccuracy::Low)).is_none());

        let next = fusion.process(mag([0.0, 20.0, -40.0], 3)).unwrap();
        assert!(!next.usable);

        let restored = fusion
            .process(MotionSample::Accuracy(MagnetometerAccuracy::High))
            .unwrap();
        assert!(restored.usable);
    }

    #[test]
    fn test_non_finite_samples_dropped() {
        let mut fusion = HeadingFusion::default();
        fusion.process(accel(1));
        assert!(fusion.process(mag([f64::NAN, 20.0, -40.0], 2)).is_none());
        assert!(fusion.process(mag([0.0, 20.0, -40.0], 3)).is_some());
    }

    #[test]
    fn test_accuracy_levels() {
        assert_eq!(MagnetometerAccuracy::from_level(0), MagnetometerAccuracy::Unreliable);
        assert_eq!(MagnetometerAccuracy::from_level(7), MagnetometerAccuracy::High);
        assert_eq!(MagnetometerAccuracy::Medium.level(), 2);
    }
}
