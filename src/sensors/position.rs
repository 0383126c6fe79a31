//! Location fix normalisation.
//!
//! Raw platform locations become [`Fix`]es (position, accuracy radius,
//! optional altitude) at most once per configured interval, measured on the
//! sample timestamps. The first sample always passes, and so does the first
//! sample after the clock steps backwards.

use log::debug;
use serde::{Deserialize, Serialize};

use super::SampleProcessor;
use crate::{Fix, GeoPoint};

/// Raw platform location callback payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    /// Horizontal accuracy radius in meters
    pub accuracy_m: f64,
    pub timestamp_ms: u64,
}

/// Configuration for the position adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionConfig {
    /// Minimum spacing between emitted fixes.
    /// Default: 3000 ms
    pub min_interval_ms: u64,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self { min_interval_ms: 3_000 }
    }
}

/// Normalises and rate-limits location samples.
#[derive(Debug, Clone, Default)]
pub struct PositionNormalizer {
    config: PositionConfig,
    last_emitted_ms: Option<u64>,
}

impl PositionNormalizer {
    pub fn new(config: PositionConfig) -> Self {
        Self { config, last_emitted_ms: None }
    }
}

impl SampleProcessor for PositionNormalizer {
    type Raw = LocationSample;
    type Output = Fix;
    const NAME: &'static str = "PositionAdapter";

    fn process(&mut self, raw: LocationSample) -> Option<Fix> {
        let point = GeoPoint {
            latitude: raw.latitude,
            longitude: raw.longitude,
            elevation: raw.altitude.filter(|a| a.is_finite()),
        };
        if !point.is_valid() || !raw.accuracy_m.is_finite() || raw.accuracy_m < 0.0 {
            return None;
        }

        if let Some(last) = self.last_emitted_ms {
            if raw.timestamp_ms < last {
                debug!(
                    "[{}] Clock stepped back {}ms, restarting interval",
                    Self::NAME,
                    last - raw.timestamp_ms
                );
            } else if raw.timestamp_ms - last < self.config.min_interval_ms {
                return None;
            }
        }

        self.last_emitted_ms = Some(raw.timestamp_ms);
        Some(Fix::new(point, raw.accuracy_m, raw.timestamp_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ts: u64) -> LocationSample {
        LocationSample {
            latitude: 46.55,
            longitude: 7.90,
            altitude: Some(1800.0),
            accuracy_m: 6.0,
            timestamp_ms: ts,
        }
    }

    #[test]
    fn test_normalises_fix() {
        let mut norm = PositionNormalizer::default();
        let fix = norm.process(sample(1_000)).unwrap();
        assert_eq!(fix.point.latitude, 46.55);
        assert_eq!(fix.altitude(), Some(1800.0));
        assert_eq!(fix.accuracy_m, 6.0);
        assert_eq!(fix.timestamp_ms, 1_000);
    }

    #[test]
    fn test_coalesces_to_interval() {
        let mut norm = PositionNormalizer::default();
        let emitted: Vec<u64> = [0, 1_000, 2_999, 3_000, 4_000, 6_500, 7_000]
            .into_iter()
            .filter_map(|ts| norm.process(sample(ts)))
            .map(|f| f.timestamp_ms)
            .collect();
        assert_eq!(emitted, vec![0, 3_000, 6_500]);
    }

    #[test]
    fn test_rejects_invalid_samples() {
        let mut norm = PositionNormalizer::default();
        let mut bad = sample(0);
        bad.latitude = f64::NAN;
        assert!(norm.process(bad).is_none());

        let mut bad_accuracy = sample(0);
        bad_accuracy.accuracy_m = f64::INFINITY;
        assert!(norm.process(bad_accuracy).is_none());

        // Rejected samples do not start the interval
        assert!(norm.process(sample(10)).is_some());
    }

    #[test]
    fn test_non_finite_altitude_dropped() {
        let mut norm = PositionNormalizer::default();
        let mut s = sample(0);
        s.altitude = Some(f64::NAN);
        let fix = norm.process(s).unwrap();
        assert_eq!(fix.altitude(), None);
    }

    #[test]
    fn test_clock_stepping_back_restarts_interval() {
        let mut norm = PositionNormalizer::default();
        let emitted: Vec<u64> = [600_000, 0, 1_000, 3_000, 4_000]
            .into_iter()
            .filter_map(|ts| norm.process(sample(ts)))
            .map(|f| f.timestamp_ms)
            .collect();
        assert_eq!(emitted, vec![600_000, 0, 3_000]);
    }
}
