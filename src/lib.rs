//! # Trail Guide
//!
//! On-trail position matching, heading guidance and group SOS coordination
//! for hikers following a pre-recorded trail.
//!
//! This library provides:
//! - A windowed position matcher that keeps a monotonic cursor on a trail
//!   under noisy GPS input
//! - Heading fusion from raw accelerometer and magnetometer samples
//! - Steering hints, off-track detection and arrival detection
//! - A live-location / SOS protocol for hiking groups
//!
//! ## Features
//!
//! - **`http`** - Enable the `reqwest` client for the group location service
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use trail_guide::{Fix, GeoPoint, MatchOutcome, MatcherConfig, PositionMatcher, Track};
//! use std::sync::Arc;
//!
//! let track = Track::from_points(&[
//!     GeoPoint::new(0.0, 0.0),
//!     GeoPoint::new(0.0, 0.001),
//!     GeoPoint::new(0.0, 0.002),
//! ]).unwrap();
//!
//! let mut matcher = PositionMatcher::new(Arc::new(track), MatcherConfig::default());
//! let fix = Fix::new(GeoPoint::new(0.0, 0.0), 5.0, 0);
//!
//! if let MatchOutcome::Updated(update) = matcher.process_fix(&fix) {
//!     assert_eq!(update.cursor, 0);
//!     assert_eq!(update.next.next_probable_point, 1);
//! }
//! ```

use serde::{Deserialize, Serialize};

pub mod config;
pub mod error;
pub mod geo_utils;
pub mod group;
pub mod guidance;
pub mod matcher;
pub mod sensors;
pub mod session;
pub mod track;

// HTTP client for the group location service
#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use http::GroupLocationClient;

pub use config::GuideConfig;
pub use error::{GuideError, InvalidTrackError};
pub use group::{
    CredentialProvider, GroupEvent, GroupLocationService, GroupProtocol, GroupSnapshot,
    GroupState, MemberLocation, MemberStateUpdate, SyncConfig,
};
pub use guidance::{
    heading_delta, AlertEvent, AlertTrigger, Guidance, GuidanceBand, GuidanceCalculator,
    GuidanceConfig, GuidanceMode,
};
pub use matcher::{
    IgnoreReason, MatchOutcome, MatchUpdate, MatcherConfig, NearPoint, NextTrackPoint,
    PositionMatcher, SectionDistances,
};
pub use sensors::{
    heading::{HeadingConfig, HeadingFusion, HeadingReading, MagnetometerAccuracy, MotionSample},
    position::{LocationSample, PositionConfig, PositionNormalizer},
    CallbackPlatform, SampleProcessor, SampleSink, SampleStream, SensorAdapter, SensorFeeder,
    SensorPlatform, SensorStatus,
};
pub use session::{GroupMembership, GuidanceSnapshot, HikeSession};
pub use track::{build_cumulative_distances, Track, TrackPoint};

/// Initialize logging for Android hosts.
///
/// On other platforms this is a no-op; the host installs its own `log` backend.
#[cfg(target_os = "android")]
pub fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("TrailGuideRust")
    );
}

#[cfg(not(target_os = "android"))]
pub fn init_logging() {
    // No-op on non-Android platforms
}

// ============================================================================
// Core Types
// ============================================================================

/// A WGS84 coordinate with optional elevation.
///
/// # Example
/// ```
/// use trail_guide::GeoPoint;
/// let point = GeoPoint::new(46.5586, 7.9026);
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
    /// Elevation in meters, when the source provides one
    #[serde(default)]
    pub elevation: Option<f64>,
}

impl GeoPoint {
    /// Create a new point without elevation.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude, elevation: None }
    }

    /// Create a new point with elevation in meters.
    pub fn with_elevation(latitude: f64, longitude: f64, elevation: f64) -> Self {
        Self { latitude, longitude, elevation: Some(elevation) }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
            && self.elevation.map_or(true, f64::is_finite)
    }
}

/// A single location reading: position, horizontal accuracy and time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    /// Position; `elevation` carries the reported altitude
    pub point: GeoPoint,
    /// Horizontal accuracy radius in meters
    pub accuracy_m: f64,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,
}

impl Fix {
    pub fn new(point: GeoPoint, accuracy_m: f64, timestamp_ms: u64) -> Self {
        Self { point, accuracy_m, timestamp_ms }
    }

    pub fn altitude(&self) -> Option<f64> {
        self.point.elevation
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geo_point_validation() {
        assert!(GeoPoint::new(46.5586, 7.9026).is_valid());
        assert!(!GeoPoint::new(91.0, 0.0).is_valid());
        assert!(!GeoPoint::new(0.0, 181.0).is_valid());
        assert!(!GeoPoint::new(f64::NAN, 0.0).is_valid());
        assert!(!GeoPoint::with_elevation(0.0, 0.0, f64::INFINITY).is_valid());
    }

    #[test]
    fn test_geo_point_json_without_elevation() {
        let p: GeoPoint = serde_json::from_str(r#"{"latitude": 1.5, "longitude": 2.5}"#).unwrap();
        assert_eq!(p, GeoPoint::new(1.5, 2.5));
    }
}
