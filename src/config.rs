//! Configuration for a hike session.
//!
//! Every section falls back to its defaults, so a partial JSON document such as
//! `{"matcher": {"off_track_threshold_m": 60}}` is a complete configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::GuideError;
use crate::group::SyncConfig;
use crate::guidance::GuidanceConfig;
use crate::matcher::MatcherConfig;
use crate::sensors::heading::HeadingConfig;
use crate::sensors::position::PositionConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuideConfig {
    pub matcher: MatcherConfig,
    pub guidance: GuidanceConfig,
    pub heading: HeadingConfig,
    pub position: PositionConfig,
    pub sync: SyncConfig,
    /// Capacity of the bounded sensor and event channels.
    /// Default: 64
    pub channel_capacity: usize,
}

impl Default for GuideConfig {
    fn default() -> Self {
        Self {
            matcher: MatcherConfig::default(),
            guidance: GuidanceConfig::default(),
            heading: HeadingConfig::default(),
            position: PositionConfig::default(),
            sync: SyncConfig::default(),
            channel_capacity: 64,
        }
    }
}

impl GuideConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, GuideError> {
        let config: GuideConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, GuideError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), GuideError> {
        let m = &self.matcher;
        positive("matcher.max_tie_radius_m", m.max_tie_radius_m)?;
        positive("matcher.off_track_threshold_m", m.off_track_threshold_m)?;
        positive("matcher.max_accuracy_m", m.max_accuracy_m)?;
        positive("matcher.arrival_threshold_m", m.arrival_threshold_m)?;
        if !(m.backward_hysteresis_m.is_finite() && m.backward_hysteresis_m >= 0.0) {
            return invalid("matcher.backward_hysteresis_m must be >= 0");
        }
        if m.forward_lookahead == 0 {
            return invalid("matcher.forward_lookahead must be at least 1");
        }
        if m.backward_debounce_fixes == 0 {
            return invalid("matcher.backward_debounce_fixes must be at least 1");
        }

        let g = &self.guidance;
        positive("guidance.ahead_half_angle_deg", g.ahead_half_angle_deg)?;
        if !(g.ahead_half_angle_deg < g.bear_half_angle_deg
            && g.bear_half_angle_deg < g.behind_half_angle_deg
            && g.behind_half_angle_deg <= 180.0)
        {
            return invalid("guidance angles must satisfy ahead < bear < behind <= 180");
        }
        if g.max_heading_age_ms == 0 {
            return invalid("guidance.max_heading_age_ms must be positive");
        }

        let h = &self.heading;
        if !(h.filter_alpha > 0.0 && h.filter_alpha <= 1.0) {
            return invalid("heading.filter_alpha must be in (0, 1]");
        }
        if h.min_usable_accuracy > 3 || h.assumed_accuracy > 3 {
            return invalid("heading accuracy levels range from 0 to 3");
        }

        let s = &self.sync;
        if s.push_interval_ms == 0 || s.pull_interval_ms == 0 || s.call_timeout_ms == 0 {
            return invalid("sync intervals and call timeout must be positive");
        }
        if s.backoff_base_ms == 0 || s.backoff_max_ms < s.backoff_base_ms {
            return invalid("sync backoff must satisfy 0 < base <= max");
        }
        if s.stale_after_failures == 0 {
            return invalid("sync.stale_after_failures must be at least 1");
        }

        if self.channel_capacity == 0 {
            return invalid("channel_capacity must be at least 1");
        }
        Ok(())
    }
}

fn positive(name: &str, value: f64) -> Result<(), GuideError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(GuideError::InvalidConfig(format!("{} must be positive, got {}", name, value)))
    }
}

fn invalid(message: &str) -> Result<(), GuideError> {
    Err(GuideError::InvalidConfig(message.to_string()))
}
