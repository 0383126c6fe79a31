//! # Guidance Calculator
//!
//! Turns matcher output plus the device heading into a steering hint.
//!
//! - `target_bearing` is the bearing from the fix to the target point: the
//!   next track point normally, the nearest trail point when off-track.
//! - `heading_delta` is the target bearing relative to the device heading,
//!   normalised into `(-180, 180]`; positive means "to the right".
//! - The delta maps onto exactly one [`GuidanceBand`], symmetrically around 0.
//!
//! Without a usable, recent heading the guidance degrades to position-only:
//! target and distance are still reported, the band is not.
//!
//! [`AlertTrigger`] decides when to vibrate. It is edge-triggered and kept
//! apart from rendering so the policy can be tested on its own.

use serde::{Deserialize, Serialize};

use crate::geo_utils::{bearing, haversine_distance, normalize_delta};
use crate::group::GroupEvent;
use crate::matcher::MatchUpdate;
use crate::sensors::heading::HeadingReading;
use crate::track::Track;
use crate::GeoPoint;

/// Angular thresholds for guidance bands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuidanceConfig {
    /// `|delta|` up to this is "ahead".
    /// Default: 20.0 degrees
    pub ahead_half_angle_deg: f64,

    /// `|delta|` up to this (and beyond "ahead") is "bear left/right".
    /// Default: 60.0 degrees
    pub bear_half_angle_deg: f64,

    /// `|delta|` from this up is "behind".
    /// Default: 150.0 degrees
    pub behind_half_angle_deg: f64,

    /// Headings older than this relative to the fix are ignored.
    /// Default: 5000 ms
    pub max_heading_age_ms: u64,
}

impl Default for GuidanceConfig {
    fn default() -> Self {
        Self {
            ahead_half_angle_deg: 20.0,
            bear_half_angle_deg: 60.0,
            behind_half_angle_deg: 150.0,
            max_heading_age_ms: 5_000,
        }
    }
}

/// Discrete steering hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuidanceBand {
    Ahead,
    BearLeft,
    BearRight,
    TurnLeft,
    TurnRight,
    Behind,
}

impl GuidanceBand {
    /// Classify a heading delta in degrees. Total over all finite inputs.
    pub fn classify(delta_deg: f64, config: &GuidanceConfig) -> Self {
        let delta = normalize_delta(delta_deg);
        let magnitude = delta.abs();
        if magnitude <= config.ahead_half_angle_deg {
            GuidanceBand::Ahead
        } else if magnitude >= config.behind_half_angle_deg {
            GuidanceBand::Behind
        } else if magnitude <= config.bear_half_angle_deg {
            if delta > 0.0 {
                GuidanceBand::BearRight
            } else {
                GuidanceBand::BearLeft
            }
        } else if delta > 0.0 {
            GuidanceBand::TurnRight
        } else {
            GuidanceBand::TurnLeft
        }
    }

    /// The band for the mirrored delta.
    pub fn mirror(self) -> Self {
        match self {
            GuidanceBand::BearLeft => GuidanceBand::BearRight,
            GuidanceBand::BearRight => GuidanceBand::BearLeft,
            GuidanceBand::TurnLeft => GuidanceBand::TurnRight,
            GuidanceBand::TurnRight => GuidanceBand::TurnLeft,
            other => other,
        }
    }
}

/// Target bearing relative to the device heading, in `(-180, 180]`.
pub fn heading_delta(target_bearing: f64, device_heading: f64) -> f64 {
    normalize_delta(target_bearing - device_heading)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuidanceMode {
    /// Steer toward the next track point
    FollowTrail,
    /// Off-track: steer back to the nearest trail point
    ReturnToTrail,
    Arrived,
}

/// One guidance result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guidance {
    pub mode: GuidanceMode,
    pub target_index: usize,
    pub target: GeoPoint,
    pub target_bearing: f64,
    pub distance_to_target_m: f64,
    /// `None` without a usable heading
    pub heading_delta: Option<f64>,
    pub band: Option<GuidanceBand>,
    pub heading_confident: bool,
    pub off_track: bool,
    pub arrived: bool,
}

#[derive(Debug, Clone, Default)]
pub struct GuidanceCalculator {
    config: GuidanceConfig,
}

impl GuidanceCalculator {
    pub fn new(config: GuidanceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GuidanceConfig {
        &self.config
    }

    pub fn compute(
        &self,
        update: &MatchUpdate,
        track: &Track,
        heading: Option<&HeadingReading>,
    ) -> Guidance {
        let (mode, target_index) = if update.arrived {
            (GuidanceMode::Arrived, track.last_index())
        } else if update.off_track {
            (GuidanceMode::ReturnToTrail, update.near_point.index)
        } else {
            (GuidanceMode::FollowTrail, update.next.next_probable_point)
        };

        let target = track.points()[target_index].point;
        let position = &update.fix.point;
        let target_bearing = bearing(position, &target);

        let usable_heading = heading.filter(|h| {
            h.usable
                && update.fix.timestamp_ms.saturating_sub(h.timestamp_ms)
                    <= self.config.max_heading_age_ms
        });
        let delta = usable_heading.map(|h| heading_delta(target_bearing, h.azimuth_deg));

        Guidance {
            mode,
            target_index,
            target,
            target_bearing,
            distance_to_target_m: haversine_distance(position, &target),
            heading_delta: delta,
            band: delta.map(|d| GuidanceBand::classify(d, &self.config)),
            heading_confident: usable_heading.is_some(),
            off_track: update.off_track,
            arrived: update.arrived,
        }
    }
}

// ============================================================================
// Alerts
// ============================================================================

/// Vibration / alert triggers. Fired once per transition, never per tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AlertEvent {
    OffTrack { deviation_m: f64 },
    Distress { member_ids: Vec<String>, local: bool },
    Arrived,
}

/// Edge detector for alert-worthy states.
#[derive(Debug, Clone, Default)]
pub struct AlertTrigger {
    off_track: bool,
    distress: bool,
    arrived: bool,
}

impl AlertTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires on every matcher transition into off-track or arrival.
    pub fn observe_match(&mut self, update: &MatchUpdate) -> Vec<AlertEvent> {
        let mut events = Vec::new();
        if update.off_track && !self.off_track {
            events.push(AlertEvent::OffTrack { deviation_m: update.deviation_m });
        }
        self.off_track = update.off_track;

        if update.arrived && !self.arrived {
            events.push(AlertEvent::Arrived);
        }
        self.arrived = update.arrived;
        events
    }

    /// Fires on every transition into group distress.
    pub fn observe_group(&mut self, event: &GroupEvent) -> Option<AlertEvent> {
        match event {
            GroupEvent::EnteredDistress { member_ids, local } => {
                if self.distress {
                    return None;
                }
                self.distress = true;
                Some(AlertEvent::Distress {
                    member_ids: member_ids.clone(),
                    local: *local,
                })
            }
            GroupEvent::DistressCleared | GroupEvent::Left => {
                self.distress = false;
                None
            }
            _ => None,
        }
    }
}
