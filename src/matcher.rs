//! # Position Matcher
//!
//! Maps noisy location fixes onto a monotonically progressing cursor over a
//! [`Track`].
//!
//! ## Algorithm
//! 1. Reject fixes with invalid coordinates or accuracy worse than the ceiling
//! 2. Search a bounded window around the cursor for the nearest point. The
//!    back edge always covers the hysteresis plus the off-track distance
//! 3. Move the cursor forward to the highest index among near-ties; hold it on
//!    small backward matches; accept a real backward walk, measured on the
//!    nearest point, only after several consecutive fixes agree
//! 4. Project the fix onto the segment around the nearest point for the
//!    deviation and the along-track position
//! 5. Flag the fix off-track when it is too far from the trail, and relocate
//!    the cursor with a global search after a sustained excursion
//!
//! Cost per fix is O(window), independent of track length.

use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::geo_utils::{haversine_distance, project_onto_segment};
use crate::track::{Track, TrackPoint};
use crate::Fix;

/// Configuration for the position matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Minimum points searched behind the cursor. The window reaches back at
    /// least `backward_hysteresis_m + off_track_threshold_m` regardless.
    /// Default: 5
    pub back_lookahead: usize,

    /// Points searched ahead of the cursor.
    /// Default: 30
    pub forward_lookahead: usize,

    /// Upper bound on the tie radius. Candidates within
    /// `min(accuracy, max_tie_radius_m)` of the nearest distance count as tied,
    /// and the highest index wins.
    /// Default: 15.0 meters
    pub max_tie_radius_m: f64,

    /// Backward matches within this along-track distance of the cursor are jitter.
    /// Default: 10.0 meters
    pub backward_hysteresis_m: f64,

    /// Consecutive backward matches needed before the cursor moves back.
    /// Default: 3
    pub backward_debounce_fixes: u32,

    /// Distance from the trail beyond which a fix is off-track.
    /// Default: 40.0 meters
    pub off_track_threshold_m: f64,

    /// Fixes with a worse accuracy radius are ignored.
    /// Default: 50.0 meters
    pub max_accuracy_m: f64,

    /// Distance to the final point that counts as arrival.
    /// Default: 15.0 meters
    pub arrival_threshold_m: f64,

    /// Consecutive off-track fixes before a full-track search. 0 disables it.
    /// Default: 5
    pub reacquire_after_off_track_fixes: u32,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            back_lookahead: 5,
            forward_lookahead: 30,
            max_tie_radius_m: 15.0,
            backward_hysteresis_m: 10.0,
            backward_debounce_fixes: 3,
            off_track_threshold_m: 40.0,
            max_accuracy_m: 50.0,
            arrival_threshold_m: 15.0,
            reacquire_after_off_track_fixes: 5,
        }
    }
}

/// Nearest track point found for a fix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NearPoint {
    pub index: usize,
    /// Point-to-point distance from the fix in meters
    pub distance_to_user: f64,
}

/// Distances from the endpoints of the segment bracketing the matched index.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SectionDistances {
    pub first_index: usize,
    pub last_index: usize,
    pub first_to_me: f64,
    pub last_to_me: f64,
    /// Projection of the fix onto the segment, 0.0 at `first`, 1.0 at `last`
    pub fraction: f64,
    /// Perpendicular distance from the fix to the segment in meters
    pub cross_track_m: f64,
}

/// The point the hiker should currently be moving toward.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NextTrackPoint {
    pub next_probable_point: usize,
    pub track_point: TrackPoint,
}

/// Matcher output for one accepted fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchUpdate {
    pub fix: Fix,
    /// Cursor after this fix
    pub cursor: usize,
    pub near_point: NearPoint,
    pub section: SectionDistances,
    pub next: NextTrackPoint,
    /// Interpolated distance from the track start in meters
    pub along_track_m: f64,
    /// Distance left to the end of the track in meters
    pub remaining_m: f64,
    /// Distance from the trail used for the off-track decision
    pub deviation_m: f64,
    pub off_track: bool,
    pub arrived: bool,
    /// True when this fix relocated the cursor with a full-track search
    pub reacquired: bool,
}

/// Why a fix did not update the matcher.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IgnoreReason {
    InvalidCoordinates,
    LowAccuracy { accuracy_m: f64, ceiling_m: f64 },
}

/// Window search result.
#[derive(Debug, Clone, Copy)]
struct WindowMatch {
    /// Minimum-distance point: drives deviation and along-track position
    nearest: NearPoint,
    /// Highest index within the tie radius of `nearest`: drives the cursor
    preferred: usize,
}

/// Result of feeding one fix to the matcher.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Updated(MatchUpdate),
    Ignored(IgnoreReason),
}

/// Windowed nearest-point matcher with a monotonic cursor.
///
/// The matcher is the single writer of its cursor; callers serialise fixes
/// (the hike session feeds it from one loop).
#[derive(Debug)]
pub struct PositionMatcher {
    track: Arc<Track>,
    config: MatcherConfig,
    cursor: usize,
    pending_backward: u32,
    off_track_streak: u32,
    arrived: bool,
    last_update: Option<MatchUpdate>,
}

impl PositionMatcher {
    pub fn new(track: Arc<Track>, config: MatcherConfig) -> Self {
        Self {
            track,
            config,
            cursor: 0,
            pending_backward: 0,
            off_track_streak: 0,
            arrived: false,
            last_update: None,
        }
    }

    pub fn track(&self) -> &Arc<Track> {
        &self.track
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn is_arrived(&self) -> bool {
        self.arrived
    }

    pub fn last_update(&self) -> Option<&MatchUpdate> {
        self.last_update.as_ref()
    }

    /// Return to the start-of-session state.
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.pending_backward = 0;
        self.off_track_streak = 0;
        self.arrived = false;
        self.last_update = None;
    }

    /// Feed one fix.
    pub fn process_fix(&mut self, fix: &Fix) -> MatchOutcome {
        if !fix.point.is_valid() {
            debug!("[PositionMatcher] Ignoring fix with invalid coordinates");
            return MatchOutcome::Ignored(IgnoreReason::InvalidCoordinates);
        }
        if !fix.accuracy_m.is_finite()
            || fix.accuracy_m < 0.0
            || fix.accuracy_m > self.config.max_accuracy_m
        {
            debug!(
                "[PositionMatcher] Ignoring fix with accuracy {:.1}m (ceiling {:.1}m)",
                fix.accuracy_m, self.config.max_accuracy_m
            );
            return MatchOutcome::Ignored(IgnoreReason::LowAccuracy {
                accuracy_m: fix.accuracy_m,
                ceiling_m: self.config.max_accuracy_m,
            });
        }

        let mut found = self.search_window(fix);
        let mut section = self.section_distances(fix, found.nearest.index);
        let mut deviation = found.nearest.distance_to_user.min(section.cross_track_m);
        let mut off_track = deviation > self.config.off_track_threshold_m;
        let mut reacquired = false;

        if off_track {
            self.off_track_streak += 1;
            let limit = self.config.reacquire_after_off_track_fixes;
            if limit > 0 && self.off_track_streak >= limit && self.reacquire(fix) {
                reacquired = true;
                found = self.search_window(fix);
                section = self.section_distances(fix, found.nearest.index);
                deviation = found.nearest.distance_to_user.min(section.cross_track_m);
                off_track = deviation > self.config.off_track_threshold_m;
            }
        }

        if off_track {
            // The cursor stays at the last on-trail position
            self.pending_backward = 0;
        } else {
            self.off_track_streak = 0;
            self.advance_cursor(found.nearest.index, found.preferred);
        }

        let last = self.track.last_index();
        if !self.arrived
            && self.cursor == last
            && haversine_distance(&fix.point, &self.track.last().point)
                <= self.config.arrival_threshold_m
        {
            info!("[PositionMatcher] Arrived at end of track");
            self.arrived = true;
        }

        let along_track_m = self.along_track(&section);
        let next_index = (self.cursor + 1).min(last);
        let update = MatchUpdate {
            fix: *fix,
            cursor: self.cursor,
            near_point: found.nearest,
            section,
            next: NextTrackPoint {
                next_probable_point: next_index,
                track_point: self.track.points()[next_index],
            },
            along_track_m,
            remaining_m: (self.track.total_distance() - along_track_m).max(0.0),
            deviation_m: deviation,
            off_track,
            arrived: self.arrived,
            reacquired,
        };

        self.last_update = Some(update.clone());
        MatchOutcome::Updated(update)
    }

    /// Relocate the cursor to the globally nearest track point.
    ///
    /// Succeeds only when that point is within the off-track threshold.
    pub fn reacquire(&mut self, fix: &Fix) -> bool {
        match self.track.nearest_index(&fix.point) {
            Some((index, distance)) if distance <= self.config.off_track_threshold_m => {
                info!(
                    "[PositionMatcher] Reacquired track at index {} ({:.0}m away), cursor was {}",
                    index, distance, self.cursor
                );
                self.cursor = index;
                self.pending_backward = 0;
                self.off_track_streak = 0;
                true
            }
            _ => false,
        }
    }

    /// Window indices for the current cursor.
    ///
    /// The back edge reaches at least `backward_hysteresis_m + off_track_threshold_m`
    /// along the trail, so a retrace on a dense track stays inside the window
    /// long enough to be confirmed.
    fn window_bounds(&self) -> (usize, usize) {
        let points = self.track.points();
        let here = points[self.cursor].total_distance_traveled;
        let reach = self.config.backward_hysteresis_m + self.config.off_track_threshold_m;

        let mut lo = self.cursor.saturating_sub(self.config.back_lookahead);
        while lo > 0 && here - points[lo - 1].total_distance_traveled <= reach {
            lo -= 1;
        }
        let hi = (self.cursor + self.config.forward_lookahead).min(self.track.last_index());
        (lo, hi)
    }

    /// Nearest point inside the search window, plus the highest index
    /// within the tie radius of it.
    fn search_window(&self, fix: &Fix) -> WindowMatch {
        let points = self.track.points();
        let (lo, hi) = self.window_bounds();

        let distances: Vec<(usize, f64)> = (lo..=hi)
            .map(|i| (i, haversine_distance(&fix.point, &points[i].point)))
            .collect();

        let (index, distance_to_user) = distances
            .iter()
            .copied()
            .reduce(|best, candidate| if candidate.1 < best.1 { candidate } else { best })
            .unwrap_or((self.cursor, f64::INFINITY));
        let tie_radius = fix.accuracy_m.min(self.config.max_tie_radius_m).max(0.0);

        let preferred = distances
            .iter()
            .rev()
            .find(|&&(_, d)| d <= distance_to_user + tie_radius)
            .map_or(index, |&(i, _)| i);

        WindowMatch {
            nearest: NearPoint { index, distance_to_user },
            preferred,
        }
    }

    /// `preferred` moves the cursor forward; backward moves are measured and
    /// taken on the true nearest point.
    fn advance_cursor(&mut self, nearest: usize, preferred: usize) {
        if preferred >= self.cursor {
            if preferred > self.cursor {
                debug!("[PositionMatcher] Cursor {} -> {}", self.cursor, preferred);
            }
            self.cursor = preferred;
            self.pending_backward = 0;
            return;
        }

        let points = self.track.points();
        let gap =
            points[self.cursor].total_distance_traveled - points[nearest].total_distance_traveled;
        if gap <= self.config.backward_hysteresis_m {
            self.pending_backward = 0;
            return;
        }

        self.pending_backward += 1;
        if self.pending_backward >= self.config.backward_debounce_fixes {
            info!(
                "[PositionMatcher] Backward walk confirmed after {} fixes: cursor {} -> {}",
                self.pending_backward, self.cursor, nearest
            );
            self.cursor = nearest;
            self.pending_backward = 0;
        }
    }

    /// Pick the segment around `index` the fix projects onto most closely.
    fn section_distances(&self, fix: &Fix, index: usize) -> SectionDistances {
        let points = self.track.points();
        let last = self.track.last_index();

        let mut candidates = Vec::with_capacity(2);
        if index < last {
            candidates.push((index, index + 1));
        }
        if index > 0 {
            candidates.push((index - 1, index));
        }

        candidates
            .into_iter()
            .map(|(first, second)| {
                let a = &points[first].point;
                let b = &points[second].point;
                let (fraction, projected) = project_onto_segment(&fix.point, a, b);
                SectionDistances {
                    first_index: first,
                    last_index: second,
                    first_to_me: haversine_distance(&fix.point, a),
                    last_to_me: haversine_distance(&fix.point, b),
                    fraction,
                    cross_track_m: haversine_distance(&fix.point, &projected),
                }
            })
            // Forward segment comes first and wins ties
            .reduce(|best, s| if s.cross_track_m < best.cross_track_m { s } else { best })
            .unwrap_or(SectionDistances {
                first_index: index,
                last_index: index,
                first_to_me: 0.0,
                last_to_me: 0.0,
                fraction: 0.0,
                cross_track_m: 0.0,
            })
    }

    fn along_track(&self, section: &SectionDistances) -> f64 {
        let points = self.track.points();
        let start = points[section.first_index].total_distance_traveled;
        start + section.fraction * points[section.last_index].distance_to_previous
    }
}
