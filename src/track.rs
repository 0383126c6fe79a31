//! # Track Model
//!
//! An immutable, ordered sequence of [`TrackPoint`]s with precomputed
//! cumulative distances, built once from parsed trail data.
//!
//! A [`Track`] is shared read-only (`Arc<Track>`) between the matcher and the
//! guidance calculator; rebuilding means constructing a new `Track`.
//!
//! Besides the ordered points, the track keeps an R-tree over its points so
//! the matcher can relocate the cursor after a long excursion without
//! scanning the full trail.

use log::debug;
use rstar::{PointDistance, RTree, RTreeObject, AABB};

use crate::error::{GuideError, InvalidTrackError};
use crate::geo_utils::haversine_distance;
use crate::GeoPoint;

/// Minimum number of points a track needs to define at least one segment.
pub const MIN_TRACK_POINTS: usize = 2;

/// A trail point with its position in the sequence and cumulative distance.
#[derive(Debug, Clone, Copy, PartialEq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct TrackPoint {
    pub point: GeoPoint,
    /// Great-circle distance from the previous point (0 for the first point)
    pub distance_to_previous: f64,
    /// Cumulative distance from the track start in meters
    pub total_distance_traveled: f64,
    /// Position in the ordered sequence (0-based)
    pub index: usize,
}

/// A track point with its index for R-tree queries
#[derive(Debug, Clone, Copy)]
struct IndexedPoint {
    idx: usize,
    lat: f64,
    lng: f64,
}

impl RTreeObject for IndexedPoint {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.lat, self.lng])
    }
}

impl PointDistance for IndexedPoint {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dlat = self.lat - point[0];
        let dlng = self.lng - point[1];
        dlat * dlat + dlng * dlng
    }
}

/// An ordered, immutable trail.
#[derive(Debug, Clone)]
pub struct Track {
    points: Vec<TrackPoint>,
    index: RTree<IndexedPoint>,
}

impl Track {
    /// Build a track from parsed trail points.
    ///
    /// See [`build_cumulative_distances`].
    pub fn from_points(points: &[GeoPoint]) -> Result<Self, GuideError> {
        build_cumulative_distances(points)
    }

    /// Number of points (always at least 2).
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Always false: a track has at least [`MIN_TRACK_POINTS`] points.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[TrackPoint] {
        &self.points
    }

    pub fn get(&self, index: usize) -> Option<&TrackPoint> {
        self.points.get(index)
    }

    /// Index of the final point.
    pub fn last_index(&self) -> usize {
        self.points.len() - 1
    }

    pub fn first(&self) -> &TrackPoint {
        &self.points[0]
    }

    pub fn last(&self) -> &TrackPoint {
        &self.points[self.last_index()]
    }

    /// Total trail length in meters.
    pub fn total_distance(&self) -> f64 {
        self.last().total_distance_traveled
    }

    /// Find the track point nearest to `position` across the whole trail.
    ///
    /// The R-tree ranks candidates by planar degree distance, so the first
    /// few candidates are re-ranked by haversine distance before choosing.
    /// Returns the index and distance in meters.
    pub fn nearest_index(&self, position: &GeoPoint) -> Option<(usize, f64)> {
        let query = [position.latitude, position.longitude];
        self.index
            .nearest_neighbor_iter(&query)
            .take(8)
            .map(|p| (p.idx, haversine_distance(position, &self.points[p.idx].point)))
            .min_by(|a, b| a.1.total_cmp(&b.1).then(b.0.cmp(&a.0)))
    }
}

/// Compute `distance_to_previous` and `total_distance_traveled` in one
/// forward pass and wrap the result in a [`Track`].
///
/// Fails with [`InvalidTrackError::TooFewPoints`] for fewer than two points,
/// or [`InvalidTrackError::NonFiniteCoordinate`] for a point with a
/// non-finite or out-of-range coordinate.
///
/// # Example
///
/// ```rust
/// use trail_guide::{GeoPoint, build_cumulative_distances};
///
/// let track = build_cumulative_distances(&[
///     GeoPoint::new(0.0, 0.0),
///     GeoPoint::new(0.0, 0.001),
///     GeoPoint::new(0.0, 0.002),
/// ]).unwrap();
///
/// assert_eq!(track.len(), 3);
/// assert!((track.total_distance() - 222.4).abs() < 1.0);
/// ```
pub fn build_cumulative_distances(points: &[GeoPoint]) -> Result<Track, GuideError> {
    if points.len() < MIN_TRACK_POINTS {
        return Err(InvalidTrackError::TooFewPoints {
            point_count: points.len(),
            minimum_required: MIN_TRACK_POINTS,
        }
        .into());
    }

    if let Some(index) = points.iter().position(|p| !p.is_valid()) {
        return Err(InvalidTrackError::NonFiniteCoordinate { index }.into());
    }

    let mut track_points = Vec::with_capacity(points.len());
    let mut total = 0.0;

    for (index, point) in points.iter().enumerate() {
        let distance_to_previous = if index == 0 {
            0.0
        } else {
            haversine_distance(&points[index - 1], point)
        };
        total += distance_to_previous;
        track_points.push(TrackPoint {
            point: *point,
            distance_to_previous,
            total_distance_traveled: total,
            index,
        });
    }

    let indexed: Vec<IndexedPoint> = track_points
        .iter()
        .map(|tp| IndexedPoint {
            idx: tp.index,
            lat: tp.point.latitude,
            lng: tp.point.longitude,
        })
        .collect();

    debug!(
        "[Track] Built track: {} points, {:.0}m",
        track_points.len(),
        total
    );

    Ok(Track {
        points: track_points,
        index: RTree::bulk_load(indexed),
    })
}
