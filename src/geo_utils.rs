//! # Geographic Utilities
//!
//! Core geographic computation utilities for on-trail guidance.
//!
//! ## Overview
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`haversine_distance`] | Great-circle distance between two points |
//! | [`bearing`] | Initial great-circle bearing, degrees in `[0, 360)` |
//! | [`normalize_bearing`] | Wrap any angle into `[0, 360)` |
//! | [`normalize_delta`] | Wrap any angle difference into `(-180, 180]` |
//! | [`project_onto_segment`] | Closest point on a short segment |
//!
//! ## Example
//!
//! ```rust
//! use trail_guide::{GeoPoint, geo_utils};
//!
//! let a = GeoPoint::new(0.0, 0.0);
//! let b = GeoPoint::new(0.0, 0.001);
//!
//! let dist = geo_utils::haversine_distance(&a, &b);
//! assert!((dist - 111.2).abs() < 1.0);
//!
//! let brg = geo_utils::bearing(&a, &b);
//! assert!((brg - 90.0).abs() < 0.01); // due east
//! ```
//!
//! ## Algorithm Notes
//!
//! Distances and bearings use the haversine formulation from the `geo` crate
//! (spherical Earth, mean radius). Segment projection uses a local planar
//! approximation scaled by the cosine of latitude, which is accurate to well
//! under a meter for trail segments of a few hundred meters.
//!
//! All functions expect WGS84 coordinates in degrees.

use geo::{Bearing, Distance, Haversine, Point};
use crate::GeoPoint;

// =============================================================================
// Distance and Direction
// =============================================================================

/// Calculate the great-circle distance between two points in meters.
///
/// Symmetric, and exactly `0.0` for identical points.
///
/// # Example
///
/// ```rust
/// use trail_guide::{GeoPoint, geo_utils};
///
/// let london = GeoPoint::new(51.5074, -0.1278);
/// let paris = GeoPoint::new(48.8566, 2.3522);
///
/// let distance = geo_utils::haversine_distance(&london, &paris);
/// assert!((distance - 343_560.0).abs() < 1000.0); // ~344 km
/// ```
#[inline]
pub fn haversine_distance(p1: &GeoPoint, p2: &GeoPoint) -> f64 {
    Haversine::distance(to_geo(p1), to_geo(p2))
}

/// Initial bearing along the great circle from `from` to `to`.
///
/// Returns degrees in `[0, 360)` with north at 0 and east at 90.
/// Returns `0.0` when the two points coincide.
pub fn bearing(from: &GeoPoint, to: &GeoPoint) -> f64 {
    if from.latitude == to.latitude && from.longitude == to.longitude {
        return 0.0;
    }
    normalize_bearing(Haversine::bearing(to_geo(from), to_geo(to)))
}

/// Wrap an angle in degrees into `[0, 360)`.
#[inline]
pub fn normalize_bearing(degrees: f64) -> f64 {
    let wrapped = degrees.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360.0 for tiny negative inputs
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Wrap an angle difference in degrees into `(-180, 180]`.
///
/// Positive values mean "clockwise of the reference", i.e. to the right.
#[inline]
pub fn normalize_delta(degrees: f64) -> f64 {
    let wrapped = normalize_bearing(degrees);
    if wrapped > 180.0 {
        wrapped - 360.0
    } else {
        wrapped
    }
}

// =============================================================================
// Segment Projection
// =============================================================================

/// Project `p` onto the segment `a -> b`.
///
/// Returns the clamped fraction along the segment (`0.0` at `a`, `1.0` at `b`)
/// and the projected point. Elevation is interpolated when both endpoints
/// carry one. Degenerate segments project onto `a`.
pub fn project_onto_segment(p: &GeoPoint, a: &GeoPoint, b: &GeoPoint) -> (f64, GeoPoint) {
    let cos_lat = ((a.latitude + b.latitude) / 2.0).to_radians().cos();

    let dx = (b.longitude - a.longitude) * cos_lat;
    let dy = b.latitude - a.latitude;
    let px = (p.longitude - a.longitude) * cos_lat;
    let py = p.latitude - a.latitude;

    let seg_len_sq = dx * dx + dy * dy;
    if seg_len_sq < 1e-20 {
        return (0.0, *a);
    }

    let t = ((px * dx + py * dy) / seg_len_sq).clamp(0.0, 1.0);
    (t, interpolate(a, b, t))
}

/// Linear interpolation between two points.
pub fn interpolate(a: &GeoPoint, b: &GeoPoint, t: f64) -> GeoPoint {
    GeoPoint {
        latitude: a.latitude + t * (b.latitude - a.latitude),
        longitude: a.longitude + t * (b.longitude - a.longitude),
        elevation: match (a.elevation, b.elevation) {
            (Some(ea), Some(eb)) => Some(ea + t * (eb - ea)),
            _ => None,
        },
    }
}

#[inline]
fn to_geo(p: &GeoPoint) -> Point<f64> {
    Point::new(p.longitude, p.latitude)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
        (a - b).abs() < epsilon
    }

    #[test]
    fn test_haversine_distance_same_point() {
        let p = GeoPoint::new(46.5586, 7.9026);
        assert_eq!(haversine_distance(&p, &p), 0.0);
    }

    #[test]
    fn test_haversine_distance_symmetric() {
        let a = GeoPoint::new(46.5586, 7.9026);
        let b = GeoPoint::new(46.5771, 7.9862);
        assert_eq!(haversine_distance(&a, &b), haversine_distance(&b, &a));
    }

    #[test]
    fn test_haversine_triangle_inequality() {
        let pts = [
            GeoPoint::new(46.5586, 7.9026),
            GeoPoint::new(46.5771, 7.9862),
            GeoPoint::new(46.6100, 7.9000),
            GeoPoint::new(-33.9249, 18.4241),
            GeoPoint::new(0.0, 179.9),
            GeoPoint::new(0.0, -179.9),
        ];
        for a in &pts {
            for b in &pts {
                for c in &pts {
                    let ab = haversine_distance(a, b);
                    let bc = haversine_distance(b, c);
                    let ac = haversine_distance(a, c);
                    assert!(ac <= ab + bc + 1e-6, "triangle inequality violated");
                }
            }
        }
    }

    #[test]
    fn test_haversine_known_value() {
        // 0.001 degrees of longitude at the equator is ~111 m
        let a = GeoPoint::new(0.0, 0.0);
        let b = GeoPoint::new(0.0, 0.001);
        assert!(approx_eq(haversine_distance(&a, &b), 111.19, 0.5));
    }

    #[test]
    fn test_bearing_cardinal_directions() {
        let origin = GeoPoint::new(0.0, 0.0);
        assert!(approx_eq(bearing(&origin, &GeoPoint::new(0.01, 0.0)), 0.0, 0.01));
        assert!(approx_eq(bearing(&origin, &GeoPoint::new(0.0, 0.01)), 90.0, 0.01));
        assert!(approx_eq(bearing(&origin, &GeoPoint::new(-0.01, 0.0)), 180.0, 0.01));
        assert!(approx_eq(bearing(&origin, &GeoPoint::new(0.0, -0.01)), 270.0, 0.01));
    }

    #[test]
    fn test_bearing_same_point_is_zero() {
        let p = GeoPoint::new(46.5586, 7.9026);
        assert_eq!(bearing(&p, &p), 0.0);
    }

    #[test]
    fn test_bearing_range() {
        let origin = GeoPoint::new(10.0, 10.0);
        for i in 0..36 {
            let angle = (i as f64 * 10.0).to_radians();
            let target = GeoPoint::new(10.0 + angle.cos() * 0.01, 10.0 + angle.sin() * 0.01);
            let b = bearing(&origin, &target);
            assert!((0.0..360.0).contains(&b), "bearing {} out of range", b);
        }
    }

    #[test]
    fn test_normalize_delta_range() {
        for i in -1000..1000 {
            let d = normalize_delta(i as f64 * 0.77);
            assert!(d > -180.0 && d <= 180.0, "delta {} out of range", d);
        }
        assert_eq!(normalize_delta(180.0), 180.0);
        assert_eq!(normalize_delta(-180.0), 180.0);
        assert_eq!(normalize_delta(540.0), 180.0);
        assert!(approx_eq(normalize_delta(350.0), -10.0, 1e-9));
        assert!(approx_eq(normalize_delta(-1e-20), 0.0, 1e-9));
    }

    #[test]
    fn test_project_onto_segment_midpoint() {
        let a = GeoPoint::new(0.0, 0.0);
        let b = GeoPoint::new(0.0, 0.002);
        let p = GeoPoint::new(0.0005, 0.001);
        let (t, projected) = project_onto_segment(&p, &a, &b);
        assert!(approx_eq(t, 0.5, 1e-6));
        assert!(approx_eq(projected.latitude, 0.0, 1e-9));
        assert!(approx_eq(projected.longitude, 0.001, 1e-9));
    }

    #[test]
    fn test_project_onto_segment_clamps() {
        let a = GeoPoint::new(0.0, 0.0);
        let b = GeoPoint::new(0.0, 0.001);
        let (t, _) = project_onto_segment(&GeoPoint::new(0.0, -0.5), &a, &b);
        assert_eq!(t, 0.0);
        let (t, _) = project_onto_segment(&GeoPoint::new(0.0, 0.5), &a, &b);
        assert_eq!(t, 1.0);
    }

    #[test]
    fn test_interpolate_elevation() {
        let a = GeoPoint::with_elevation(0.0, 0.0, 100.0);
        let b = GeoPoint::with_elevation(0.0, 0.001, 200.0);
        let mid = interpolate(&a, &b, 0.25);
        assert_eq!(mid.elevation, Some(125.0));
        let no_ele = interpolate(&a, &GeoPoint::new(0.0, 0.001), 0.5);
        assert_eq!(no_ele.elevation, None);
    }
}
