//! Coordinate service (spec §4.B): pure conversion between local Cartesian
//! meters and geodetic lat/lng around a reference origin, via equirectangular
//! linearisation. No mutable state.

use serde::{Deserialize, Serialize};

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Geodetic triple in decimal degrees and meters. Immutable once constructed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
    pub alt: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lng: f64, alt: f64) -> Self {
        Self { lat, lng, alt }
    }
}

/// A local Cartesian offset from an origin, in meters. `x` runs east
/// (longitude direction), `y` runs north (latitude direction).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Local {
    pub x: f64,
    pub y: f64,
}

/// Convert a local (x, y) offset in meters to a geodetic coordinate around
/// `origin`, preserving `origin.alt` unless `alt` overrides it.
pub fn local_to_geodetic(origin: Coordinate, dx: f64, dy: f64, alt: f64) -> Coordinate {
    let delta_lat = dy / EARTH_RADIUS_M * (180.0 / std::f64::consts::PI);
    let delta_lng = dx / (EARTH_RADIUS_M * origin.lat.to_radians().cos()) * (180.0 / std::f64::consts::PI);
    Coordinate::new(origin.lat + delta_lat, origin.lng + delta_lng, alt)
}

/// Convert a geodetic coordinate back to a local (x, y) offset in meters
/// relative to `origin`. Inverse of [`local_to_geodetic`].
pub fn geodetic_to_local(origin: Coordinate, point: Coordinate) -> Local {
    let dy = (point.lat - origin.lat).to_radians() * EARTH_RADIUS_M;
    let dx = (point.lng - origin.lng).to_radians() * EARTH_RADIUS_M * origin.lat.to_radians().cos();
    Local { x: dx, y: dy }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_within_a_millimeter_for_small_offsets() {
        let origin = Coordinate::new(57.7, 11.9, 0.0);
        for &(dx, dy) in &[(0.0, 0.0), (1234.5, -876.2), (-5000.0, 9000.0), (10.0, 10.0)] {
            let geo = local_to_geodetic(origin, dx, dy, 0.0);
            let local = geodetic_to_local(origin, geo);
            assert!((local.x - dx).abs() < 0.001, "dx: {} vs {}", local.x, dx);
            assert!((local.y - dy).abs() < 0.001, "dy: {} vs {}", local.y, dy);
        }
    }

    #[test]
    fn origin_maps_to_itself() {
        let origin = Coordinate::new(40.0, -70.0, 5.0);
        let geo = local_to_geodetic(origin, 0.0, 0.0, 5.0);
        assert!((geo.lat - origin.lat).abs() < 1e-12);
        assert!((geo.lng - origin.lng).abs() < 1e-12);
    }
}
