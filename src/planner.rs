//! Geometry Planner (spec §4.A): from a set of ground-object trajectories,
//! compute N fly-to targets and a shared yaw angle via a minimum-area
//! rectangle cover of the flattened point cloud.
//!
//! Grounded on `original_source/communication_software/communication_software/
//! ConvexHullScalable.py`: rotating calipers over the convex hull, iterative
//! square shrinking, and altitude-regulated field-of-view sizing.

use std::collections::HashMap;

use crate::error::{CoreError, CoreResult};
use crate::geometry::{local_to_geodetic, Coordinate};

const DEGENERATE_EPS: f64 = 1e-9;

/// Ordered sequence of coordinates per tracked object, keyed by object id.
/// Constructed once per test, read by the planner, then discarded.
#[derive(Debug, Clone, Default)]
pub struct TrajectorySet {
    pub paths: HashMap<String, Vec<Coordinate>>,
}

impl TrajectorySet {
    pub fn new() -> Self {
        Self { paths: HashMap::new() }
    }

    pub fn insert(&mut self, object_id: impl Into<String>, path: Vec<Coordinate>) {
        self.paths.insert(object_id.into(), path);
    }

    fn is_empty(&self) -> bool {
        self.paths.values().all(|p| p.is_empty())
    }
}

/// A fly-to target: a coordinate plus a yaw in degrees clockwise from north.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlyToTarget {
    pub coordinate: Coordinate,
    pub yaw_deg: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Vec2 {
    x: f64,
    y: f64,
}

impl Vec2 {
    fn sub(self, other: Vec2) -> Vec2 {
        Vec2 { x: self.x - other.x, y: self.y - other.y }
    }
    fn add(self, other: Vec2) -> Vec2 {
        Vec2 { x: self.x + other.x, y: self.y + other.y }
    }
    fn scale(self, s: f64) -> Vec2 {
        Vec2 { x: self.x * s, y: self.y * s }
    }
    fn dot(self, other: Vec2) -> f64 {
        self.x * other.x + self.y * other.y
    }
    fn norm(self) -> f64 {
        self.dot(self).sqrt()
    }
    fn normalize(self) -> Vec2 {
        let n = self.norm();
        if n < DEGENERATE_EPS {
            Vec2 { x: 1.0, y: 0.0 }
        } else {
            self.scale(1.0 / n)
        }
    }
    fn perp(self) -> Vec2 {
        Vec2 { x: -self.y, y: self.x }
    }
}

#[derive(Debug, Clone, Copy)]
struct Rectangle {
    center: Vec2,
    axis: [Vec2; 2],
    extent: [f64; 2],
}

/// Monotone-chain convex hull. Returns hull vertices in counter-clockwise
/// order, duplicate points removed.
fn convex_hull(points: &[Vec2]) -> Vec<Vec2> {
    let mut pts: Vec<(f64, f64)> = points.iter().map(|p| (p.x, p.y)).collect();
    pts.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    pts.dedup();
    let n = pts.len();
    if n < 3 {
        return pts.into_iter().map(|(x, y)| Vec2 { x, y }).collect();
    }

    fn cross(o: (f64, f64), a: (f64, f64), b: (f64, f64)) -> f64 {
        (a.0 - o.0) * (b.1 - o.1) - (a.1 - o.1) * (b.0 - o.0)
    }

    let mut lower: Vec<(f64, f64)> = Vec::new();
    for &p in &pts {
        while lower.len() >= 2 && cross(lower[lower.len() - 2], lower[lower.len() - 1], p) <= 0.0 {
            lower.pop();
        }
        lower.push(p);
    }

    let mut upper: Vec<(f64, f64)> = Vec::new();
    for &p in pts.iter().rev() {
        while upper.len() >= 2 && cross(upper[upper.len() - 2], upper[upper.len() - 1], p) <= 0.0 {
            upper.pop();
        }
        upper.push(p);
    }

    lower.pop();
    upper.pop();
    lower.extend(upper);
    lower.into_iter().map(|(x, y)| Vec2 { x, y }).collect()
}

fn are_collinear(points: &[Vec2]) -> bool {
    if points.len() < 3 {
        return true;
    }
    let (x0, y0) = (points[0].x, points[0].y);
    let (x1, y1) = (points[1].x, points[1].y);
    for p in &points[2..] {
        let cp = (x1 - x0) * (p.y - y0) - (y1 - y0) * (p.x - x0);
        if cp.abs() > DEGENERATE_EPS {
            return false;
        }
    }
    true
}

fn mean(points: &[Vec2]) -> Vec2 {
    let n = points.len() as f64;
    let sum = points.iter().fold(Vec2::default(), |acc, p| acc.add(*p));
    sum.scale(1.0 / n)
}

/// Minimum-area enclosing rectangle of a convex polygon via rotating
/// calipers: for each hull edge, project all vertices onto the edge
/// direction and its perpendicular, keep the rectangle of minimum area
/// (ties broken by lower edge index).
fn min_area_rectangle(hull: &[Vec2]) -> Rectangle {
    let n = hull.len();
    let mut best: Option<(f64, Rectangle)> = None;

    for i0 in 0..n {
        let i1 = (i0 + 1) % n;
        let origin = hull[i0];
        let u0 = hull[i1].sub(origin).normalize();
        let u1 = u0.perp();

        let mut min0 = 0.0_f64;
        let mut max0 = 0.0_f64;
        let mut max1 = 0.0_f64;

        for &p in hull {
            let d = p.sub(origin);
            let dot0 = u0.dot(d);
            min0 = min0.min(dot0);
            max0 = max0.max(dot0);
            let dot1 = u1.dot(d);
            max1 = max1.max(dot1);
        }

        let area = (max0 - min0) * max1;
        let candidate = Rectangle {
            center: origin.add(u0.scale((min0 + max0) / 2.0)).add(u1.scale(max1 / 2.0)),
            axis: [u0, u1],
            extent: [(max0 - min0) / 2.0, max1 / 2.0],
        };

        match &best {
            Some((best_area, _)) if area >= *best_area => {}
            _ => best = Some((area, candidate)),
        }
    }

    best.expect("hull must have at least one edge").1
}

fn degenerate_rectangle(points: &[Vec2]) -> Rectangle {
    let center = mean(points);
    let mut sorted = points.to_vec();
    sorted.sort_by(|a, b| a.x.partial_cmp(&b.x).unwrap_or(std::cmp::Ordering::Equal));
    let end = *sorted.last().unwrap_or(&center);
    let direction = end.sub(center);
    let u0 = direction.normalize();
    let u1 = u0.perp();
    let extent_long = direction.norm();
    Rectangle {
        center,
        axis: [u0, u1],
        extent: [extent_long, extent_long / 2.0],
    }
}

/// Raw (unrounded, unclamped) altitude for covering a square of the given
/// area, given the camera's field of view and 16:9 sensor framing.
fn raw_height_for_area(area: f64, fov_degrees: f64) -> f64 {
    let theta = (fov_degrees / 2.0).to_radians();
    let x = (area / (16.0 * 9.0)).sqrt();
    let y = (16.0 * x) / 4.0;
    let radius = ((2.0 * y).powi(2) + (1.5 * y).powi(2)).sqrt();
    radius / theta.tan()
}

/// Invert `raw_height_for_area` for a target height by bisection — the
/// height is monotonically increasing in the square's area.
fn square_size_for_height(target_height: f64, fov_degrees: f64) -> f64 {
    let area_for = |square_size: f64| (2.0 * square_size).powi(2);
    let mut lo = 1e-3_f64;
    let mut hi = 10_000.0_f64;
    for _ in 0..200 {
        let mid = (lo + hi) / 2.0;
        let h = raw_height_for_area(area_for(mid), fov_degrees);
        if h < target_height {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    (lo + hi) / 2.0
}

pub struct PlannerInput {
    pub trajectories: TrajectorySet,
    pub origin: Coordinate,
    pub drone_count: usize,
    pub overlap: f64,
    pub fov_degrees: f64,
    pub altitude_min_m: f64,
    pub altitude_max_m: f64,
}

pub struct PlannerOutput {
    pub targets: Vec<FlyToTarget>,
}

/// Run the planner end to end (spec §4.A, steps 1–8).
pub fn plan(input: PlannerInput) -> CoreResult<PlannerOutput> {
    if input.drone_count == 0 {
        return Err(CoreError::Config("drone_count must be >= 1".into()));
    }
    if input.drone_count >= 2 && input.overlap > 0.9 {
        return Err(CoreError::Config(
            "drone_count >= 2 with overlap > 0.9 is a proximity error".into(),
        ));
    }
    if input.trajectories.is_empty() {
        return Err(CoreError::Config("trajectory set is empty".into()));
    }

    // Step 1: flatten to local Cartesian meters.
    let mut points: Vec<Vec2> = Vec::new();
    for path in input.trajectories.paths.values() {
        for coord in path {
            let local = crate::geometry::geodetic_to_local(input.origin, *coord);
            points.push(Vec2 { x: local.x, y: local.y });
        }
    }
    if points.is_empty() {
        return Err(CoreError::Config("trajectory set is empty".into()));
    }

    let first = points[0];
    if points.iter().all(|p| (p.x - first.x).abs() < DEGENERATE_EPS && (p.y - first.y).abs() < DEGENERATE_EPS) {
        return Err(CoreError::Config("degenerate coordinates: all points equal".into()));
    }

    // Step 2 + degenerate fallback.
    let rect = if are_collinear(&points) {
        degenerate_rectangle(&points)
    } else {
        // Step 3.
        let hull = convex_hull(&points);
        min_area_rectangle(&hull)
    };

    let longer_extent = rect.extent[0].max(rect.extent[1]);
    let shorter_extent = rect.extent[0].min(rect.extent[1]);
    let split_axis = if rect.extent[0] > rect.extent[1] { rect.axis[0] } else { rect.axis[1] };

    // Step 4: choose square side (half-extent convention, matching the
    // original's `square_size`).
    let n = input.drone_count as f64;
    let mut square_size = longer_extent;
    let mut split_offset;
    if input.drone_count >= 2 {
        split_offset = f64::INFINITY;
        let mut iterations = 0;
        while split_offset * n + split_offset >= longer_extent * 2.0 * 1.1 {
            iterations += 1;
            if iterations >= 99 {
                break;
            }
            square_size *= 0.98;
            split_offset = square_size * (1.0 - input.overlap) * 2.0;
        }
        if square_size <= shorter_extent {
            square_size = shorter_extent * 1.1;
        }
    } else {
        square_size = 1.1 * longer_extent;
    }

    // Step 5: altitude from square size, clamped, with back-solve on clamp.
    let area = (2.0 * square_size).powi(2);
    let raw_height = raw_height_for_area(area, input.fov_degrees);
    let mut altitude = raw_height.round();
    if altitude < input.altitude_min_m {
        altitude = input.altitude_min_m;
        square_size = square_size_for_height(altitude, input.fov_degrees);
        tracing::warn!(
            altitude,
            "planner: altitude clamped to minimum, square size back-solved"
        );
    } else if altitude > input.altitude_max_m {
        altitude = input.altitude_max_m;
        square_size = square_size_for_height(altitude, input.fov_degrees);
        tracing::warn!(
            altitude,
            "planner: altitude exceeds regulatory cap, coverage may be incomplete after back-solve"
        );
    }

    split_offset = square_size * (1.0 - input.overlap) * 2.0;

    // Step 6: centers along the long axis.
    let centers: Vec<Vec2> = (0..input.drone_count)
        .map(|i| {
            let offset = (i as f64 - (n - 1.0) / 2.0) * split_offset;
            rect.center.add(split_axis.scale(offset))
        })
        .collect();

    // Step 7: back to geodetic.
    let targets: Vec<FlyToTarget> = centers
        .iter()
        .map(|c| FlyToTarget {
            coordinate: local_to_geodetic(input.origin, c.x, c.y, altitude),
            yaw_deg: yaw_from_axis(split_axis),
        })
        .collect();

    Ok(PlannerOutput { targets })
}

fn yaw_from_axis(axis: Vec2) -> f64 {
    let mut yaw = axis.y.atan2(axis.x).to_degrees() + 90.0;
    yaw %= 360.0;
    if yaw < 0.0 {
        yaw += 360.0;
    }
    yaw
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_drone_input(overlap: f64) -> PlannerInput {
        let origin = Coordinate::new(57.7, 11.9, 0.0);
        let mut traj = TrajectorySet::new();
        traj.insert(
            "v1",
            vec![
                Coordinate::new(57.7, 11.9, 0.0),
                Coordinate::new(57.701, 11.901, 0.0),
                Coordinate::new(57.7005, 11.9015, 0.0),
            ],
        );
        PlannerInput {
            trajectories: traj,
            origin,
            drone_count: 1,
            overlap,
            fov_degrees: crate::config::FOV_DEGREES,
            altitude_min_m: crate::config::ALTITUDE_MIN_M,
            altitude_max_m: crate::config::ALTITUDE_MAX_M,
        }
    }

    #[test]
    fn single_drone_assignment_within_bounds() {
        let out = plan(single_drone_input(0.5)).expect("plan should succeed");
        assert_eq!(out.targets.len(), 1);
        let t = out.targets[0];
        assert!((t.coordinate.lat - 57.7).abs() < 0.001);
        assert!((t.coordinate.lng - 11.9).abs() < 0.001);
        assert!(t.coordinate.alt >= 30.0 && t.coordinate.alt <= 99.0);
        assert!(t.yaw_deg >= 0.0 && t.yaw_deg < 360.0);
    }

    #[test]
    fn two_drone_symmetry_about_origin() {
        let origin = Coordinate::new(0.0, 0.0, 0.0);
        let mut traj = TrajectorySet::new();
        // Square-symmetric cloud, 40m x 40m extents, centered on origin.
        let half = 20.0;
        let corners = [(-half, -half), (half, -half), (half, half), (-half, half)];
        let path: Vec<Coordinate> = corners
            .iter()
            .map(|&(x, y)| local_to_geodetic(origin, x, y, 0.0))
            .collect();
        traj.insert("cloud", path);

        let input = PlannerInput {
            trajectories: traj,
            origin,
            drone_count: 2,
            overlap: 0.5,
            fov_degrees: crate::config::FOV_DEGREES,
            altitude_min_m: crate::config::ALTITUDE_MIN_M,
            altitude_max_m: crate::config::ALTITUDE_MAX_M,
        };
        let out = plan(input).expect("plan should succeed");
        assert_eq!(out.targets.len(), 2);
        assert!((out.targets[0].coordinate.alt - out.targets[1].coordinate.alt).abs() < 1e-9);

        // Symmetric about origin: midpoint of the two targets' local
        // offsets should be ~(0, 0).
        let l0 = crate::geometry::geodetic_to_local(origin, out.targets[0].coordinate);
        let l1 = crate::geometry::geodetic_to_local(origin, out.targets[1].coordinate);
        assert!((l0.x + l1.x).abs() < 1e-6);
        assert!((l0.y + l1.y).abs() < 1e-6);
    }

    #[test]
    fn rejects_proximity_error() {
        let result = plan(single_drone_input(0.5).with_drone_count(2).with_overlap(0.95));
        assert!(result.is_err());
    }

    #[test]
    fn rejects_empty_trajectory_set() {
        let origin = Coordinate::new(0.0, 0.0, 0.0);
        let input = PlannerInput {
            trajectories: TrajectorySet::new(),
            origin,
            drone_count: 1,
            overlap: 0.5,
            fov_degrees: crate::config::FOV_DEGREES,
            altitude_min_m: crate::config::ALTITUDE_MIN_M,
            altitude_max_m: crate::config::ALTITUDE_MAX_M,
        };
        assert!(plan(input).is_err());
    }

    #[test]
    fn rejects_degenerate_equal_points() {
        let origin = Coordinate::new(0.0, 0.0, 0.0);
        let mut traj = TrajectorySet::new();
        traj.insert("v1", vec![origin, origin, origin]);
        let input = PlannerInput {
            trajectories: traj,
            origin,
            drone_count: 1,
            overlap: 0.5,
            fov_degrees: crate::config::FOV_DEGREES,
            altitude_min_m: crate::config::ALTITUDE_MIN_M,
            altitude_max_m: crate::config::ALTITUDE_MAX_M,
        };
        assert!(plan(input).is_err());
    }

    impl PlannerInput {
        fn with_drone_count(mut self, n: usize) -> Self {
            self.drone_count = n;
            self
        }
        fn with_overlap(mut self, o: f64) -> Self {
            self.overlap = o;
            self
        }
    }
}
