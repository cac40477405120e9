//! Geodesic primitives for stop and shape calculations.
//!
//! Distances are meters on a spherical earth. Shape polylines come from GTFS
//! `shapes.txt` as ordered `(lat, lon)` pairs.

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

fn to_radians(degrees: f64) -> f64 {
    degrees * std::f64::consts::PI / 180.0
}

/// Great-circle distance between two coordinates in meters.
pub fn haversine(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = to_radians(lat1);
    let lon1_rad = to_radians(lon1);
    let lat2_rad = to_radians(lat2);
    let lon2_rad = to_radians(lon2);

    let dlat = lat2_rad - lat1_rad;
    let dlon = lon2_rad - lon1_rad;

    let a = (dlat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Total length of a polyline in meters. Zero for fewer than two points.
pub fn polyline_length(points: &[(f64, f64)]) -> f64 {
    points
        .windows(2)
        .map(|w| haversine(w[0].0, w[0].1, w[1].0, w[1].1))
        .sum()
}

/// Result of projecting a point onto a polyline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    /// Perpendicular distance from the point to the polyline, meters.
    pub offset_m: f64,
    /// Cumulative distance from the polyline start to the projected point.
    pub along_m: f64,
}

/// Project `(lat, lon)` onto the polyline, picking the segment with the
/// smallest perpendicular distance. Returns `None` for polylines with fewer
/// than two points; callers fall back to direct haversine against a
/// reference stop.
///
/// Each segment is treated as planar in a local equirectangular frame, which
/// is accurate to well under a meter at transit-shape segment lengths.
pub fn project_onto_polyline(lat: f64, lon: f64, points: &[(f64, f64)]) -> Option<Projection> {
    if points.len() < 2 {
        return None;
    }

    let mut best: Option<Projection> = None;
    let mut traversed = 0.0_f64;

    for w in points.windows(2) {
        let (alat, alon) = w[0];
        let (blat, blon) = w[1];
        let seg_len = haversine(alat, alon, blat, blon);

        // Local planar frame centered on the segment start
        let cos_lat = to_radians((alat + blat) / 2.0).cos();
        let ax = 0.0;
        let ay = 0.0;
        let bx = to_radians(blon - alon) * cos_lat * EARTH_RADIUS_M;
        let by = to_radians(blat - alat) * EARTH_RADIUS_M;
        let px = to_radians(lon - alon) * cos_lat * EARTH_RADIUS_M;
        let py = to_radians(lat - alat) * EARTH_RADIUS_M;

        let seg_sq = (bx - ax).powi(2) + (by - ay).powi(2);
        let t = if seg_sq > 0.0 {
            (((px - ax) * (bx - ax) + (py - ay) * (by - ay)) / seg_sq).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let cx = ax + t * (bx - ax);
        let cy = ay + t * (by - ay);
        let offset = ((px - cx).powi(2) + (py - cy).powi(2)).sqrt();

        let candidate = Projection {
            offset_m: offset,
            along_m: traversed + t * seg_len,
        };
        if best.map_or(true, |b| candidate.offset_m < b.offset_m) {
            best = Some(candidate);
        }

        traversed += seg_len;
    }

    best
}

/// Cumulative distance of a point along a shape polyline.
pub fn distance_along_polyline(lat: f64, lon: f64, points: &[(f64, f64)]) -> Option<f64> {
    project_onto_polyline(lat, lon, points).map(|p| p.along_m)
}
