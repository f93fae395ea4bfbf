//! Flat-earth coordinate helpers.
//!
//! All planning and simulation geometry runs on the small-area
//! approximation: one degree of latitude is a fixed meter count and
//! longitude shrinks with cos(lat). Good to well under a percent at
//! mission scale, and every caller uses the same constants so offsets
//! and distances stay consistent.

pub const M_PER_DEG_LAT: f64 = 111_000.0;

pub fn m_per_deg_lon(lat_deg: f64) -> f64 {
    M_PER_DEG_LAT * lat_deg.to_radians().cos()
}

/// Ground distance in meters, longitude scaled at the first point.
pub fn flat_distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1) * M_PER_DEG_LAT;
    let d_lon = (lon2 - lon1) * m_per_deg_lon(lat1);
    d_lat.hypot(d_lon)
}

/// Course from point 1 to point 2 on raw degree deltas, 0..360 with
/// 0 = north. This is the heading the simulator steers toward.
pub fn flat_bearing_deg(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = lat2 - lat1;
    let d_lon = lon2 - lon1;
    d_lon.atan2(d_lat).to_degrees().rem_euclid(360.0)
}

/// Initial great-circle bearing, 0..360. Used to orient mission legs
/// when generating offset follower routes.
pub fn bearing_deg(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lon = (lon2 - lon1).to_radians();
    let lat1 = lat1.to_radians();
    let lat2 = lat2.to_radians();
    let x = d_lon.sin() * lat2.cos();
    let y = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * d_lon.cos();
    x.atan2(y).to_degrees().rem_euclid(360.0)
}

/// Step `distance_m` along `heading_deg` from a point.
pub fn move_along(lat: f64, lon: f64, heading_deg: f64, distance_m: f64) -> (f64, f64) {
    let h = heading_deg.to_radians();
    let d_lat = distance_m * h.cos() / M_PER_DEG_LAT;
    let d_lon = distance_m * h.sin() / m_per_deg_lon(lat);
    (lat + d_lat, lon + d_lon)
}

/// Shift a point right of and behind a travel heading. Negative values
/// go left / ahead.
pub fn offset_coordinate(
    lat: f64,
    lon: f64,
    heading_deg: f64,
    right_m: f64,
    back_m: f64,
) -> (f64, f64) {
    let right = (heading_deg + 90.0).to_radians();
    let back = (heading_deg + 180.0).to_radians();

    let d_lat = (right_m * right.cos() + back_m * back.cos()) / M_PER_DEG_LAT;
    let d_lon = (right_m * right.sin() + back_m * back.sin()) / m_per_deg_lon(lat);
    (lat + d_lat, lon + d_lon)
}
