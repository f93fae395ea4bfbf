//! Formation geometry for carrier-following sub-vehicles.
//!
//! Offsets are expressed right-of and behind the leader's travel heading,
//! then mapped to coordinates with the flat-earth transform in [`geo`].
//! Dynamic coordination recomputes the target from live leader telemetry
//! every update; waypoint coordination bakes the same offsets into a
//! one-shot copy of the leader mission.

use serde::Deserialize;

use roost_proto::mission::{MissionWaypoint, WaypointKind};

use crate::geo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormationKind {
    LineAbreast,
    Trail,
    EchelonRight,
    EchelonLeft,
    Vee,
    Spread,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationMode {
    /// Follower targets are recomputed from leader telemetry every update.
    #[default]
    Dynamic,
    /// Followers fly a pre-generated offset copy of the leader mission.
    Waypoint,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwarmTrackingConfig {
    pub formation: FormationKind,
    #[serde(default = "default_spacing")]
    pub spacing_m: f64,
    /// Negative keeps followers below the leader.
    #[serde(default = "default_alt_offset")]
    pub alt_offset_m: f64,
    #[serde(default)]
    pub coordination: CoordinationMode,
}

fn default_spacing() -> f64 {
    50.0
}

fn default_alt_offset() -> f64 {
    -10.0
}

impl SwarmTrackingConfig {
    pub fn new(formation: FormationKind) -> Self {
        Self {
            formation,
            spacing_m: default_spacing(),
            alt_offset_m: default_alt_offset(),
            coordination: CoordinationMode::default(),
        }
    }
}

/// (right_m, back_m) for follower `index` (0-based, slot order).
///
/// Line abreast alternates sides in growing pairs so any follower count
/// stays clear of the leader track; the other shapes keep the classic
/// two-ship geometry.
pub fn formation_offsets(kind: FormationKind, index: usize, spacing_m: f64) -> (f64, f64) {
    let stagger = spacing_m * (index + 1) as f64;
    let side = if index % 2 == 0 { -1.0 } else { 1.0 };
    match kind {
        FormationKind::LineAbreast => {
            let pair = (index / 2 + 1) as f64;
            (side * spacing_m * pair, 0.0)
        }
        FormationKind::Trail => (0.0, stagger),
        FormationKind::EchelonRight => (stagger, stagger * 0.5),
        FormationKind::EchelonLeft => (-stagger, stagger * 0.5),
        FormationKind::Vee => (side * spacing_m, spacing_m * 0.7),
        FormationKind::Spread => (side * spacing_m * 2.0, spacing_m * 0.5),
    }
}

/// Where follower `index` should sit right now, given the leader's
/// current position, heading and altitude.
pub fn formation_position(
    leader_lat: f64,
    leader_lon: f64,
    leader_heading: f64,
    leader_alt: f64,
    index: usize,
    cfg: &SwarmTrackingConfig,
) -> (f64, f64, f64) {
    let (right, back) = formation_offsets(cfg.formation, index, cfg.spacing_m);
    let (lat, lon) = geo::offset_coordinate(leader_lat, leader_lon, leader_heading, right, back);
    (lat, lon, leader_alt + cfg.alt_offset_m)
}

/// Build follower `index`'s mission as an offset copy of the leader's.
///
/// Launch entries never transfer: the follower is the thing being
/// launched. In trail formation the follower's route starts at its own
/// release point; laterally offset formations fly the whole path. RTL
/// entries pass through untouched and every other waypoint is shifted
/// along the bearing of its outgoing leg.
pub fn offset_mission(
    leader: &[MissionWaypoint],
    follower_id: &str,
    index: usize,
    cfg: &SwarmTrackingConfig,
) -> Vec<MissionWaypoint> {
    let (right, back) = formation_offsets(cfg.formation, index, cfg.spacing_m);

    let start = if cfg.formation == FormationKind::Trail {
        leader
            .iter()
            .position(|wp| {
                wp.kind == WaypointKind::Launch && wp.launch_vehicle.as_deref() == Some(follower_id)
            })
            .unwrap_or(0)
    } else {
        0
    };

    let mut out = Vec::new();
    for (i, wp) in leader.iter().enumerate().skip(start) {
        match wp.kind {
            WaypointKind::Launch => {
                // own release point becomes the route start, others vanish
                if wp.launch_vehicle.as_deref() == Some(follower_id) {
                    out.push(MissionWaypoint::new(
                        WaypointKind::Waypoint,
                        wp.lat,
                        wp.lon,
                        wp.alt + cfg.alt_offset_m,
                    ));
                }
            }
            WaypointKind::Rtl => out.push(wp.clone()),
            _ => {
                let heading = leg_heading(leader, i);
                let (lat, lon) = geo::offset_coordinate(wp.lat, wp.lon, heading, right, back);
                let mut shifted = wp.clone();
                shifted.lat = lat;
                shifted.lon = lon;
                shifted.alt += cfg.alt_offset_m;
                out.push(shifted);
            }
        }
    }
    out
}

// Bearing of the leg leaving waypoint `i`, scanning forward to the next
// entry that carries a usable position. North when none remains.
fn leg_heading(waypoints: &[MissionWaypoint], i: usize) -> f64 {
    let here = &waypoints[i];
    waypoints[i + 1..]
        .iter()
        .find(|wp| wp.kind.is_positional() && wp.kind != WaypointKind::Launch)
        .map(|next| geo::bearing_deg(here.lat, here.lon, next.lat, next.lon))
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(formation: FormationKind) -> SwarmTrackingConfig {
        SwarmTrackingConfig::new(formation)
    }

    fn wp(kind: WaypointKind, lat: f64, lon: f64, alt: f64) -> MissionWaypoint {
        MissionWaypoint::new(kind, lat, lon, alt)
    }

    #[test]
    fn offsets_match_the_geometry_table() {
        let s = 50.0;
        assert_eq!(formation_offsets(FormationKind::LineAbreast, 0, s), (-50.0, 0.0));
        assert_eq!(formation_offsets(FormationKind::LineAbreast, 1, s), (50.0, 0.0));
        assert_eq!(formation_offsets(FormationKind::LineAbreast, 2, s), (-100.0, 0.0));
        assert_eq!(formation_offsets(FormationKind::Trail, 0, s), (0.0, 50.0));
        assert_eq!(formation_offsets(FormationKind::Trail, 1, s), (0.0, 100.0));
        assert_eq!(formation_offsets(FormationKind::EchelonRight, 0, s), (50.0, 25.0));
        assert_eq!(formation_offsets(FormationKind::EchelonLeft, 1, s), (-100.0, 50.0));
        assert_eq!(formation_offsets(FormationKind::Vee, 0, s), (-50.0, 35.0));
        assert_eq!(formation_offsets(FormationKind::Vee, 1, s), (50.0, 35.0));
        assert_eq!(formation_offsets(FormationKind::Spread, 0, s), (-100.0, 25.0));
        assert_eq!(formation_offsets(FormationKind::Spread, 1, s), (100.0, 25.0));
    }

    #[test]
    fn dynamic_trail_position_sits_behind_the_leader() {
        let c = cfg(FormationKind::Trail);
        // leader flying due north
        let (lat, lon, alt) = formation_position(52.0, -1.5, 0.0, 120.0, 0, &c);
        assert!(lat < 52.0);
        assert!((lon - -1.5).abs() < 1e-9);
        assert!((alt - 110.0).abs() < f64::EPSILON);
        let back = geo::flat_distance_m(52.0, -1.5, lat, lon);
        assert!((back - 50.0).abs() < 0.01);
    }

    #[test]
    fn waypoint_mode_preserves_count_and_kinds_without_launches() {
        let leader = vec![
            wp(WaypointKind::Takeoff, 52.0, -1.5, 50.0),
            wp(WaypointKind::Waypoint, 52.01, -1.5, 100.0),
            wp(WaypointKind::Loiter, 52.02, -1.5, 100.0),
            wp(WaypointKind::Rtl, 0.0, 0.0, 0.0),
        ];
        let c = cfg(FormationKind::LineAbreast);
        let follower = offset_mission(&leader, "dart1.1", 0, &c);
        assert_eq!(follower.len(), leader.len());
        let kinds: Vec<WaypointKind> = follower.iter().map(|w| w.kind).collect();
        let expect: Vec<WaypointKind> = leader.iter().map(|w| w.kind).collect();
        assert_eq!(kinds, expect);
        // RTL stays zeroed
        assert_eq!(follower[3], leader[3]);
    }

    #[test]
    fn line_abreast_shifts_west_of_a_northbound_leg() {
        let leader = vec![
            wp(WaypointKind::Waypoint, 52.0, -1.5, 100.0),
            wp(WaypointKind::Waypoint, 52.02, -1.5, 100.0),
        ];
        let c = cfg(FormationKind::LineAbreast);
        let follower = offset_mission(&leader, "dart1.1", 0, &c);
        // index 0 flies left of track, which is west when heading north
        assert!(follower[0].lon < leader[0].lon);
        assert!((follower[0].lat - leader[0].lat).abs() < 1e-9);
        let d = geo::flat_distance_m(leader[0].lat, leader[0].lon, follower[0].lat, follower[0].lon);
        assert!((d - 50.0).abs() < 0.05);
        assert!((follower[0].alt - 90.0).abs() < f64::EPSILON);
    }

    #[test]
    fn trail_route_starts_at_own_release_point() {
        let mut launch = wp(WaypointKind::Launch, 52.01, -1.5, 100.0);
        launch.launch_vehicle = Some("dart1.1".into());
        let mut other_launch = wp(WaypointKind::Launch, 52.02, -1.5, 100.0);
        other_launch.launch_vehicle = Some("dart1.2".into());
        let leader = vec![
            wp(WaypointKind::Takeoff, 52.0, -1.5, 50.0),
            launch,
            other_launch,
            wp(WaypointKind::Waypoint, 52.03, -1.5, 100.0),
            wp(WaypointKind::Rtl, 0.0, 0.0, 0.0),
        ];
        let c = cfg(FormationKind::Trail);
        let follower = offset_mission(&leader, "dart1.1", 0, &c);

        // start marker at the release point, other launches dropped
        assert_eq!(follower[0].kind, WaypointKind::Waypoint);
        assert!((follower[0].lat - 52.01).abs() < 1e-9);
        assert!((follower[0].alt - 90.0).abs() < f64::EPSILON);
        assert_eq!(follower.len(), 3);
        assert_eq!(follower[2].kind, WaypointKind::Rtl);
        // the en-route waypoint trails the leader's
        assert!(follower[1].lat < 52.03);
    }

    #[test]
    fn launches_never_reach_lateral_followers() {
        let mut launch = wp(WaypointKind::Launch, 52.01, -1.5, 100.0);
        launch.launch_vehicle = Some("dart1.2".into());
        let leader = vec![
            wp(WaypointKind::Waypoint, 52.0, -1.5, 100.0),
            launch,
            wp(WaypointKind::Waypoint, 52.02, -1.5, 100.0),
        ];
        let c = cfg(FormationKind::Vee);
        let follower = offset_mission(&leader, "dart1.1", 0, &c);
        assert_eq!(follower.len(), 2);
        assert!(follower.iter().all(|w| w.kind != WaypointKind::Launch));
    }
}
