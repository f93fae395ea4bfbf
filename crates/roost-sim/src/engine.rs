use std::collections::BTreeMap;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::warn;

use roost_fleet::formation::{self, SwarmTrackingConfig};
use roost_fleet::geo;
use roost_fleet::profile::PerfProfile;
use roost_fleet::FleetConfig;
use roost_proto::mission::{MissionWaypoint, WaypointKind};
use roost_proto::telemetry::VehicleTelemetry;
use roost_proto::{VehicleId, VehicleKind};

use crate::{SPAWN_ALT, SPAWN_LAT, SPAWN_LON, TICK_DT};

/// Autonomous transitions produced while stepping. Command-driven changes
/// are the caller's to announce; these are the ones the model decided on
/// its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    ModeChanged { vehicle: VehicleId, mode: String },
    WaypointReached { vehicle: VehicleId, index: usize },
    /// A carrier crossed a release waypoint for one of its sub-vehicles.
    LaunchTriggered { carrier: VehicleId, vehicle: VehicleId },
}

#[derive(Debug, Default)]
pub struct TickOutput {
    pub updates: Vec<(VehicleId, VehicleTelemetry)>,
    pub events: Vec<SimEvent>,
}

struct SimVehicleState {
    telemetry: VehicleTelemetry,
    kind: VehicleKind,
    profile: PerfProfile,
    home: (f64, f64),
    loiter_center: (f64, f64),
    loiter_angle: f64, // radians, clockwise from north
    target_alt: f64,
    goto_target: Option<(f64, f64, f64)>,
    mission: Vec<MissionWaypoint>,
    mission_index: usize,
    carrier: Option<VehicleId>,
    follower_index: Option<usize>,
    attached: bool,
    released: bool,
}

/// Fixed-step flight model for a whole fleet.
///
/// One seeded generator drives every jitter draw and vehicles step in
/// sorted-id order, so trajectories replay exactly for a given seed and
/// command sequence.
pub struct SimEngine {
    vehicles: BTreeMap<VehicleId, SimVehicleState>,
    rng: StdRng,
    swarm: Option<SwarmTrackingConfig>,
}

impl SimEngine {
    pub fn from_fleet(fleet: &FleetConfig, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut vehicles = BTreeMap::new();

        for spec in &fleet.vehicles {
            let profile = fleet
                .performance(&spec.id)
                .unwrap_or_else(|| PerfProfile::defaults(spec.kind));
            let fixed_wing = spec.kind.is_fixed_wing();

            let telemetry = VehicleTelemetry {
                lat: SPAWN_LAT,
                lon: SPAWN_LON,
                alt: SPAWN_ALT,
                heading: rng.gen_range(0.0..360.0),
                groundspeed: if fixed_wing { profile.loiter_speed } else { 0.0 },
                airspeed: if fixed_wing { profile.cruise_speed } else { 0.0 },
                battery_pct: rng.gen_range(70..=95_i32) as f32,
                battery_voltage: rng.gen_range(14.5..16.8_f32),
                mode: "LOITER".to_string(),
                armed: true,
                gps_fix: 3,
                gps_sats: rng.gen_range(12..=18_u8),
                mission_seq: None,
                last_heartbeat: Some(Instant::now()),
            };

            vehicles.insert(
                spec.id.clone(),
                SimVehicleState {
                    telemetry,
                    kind: spec.kind,
                    profile,
                    home: (SPAWN_LAT, SPAWN_LON),
                    loiter_center: (SPAWN_LAT, SPAWN_LON),
                    loiter_angle: 0.0,
                    target_alt: SPAWN_ALT,
                    goto_target: None,
                    mission: Vec::new(),
                    mission_index: 0,
                    carrier: spec.carrier.clone(),
                    follower_index: fleet.follower_index(&spec.id),
                    attached: spec.carrier.is_some(),
                    released: false,
                },
            );
        }

        Self { vehicles, rng, swarm: None }
    }

    pub fn vehicle_ids(&self) -> Vec<VehicleId> {
        self.vehicles.keys().cloned().collect()
    }

    pub fn telemetry(&self, id: &str) -> Option<&VehicleTelemetry> {
        self.vehicles.get(id).map(|st| &st.telemetry)
    }

    pub fn is_attached(&self, id: &str) -> bool {
        self.vehicles.get(id).map(|st| st.attached).unwrap_or(false)
    }

    // ----- Command-side target fields -----

    pub fn set_mode(&mut self, id: &str, mode: &str) -> bool {
        match self.vehicles.get_mut(id) {
            Some(st) => {
                st.telemetry.mode = mode.to_string();
                true
            }
            None => false,
        }
    }

    pub fn arm(&mut self, id: &str, armed: bool) -> bool {
        match self.vehicles.get_mut(id) {
            Some(st) => {
                st.telemetry.armed = armed;
                true
            }
            None => false,
        }
    }

    /// Guided-mode position target. Also pins the persistent altitude
    /// target so later mode changes keep the commanded altitude.
    pub fn set_goto(&mut self, id: &str, lat: f64, lon: f64, alt: f64) -> bool {
        match self.vehicles.get_mut(id) {
            Some(st) => {
                st.goto_target = Some((lat, lon, alt));
                st.target_alt = alt;
                true
            }
            None => false,
        }
    }

    /// Altitude-only retarget; never touches mode or position targets.
    pub fn set_target_alt(&mut self, id: &str, alt: f64) -> bool {
        match self.vehicles.get_mut(id) {
            Some(st) => {
                st.target_alt = alt;
                true
            }
            None => false,
        }
    }

    /// Store a mission as the vehicle's autopilot would hold it after an
    /// upload: coordinates snapped to the wire grid, index rewound.
    pub fn set_mission(&mut self, id: &str, waypoints: Vec<MissionWaypoint>) -> bool {
        match self.vehicles.get_mut(id) {
            Some(st) => {
                st.mission = waypoints.iter().map(MissionWaypoint::quantized).collect();
                st.mission_index = 0;
                true
            }
            None => false,
        }
    }

    pub fn mission(&self, id: &str) -> Option<&[MissionWaypoint]> {
        self.vehicles.get(id).map(|st| st.mission.as_slice())
    }

    /// Place a vehicle, e.g. at its carrier's position on release. Home
    /// and the loiter center move with it.
    pub fn set_position(&mut self, id: &str, lat: f64, lon: f64, alt: f64, heading: Option<f64>) -> bool {
        match self.vehicles.get_mut(id) {
            Some(st) => {
                st.telemetry.lat = lat;
                st.telemetry.lon = lon;
                st.telemetry.alt = alt;
                if let Some(h) = heading {
                    st.telemetry.heading = h;
                }
                st.home = (lat, lon);
                st.loiter_center = (lat, lon);
                true
            }
            None => false,
        }
    }

    pub fn activate_swarm(&mut self, cfg: SwarmTrackingConfig) {
        self.swarm = Some(cfg);
    }

    pub fn deactivate_swarm(&mut self) {
        self.swarm = None;
    }

    /// Free a sub-vehicle from its carrier so it flies (and tracks) on
    /// its own.
    pub fn mark_released(&mut self, id: &str) -> bool {
        match self.vehicles.get_mut(id) {
            Some(st) => {
                st.released = true;
                st.attached = false;
                true
            }
            None => false,
        }
    }

    // ----- Stepping -----

    pub fn tick(&mut self) -> TickOutput {
        let mut out = TickOutput::default();
        let ids: Vec<VehicleId> = self.vehicles.keys().cloned().collect();

        for id in ids {
            // carrier snapshot before the follower borrows mutably
            let carrier_telem = self
                .vehicles
                .get(&id)
                .and_then(|st| st.carrier.clone())
                .and_then(|c| self.vehicles.get(&c))
                .map(|c| c.telemetry.clone());

            let Some(st) = self.vehicles.get_mut(&id) else { continue };
            step_vehicle(
                &id,
                st,
                carrier_telem.as_ref(),
                self.swarm.as_ref(),
                &mut self.rng,
                &mut out.events,
            );
            out.updates.push((id.clone(), st.telemetry.clone()));
        }
        out
    }
}

fn step_vehicle(
    id: &str,
    st: &mut SimVehicleState,
    carrier: Option<&VehicleTelemetry>,
    swarm: Option<&SwarmTrackingConfig>,
    rng: &mut StdRng,
    events: &mut Vec<SimEvent>,
) {
    st.telemetry.last_heartbeat = Some(Instant::now());
    let fixed_wing = st.kind.is_fixed_wing();

    // Attached sub-vehicles ride their carrier: no independent motion,
    // battery drains at half rate.
    if st.attached {
        if let Some(c) = carrier {
            st.telemetry.lat = c.lat;
            st.telemetry.lon = c.lon;
            st.telemetry.alt = c.alt;
            st.telemetry.heading = c.heading;
            st.telemetry.groundspeed = c.groundspeed;
            st.telemetry.airspeed = c.airspeed;
        }
        if st.telemetry.battery_pct > 10.0 {
            st.telemetry.battery_pct -= rng.gen_range(0.0..0.005_f32);
        }
        return;
    }

    if st.telemetry.battery_pct > 10.0 {
        st.telemetry.battery_pct -= rng.gen_range(0.0..0.01_f32);
    }

    // Released followers in AUTO chase a formation slot computed from the
    // carrier's current telemetry instead of their own mission.
    if let (Some(cfg), Some(c), Some(index)) = (swarm, carrier, st.follower_index) {
        if st.released && st.telemetry.mode == "AUTO" {
            let (target_lat, target_lon, target_alt) =
                formation::formation_position(c.lat, c.lon, c.heading, c.alt, index, cfg);
            let speed = st.profile.swarm_track_speed;
            steer(st, target_lat, target_lon, speed, false);
            st.telemetry.alt = target_alt + rng.gen_range(-1.0..1.0);
            return;
        }
    }

    let mode = st.telemetry.mode.clone();
    match mode.as_str() {
        "LOITER" => {
            if fixed_wing {
                plane_orbit(st, rng);
            } else {
                st.telemetry.lat += rng.gen_range(-0.000002..0.000002);
                st.telemetry.lon += rng.gen_range(-0.000002..0.000002);
                st.telemetry.groundspeed = rng.gen_range(0.0..2.0);
                st.telemetry.heading =
                    (st.telemetry.heading + rng.gen_range(-1.0..1.0)).rem_euclid(360.0);
            }
            st.telemetry.alt = adjust_altitude(st.telemetry.alt, st.target_alt, &st.profile);
        }

        "RTL" => {
            let home = st.home;
            let speed = st.profile.cruise_speed;
            steer(st, home.0, home.1, speed, fixed_wing);

            let dist = geo::flat_distance_m(st.telemetry.lat, st.telemetry.lon, home.0, home.1);
            let rtl_alt = if fixed_wing { 30.0 } else { 15.0 };
            if dist < 200.0 {
                st.telemetry.alt = adjust_altitude(st.telemetry.alt, rtl_alt, &st.profile);
            } else {
                st.telemetry.alt = adjust_altitude(st.telemetry.alt, st.target_alt, &st.profile);
            }

            let arrival = if fixed_wing { 50.0 } else { 10.0 };
            if dist < arrival {
                st.telemetry.mode = "LOITER".to_string();
                st.loiter_center = home;
                st.target_alt = rtl_alt;
                events.push(SimEvent::ModeChanged {
                    vehicle: id.to_string(),
                    mode: "LOITER".to_string(),
                });
            }
        }

        "GUIDED" => {
            if let Some((target_lat, target_lon, target_alt)) = st.goto_target {
                let speed = st.profile.cruise_speed;
                steer(st, target_lat, target_lon, speed, fixed_wing);
                st.telemetry.alt = adjust_altitude(st.telemetry.alt, target_alt, &st.profile);

                let dist =
                    geo::flat_distance_m(st.telemetry.lat, st.telemetry.lon, target_lat, target_lon);
                let alt_diff = (st.telemetry.alt - target_alt).abs();
                let arrival = if fixed_wing { 50.0 } else { 30.0 };
                if dist < arrival && alt_diff < 5.0 {
                    st.telemetry.mode = "LOITER".to_string();
                    st.loiter_center = (target_lat, target_lon);
                    st.target_alt = target_alt;
                    st.goto_target = None;
                    events.push(SimEvent::ModeChanged {
                        vehicle: id.to_string(),
                        mode: "LOITER".to_string(),
                    });
                }
            } else {
                st.telemetry.alt = adjust_altitude(st.telemetry.alt, st.target_alt, &st.profile);
            }
        }

        "AUTO" => {
            if st.mission_index < st.mission.len() {
                let wp = st.mission[st.mission_index].clone();
                if wp.kind == WaypointKind::Rtl {
                    st.telemetry.mode = "RTL".to_string();
                    events.push(SimEvent::ModeChanged {
                        vehicle: id.to_string(),
                        mode: "RTL".to_string(),
                    });
                } else {
                    let speed = wp
                        .speed
                        .filter(|s| *s > 0.0)
                        .unwrap_or(st.profile.cruise_speed);
                    steer(st, wp.lat, wp.lon, speed, fixed_wing);
                    st.telemetry.alt = adjust_altitude(st.telemetry.alt, wp.alt, &st.profile);

                    let dist =
                        geo::flat_distance_m(st.telemetry.lat, st.telemetry.lon, wp.lat, wp.lon);
                    let alt_diff = (st.telemetry.alt - wp.alt).abs();
                    let arrival = if fixed_wing { 40.0 } else { 15.0 };
                    if dist < arrival && alt_diff < 10.0 {
                        st.target_alt = wp.alt;
                        events.push(SimEvent::WaypointReached {
                            vehicle: id.to_string(),
                            index: st.mission_index,
                        });
                        if wp.kind == WaypointKind::Launch {
                            match &wp.launch_vehicle {
                                Some(target) => events.push(SimEvent::LaunchTriggered {
                                    carrier: id.to_string(),
                                    vehicle: target.clone(),
                                }),
                                None => {
                                    warn!("sim: {} launch waypoint names no vehicle, skipping release", id)
                                }
                            }
                        }
                        st.mission_index += 1;
                    }
                }
            } else {
                // mission exhausted, hold at the last position
                if fixed_wing {
                    plane_orbit(st, rng);
                } else {
                    st.telemetry.groundspeed = rng.gen_range(0.0..2.0);
                }
                st.telemetry.alt = adjust_altitude(st.telemetry.alt, st.target_alt, &st.profile);
            }
        }

        // MANUAL, FBWA and friends: gentle wandering
        _ => {
            if fixed_wing {
                st.telemetry.groundspeed = st.profile.cruise_speed + rng.gen_range(-2.0..2.0);
                let max_turn = st.profile.turn_rate * TICK_DT;
                let jitter = rng.gen_range(-3.0f64..3.0).clamp(-max_turn, max_turn);
                st.telemetry.heading = (st.telemetry.heading + jitter).rem_euclid(360.0);
                let (lat, lon) = geo::move_along(
                    st.telemetry.lat,
                    st.telemetry.lon,
                    st.telemetry.heading,
                    st.telemetry.groundspeed * TICK_DT,
                );
                st.telemetry.lat = lat;
                st.telemetry.lon = lon;
            } else {
                st.telemetry.lat += rng.gen_range(-0.000005..0.000005);
                st.telemetry.lon += rng.gen_range(-0.000005..0.000005);
                st.telemetry.heading =
                    (st.telemetry.heading + rng.gen_range(-2.0..2.0)).rem_euclid(360.0);
            }
        }
    }

    // Trailing altitude pull plus a little noise. Guided already tracked
    // its own target this tick.
    if st.telemetry.mode != "GUIDED" {
        st.telemetry.alt = adjust_altitude(st.telemetry.alt, st.target_alt, &st.profile);
    }
    st.telemetry.alt += rng.gen_range(-0.5..0.5);

    if fixed_wing {
        st.telemetry.airspeed = st.telemetry.groundspeed + rng.gen_range(-2.0..2.0);
    }
}

/// Advance toward a target at the clamped speed, never overshooting.
/// Fixed-wing heading slews inside the profile turn-rate limit; rotary
/// snaps straight onto the bearing.
fn steer(st: &mut SimVehicleState, target_lat: f64, target_lon: f64, requested: f64, fixed_wing: bool) {
    let speed = st.profile.clamp_speed(requested);
    let max_turn = st.profile.turn_rate * TICK_DT;

    let t = &mut st.telemetry;
    let desired = geo::flat_bearing_deg(t.lat, t.lon, target_lat, target_lon);
    let dist = geo::flat_distance_m(t.lat, t.lon, target_lat, target_lon);

    let heading = if fixed_wing { slew(t.heading, desired, max_turn) } else { desired };
    let move_dist = (speed * TICK_DT).min(dist);
    let (lat, lon) = geo::move_along(t.lat, t.lon, heading, move_dist);

    t.lat = lat;
    t.lon = lon;
    t.heading = heading;
    t.groundspeed = speed;
}

fn slew(current: f64, desired: f64, max_step: f64) -> f64 {
    let mut diff = (desired - current + 180.0).rem_euclid(360.0) - 180.0;
    if diff.abs() > max_step {
        diff = if diff > 0.0 { max_step } else { -max_step };
    }
    (current + diff).rem_euclid(360.0)
}

/// Clockwise orbit of the loiter center at profile radius and loiter
/// speed. Heading chases the orbit tangent within the turn-rate limit.
fn plane_orbit(st: &mut SimVehicleState, rng: &mut StdRng) {
    let radius = if st.profile.loiter_radius > 0.0 { st.profile.loiter_radius } else { 80.0 };
    let speed = st.profile.loiter_speed;

    st.loiter_angle += speed * TICK_DT / radius;
    let (center_lat, center_lon) = st.loiter_center;

    st.telemetry.lat = center_lat + (radius * st.loiter_angle.cos()) / geo::M_PER_DEG_LAT;
    st.telemetry.lon = center_lon + (radius * st.loiter_angle.sin()) / geo::m_per_deg_lon(center_lat);

    let tangent = (st.loiter_angle.to_degrees() + 90.0).rem_euclid(360.0);
    st.telemetry.heading = slew(st.telemetry.heading, tangent, st.profile.turn_rate * TICK_DT);
    st.telemetry.groundspeed = speed + rng.gen_range(-1.0..1.0);
}

/// Rate-limited climb/descent with a half-meter snap window.
fn adjust_altitude(current: f64, target: f64, profile: &PerfProfile) -> f64 {
    let diff = target - current;
    if diff.abs() < 0.5 {
        return target;
    }
    if diff > 0.0 {
        current + (profile.climb_rate * TICK_DT).min(diff)
    } else {
        current - (profile.descent_rate * TICK_DT).min(-diff)
    }
}
