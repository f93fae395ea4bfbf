//! External waypoint model consumed from the mission editor.
//!
//! The link layer's obligation is a stable transform between this list and
//! the wire item sequence; the transform itself lives next to the MAVLink
//! types in roost-link, the coordinate grid lives here.

use serde::{Deserialize, Serialize};

use crate::VehicleId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaypointKind {
    Takeoff,
    Waypoint,
    Loiter,
    LoiterTime,
    /// Release point for a carried sub-vehicle.
    Launch,
    Rtl,
    Land,
    Target,
}

impl WaypointKind {
    /// RTL rides the wire with zeroed coordinates; everything else carries
    /// a real position.
    pub fn is_positional(self) -> bool {
        !matches!(self, WaypointKind::Rtl)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionWaypoint {
    pub kind: WaypointKind,
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    /// Leg speed override in m/s; cruise speed applies when unset.
    #[serde(default)]
    pub speed: Option<f64>,
    /// Loiter duration for LoiterTime entries.
    #[serde(default)]
    pub loiter_secs: Option<f32>,
    /// Which carried vehicle a Launch entry releases.
    #[serde(default)]
    pub launch_vehicle: Option<VehicleId>,
}

impl MissionWaypoint {
    pub fn new(kind: WaypointKind, lat: f64, lon: f64, alt: f64) -> Self {
        Self { kind, lat, lon, alt, speed: None, loiter_secs: None, launch_vehicle: None }
    }

    /// Snap coordinates to the wire grid, the list an autopilot would
    /// hold after accepting an upload of this waypoint.
    pub fn quantized(&self) -> Self {
        let mut wp = self.clone();
        wp.lat = wire_to_deg(deg_to_wire(wp.lat));
        wp.lon = wire_to_deg(deg_to_wire(wp.lon));
        wp
    }
}

// Scaled-integer position fields use a 1e-7 degree grid. Conversion
// truncates toward zero, matching how every GCS we interoperate with
// builds these fields.
pub fn deg_to_wire(deg: f64) -> i32 {
    (deg * 1e7) as i32
}

pub fn wire_to_deg(v: i32) -> f64 {
    v as f64 / 1e7
}
