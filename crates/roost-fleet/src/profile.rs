use serde::Deserialize;

use roost_proto::VehicleKind;

/// Resolved flight performance figures for one vehicle.
///
/// Built by merging the kind defaults with any configured overrides; the
/// planner and the simulation engine read the same numbers.
#[derive(Debug, Clone)]
pub struct PerfProfile {
    pub cruise_speed: f64,       // m/s
    pub max_speed: f64,          // m/s
    pub min_speed: f64,          // m/s, stall floor for fixed-wing
    pub loiter_speed: f64,       // m/s, orbit speed (0 = hover)
    pub swarm_track_speed: f64,  // m/s while tracking a carrier
    pub climb_rate: f64,         // m/s
    pub descent_rate: f64,       // m/s
    pub turn_rate: f64,          // deg/s
    pub loiter_radius: f64,      // m (0 = hover in place)
    pub battery_capacity_mah: f64,
    pub avg_current_draw_a: f64, // amps at cruise
    pub endurance_min: f64,      // minutes at cruise
}

impl PerfProfile {
    pub fn defaults(kind: VehicleKind) -> Self {
        match kind {
            VehicleKind::FixedWing => Self {
                cruise_speed: 18.0,
                max_speed: 25.0,
                min_speed: 12.0,
                loiter_speed: 18.0,
                swarm_track_speed: 18.0,
                climb_rate: 3.0,
                descent_rate: 5.0,
                turn_rate: 15.0,
                loiter_radius: 80.0,
                battery_capacity_mah: 10_000.0,
                avg_current_draw_a: 15.0,
                endurance_min: 40.0,
            },
            VehicleKind::RotaryWing => Self {
                cruise_speed: 22.0,
                max_speed: 35.0,
                min_speed: 0.0,
                loiter_speed: 0.0,
                swarm_track_speed: 25.0,
                climb_rate: 8.0,
                descent_rate: 5.0,
                turn_rate: 180.0,
                loiter_radius: 0.0,
                battery_capacity_mah: 5_000.0,
                avg_current_draw_a: 20.0,
                endurance_min: 15.0,
            },
        }
    }

    pub fn with_overrides(mut self, ovr: &PerfOverrides) -> Self {
        if let Some(v) = ovr.cruise_speed {
            self.cruise_speed = v;
        }
        if let Some(v) = ovr.max_speed {
            self.max_speed = v;
        }
        if let Some(v) = ovr.min_speed {
            self.min_speed = v;
        }
        if let Some(v) = ovr.loiter_speed {
            self.loiter_speed = v;
        }
        if let Some(v) = ovr.swarm_track_speed {
            self.swarm_track_speed = v;
        }
        if let Some(v) = ovr.climb_rate {
            self.climb_rate = v;
        }
        if let Some(v) = ovr.descent_rate {
            self.descent_rate = v;
        }
        if let Some(v) = ovr.turn_rate {
            self.turn_rate = v;
        }
        if let Some(v) = ovr.loiter_radius {
            self.loiter_radius = v;
        }
        if let Some(v) = ovr.battery_capacity_mah {
            self.battery_capacity_mah = v;
        }
        if let Some(v) = ovr.avg_current_draw_a {
            self.avg_current_draw_a = v;
        }
        if let Some(v) = ovr.endurance_min {
            self.endurance_min = v;
        }
        self
    }

    /// Clamp a requested speed into the flyable range. Fixed-wing never
    /// drops below stall; rotary-wing may hover at zero.
    pub fn clamp_speed(&self, requested: f64) -> f64 {
        requested.max(self.min_speed).min(self.max_speed)
    }

    /// Seconds to fly one leg, assuming climb and cruise happen together.
    pub fn estimate_leg_time(&self, distance_m: f64, alt_change_m: f64) -> f64 {
        let horiz = distance_m / self.cruise_speed;
        let vert = if alt_change_m > 0.0 {
            alt_change_m / self.climb_rate
        } else if alt_change_m < 0.0 {
            alt_change_m.abs() / self.descent_rate
        } else {
            0.0
        };
        horiz.max(vert)
    }

    /// Battery percentage consumed over `time_sec` at nominal cruise draw.
    pub fn estimate_leg_battery_pct(&self, time_sec: f64) -> f64 {
        let mah_used = self.avg_current_draw_a * (time_sec / 3600.0) * 1000.0;
        mah_used / self.battery_capacity_mah * 100.0
    }
}

/// Optional adjustments layered over the kind defaults. Every field is
/// independent; unset fields leave the base value alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PerfOverrides {
    pub cruise_speed: Option<f64>,
    pub max_speed: Option<f64>,
    pub min_speed: Option<f64>,
    pub loiter_speed: Option<f64>,
    pub swarm_track_speed: Option<f64>,
    pub climb_rate: Option<f64>,
    pub descent_rate: Option<f64>,
    pub turn_rate: Option<f64>,
    pub loiter_radius: Option<f64>,
    pub battery_capacity_mah: Option<f64>,
    pub avg_current_draw_a: Option<f64>,
    pub endurance_min: Option<f64>,
}
