use std::time::{Duration, Instant};

/// Heartbeat age past which a vehicle is considered link-dead.
pub const HEARTBEAT_STALE: Duration = Duration::from_secs(5);

/// Last-known state of one vehicle. Written by the receiver router (live
/// links) or the simulation driver, read by everyone else. Liveness is
/// derived from `last_heartbeat`, never stored.
#[derive(Debug, Clone)]
pub struct VehicleTelemetry {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,     // m above home
    pub heading: f64, // degrees 0-360
    pub groundspeed: f64,
    pub airspeed: f64,
    pub battery_pct: f32,
    pub battery_voltage: f32,
    pub mode: String,
    pub armed: bool,
    pub gps_fix: u8, // GPS_FIX_TYPE numeric value, 3 = 3D
    pub gps_sats: u8,
    pub mission_seq: Option<u16>,
    pub last_heartbeat: Option<Instant>,
}

impl Default for VehicleTelemetry {
    fn default() -> Self {
        Self {
            lat: 0.0,
            lon: 0.0,
            alt: 0.0,
            heading: 0.0,
            groundspeed: 0.0,
            airspeed: 0.0,
            battery_pct: 0.0,
            battery_voltage: 0.0,
            mode: "UNKNOWN".to_string(),
            armed: false,
            gps_fix: 0,
            gps_sats: 0,
            mission_seq: None,
            last_heartbeat: None,
        }
    }
}

impl VehicleTelemetry {
    pub fn hb_age(&self) -> Option<Duration> {
        self.last_heartbeat.map(|t| t.elapsed())
    }

    pub fn is_connected(&self) -> bool {
        self.hb_age().map(|age| age < HEARTBEAT_STALE).unwrap_or(false)
    }

    pub fn has_3d_fix(&self) -> bool {
        self.gps_fix >= 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_heartbeat_is_connected() {
        let mut t = VehicleTelemetry::default();
        assert!(!t.is_connected());
        t.last_heartbeat = Some(Instant::now());
        assert!(t.is_connected());
    }

    #[test]
    fn stale_heartbeat_is_disconnected() {
        let mut t = VehicleTelemetry::default();
        t.last_heartbeat = Instant::now().checked_sub(Duration::from_secs(6));
        assert!(t.last_heartbeat.is_some());
        assert!(!t.is_connected());
    }
}
