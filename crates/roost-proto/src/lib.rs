pub mod mission;
pub mod modes;
pub mod status;
pub mod telemetry;

use serde::{Deserialize, Serialize};

/// Fleet-level vehicle identifier, e.g. "carrier1" or "dart1.2".
pub type VehicleId = String;

/// Airframe class. Fixed-wing and rotary firmware disagree on mode
/// numbering, arrival tolerances and minimum speeds, so almost everything
/// downstream keys on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleKind {
    FixedWing,
    RotaryWing,
}

impl VehicleKind {
    pub fn is_fixed_wing(self) -> bool {
        matches!(self, VehicleKind::FixedWing)
    }

    /// Map a heartbeat MAV_TYPE value onto a kind. Type 1 is fixed-wing;
    /// quad/coax/heli/hexa/octo/tri airframes count as rotary. Ground
    /// stations, antennas etc. map to None.
    pub fn from_mav_type(mav_type: u8) -> Option<Self> {
        match mav_type {
            1 => Some(VehicleKind::FixedWing),
            2 | 3 | 4 | 13 | 14 | 15 => Some(VehicleKind::RotaryWing),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            VehicleKind::FixedWing => "fixed-wing",
            VehicleKind::RotaryWing => "rotary-wing",
        }
    }
}
