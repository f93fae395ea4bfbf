//! ArduPilot custom-mode tables, scoped by vehicle kind.
//!
//! A mode name only means something together with the kind it was resolved
//! against: custom-mode 5 is FBWA on a plane and LOITER on a copter. The
//! numeric values ride the wire in heartbeats and DO_SET_MODE commands and
//! must stay exactly ArduPilot's.

use crate::VehicleKind;

const FIXED_WING_MODES: &[(&str, u32)] = &[
    ("MANUAL", 0),
    ("CIRCLE", 1),
    ("STABILIZE", 2),
    ("TRAINING", 3),
    ("ACRO", 4),
    ("FBWA", 5),
    ("FBWB", 6),
    ("CRUISE", 7),
    ("AUTOTUNE", 8),
    ("AUTO", 10),
    ("RTL", 11),
    ("LOITER", 12),
    ("TAKEOFF", 13),
    ("AVOID_ADSB", 14),
    ("GUIDED", 15),
    ("QSTABILIZE", 17),
    ("QHOVER", 18),
    ("QLOITER", 19),
    ("QLAND", 20),
    ("QRTL", 21),
    ("LAND", 23),
];

const ROTARY_WING_MODES: &[(&str, u32)] = &[
    ("STABILIZE", 0),
    ("ACRO", 1),
    ("ALT_HOLD", 2),
    ("AUTO", 3),
    ("GUIDED", 4),
    ("LOITER", 5),
    ("RTL", 6),
    ("CIRCLE", 7),
    ("LAND", 9),
    ("DRIFT", 11),
    ("SPORT", 13),
    ("FLIP", 14),
    ("AUTOTUNE", 15),
    ("POSHOLD", 16),
    ("BRAKE", 17),
    ("THROW", 18),
    ("GUIDED_NOGPS", 20),
    ("SMART_RTL", 21),
];

pub fn mode_table(kind: VehicleKind) -> &'static [(&'static str, u32)] {
    match kind {
        VehicleKind::FixedWing => FIXED_WING_MODES,
        VehicleKind::RotaryWing => ROTARY_WING_MODES,
    }
}

/// Resolve a mode name (exact, upper-case) to its custom-mode id.
pub fn mode_id(kind: VehicleKind, name: &str) -> Option<u32> {
    mode_table(kind)
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, id)| *id)
}

/// Name for a custom-mode id. Ids outside the table render as `MODE_<n>`
/// so an unexpected firmware mode still shows up in telemetry.
pub fn mode_name(kind: VehicleKind, custom_mode: u32) -> String {
    mode_table(kind)
        .iter()
        .find(|(_, id)| *id == custom_mode)
        .map(|(n, _)| (*n).to_string())
        .unwrap_or_else(|| format!("MODE_{}", custom_mode))
}
