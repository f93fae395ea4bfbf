//! STATUSTEXT severity handling.

/// MAV_SEVERITY names, indexed by wire value.
const SEVERITY_NAMES: [&str; 8] =
    ["EMERG", "ALERT", "CRIT", "ERROR", "WARN", "NOTICE", "INFO", "DEBUG"];

pub fn severity_name(severity: u8) -> &'static str {
    SEVERITY_NAMES.get(severity as usize).copied().unwrap_or("")
}

/// NOTICE and worse get logged; INFO/DEBUG spam does not.
pub fn severity_notable(severity: u8) -> bool {
    severity <= 5
}
