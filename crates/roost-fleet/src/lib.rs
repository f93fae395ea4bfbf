pub mod doctor;
pub mod formation;
pub mod geo;
pub mod profile;

use serde::Deserialize;

use profile::{PerfOverrides, PerfProfile};
use roost_proto::{VehicleId, VehicleKind};

/// One fleet member as configured.
#[derive(Debug, Clone, Deserialize)]
pub struct VehicleSpec {
    pub id: VehicleId,
    pub kind: VehicleKind,

    /// MAVLink system id; also used to demux vehicles sharing one bus.
    pub system_id: u8,

    /// Carrier this vehicle rides on, with its 1-based carry slot.
    /// Slot doubles as the release servo selector.
    #[serde(default)]
    pub carrier: Option<VehicleId>,
    #[serde(default)]
    pub slot: Option<u8>,

    /// Per-vehicle performance tweaks on top of the kind profile.
    #[serde(default)]
    pub performance: PerfOverrides,
}

/// Kind-level performance adjustments applied before per-vehicle ones.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileTable {
    #[serde(default)]
    pub fixed_wing: PerfOverrides,
    #[serde(default)]
    pub rotary_wing: PerfOverrides,
}

impl ProfileTable {
    fn for_kind(&self, kind: VehicleKind) -> &PerfOverrides {
        match kind {
            VehicleKind::FixedWing => &self.fixed_wing,
            VehicleKind::RotaryWing => &self.rotary_wing,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FleetConfig {
    pub vehicles: Vec<VehicleSpec>,
    #[serde(default)]
    pub profiles: ProfileTable,
}

impl FleetConfig {
    pub fn vehicle(&self, id: &str) -> Option<&VehicleSpec> {
        self.vehicles.iter().find(|v| v.id == id)
    }

    pub fn kind_of(&self, id: &str) -> Option<VehicleKind> {
        self.vehicle(id).map(|v| v.kind)
    }

    pub fn by_system_id(&self, system_id: u8) -> Option<&VehicleSpec> {
        self.vehicles.iter().find(|v| v.system_id == system_id)
    }

    pub fn carrier_of(&self, id: &str) -> Option<&VehicleId> {
        self.vehicle(id).and_then(|v| v.carrier.as_ref())
    }

    /// Carried vehicles of one carrier, in slot order.
    pub fn followers_of(&self, carrier_id: &str) -> Vec<&VehicleSpec> {
        let mut out: Vec<&VehicleSpec> = self
            .vehicles
            .iter()
            .filter(|v| v.carrier.as_deref() == Some(carrier_id))
            .collect();
        out.sort_by_key(|v| v.slot.unwrap_or(1));
        out
    }

    /// First fixed-wing in declaration order; the backup link binds here.
    pub fn primary_carrier(&self) -> Option<&VehicleSpec> {
        self.vehicles.iter().find(|v| v.kind == VehicleKind::FixedWing)
    }

    /// Kind defaults, kind-table adjustments, then per-vehicle overrides.
    pub fn performance(&self, id: &str) -> Option<PerfProfile> {
        let spec = self.vehicle(id)?;
        let merged = PerfProfile::defaults(spec.kind)
            .with_overrides(self.profiles.for_kind(spec.kind))
            .with_overrides(&spec.performance);
        Some(merged)
    }

    /// 0-based formation index of a carried vehicle (slot 1 → 0).
    pub fn follower_index(&self, id: &str) -> Option<usize> {
        let spec = self.vehicle(id)?;
        spec.carrier.as_ref()?;
        Some(spec.slot.unwrap_or(1).saturating_sub(1) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str, kind: VehicleKind, system_id: u8, carrier: Option<&str>, slot: Option<u8>) -> VehicleSpec {
        VehicleSpec {
            id: id.to_string(),
            kind,
            system_id,
            carrier: carrier.map(str::to_string),
            slot,
            performance: PerfOverrides::default(),
        }
    }

    fn fleet() -> FleetConfig {
        FleetConfig {
            vehicles: vec![
                spec("carrier1", VehicleKind::FixedWing, 1, None, None),
                spec("dart1.2", VehicleKind::RotaryWing, 3, Some("carrier1"), Some(2)),
                spec("dart1.1", VehicleKind::RotaryWing, 2, Some("carrier1"), Some(1)),
            ],
            profiles: ProfileTable::default(),
        }
    }

    #[test]
    fn followers_come_back_in_slot_order() {
        let f = fleet();
        let ids: Vec<&str> = f.followers_of("carrier1").iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, ["dart1.1", "dart1.2"]);
        assert_eq!(f.follower_index("dart1.1"), Some(0));
        assert_eq!(f.follower_index("dart1.2"), Some(1));
        assert_eq!(f.follower_index("carrier1"), None);
    }

    #[test]
    fn system_id_lookup() {
        let f = fleet();
        assert_eq!(f.by_system_id(2).map(|v| v.id.as_str()), Some("dart1.1"));
        assert!(f.by_system_id(9).is_none());
    }

    #[test]
    fn primary_carrier_is_first_fixed_wing() {
        let f = fleet();
        assert_eq!(f.primary_carrier().map(|v| v.id.as_str()), Some("carrier1"));
    }

    #[test]
    fn vehicle_overrides_shadow_kind_defaults() {
        let mut f = fleet();
        f.profiles.rotary_wing.cruise_speed = Some(30.0);
        f.vehicles[1].performance.cruise_speed = Some(12.5);

        let dart12 = f.performance("dart1.2").unwrap();
        assert!((dart12.cruise_speed - 12.5).abs() < f64::EPSILON);
        let dart11 = f.performance("dart1.1").unwrap();
        assert!((dart11.cruise_speed - 30.0).abs() < f64::EPSILON);
        // untouched fields keep the kind defaults
        assert!((dart11.climb_rate - 8.0).abs() < f64::EPSILON);
    }
}
