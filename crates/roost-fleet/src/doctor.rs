use std::collections::HashSet;

use anyhow::Result;

use crate::FleetConfig;

/// Preflight validation of the fleet registry. Run before any link is
/// opened so a bad config fails loudly instead of half-connecting.
pub fn check_fleet(fleet: &FleetConfig) -> Result<()> {
    anyhow::ensure!(!fleet.vehicles.is_empty(), "fleet.vehicles must not be empty");

    let mut ids = HashSet::new();
    let mut system_ids = HashSet::new();
    for v in &fleet.vehicles {
        anyhow::ensure!(!v.id.is_empty(), "fleet vehicle with empty id");
        anyhow::ensure!(ids.insert(v.id.as_str()), "duplicate vehicle id {}", v.id);
        anyhow::ensure!(
            v.system_id != 0 && v.system_id != 255,
            "{}: system_id must be 1..254 (255 is the ground station)",
            v.id
        );
        anyhow::ensure!(
            system_ids.insert(v.system_id),
            "{}: system_id {} already taken",
            v.id,
            v.system_id
        );
    }

    for v in &fleet.vehicles {
        let Some(carrier) = &v.carrier else { continue };
        anyhow::ensure!(carrier != &v.id, "{}: vehicle cannot carry itself", v.id);
        match fleet.vehicle(carrier) {
            Some(c) => anyhow::ensure!(
                c.kind.is_fixed_wing(),
                "{}: carrier {} is not fixed-wing",
                v.id,
                carrier
            ),
            None => anyhow::bail!("{}: carrier {} not in fleet", v.id, carrier),
        }
        anyhow::ensure!(
            v.slot.map_or(false, |s| s >= 1),
            "{}: carried vehicle needs a slot >= 1",
            v.id
        );
    }

    // release servos are keyed by slot, collisions would double-release
    for v in &fleet.vehicles {
        let mut slots = HashSet::new();
        for f in fleet.followers_of(&v.id) {
            if let Some(slot) = f.slot {
                anyhow::ensure!(
                    slots.insert(slot),
                    "{}: slot {} used by more than one carried vehicle",
                    v.id,
                    slot
                );
            }
        }
    }

    Ok(())
}

/// Sanity limits on the merged performance numbers of every vehicle.
pub fn check_profiles(fleet: &FleetConfig) -> Result<()> {
    for v in &fleet.vehicles {
        let p = match fleet.performance(&v.id) {
            Some(p) => p,
            None => continue,
        };
        anyhow::ensure!(
            p.min_speed <= p.cruise_speed && p.cruise_speed <= p.max_speed,
            "{}: speeds must satisfy min <= cruise <= max",
            v.id
        );
        anyhow::ensure!(p.climb_rate > 0.0, "{}: climb_rate must be positive", v.id);
        anyhow::ensure!(p.descent_rate > 0.0, "{}: descent_rate must be positive", v.id);
        anyhow::ensure!(p.turn_rate > 0.0, "{}: turn_rate must be positive", v.id);
        anyhow::ensure!(
            p.battery_capacity_mah > 0.0,
            "{}: battery_capacity_mah must be positive",
            v.id
        );
        if v.kind.is_fixed_wing() {
            anyhow::ensure!(
                p.loiter_radius > 0.0,
                "{}: fixed-wing needs a loiter_radius",
                v.id
            );
            anyhow::ensure!(p.min_speed > 0.0, "{}: fixed-wing stall speed must be positive", v.id);
        }
    }
    Ok(())
}
