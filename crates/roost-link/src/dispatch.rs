//! Command dispatch.
//!
//! One surface for every vehicle command, forked per call: with a sim
//! session active commands go straight into the engine and the store,
//! otherwise they are encoded for the vehicle's registered connection.
//! Cheap to clone; background sequences carry their own copy.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mavlink::common::{
    COMMAND_LONG_DATA, MavCmd, MavFrame, MavMessage, MavModeFlag, PositionTargetTypemask,
    SET_POSITION_TARGET_GLOBAL_INT_DATA,
};
use tracing::{info, warn};

use roost_fleet::formation::SwarmTrackingConfig;
use roost_fleet::geo;
use roost_fleet::FleetConfig;
use roost_proto::mission::{MissionWaypoint, deg_to_wire};
use roost_proto::modes;
use roost_proto::telemetry::VehicleTelemetry;
use roost_proto::{VehicleId, VehicleKind};
use roost_sim::SimEngine;

use crate::connection::LinkWriter;
use crate::error::LinkError;
use crate::events::{EventBus, LinkEvent};
use crate::mission::{self, TransferLink, TransferSlots};
use crate::quickfly::{self, QuickFly};
use crate::router::{RouterDeps, SharedRegistry};
use crate::store::TelemetryStore;

/// Force-arm magic accepted by ArduPilot in param2.
const FORCE_ARM_MAGIC: f32 = 21196.0;

/// Position-only type mask: velocity, acceleration and yaw fields are
/// ignored by the autopilot.
const GOTO_TYPE_MASK: u16 = 0b0000_1111_1111_1000;

#[derive(Clone)]
pub struct Dispatcher {
    fleet: Arc<FleetConfig>,
    store: TelemetryStore,
    bus: EventBus,
    registry: SharedRegistry,
    transfers: TransferSlots,
    sim: Arc<Mutex<Option<SimEngine>>>,
    swarm: Arc<Mutex<Option<SwarmTrackingConfig>>>,
    released: Arc<Mutex<HashSet<VehicleId>>>,
    step_timeout: Duration,
}

impl Dispatcher {
    pub(crate) fn new(
        shared: RouterDeps,
        sim: Arc<Mutex<Option<SimEngine>>>,
        step_timeout: Duration,
    ) -> Self {
        Self {
            fleet: shared.fleet,
            store: shared.store,
            bus: shared.bus,
            registry: shared.registry,
            transfers: shared.transfers,
            sim,
            swarm: Arc::new(Mutex::new(None)),
            released: Arc::new(Mutex::new(HashSet::new())),
            step_timeout,
        }
    }

    pub fn telemetry(&self, vehicle: &str) -> Option<VehicleTelemetry> {
        self.store.snapshot(vehicle)
    }

    pub fn kind_of(&self, vehicle: &str) -> Option<VehicleKind> {
        if let Some(conn) = self.registry.lock().unwrap().get(vehicle) {
            return Some(conn.kind);
        }
        self.fleet.kind_of(vehicle)
    }

    pub fn set_mode(&self, vehicle: &str, mode: &str) -> Result<(), LinkError> {
        let kind = self
            .kind_of(vehicle)
            .ok_or_else(|| LinkError::UnknownVehicle(vehicle.to_string()))?;
        let Some(mode_id) = modes::mode_id(kind, mode) else {
            return Err(LinkError::UnknownMode {
                vehicle: vehicle.to_string(),
                mode: mode.to_string(),
            });
        };

        if self.sim_active() {
            if !self.with_engine(|e| e.set_mode(vehicle, mode)).unwrap_or(false) {
                return Err(LinkError::UnknownVehicle(vehicle.to_string()));
            }
            self.store.update(vehicle, |t| t.mode = mode.to_string());
            self.bus.emit(LinkEvent::ModeChanged {
                vehicle: vehicle.to_string(),
                mode: mode.to_string(),
            });
            info!("{}: mode {} (sim)", vehicle, mode);
            return Ok(());
        }

        let (writer, system, component) = self.conn_info(vehicle)?;
        let msg = command_long(
            system,
            component,
            MavCmd::MAV_CMD_DO_SET_MODE,
            [
                MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED.bits() as f32,
                mode_id as f32,
                0.0,
                0.0,
                0.0,
                0.0,
                0.0,
            ],
        );
        writer.lock().unwrap().send(&msg)?;
        info!("{}: mode {} requested", vehicle, mode);
        Ok(())
    }

    pub fn arm(&self, vehicle: &str, armed: bool, force: bool) -> Result<(), LinkError> {
        if self.sim_active() {
            if !self.with_engine(|e| e.arm(vehicle, armed)).unwrap_or(false) {
                return Err(LinkError::UnknownVehicle(vehicle.to_string()));
            }
            self.store.update(vehicle, |t| t.armed = armed);
            self.bus
                .emit(LinkEvent::ArmedChanged { vehicle: vehicle.to_string(), armed });
            info!("{}: {} (sim)", vehicle, if armed { "armed" } else { "disarmed" });
            return Ok(());
        }

        let (writer, system, component) = self.conn_info(vehicle)?;
        let msg = command_long(
            system,
            component,
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            [
                if armed { 1.0 } else { 0.0 },
                if force { FORCE_ARM_MAGIC } else { 0.0 },
                0.0,
                0.0,
                0.0,
                0.0,
                0.0,
            ],
        );
        writer.lock().unwrap().send(&msg)?;
        info!(
            "{}: {}{} requested",
            vehicle,
            if armed { "arm" } else { "disarm" },
            if force { " (forced)" } else { "" }
        );
        Ok(())
    }

    /// Guided reposition. The vehicle must already be in a mode that
    /// accepts position targets.
    pub fn goto(&self, vehicle: &str, lat: f64, lon: f64, alt: f64) -> Result<(), LinkError> {
        if let Some(t) = self.store.snapshot(vehicle) {
            let dist = geo::flat_distance_m(t.lat, t.lon, lat, lon);
            info!("{}: goto {:.0}m away, alt {}m", vehicle, dist, alt);
        }

        if self.sim_active() {
            if !self.with_engine(|e| e.set_goto(vehicle, lat, lon, alt)).unwrap_or(false) {
                return Err(LinkError::UnknownVehicle(vehicle.to_string()));
            }
            return Ok(());
        }

        let (writer, system, component) = self.conn_info(vehicle)?;
        let msg = MavMessage::SET_POSITION_TARGET_GLOBAL_INT(SET_POSITION_TARGET_GLOBAL_INT_DATA {
            time_boot_ms: 0,
            lat_int: deg_to_wire(lat),
            lon_int: deg_to_wire(lon),
            alt: alt as f32,
            vx: 0.0,
            vy: 0.0,
            vz: 0.0,
            afx: 0.0,
            afy: 0.0,
            afz: 0.0,
            yaw: 0.0,
            yaw_rate: 0.0,
            type_mask: PositionTargetTypemask::from_bits_truncate(GOTO_TYPE_MASK),
            target_system: system,
            target_component: component,
            coordinate_frame: MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT_INT,
        });
        writer.lock().unwrap().send(&msg)?;
        Ok(())
    }

    pub fn takeoff(&self, vehicle: &str, altitude: f64) -> Result<(), LinkError> {
        if self.sim_active() {
            if !self.with_engine(|e| e.set_target_alt(vehicle, altitude)).unwrap_or(false) {
                return Err(LinkError::UnknownVehicle(vehicle.to_string()));
            }
            info!("{}: climbing to {}m (sim)", vehicle, altitude);
            return Ok(());
        }

        let (writer, system, component) = self.conn_info(vehicle)?;
        let msg = command_long(
            system,
            component,
            MavCmd::MAV_CMD_NAV_TAKEOFF,
            [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, altitude as f32],
        );
        writer.lock().unwrap().send(&msg)?;
        info!("{}: takeoff to {}m requested", vehicle, altitude);
        Ok(())
    }

    pub fn land(&self, vehicle: &str) -> Result<(), LinkError> {
        if self.sim_active() {
            self.set_mode(vehicle, "LAND")?;
            self.with_engine(|e| e.set_target_alt(vehicle, 0.0));
            return Ok(());
        }

        let (writer, system, component) = self.conn_info(vehicle)?;
        // Zeroed coordinates mean "land where you are".
        let msg = command_long(
            system,
            component,
            MavCmd::MAV_CMD_NAV_LAND,
            [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        );
        writer.lock().unwrap().send(&msg)?;
        info!("{}: land requested", vehicle);
        Ok(())
    }

    /// Adjusts the altitude target without touching the flight mode.
    pub fn change_altitude(&self, vehicle: &str, altitude: f64) -> Result<(), LinkError> {
        if self.sim_active() {
            if !self.with_engine(|e| e.set_target_alt(vehicle, altitude)).unwrap_or(false) {
                return Err(LinkError::UnknownVehicle(vehicle.to_string()));
            }
            info!("{}: target altitude {}m (sim)", vehicle, altitude);
            return Ok(());
        }

        let (writer, system, component) = self.conn_info(vehicle)?;
        let msg = command_long(
            system,
            component,
            MavCmd::MAV_CMD_DO_CHANGE_ALTITUDE,
            [
                altitude as f32,
                MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT as u32 as f32,
                0.0,
                0.0,
                0.0,
                0.0,
                0.0,
            ],
        );
        writer.lock().unwrap().send(&msg)?;
        info!("{}: altitude change to {}m requested", vehicle, altitude);
        Ok(())
    }

    pub fn rtl(&self, vehicle: &str) -> Result<(), LinkError> {
        self.set_mode(vehicle, "RTL")
    }

    /// Recalls every fleet vehicle we know about; failures are reported
    /// per vehicle instead of aborting the sweep.
    pub fn rtl_all(&self) -> Vec<(VehicleId, Result<(), LinkError>)> {
        let mut results = Vec::new();
        for spec in &self.fleet.vehicles {
            let known = self.registry.lock().unwrap().contains_key(&spec.id)
                || self.store.snapshot(&spec.id).is_some();
            if !known {
                continue;
            }
            let outcome = self.rtl(&spec.id);
            if let Err(e) = &outcome {
                warn!("{}: recall failed: {}", spec.id, e);
            }
            results.push((spec.id.clone(), outcome));
        }
        info!("fleet recall sent to {} vehicles", results.len());
        results
    }

    /// Teleports a simulated vehicle; home and loiter anchors move with
    /// it. Ignored with a warning on live links.
    pub fn set_vehicle_position(
        &self,
        vehicle: &str,
        lat: f64,
        lon: f64,
        alt: f64,
        heading: Option<f64>,
    ) -> Result<(), LinkError> {
        if self.sim_active() {
            if !self
                .with_engine(|e| e.set_position(vehicle, lat, lon, alt, heading))
                .unwrap_or(false)
            {
                return Err(LinkError::UnknownVehicle(vehicle.to_string()));
            }
            self.store.update(vehicle, |t| {
                t.lat = lat;
                t.lon = lon;
                t.alt = alt;
                if let Some(h) = heading {
                    t.heading = h;
                }
            });
            info!("{}: repositioned to ({:.6}, {:.6}) (sim)", vehicle, lat, lon);
            return Ok(());
        }

        warn!("{}: position override is simulation-only", vehicle);
        Ok(())
    }

    pub fn activate_swarm(&self, config: SwarmTrackingConfig) {
        *self.swarm.lock().unwrap() = Some(config.clone());
        if self.sim_active() {
            self.with_engine(|e| e.activate_swarm(config));
            info!("swarm tracking active (sim)");
        } else {
            warn!("swarm tracking stored; live links fly it as uploaded missions only");
        }
    }

    pub fn deactivate_swarm(&self) {
        *self.swarm.lock().unwrap() = None;
        self.with_engine(|e| e.deactivate_swarm());
        info!("swarm tracking off");
    }

    pub fn swarm_config(&self) -> Option<SwarmTrackingConfig> {
        self.swarm.lock().unwrap().clone()
    }

    /// Records that a carried vehicle has left its carrier.
    pub fn mark_released(&self, vehicle: &str) -> Result<(), LinkError> {
        if self.fleet.vehicle(vehicle).is_none() {
            return Err(LinkError::UnknownVehicle(vehicle.to_string()));
        }
        self.released.lock().unwrap().insert(vehicle.to_string());
        self.with_engine(|e| e.mark_released(vehicle));
        info!("{}: released from carrier", vehicle);
        Ok(())
    }

    pub fn is_attached(&self, vehicle: &str) -> bool {
        if self.sim_active() {
            return self.with_engine(|e| e.is_attached(vehicle)).unwrap_or(false);
        }
        self.fleet.carrier_of(vehicle).is_some()
            && !self.released.lock().unwrap().contains(vehicle)
    }

    pub async fn upload_mission(
        &self,
        vehicle: &str,
        waypoints: Vec<MissionWaypoint>,
    ) -> Result<(), LinkError> {
        if self.sim_active() {
            let count = waypoints.len();
            if !self.with_engine(|e| e.set_mission(vehicle, waypoints)).unwrap_or(false) {
                return Err(LinkError::UnknownVehicle(vehicle.to_string()));
            }
            info!("{}: mission stored, {} waypoints (sim)", vehicle, count);
            return Ok(());
        }

        let link = self.transfer_link(vehicle)?;
        let fleet = self.fleet.clone();
        let transfers = self.transfers.clone();
        let step = self.step_timeout;
        tokio::task::spawn_blocking(move || {
            mission::upload(&link, &fleet, &waypoints, &transfers, step)
        })
        .await
        .map_err(|_| LinkError::TransportRead("mission worker died".into()))?
    }

    pub async fn download_mission(&self, vehicle: &str) -> Result<Vec<MissionWaypoint>, LinkError> {
        if self.sim_active() {
            let known = self.with_engine(|e| e.telemetry(vehicle).is_some()).unwrap_or(false);
            if !known {
                return Err(LinkError::UnknownVehicle(vehicle.to_string()));
            }
            let mission = self
                .with_engine(|e| e.mission(vehicle).map(|m| m.to_vec()))
                .flatten()
                .unwrap_or_default();
            return Ok(mission);
        }

        let link = self.transfer_link(vehicle)?;
        let transfers = self.transfers.clone();
        let step = self.step_timeout;
        tokio::task::spawn_blocking(move || mission::download(&link, &transfers, step))
            .await
            .map_err(|_| LinkError::TransportRead("mission worker died".into()))?
    }

    pub fn cancel_transfer(&self, vehicle: &str) -> bool {
        mission::cancel_transfer(&self.transfers, vehicle)
    }

    pub fn quick_fly(&self, vehicle: &str, altitude: f64) -> Result<QuickFly, LinkError> {
        if self.kind_of(vehicle).is_none() {
            return Err(LinkError::UnknownVehicle(vehicle.to_string()));
        }
        if !self.sim_active() && !self.registry.lock().unwrap().contains_key(vehicle) {
            return Err(LinkError::NotConnected(vehicle.to_string()));
        }
        Ok(quickfly::start(self.clone(), vehicle.to_string(), altitude))
    }

    fn sim_active(&self) -> bool {
        self.sim.lock().unwrap().is_some()
    }

    fn with_engine<T>(&self, f: impl FnOnce(&mut SimEngine) -> T) -> Option<T> {
        self.sim.lock().unwrap().as_mut().map(f)
    }

    fn conn_info(&self, vehicle: &str) -> Result<(Arc<Mutex<LinkWriter>>, u8, u8), LinkError> {
        let registry = self.registry.lock().unwrap();
        let conn = registry
            .get(vehicle)
            .ok_or_else(|| LinkError::NotConnected(vehicle.to_string()))?;
        Ok((conn.writer.clone(), conn.system_id, conn.component_id))
    }

    fn transfer_link(&self, vehicle: &str) -> Result<TransferLink, LinkError> {
        let (writer, target_system, target_component) = self.conn_info(vehicle)?;
        Ok(TransferLink {
            vehicle: vehicle.to_string(),
            writer,
            target_system,
            target_component,
        })
    }
}

fn command_long(
    target_system: u8,
    target_component: u8,
    command: MavCmd,
    p: [f32; 7],
) -> MavMessage {
    MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
        param1: p[0],
        param2: p[1],
        param3: p[2],
        param4: p[3],
        param5: p[4],
        param6: p[5],
        param7: p[6],
        command,
        target_system,
        target_component,
        confirmation: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use roost_fleet::profile::PerfOverrides;
    use roost_fleet::{ProfileTable, VehicleSpec};
    use std::collections::HashMap;

    fn spec(id: &str, kind: VehicleKind, system_id: u8, carrier: Option<&str>) -> VehicleSpec {
        VehicleSpec {
            id: id.to_string(),
            kind,
            system_id,
            carrier: carrier.map(str::to_string),
            slot: carrier.map(|_| 1),
            performance: PerfOverrides::default(),
        }
    }

    fn fleet() -> FleetConfig {
        FleetConfig {
            vehicles: vec![
                spec("carrier1", VehicleKind::FixedWing, 1, None),
                spec("dart1.1", VehicleKind::RotaryWing, 2, Some("carrier1")),
            ],
            profiles: ProfileTable::default(),
        }
    }

    fn sim_dispatcher() -> Dispatcher {
        let fleet = Arc::new(fleet());
        let store = TelemetryStore::new();
        for spec in &fleet.vehicles {
            store.register(&spec.id);
        }
        let shared = RouterDeps {
            store,
            bus: EventBus::default(),
            fleet: fleet.clone(),
            registry: Arc::new(Mutex::new(HashMap::new())),
            transfers: Arc::new(Mutex::new(HashMap::new())),
        };
        let engine = SimEngine::from_fleet(&fleet, 7);
        Dispatcher::new(shared, Arc::new(Mutex::new(Some(engine))), Duration::from_secs(5))
    }

    #[test]
    fn sim_mode_change_updates_store_and_notifies() {
        let d = sim_dispatcher();
        let mut rx = d.bus.subscribe();

        d.set_mode("carrier1", "GUIDED").expect("valid mode");

        assert_eq!(d.telemetry("carrier1").expect("known").mode, "GUIDED");
        assert!(matches!(
            rx.try_recv(),
            Ok(LinkEvent::ModeChanged { mode, .. }) if mode == "GUIDED"
        ));
    }

    #[test]
    fn made_up_modes_are_rejected() {
        let d = sim_dispatcher();
        assert!(matches!(
            d.set_mode("carrier1", "WARP"),
            Err(LinkError::UnknownMode { .. })
        ));
        assert!(matches!(
            d.set_mode("ghost", "GUIDED"),
            Err(LinkError::UnknownVehicle(_))
        ));
    }

    #[test]
    fn sim_arm_round_trips_through_telemetry() {
        let d = sim_dispatcher();
        let mut rx = d.bus.subscribe();

        d.arm("dart1.1", true, false).expect("known vehicle");
        assert!(d.telemetry("dart1.1").expect("known").armed);
        assert!(matches!(
            rx.try_recv(),
            Ok(LinkEvent::ArmedChanged { armed: true, .. })
        ));

        d.arm("dart1.1", false, false).expect("known vehicle");
        assert!(!d.telemetry("dart1.1").expect("known").armed);
    }

    #[test]
    fn recall_covers_every_spawned_vehicle() {
        let d = sim_dispatcher();
        let results = d.rtl_all();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert_eq!(d.telemetry("carrier1").expect("known").mode, "RTL");
    }

    #[test]
    fn release_detaches_the_dart() {
        let d = sim_dispatcher();
        assert!(d.is_attached("dart1.1"));
        d.mark_released("dart1.1").expect("fleet vehicle");
        assert!(!d.is_attached("dart1.1"));
        assert!(matches!(
            d.mark_released("ghost"),
            Err(LinkError::UnknownVehicle(_))
        ));
    }

    #[test]
    fn live_commands_without_a_connection_are_refused() {
        let d = sim_dispatcher();
        *d.sim.lock().unwrap() = None;
        assert!(matches!(
            d.set_mode("carrier1", "GUIDED"),
            Err(LinkError::NotConnected(_))
        ));
        assert!(matches!(
            d.goto("carrier1", 52.0, -1.5, 100.0),
            Err(LinkError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn sim_missions_store_and_read_back() {
        let d = sim_dispatcher();
        let wps = vec![roost_proto::mission::MissionWaypoint::new(
            roost_proto::mission::WaypointKind::Waypoint,
            52.1,
            -1.4,
            90.0,
        )];
        d.upload_mission("carrier1", wps.clone()).await.expect("stored");

        let back = d.download_mission("carrier1").await.expect("read back");
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].kind, wps[0].kind);
        // Engine snaps coordinates to the wire grid on upload.
        assert!((back[0].lat - wps[0].lat).abs() < 1e-6);

        assert!(matches!(
            d.download_mission("ghost").await,
            Err(LinkError::UnknownVehicle(_))
        ));
    }

    #[test]
    fn swarm_config_is_remembered() {
        let d = sim_dispatcher();
        assert!(d.swarm_config().is_none());
        d.activate_swarm(SwarmTrackingConfig::new(
            roost_fleet::formation::FormationKind::Trail,
        ));
        assert!(d.swarm_config().is_some());
        d.deactivate_swarm();
        assert!(d.swarm_config().is_none());
    }
}
