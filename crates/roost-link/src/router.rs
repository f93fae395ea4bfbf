//! Inbound frame routing.
//!
//! Reader threads tag every frame with where it came from; the router
//! task resolves that to a vehicle, applies the telemetry handlers and
//! publishes change events. It is the only writer of live telemetry, so
//! change detection is a plain snapshot-compare-update.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use mavlink::common::{HEARTBEAT_DATA, MavMessage, MavModeFlag};
use mavlink::MavHeader;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use roost_fleet::FleetConfig;
use roost_proto::modes::mode_name;
use roost_proto::status::{severity_name, severity_notable};
use roost_proto::{VehicleId, VehicleKind};

use crate::connection::{self, LinkWriter, STREAM_RATE_HZ};
use crate::events::{EventBus, LinkEvent};
use crate::mission::TransferSlots;
use crate::store::TelemetryStore;

/// Where a frame came from. Direct transports carry one vehicle; a bus
/// frame is attributed by its source system id against the fleet file.
#[derive(Clone)]
pub enum Route {
    Direct(VehicleId),
    Bus(Arc<Mutex<LinkWriter>>),
}

pub struct Inbound {
    pub route: Route,
    pub header: MavHeader,
    pub msg: MavMessage,
}

/// Live connection record for one vehicle.
pub struct VehicleConn {
    pub writer: Arc<Mutex<LinkWriter>>,
    pub kind: VehicleKind,
    pub system_id: u8,
    pub component_id: u8,
}

pub type SharedRegistry = Arc<Mutex<HashMap<VehicleId, VehicleConn>>>;

#[derive(Clone)]
pub struct RouterDeps {
    pub store: TelemetryStore,
    pub bus: EventBus,
    pub fleet: Arc<FleetConfig>,
    pub registry: SharedRegistry,
    pub transfers: TransferSlots,
}

pub fn spawn_router(
    deps: RouterDeps,
    mut rx: mpsc::Receiver<Inbound>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(inbound) = rx.recv().await {
            handle_inbound(&deps, inbound);
        }
        debug!("router stopped");
    })
}

pub fn handle_inbound(deps: &RouterDeps, inbound: Inbound) {
    let Inbound { route, header, msg } = inbound;
    let Some(vehicle) = resolve(deps, &route, &header, &msg) else {
        return;
    };

    if is_transfer_message(&msg) {
        if !forward_to_transfer(deps, &vehicle, &msg) {
            debug!("{}: mission frame with no transfer running", vehicle);
        }
        return;
    }

    handle_message(deps, &vehicle, &msg);
}

fn resolve(
    deps: &RouterDeps,
    route: &Route,
    header: &MavHeader,
    msg: &MavMessage,
) -> Option<VehicleId> {
    match route {
        Route::Direct(vehicle) => Some(vehicle.clone()),
        Route::Bus(writer) => {
            let spec = deps.fleet.by_system_id(header.system_id)?;
            let vehicle = spec.id.clone();
            if deps.registry.lock().unwrap().contains_key(&vehicle) {
                return Some(vehicle);
            }
            // Only a heartbeat can introduce a bus vehicle.
            if !matches!(msg, MavMessage::HEARTBEAT(_)) {
                return None;
            }
            register_bus_vehicle(deps, &vehicle, spec.kind, header, writer);
            Some(vehicle)
        }
    }
}

fn register_bus_vehicle(
    deps: &RouterDeps,
    vehicle: &VehicleId,
    kind: VehicleKind,
    header: &MavHeader,
    writer: &Arc<Mutex<LinkWriter>>,
) {
    deps.registry.lock().unwrap().insert(
        vehicle.clone(),
        VehicleConn {
            writer: writer.clone(),
            kind,
            system_id: header.system_id,
            component_id: header.component_id,
        },
    );
    deps.store.register(vehicle);

    let request =
        connection::request_data_stream(header.system_id, header.component_id, STREAM_RATE_HZ);
    if let Err(e) = writer.lock().unwrap().send(&request) {
        warn!("{}: stream request failed: {}", vehicle, e);
    }

    info!("{}: found on shared bus (system {})", vehicle, header.system_id);
    deps.bus
        .emit(LinkEvent::ConnectionChanged { vehicle: vehicle.clone(), connected: true });
}

fn is_transfer_message(msg: &MavMessage) -> bool {
    matches!(
        msg,
        MavMessage::MISSION_REQUEST(_)
            | MavMessage::MISSION_REQUEST_INT(_)
            | MavMessage::MISSION_COUNT(_)
            | MavMessage::MISSION_ITEM_INT(_)
            | MavMessage::MISSION_ACK(_)
    )
}

fn forward_to_transfer(deps: &RouterDeps, vehicle: &VehicleId, msg: &MavMessage) -> bool {
    let slots = deps.transfers.lock().unwrap();
    match slots.get(vehicle) {
        Some(handle) => handle.tx.send(msg.clone()).is_ok(),
        None => false,
    }
}

fn handle_message(deps: &RouterDeps, vehicle: &VehicleId, msg: &MavMessage) {
    match msg {
        MavMessage::HEARTBEAT(hb) => handle_heartbeat(deps, vehicle, hb),
        MavMessage::GLOBAL_POSITION_INT(p) => {
            deps.store.update(vehicle, |t| {
                t.lat = p.lat as f64 / 1e7;
                t.lon = p.lon as f64 / 1e7;
                t.alt = p.relative_alt as f64 / 1000.0;
                // 65535 means "heading unknown".
                if p.hdg != u16::MAX {
                    t.heading = p.hdg as f64 / 100.0;
                }
            });
            emit_telemetry(deps, vehicle);
        }
        MavMessage::ATTITUDE(a) => {
            let heading = (a.yaw as f64).to_degrees().rem_euclid(360.0);
            deps.store.update(vehicle, |t| t.heading = heading);
        }
        MavMessage::SYS_STATUS(s) => {
            deps.store.update(vehicle, |t| {
                if s.voltage_battery != u16::MAX {
                    t.battery_voltage = s.voltage_battery as f32 / 1000.0;
                }
                if s.battery_remaining >= 0 {
                    t.battery_pct = s.battery_remaining as f32;
                }
            });
        }
        MavMessage::GPS_RAW_INT(g) => {
            deps.store.update(vehicle, |t| {
                t.gps_fix = g.fix_type as u8;
                t.gps_sats = g.satellites_visible;
            });
        }
        MavMessage::VFR_HUD(h) => {
            deps.store.update(vehicle, |t| {
                t.groundspeed = h.groundspeed as f64;
                t.airspeed = h.airspeed as f64;
                t.heading = h.heading as f64;
            });
            emit_telemetry(deps, vehicle);
        }
        MavMessage::MISSION_CURRENT(c) => {
            deps.store.update(vehicle, |t| t.mission_seq = Some(c.seq));
        }
        MavMessage::MISSION_ITEM_REACHED(r) => {
            info!("{}: reached waypoint {}", vehicle, r.seq);
            deps.bus
                .emit(LinkEvent::WaypointReached { vehicle: vehicle.clone(), index: r.seq });
        }
        MavMessage::STATUSTEXT(st) => {
            let text: String =
                st.text.iter().take_while(|&&c| c != 0).map(|&c| c as char).collect();
            let severity = st.severity as u8;
            if severity_notable(severity) {
                warn!("{}: [{}] {}", vehicle, severity_name(severity), text);
            }
            deps.bus.emit(LinkEvent::StatusText {
                vehicle: vehicle.clone(),
                severity,
                text,
            });
        }
        _ => {}
    }
}

fn handle_heartbeat(deps: &RouterDeps, vehicle: &VehicleId, hb: &HEARTBEAT_DATA) {
    let kind = kind_of(deps, vehicle);
    let mode = mode_name(kind, hb.custom_mode);
    let armed = hb.base_mode.contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED);

    let before = deps.store.snapshot(vehicle);
    let applied = deps.store.update(vehicle, |t| {
        t.mode = mode.clone();
        t.armed = armed;
        t.last_heartbeat = Some(Instant::now());
    });
    if !applied {
        return;
    }

    if let Some(before) = before {
        if before.mode != mode {
            info!("{}: mode {}", vehicle, mode);
            deps.bus
                .emit(LinkEvent::ModeChanged { vehicle: vehicle.clone(), mode });
        }
        if before.armed != armed {
            info!("{}: {}", vehicle, if armed { "armed" } else { "disarmed" });
            deps.bus
                .emit(LinkEvent::ArmedChanged { vehicle: vehicle.clone(), armed });
        }
    }
}

fn kind_of(deps: &RouterDeps, vehicle: &VehicleId) -> VehicleKind {
    if let Some(conn) = deps.registry.lock().unwrap().get(vehicle) {
        return conn.kind;
    }
    deps.fleet.kind_of(vehicle).unwrap_or(VehicleKind::RotaryWing)
}

fn emit_telemetry(deps: &RouterDeps, vehicle: &VehicleId) {
    if let Some(telemetry) = deps.store.snapshot(vehicle) {
        deps.bus
            .emit(LinkEvent::TelemetryChanged { vehicle: vehicle.clone(), telemetry });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mavlink::common::{
        GLOBAL_POSITION_INT_DATA, MISSION_ACK_DATA, MavAutopilot, MavMissionResult, MavSeverity,
        MavState, MavType, STATUSTEXT_DATA,
    };
    use roost_fleet::{ProfileTable, VehicleSpec};
    use roost_fleet::profile::PerfOverrides;
    use std::sync::mpsc as std_mpsc;
    use tokio::sync::broadcast::error::TryRecvError;

    use crate::mission::TransferHandle;
    use crate::transport::channel_pair;

    fn spec(id: &str, kind: VehicleKind, system_id: u8) -> VehicleSpec {
        VehicleSpec {
            id: id.to_string(),
            kind,
            system_id,
            carrier: None,
            slot: None,
            performance: PerfOverrides::default(),
        }
    }

    fn fleet() -> FleetConfig {
        FleetConfig {
            vehicles: vec![
                spec("carrier1", VehicleKind::FixedWing, 1),
                spec("dart1.1", VehicleKind::RotaryWing, 2),
            ],
            profiles: ProfileTable::default(),
        }
    }

    fn deps() -> RouterDeps {
        RouterDeps {
            store: TelemetryStore::new(),
            bus: EventBus::default(),
            fleet: Arc::new(fleet()),
            registry: Arc::new(Mutex::new(HashMap::new())),
            transfers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn header(system_id: u8) -> MavHeader {
        MavHeader { system_id, component_id: 1, sequence: 0 }
    }

    fn heartbeat(custom_mode: u32, armed: bool) -> MavMessage {
        let mut base_mode = MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED;
        if armed {
            base_mode |= MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED;
        }
        MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode,
            mavtype: MavType::MAV_TYPE_FIXED_WING,
            autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
            base_mode,
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        })
    }

    fn direct(vehicle: &str, msg: MavMessage) -> Inbound {
        Inbound { route: Route::Direct(vehicle.to_string()), header: header(1), msg }
    }

    #[test]
    fn heartbeat_flags_mode_and_arming_changes() {
        let deps = deps();
        deps.store.register("carrier1");
        let mut rx = deps.bus.subscribe();

        handle_inbound(&deps, direct("carrier1", heartbeat(12, true)));

        assert!(matches!(
            rx.try_recv(),
            Ok(LinkEvent::ModeChanged { mode, .. }) if mode == "LOITER"
        ));
        assert!(matches!(
            rx.try_recv(),
            Ok(LinkEvent::ArmedChanged { armed: true, .. })
        ));

        // Same heartbeat again is not a change.
        handle_inbound(&deps, direct("carrier1", heartbeat(12, true)));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        let snap = deps.store.snapshot("carrier1").expect("registered");
        assert_eq!(snap.mode, "LOITER");
        assert!(snap.armed);
        assert!(snap.last_heartbeat.is_some());
    }

    #[test]
    fn position_frames_update_the_store_and_notify() {
        let deps = deps();
        deps.store.register("carrier1");
        let mut rx = deps.bus.subscribe();

        let msg = MavMessage::GLOBAL_POSITION_INT(GLOBAL_POSITION_INT_DATA {
            lat: 520_000_000,
            lon: -15_000_000,
            relative_alt: 127_000,
            hdg: 9000,
            ..Default::default()
        });
        handle_inbound(&deps, direct("carrier1", msg));

        let snap = deps.store.snapshot("carrier1").expect("registered");
        assert!((snap.lat - 52.0).abs() < 1e-9);
        assert!((snap.lon + 1.5).abs() < 1e-9);
        assert!((snap.alt - 127.0).abs() < 1e-9);
        assert!((snap.heading - 90.0).abs() < 1e-9);
        assert!(matches!(rx.try_recv(), Ok(LinkEvent::TelemetryChanged { .. })));
    }

    #[test]
    fn bus_heartbeat_registers_fleet_vehicle() {
        let deps = deps();
        let mut rx = deps.bus.subscribe();
        let (pair, peer) = channel_pair("chan:bus");
        let writer = Arc::new(Mutex::new(LinkWriter::new(pair.writer)));

        handle_inbound(
            &deps,
            Inbound { route: Route::Bus(writer), header: header(2), msg: heartbeat(5, false) },
        );

        assert!(deps.registry.lock().unwrap().contains_key("dart1.1"));
        let snap = deps.store.snapshot("dart1.1").expect("registered");
        assert_eq!(snap.mode, "LOITER");

        let (_, req) = peer.recv_timeout(std::time::Duration::from_secs(1)).expect("request");
        match req {
            MavMessage::REQUEST_DATA_STREAM(req) => assert_eq!(req.target_system, 2),
            other => panic!("expected stream request, got {:?}", other),
        }

        assert!(matches!(
            rx.try_recv(),
            Ok(LinkEvent::ConnectionChanged { connected: true, .. })
        ));
        // First heartbeat also resolves the mode.
        assert!(matches!(rx.try_recv(), Ok(LinkEvent::ModeChanged { .. })));
    }

    #[test]
    fn bus_frames_from_strangers_are_dropped() {
        let deps = deps();
        let (pair, _peer) = channel_pair("chan:bus");
        let writer = Arc::new(Mutex::new(LinkWriter::new(pair.writer)));

        handle_inbound(
            &deps,
            Inbound { route: Route::Bus(writer), header: header(99), msg: heartbeat(0, false) },
        );

        assert!(deps.registry.lock().unwrap().is_empty());
        assert!(deps.store.vehicle_ids().is_empty());
    }

    #[test]
    fn status_text_reaches_subscribers() {
        let deps = deps();
        deps.store.register("carrier1");
        let mut rx = deps.bus.subscribe();

        let mut text = [0u8; 50];
        for (i, b) in b"PreArm: check fence".iter().enumerate() {
            text[i] = *b;
        }
        let msg = MavMessage::STATUSTEXT(STATUSTEXT_DATA {
            severity: MavSeverity::MAV_SEVERITY_WARNING,
            text,
        });
        handle_inbound(&deps, direct("carrier1", msg));

        match rx.try_recv() {
            Ok(LinkEvent::StatusText { severity, text, .. }) => {
                assert_eq!(severity, 4);
                assert_eq!(text, "PreArm: check fence");
            }
            other => panic!("expected status text, got {:?}", other),
        }
    }

    #[test]
    fn mission_frames_go_to_the_active_transfer() {
        let deps = deps();
        deps.store.register("carrier1");
        let (tx, rx) = std_mpsc::channel();
        deps.transfers.lock().unwrap().insert(
            "carrier1".to_string(),
            TransferHandle { tx, cancel: Arc::new(std::sync::atomic::AtomicBool::new(false)) },
        );

        let ack = MavMessage::MISSION_ACK(MISSION_ACK_DATA {
            target_system: crate::GCS_SYSTEM_ID,
            target_component: 0,
            mavtype: MavMissionResult::MAV_MISSION_ACCEPTED,
        });
        handle_inbound(&deps, direct("carrier1", ack));

        let forwarded = rx.recv_timeout(std::time::Duration::from_secs(1)).expect("frame");
        assert!(matches!(forwarded, MavMessage::MISSION_ACK(_)));
    }
}
