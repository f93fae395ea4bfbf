//! Mission transfer: the waypoint-item transform and the count/request
//! wire protocol.
//!
//! Uploads and downloads run on blocking worker threads. While one runs,
//! the router forwards transfer frames into a per-vehicle slot; the slot
//! doubles as the busy marker, so a vehicle carries at most one transfer
//! at a time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mavlink::common::{
    MISSION_ACK_DATA, MISSION_CLEAR_ALL_DATA, MISSION_COUNT_DATA, MISSION_ITEM_INT_DATA,
    MISSION_REQUEST_INT_DATA, MISSION_REQUEST_LIST_DATA, MavCmd, MavFrame, MavMessage,
    MavMissionResult,
};
use tracing::{debug, info, warn};

use roost_fleet::FleetConfig;
use roost_proto::mission::{MissionWaypoint, WaypointKind, deg_to_wire, wire_to_deg};
use roost_proto::VehicleId;

use crate::connection::LinkWriter;
use crate::error::LinkError;

/// Servo channel 9 releases slot 1, channel 10 slot 2.
const SERVO_CHANNEL_BASE: u8 = 8;
const LAUNCH_SERVO_PWM: f32 = 1900.0;
const DEFAULT_LOITER_SECS: f32 = 30.0;

/// Router-side end of a running transfer.
pub struct TransferHandle {
    pub tx: Sender<MavMessage>,
    pub cancel: Arc<AtomicBool>,
}

pub type TransferSlots = Arc<Mutex<HashMap<VehicleId, TransferHandle>>>;

/// Connection facts a transfer needs, resolved from the registry before
/// the worker thread starts.
pub struct TransferLink {
    pub vehicle: VehicleId,
    pub writer: Arc<Mutex<LinkWriter>>,
    pub target_system: u8,
    pub target_component: u8,
}

/// Flags the running transfer for `vehicle`, if any.
pub fn cancel_transfer(transfers: &TransferSlots, vehicle: &str) -> bool {
    match transfers.lock().unwrap().get(vehicle) {
        Some(handle) => {
            handle.cancel.store(true, Ordering::Relaxed);
            true
        }
        None => false,
    }
}

/// Clear-count-request exchange. An empty waypoint list just clears the
/// vehicle's stored mission.
pub fn upload(
    link: &TransferLink,
    fleet: &FleetConfig,
    waypoints: &[MissionWaypoint],
    transfers: &TransferSlots,
    step_timeout: Duration,
) -> Result<(), LinkError> {
    let (rx, cancel, _slot) = claim_slot(transfers, &link.vehicle)?;
    let items = mission_to_items(waypoints, fleet, link.target_system, link.target_component);
    info!("{}: uploading mission, {} items", link.vehicle, items.len());

    send(
        link,
        MavMessage::MISSION_CLEAR_ALL(MISSION_CLEAR_ALL_DATA {
            target_system: link.target_system,
            target_component: link.target_component,
        }),
    )?;
    wait_clear_ack(link, &rx, &cancel, step_timeout)?;

    if items.is_empty() {
        info!("{}: mission cleared", link.vehicle);
        return Ok(());
    }

    // Frames still queued belong to the clear exchange.
    while rx.try_recv().is_ok() {}

    send(
        link,
        MavMessage::MISSION_COUNT(MISSION_COUNT_DATA {
            target_system: link.target_system,
            target_component: link.target_component,
            count: items.len() as u16,
        }),
    )?;

    let last = (items.len() - 1) as u16;
    let mut all_sent = false;
    loop {
        let stage = if all_sent { "mission ack" } else { "mission request" };
        let deadline = Instant::now() + step_timeout;
        match next_frame(&link.vehicle, &rx, &cancel, deadline, stage, true)? {
            MavMessage::MISSION_REQUEST(req) => {
                send_item(link, &items, req.seq, last, &mut all_sent)?;
            }
            MavMessage::MISSION_REQUEST_INT(req) => {
                send_item(link, &items, req.seq, last, &mut all_sent)?;
            }
            MavMessage::MISSION_ACK(ack) => {
                return match ack.mavtype {
                    MavMissionResult::MAV_MISSION_ACCEPTED => {
                        info!("{}: mission accepted", link.vehicle);
                        Ok(())
                    }
                    other => Err(LinkError::CommandRejected {
                        vehicle: link.vehicle.clone(),
                        what: "mission upload",
                        code: format!("{:?}", other),
                    }),
                };
            }
            _ => {}
        }
    }
}

/// Request-list-count-item exchange; the home record at seq 0 and rows
/// without a position are dropped from the result.
pub fn download(
    link: &TransferLink,
    transfers: &TransferSlots,
    step_timeout: Duration,
) -> Result<Vec<MissionWaypoint>, LinkError> {
    let (rx, cancel, _slot) = claim_slot(transfers, &link.vehicle)?;

    send(
        link,
        MavMessage::MISSION_REQUEST_LIST(MISSION_REQUEST_LIST_DATA {
            target_system: link.target_system,
            target_component: link.target_component,
        }),
    )?;

    let count = {
        let deadline = Instant::now() + step_timeout;
        loop {
            match next_frame(&link.vehicle, &rx, &cancel, deadline, "mission count", false)? {
                MavMessage::MISSION_COUNT(c) => break c.count,
                _ => continue,
            }
        }
    };
    debug!("{}: downloading {} mission items", link.vehicle, count);

    let mut raw = Vec::with_capacity(count as usize);
    for seq in 0..count {
        send(
            link,
            MavMessage::MISSION_REQUEST_INT(MISSION_REQUEST_INT_DATA {
                seq,
                target_system: link.target_system,
                target_component: link.target_component,
            }),
        )?;
        let deadline = Instant::now() + step_timeout;
        let item = loop {
            match next_frame(&link.vehicle, &rx, &cancel, deadline, "mission item", false)? {
                MavMessage::MISSION_ITEM_INT(item) if item.seq == seq => break item,
                _ => continue,
            }
        };
        raw.push(item);
    }

    send(
        link,
        MavMessage::MISSION_ACK(MISSION_ACK_DATA {
            target_system: link.target_system,
            target_component: link.target_component,
            mavtype: MavMissionResult::MAV_MISSION_ACCEPTED,
        }),
    )?;

    let waypoints: Vec<MissionWaypoint> =
        raw.iter().filter(|item| item.seq != 0).filter_map(item_to_waypoint).collect();
    info!("{}: downloaded {} waypoints", link.vehicle, waypoints.len());
    Ok(waypoints)
}

/// Expands waypoints into the wire item list. Slot 0 duplicates the
/// first waypoint as a home placeholder; autopilots overwrite it with
/// their own home position.
pub fn mission_to_items(
    waypoints: &[MissionWaypoint],
    fleet: &FleetConfig,
    target_system: u8,
    target_component: u8,
) -> Vec<MISSION_ITEM_INT_DATA> {
    let Some(first) = waypoints.first() else {
        return Vec::new();
    };

    let mut items = Vec::with_capacity(waypoints.len() + 1);
    items.push(base_item(
        MavCmd::MAV_CMD_NAV_WAYPOINT,
        first.lat,
        first.lon,
        first.alt,
        target_system,
        target_component,
    ));

    for wp in waypoints {
        match wp.kind {
            WaypointKind::Takeoff => {
                items.push(base_item(
                    MavCmd::MAV_CMD_NAV_TAKEOFF,
                    wp.lat,
                    wp.lon,
                    wp.alt,
                    target_system,
                    target_component,
                ));
            }
            WaypointKind::Waypoint => {
                let mut item = base_item(
                    MavCmd::MAV_CMD_NAV_WAYPOINT,
                    wp.lat,
                    wp.lon,
                    wp.alt,
                    target_system,
                    target_component,
                );
                if let Some(speed) = wp.speed {
                    item.param2 = speed as f32;
                }
                items.push(item);
            }
            WaypointKind::Loiter => {
                items.push(base_item(
                    MavCmd::MAV_CMD_NAV_LOITER_UNLIM,
                    wp.lat,
                    wp.lon,
                    wp.alt,
                    target_system,
                    target_component,
                ));
            }
            WaypointKind::LoiterTime => {
                let mut item = base_item(
                    MavCmd::MAV_CMD_NAV_LOITER_TIME,
                    wp.lat,
                    wp.lon,
                    wp.alt,
                    target_system,
                    target_component,
                );
                item.param1 = wp.loiter_secs.unwrap_or(DEFAULT_LOITER_SECS);
                items.push(item);
            }
            WaypointKind::Launch => {
                items.push(base_item(
                    MavCmd::MAV_CMD_NAV_WAYPOINT,
                    wp.lat,
                    wp.lon,
                    wp.alt,
                    target_system,
                    target_component,
                ));
                items.push(servo_item(wp, fleet, target_system, target_component));
            }
            WaypointKind::Rtl => {
                items.push(base_item(
                    MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH,
                    0.0,
                    0.0,
                    0.0,
                    target_system,
                    target_component,
                ));
            }
            WaypointKind::Land => {
                items.push(base_item(
                    MavCmd::MAV_CMD_NAV_LAND,
                    wp.lat,
                    wp.lon,
                    wp.alt,
                    target_system,
                    target_component,
                ));
            }
            WaypointKind::Target => {
                items.push(base_item(
                    MavCmd::MAV_CMD_NAV_WAYPOINT,
                    wp.lat,
                    wp.lon,
                    wp.alt,
                    target_system,
                    target_component,
                ));
            }
        }
    }

    for (seq, item) in items.iter_mut().enumerate() {
        item.seq = seq as u16;
        item.current = u8::from(seq == 0);
    }
    items
}

/// Maps one downloaded item back to a waypoint. RTL keeps its zeroed
/// coordinates; any other row without a position (servo pulses and the
/// like) maps to nothing.
pub fn item_to_waypoint(item: &MISSION_ITEM_INT_DATA) -> Option<MissionWaypoint> {
    if item.command == MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH {
        return Some(MissionWaypoint::new(WaypointKind::Rtl, 0.0, 0.0, 0.0));
    }
    let lat = wire_to_deg(item.x);
    let lon = wire_to_deg(item.y);
    if lat == 0.0 && lon == 0.0 {
        return None;
    }
    let kind = match item.command {
        MavCmd::MAV_CMD_NAV_LOITER_UNLIM => WaypointKind::Loiter,
        MavCmd::MAV_CMD_NAV_LOITER_TIME => WaypointKind::LoiterTime,
        MavCmd::MAV_CMD_NAV_TAKEOFF => WaypointKind::Takeoff,
        MavCmd::MAV_CMD_NAV_LAND => WaypointKind::Land,
        _ => WaypointKind::Waypoint,
    };
    let mut wp = MissionWaypoint::new(kind, lat, lon, item.z as f64);
    if kind == WaypointKind::LoiterTime {
        wp.loiter_secs = Some(item.param1);
    }
    Some(wp)
}

fn base_item(
    command: MavCmd,
    lat: f64,
    lon: f64,
    alt: f64,
    target_system: u8,
    target_component: u8,
) -> MISSION_ITEM_INT_DATA {
    MISSION_ITEM_INT_DATA {
        param1: 0.0,
        param2: 0.0,
        param3: 0.0,
        param4: 0.0,
        x: deg_to_wire(lat),
        y: deg_to_wire(lon),
        z: alt as f32,
        seq: 0,
        command,
        target_system,
        target_component,
        frame: MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT,
        current: 0,
        autocontinue: 1,
    }
}

fn servo_item(
    wp: &MissionWaypoint,
    fleet: &FleetConfig,
    target_system: u8,
    target_component: u8,
) -> MISSION_ITEM_INT_DATA {
    let slot = wp
        .launch_vehicle
        .as_deref()
        .and_then(|id| fleet.vehicle(id))
        .and_then(|spec| spec.slot)
        .unwrap_or(1);
    let mut item =
        base_item(MavCmd::MAV_CMD_DO_SET_SERVO, 0.0, 0.0, 0.0, target_system, target_component);
    item.param1 = f32::from(SERVO_CHANNEL_BASE + slot);
    item.param2 = LAUNCH_SERVO_PWM;
    item
}

fn send(link: &TransferLink, msg: MavMessage) -> Result<(), LinkError> {
    link.writer.lock().unwrap().send(&msg)
}

fn claim_slot(
    transfers: &TransferSlots,
    vehicle: &VehicleId,
) -> Result<(Receiver<MavMessage>, Arc<AtomicBool>, SlotGuard), LinkError> {
    let mut slots = transfers.lock().unwrap();
    if slots.contains_key(vehicle) {
        return Err(LinkError::TransferBusy(vehicle.clone()));
    }
    let (tx, rx) = mpsc::channel();
    let cancel = Arc::new(AtomicBool::new(false));
    slots.insert(vehicle.clone(), TransferHandle { tx, cancel: cancel.clone() });
    Ok((rx, cancel, SlotGuard { transfers: transfers.clone(), vehicle: vehicle.clone() }))
}

/// Frees the transfer slot on every exit path.
struct SlotGuard {
    transfers: TransferSlots,
    vehicle: VehicleId,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.transfers.lock().unwrap().remove(&self.vehicle);
    }
}

fn next_frame(
    vehicle: &VehicleId,
    rx: &Receiver<MavMessage>,
    cancel: &AtomicBool,
    deadline: Instant,
    stage: &'static str,
    partial: bool,
) -> Result<MavMessage, LinkError> {
    loop {
        if cancel.load(Ordering::Relaxed) {
            return Err(LinkError::Cancelled);
        }
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            return Err(LinkError::ProtocolTimeout { vehicle: vehicle.clone(), stage, partial });
        };
        match rx.recv_timeout(remaining.min(Duration::from_millis(50))) {
            Ok(msg) => return Ok(msg),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                return Err(LinkError::TransportRead("router stopped".into()));
            }
        }
    }
}

fn wait_clear_ack(
    link: &TransferLink,
    rx: &Receiver<MavMessage>,
    cancel: &AtomicBool,
    step_timeout: Duration,
) -> Result<(), LinkError> {
    let deadline = Instant::now() + step_timeout;
    loop {
        match next_frame(&link.vehicle, rx, cancel, deadline, "mission clear", false)? {
            MavMessage::MISSION_ACK(ack) => {
                return match ack.mavtype {
                    MavMissionResult::MAV_MISSION_ACCEPTED => Ok(()),
                    other => Err(LinkError::CommandRejected {
                        vehicle: link.vehicle.clone(),
                        what: "mission clear",
                        code: format!("{:?}", other),
                    }),
                };
            }
            _ => continue,
        }
    }
}

fn send_item(
    link: &TransferLink,
    items: &[MISSION_ITEM_INT_DATA],
    seq: u16,
    last: u16,
    all_sent: &mut bool,
) -> Result<(), LinkError> {
    match items.get(seq as usize) {
        Some(item) => {
            debug!("{}: sending mission item {}", link.vehicle, seq);
            send(link, MavMessage::MISSION_ITEM_INT(item.clone()))?;
            if seq == last {
                *all_sent = true;
            }
            Ok(())
        }
        None => {
            warn!(
                "{}: autopilot asked for mission item {} of {}",
                link.vehicle,
                seq,
                items.len()
            );
            Ok(())
        }
    }
}
