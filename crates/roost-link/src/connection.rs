//! Connection bring-up and the shared writer half.
//!
//! A connect follows the same dance for every transport: open, block for
//! the first autopilot heartbeat, seed telemetry from it, then ask the
//! autopilot to stream at [`STREAM_RATE_HZ`] and announce ourselves with a
//! single GCS heartbeat.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use mavlink::common::{
    HEARTBEAT_DATA, MavAutopilot, MavMessage, MavModeFlag, MavState, MavType,
    REQUEST_DATA_STREAM_DATA,
};
use mavlink::MavHeader;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use roost_proto::modes::mode_name;
use roost_proto::telemetry::VehicleTelemetry;
use roost_proto::{VehicleId, VehicleKind};

use crate::error::LinkError;
use crate::router::{Inbound, Route};
use crate::transport::{self, Endpoint, TransportPair, TransportReader, TransportWriter};

/// Telemetry stream rate asked of every autopilot.
pub const STREAM_RATE_HZ: u16 = 4;

const IDLE_SLEEP: Duration = Duration::from_millis(10);

/// Writer half plus the outgoing GCS header state. Sequence numbers are
/// per transport, so a shared bus keeps one writer for every vehicle on
/// it.
pub struct LinkWriter {
    writer: Box<dyn TransportWriter>,
    seq: u8,
}

impl LinkWriter {
    pub fn new(writer: Box<dyn TransportWriter>) -> Self {
        Self { writer, seq: 0 }
    }

    pub fn send(&mut self, msg: &MavMessage) -> Result<(), LinkError> {
        self.seq = self.seq.wrapping_add(1);
        let header = MavHeader {
            system_id: crate::GCS_SYSTEM_ID,
            component_id: 0,
            sequence: self.seq,
        };
        self.writer.send(&header, msg)
    }
}

/// Everything a fresh connection hands back to the link layer.
pub struct ConnectOutcome {
    pub vehicle: VehicleId,
    pub kind: VehicleKind,
    pub system_id: u8,
    pub component_id: u8,
    pub writer: Arc<Mutex<LinkWriter>>,
    pub reader: Box<dyn TransportReader>,
    pub seed: VehicleTelemetry,
    pub label: String,
}

impl std::fmt::Debug for ConnectOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOutcome")
            .field("vehicle", &self.vehicle)
            .field("kind", &self.kind)
            .field("system_id", &self.system_id)
            .field("component_id", &self.component_id)
            .field("seed", &self.seed)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

pub fn open_direct(
    vehicle: &str,
    endpoint: &Endpoint,
    expected: Option<VehicleKind>,
    heartbeat_timeout: Duration,
) -> Result<ConnectOutcome, LinkError> {
    let pair = transport::open(endpoint)?;
    open_pair(vehicle, pair, expected, heartbeat_timeout)
}

/// Runs the bring-up dance over an already open transport.
pub fn open_pair(
    vehicle: &str,
    pair: TransportPair,
    expected: Option<VehicleKind>,
    heartbeat_timeout: Duration,
) -> Result<ConnectOutcome, LinkError> {
    let TransportPair { label, mut reader, writer } = pair;
    debug!("{}: waiting for heartbeat on {}", vehicle, label);
    let (header, hb) = wait_for_heartbeat(vehicle, reader.as_mut(), heartbeat_timeout)?;

    let kind = match VehicleKind::from_mav_type(hb.mavtype as u8) {
        Some(seen) => {
            if let Some(expected) = expected {
                if expected != seen {
                    warn!(
                        "{}: autopilot reports {}, fleet file says {}",
                        vehicle,
                        seen.label(),
                        expected.label()
                    );
                }
            }
            seen
        }
        None => {
            let fallback = expected.unwrap_or(VehicleKind::RotaryWing);
            debug!(
                "{}: unrecognized airframe type {}, treating as {}",
                vehicle, hb.mavtype as u8, fallback.label()
            );
            fallback
        }
    };

    let mut seed = VehicleTelemetry::default();
    seed.mode = mode_name(kind, hb.custom_mode);
    seed.armed = hb.base_mode.contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED);
    seed.last_heartbeat = Some(Instant::now());

    let mut writer = LinkWriter::new(writer);
    writer.send(&request_data_stream(header.system_id, header.component_id, STREAM_RATE_HZ))?;
    writer.send(&gcs_heartbeat())?;
    info!(
        "{}: connected on {} (system {}, {} {})",
        vehicle, label, header.system_id, kind.label(), seed.mode
    );

    Ok(ConnectOutcome {
        vehicle: vehicle.to_string(),
        kind,
        system_id: header.system_id,
        component_id: header.component_id,
        writer: Arc::new(Mutex::new(writer)),
        reader,
        seed,
        label,
    })
}

/// Discards everything until a heartbeat shows up.
pub(crate) fn wait_for_heartbeat(
    vehicle: &str,
    reader: &mut dyn TransportReader,
    timeout: Duration,
) -> Result<(MavHeader, HEARTBEAT_DATA), LinkError> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        match reader.recv()? {
            Some((header, MavMessage::HEARTBEAT(hb))) => return Ok((header, hb)),
            Some(_) => continue,
            None => thread::sleep(IDLE_SLEEP),
        }
    }
    Err(LinkError::ConnectionTimeout {
        vehicle: vehicle.to_string(),
        waited_secs: timeout.as_secs_f64().ceil() as u64,
    })
}

pub fn request_data_stream(target_system: u8, target_component: u8, rate_hz: u16) -> MavMessage {
    MavMessage::REQUEST_DATA_STREAM(REQUEST_DATA_STREAM_DATA {
        req_message_rate: rate_hz,
        target_system,
        target_component,
        // Stream id 0 is "all streams".
        req_stream_id: 0,
        start_stop: 1,
    })
}

pub fn gcs_heartbeat() -> MavMessage {
    MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode: 0,
        mavtype: MavType::MAV_TYPE_GCS,
        autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
        base_mode: MavModeFlag::empty(),
        system_status: MavState::MAV_STATE_ACTIVE,
        mavlink_version: 3,
    })
}

/// Blocking reader pumping frames into the router.
pub struct ReaderThread {
    pub label: String,
    pub stop: Arc<AtomicBool>,
    pub handle: tokio::task::JoinHandle<()>,
}

pub fn spawn_reader(
    label: String,
    mut reader: Box<dyn TransportReader>,
    route: Route,
    tx: mpsc::Sender<Inbound>,
) -> ReaderThread {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    let thread_label = label.clone();
    let handle = tokio::task::spawn_blocking(move || {
        while !flag.load(Ordering::Relaxed) {
            match reader.recv() {
                Ok(Some((header, msg))) => {
                    let inbound = Inbound { route: route.clone(), header, msg };
                    if tx.blocking_send(inbound).is_err() {
                        // Router is gone, nothing left to feed.
                        break;
                    }
                }
                Ok(None) => thread::sleep(IDLE_SLEEP),
                Err(e) => {
                    warn!("{}: transport lost: {}", thread_label, e);
                    break;
                }
            }
        }
        debug!("{}: reader stopped", thread_label);
    });
    ReaderThread { label, stop, handle }
}
