//! Session facade over every way a vehicle can reach us.
//!
//! One [`VehicleLink`] owns the telemetry store, the event bus, the reader
//! threads and the router task. Live transports and the simulation engine
//! publish into the same store, so readers never care which one is driving.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mavlink::common::MavMessage;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use roost_fleet::formation::SwarmTrackingConfig;
use roost_fleet::FleetConfig;
use roost_proto::mission::MissionWaypoint;
use roost_proto::telemetry::VehicleTelemetry;
use roost_proto::{VehicleId, VehicleKind};
use roost_sim::{SimEngine, SimEvent, TICK_DT};

use crate::connection::{self, ConnectOutcome, LinkWriter, ReaderThread};
use crate::dispatch::Dispatcher;
use crate::error::LinkError;
use crate::events::{EventBus, LinkEvent};
use crate::mission::TransferSlots;
use crate::quickfly::QuickFly;
use crate::router::{self, Inbound, Route, RouterDeps, SharedRegistry, VehicleConn};
use crate::store::TelemetryStore;
use crate::transport::{self, Endpoint, TransportPair};

/// How long a connect waits for the first autopilot heartbeat.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-step deadline inside mission transfers.
pub const TRANSFER_STEP_TIMEOUT: Duration = Duration::from_secs(5);

const ROUTER_QUEUE: usize = 256;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

struct RouterRuntime {
    tx: mpsc::Sender<Inbound>,
    handle: tokio::task::JoinHandle<()>,
}

struct SimDriver {
    stop: Arc<AtomicBool>,
    handle: tokio::task::JoinHandle<()>,
}

pub struct VehicleLink {
    fleet: Arc<FleetConfig>,
    store: TelemetryStore,
    bus: EventBus,
    registry: SharedRegistry,
    transfers: TransferSlots,
    sim: Arc<Mutex<Option<SimEngine>>>,
    dispatch: Dispatcher,
    heartbeat_timeout: Duration,
    readers: Mutex<Vec<ReaderThread>>,
    router: Mutex<Option<RouterRuntime>>,
    sim_driver: Mutex<Option<SimDriver>>,
}

impl VehicleLink {
    pub fn new(fleet: FleetConfig) -> Self {
        Self::with_timeouts(fleet, HEARTBEAT_TIMEOUT, TRANSFER_STEP_TIMEOUT)
    }

    /// Same as [`VehicleLink::new`] with the two protocol deadlines
    /// overridable. The test suite shrinks them to keep failure paths
    /// fast.
    pub fn with_timeouts(
        fleet: FleetConfig,
        heartbeat_timeout: Duration,
        transfer_step: Duration,
    ) -> Self {
        let fleet = Arc::new(fleet);
        let store = TelemetryStore::new();
        let bus = EventBus::default();
        let registry: SharedRegistry = Arc::new(Mutex::new(HashMap::new()));
        let transfers: TransferSlots = Arc::new(Mutex::new(HashMap::new()));
        let sim: Arc<Mutex<Option<SimEngine>>> = Arc::new(Mutex::new(None));
        let deps = RouterDeps {
            store: store.clone(),
            bus: bus.clone(),
            fleet: fleet.clone(),
            registry: registry.clone(),
            transfers: transfers.clone(),
        };
        let dispatch = Dispatcher::new(deps, sim.clone(), transfer_step);
        Self {
            fleet,
            store,
            bus,
            registry,
            transfers,
            sim,
            dispatch,
            heartbeat_timeout,
            readers: Mutex::new(Vec::new()),
            router: Mutex::new(None),
            sim_driver: Mutex::new(None),
        }
    }

    fn shared_deps(&self) -> RouterDeps {
        RouterDeps {
            store: self.store.clone(),
            bus: self.bus.clone(),
            fleet: self.fleet.clone(),
            registry: self.registry.clone(),
            transfers: self.transfers.clone(),
        }
    }

    /// Router task shared by every transport, started on first use.
    fn router_tx(&self) -> mpsc::Sender<Inbound> {
        let mut slot = self.router.lock().unwrap();
        if let Some(rt) = slot.as_ref() {
            return rt.tx.clone();
        }
        let (tx, rx) = mpsc::channel(ROUTER_QUEUE);
        let handle = router::spawn_router(self.shared_deps(), rx);
        *slot = Some(RouterRuntime { tx: tx.clone(), handle });
        tx
    }

    /// Connects the vehicles named in the map (vehicle id to endpoint
    /// URL), one transport each. A vehicle that fails to come up does not
    /// stop the rest; the first error surfaces only when nobody connected
    /// at all.
    pub async fn connect_sitl(
        &self,
        endpoints: &BTreeMap<String, String>,
    ) -> Result<Vec<VehicleId>, LinkError> {
        let mut connected = Vec::new();
        let mut first_err = None;
        for (vehicle, url) in endpoints {
            if self.fleet.vehicle(vehicle).is_none() {
                warn!("{}: not in the fleet, skipping {}", vehicle, url);
                continue;
            }
            match self.connect_direct(vehicle, url).await {
                Ok(()) => connected.push(vehicle.clone()),
                Err(err) => {
                    warn!("{}: connect failed: {}", vehicle, err);
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }
        if connected.is_empty() {
            if let Some(err) = first_err {
                return Err(err);
            }
        }
        Ok(connected)
    }

    async fn connect_direct(&self, vehicle: &str, url: &str) -> Result<(), LinkError> {
        let endpoint = Endpoint::parse(url)?;
        let expected = self.fleet.kind_of(vehicle);
        let timeout = self.heartbeat_timeout;
        let id = vehicle.to_string();
        let outcome = tokio::task::spawn_blocking(move || {
            connection::open_direct(&id, &endpoint, expected, timeout)
        })
        .await
        .map_err(|_| LinkError::TransportRead("connect worker died".into()))??;
        self.adopt(outcome);
        Ok(())
    }

    fn adopt(&self, outcome: ConnectOutcome) {
        let ConnectOutcome {
            vehicle,
            kind,
            system_id,
            component_id,
            writer,
            reader,
            seed,
            label,
        } = outcome;
        self.registry.lock().unwrap().insert(
            vehicle.clone(),
            VehicleConn { writer, kind, system_id, component_id },
        );
        self.store.register(&vehicle);
        self.store.replace(&vehicle, seed);
        self.bus.emit(LinkEvent::ConnectionChanged {
            vehicle: vehicle.clone(),
            connected: true,
        });
        let tx = self.router_tx();
        let reader = connection::spawn_reader(label, reader, Route::Direct(vehicle), tx);
        self.readers.lock().unwrap().push(reader);
    }

    /// One serial transport carrying the whole fleet. Vehicles register
    /// themselves as their heartbeats arrive; the probe heartbeat that
    /// proves the bus is alive registers the first one right away.
    pub async fn connect_hardware(&self, port: &str, baud: u32) -> Result<(), LinkError> {
        let endpoint = Endpoint::Serial { dev: port.to_string(), baud };
        let label = endpoint.to_string();
        let timeout = self.heartbeat_timeout;
        let probe_label = label.clone();
        let (pair, header, hb) = tokio::task::spawn_blocking(move || {
            let mut pair = transport::open(&endpoint)?;
            let (header, hb) =
                connection::wait_for_heartbeat(&probe_label, pair.reader.as_mut(), timeout)?;
            Ok::<_, LinkError>((pair, header, hb))
        })
        .await
        .map_err(|_| LinkError::TransportRead("connect worker died".into()))??;

        let writer = self.adopt_bus(pair);
        // Replay the probe heartbeat so the first vehicle does not wait a
        // beat to register.
        router::handle_inbound(
            &self.shared_deps(),
            Inbound {
                route: Route::Bus(writer),
                header,
                msg: MavMessage::HEARTBEAT(hb),
            },
        );
        info!("fleet bus up on {}", label);
        Ok(())
    }

    fn adopt_bus(&self, pair: TransportPair) -> Arc<Mutex<LinkWriter>> {
        let TransportPair { label, reader, writer } = pair;
        let writer = Arc::new(Mutex::new(LinkWriter::new(writer)));
        let tx = self.router_tx();
        let reader = connection::spawn_reader(label, reader, Route::Bus(writer.clone()), tx);
        self.readers.lock().unwrap().push(reader);
        writer
    }

    /// Cellular fallback door: wait on a UDP port for the carrier to dial
    /// in. Whoever talks to us is pinned to the primary carrier's slot.
    pub async fn connect_backup(&self, host: &str, port: u16) -> Result<VehicleId, LinkError> {
        let Some(primary) = self.fleet.primary_carrier() else {
            return Err(LinkError::UnknownVehicle("no carrier in the fleet".into()));
        };
        let vehicle = primary.id.clone();
        let expected = Some(primary.kind);
        let endpoint = Endpoint::Udp { host: host.to_string(), port };
        let timeout = self.heartbeat_timeout;
        let id = vehicle.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            connection::open_direct(&id, &endpoint, expected, timeout)
        })
        .await
        .map_err(|_| LinkError::TransportRead("connect worker died".into()))??;
        self.adopt(outcome);
        info!("{}: backup link active", vehicle);
        Ok(vehicle)
    }

    /// Connects one vehicle over an in-process transport pair. The test
    /// suite drives the far end with a scripted autopilot.
    pub async fn connect_channel(
        &self,
        vehicle: &str,
        pair: TransportPair,
    ) -> Result<(), LinkError> {
        let expected = self.fleet.kind_of(vehicle);
        let timeout = self.heartbeat_timeout;
        let id = vehicle.to_string();
        let outcome = tokio::task::spawn_blocking(move || {
            connection::open_pair(&id, pair, expected, timeout)
        })
        .await
        .map_err(|_| LinkError::TransportRead("connect worker died".into()))??;
        self.adopt(outcome);
        Ok(())
    }

    /// Shared-bus variant of [`VehicleLink::connect_channel`]. No
    /// handshake, vehicles register as they speak.
    pub fn connect_bus_channel(&self, pair: TransportPair) {
        self.adopt_bus(pair);
    }

    /// Replaces live links with the deterministic engine. Every fleet
    /// vehicle comes up at once.
    pub fn start_sim(&self, seed: u64) -> Vec<VehicleId> {
        if let Some(old) = self.sim_driver.lock().unwrap().take() {
            old.stop.store(true, Ordering::Relaxed);
        }

        let engine = SimEngine::from_fleet(&self.fleet, seed);
        let ids = engine.vehicle_ids();
        for id in &ids {
            self.store.register(id);
            if let Some(t) = engine.telemetry(id) {
                self.store.replace(id, t.clone());
            }
            self.bus.emit(LinkEvent::ConnectionChanged {
                vehicle: id.clone(),
                connected: true,
            });
        }
        *self.sim.lock().unwrap() = Some(engine);

        let stop = Arc::new(AtomicBool::new(false));
        let handle = spawn_sim_driver(
            self.sim.clone(),
            self.store.clone(),
            self.bus.clone(),
            stop.clone(),
        );
        *self.sim_driver.lock().unwrap() = Some(SimDriver { stop, handle });
        info!("simulation up, {} vehicles (seed {})", ids.len(), seed);
        ids
    }

    /// Stops the engine. Snapshots stay readable but stop refreshing.
    pub async fn stop_sim(&self) {
        let driver = self.sim_driver.lock().unwrap().take();
        if let Some(SimDriver { stop, handle }) = driver {
            stop.store(true, Ordering::Relaxed);
            join_with_grace(handle, "sim driver").await;
        }
        let engine = self.sim.lock().unwrap().take();
        if let Some(engine) = engine {
            for vehicle in engine.vehicle_ids() {
                self.bus.emit(LinkEvent::ConnectionChanged {
                    vehicle,
                    connected: false,
                });
            }
            info!("simulation stopped");
        }
    }

    /// Tears down every session: simulation, readers, transfers, router.
    pub async fn disconnect_all(&self) {
        self.stop_sim().await;

        let readers: Vec<ReaderThread> = {
            let mut guard = self.readers.lock().unwrap();
            guard.drain(..).collect()
        };
        for reader in &readers {
            reader.stop.store(true, Ordering::Relaxed);
        }
        for ReaderThread { label, handle, .. } in readers {
            join_with_grace(handle, &label).await;
        }

        {
            let transfers = self.transfers.lock().unwrap();
            for transfer in transfers.values() {
                transfer.cancel.store(true, Ordering::Relaxed);
            }
        }

        let vehicles: Vec<VehicleId> = {
            let mut registry = self.registry.lock().unwrap();
            let ids = registry.keys().cloned().collect();
            registry.clear();
            ids
        };
        for vehicle in vehicles {
            info!("{}: disconnected", vehicle);
            self.bus.emit(LinkEvent::ConnectionChanged {
                vehicle,
                connected: false,
            });
        }

        // Router drains and exits once the last reader sender is gone.
        let router = self.router.lock().unwrap().take();
        if let Some(RouterRuntime { tx, handle }) = router {
            drop(tx);
            join_with_grace(handle, "router").await;
        }
    }

    pub fn fleet(&self) -> &FleetConfig {
        &self.fleet
    }

    /// Subscribe to the notification stream.
    pub fn events(&self) -> broadcast::Receiver<LinkEvent> {
        self.bus.subscribe()
    }

    pub fn telemetry(&self, vehicle: &str) -> Option<VehicleTelemetry> {
        self.store.snapshot(vehicle)
    }

    /// Watch one vehicle's snapshots without polling.
    pub fn watch(&self, vehicle: &str) -> Option<watch::Receiver<VehicleTelemetry>> {
        self.store.watch(vehicle)
    }

    /// Every vehicle that had a session this run, sorted.
    pub fn vehicle_ids(&self) -> Vec<VehicleId> {
        self.store.vehicle_ids()
    }

    /// Fresh heartbeat within the stale window.
    pub fn is_connected(&self, vehicle: &str) -> bool {
        self.store.is_connected(vehicle)
    }

    pub fn kind_of(&self, vehicle: &str) -> Option<VehicleKind> {
        self.dispatch.kind_of(vehicle)
    }

    pub fn is_attached(&self, vehicle: &str) -> bool {
        self.dispatch.is_attached(vehicle)
    }

    pub fn sim_active(&self) -> bool {
        self.sim.lock().unwrap().is_some()
    }

    pub fn set_mode(&self, vehicle: &str, mode: &str) -> Result<(), LinkError> {
        self.dispatch.set_mode(vehicle, mode)
    }

    pub fn arm(&self, vehicle: &str, armed: bool, force: bool) -> Result<(), LinkError> {
        self.dispatch.arm(vehicle, armed, force)
    }

    pub fn goto(&self, vehicle: &str, lat: f64, lon: f64, alt: f64) -> Result<(), LinkError> {
        self.dispatch.goto(vehicle, lat, lon, alt)
    }

    pub fn takeoff(&self, vehicle: &str, altitude: f64) -> Result<(), LinkError> {
        self.dispatch.takeoff(vehicle, altitude)
    }

    pub fn land(&self, vehicle: &str) -> Result<(), LinkError> {
        self.dispatch.land(vehicle)
    }

    pub fn change_altitude(&self, vehicle: &str, altitude: f64) -> Result<(), LinkError> {
        self.dispatch.change_altitude(vehicle, altitude)
    }

    pub fn rtl(&self, vehicle: &str) -> Result<(), LinkError> {
        self.dispatch.rtl(vehicle)
    }

    /// Recall everything with a session, best effort per vehicle.
    pub fn rtl_all(&self) -> Vec<(VehicleId, Result<(), LinkError>)> {
        self.dispatch.rtl_all()
    }

    pub fn set_vehicle_position(
        &self,
        vehicle: &str,
        lat: f64,
        lon: f64,
        alt: f64,
        heading: Option<f64>,
    ) -> Result<(), LinkError> {
        self.dispatch.set_vehicle_position(vehicle, lat, lon, alt, heading)
    }

    pub fn activate_swarm(&self, config: SwarmTrackingConfig) {
        self.dispatch.activate_swarm(config)
    }

    pub fn deactivate_swarm(&self) {
        self.dispatch.deactivate_swarm()
    }

    pub fn swarm_config(&self) -> Option<SwarmTrackingConfig> {
        self.dispatch.swarm_config()
    }

    pub fn mark_released(&self, vehicle: &str) -> Result<(), LinkError> {
        self.dispatch.mark_released(vehicle)
    }

    pub async fn upload_mission(
        &self,
        vehicle: &str,
        waypoints: Vec<MissionWaypoint>,
    ) -> Result<(), LinkError> {
        self.dispatch.upload_mission(vehicle, waypoints).await
    }

    pub async fn download_mission(
        &self,
        vehicle: &str,
    ) -> Result<Vec<MissionWaypoint>, LinkError> {
        self.dispatch.download_mission(vehicle).await
    }

    /// Flags a running transfer to bail at its next step.
    pub fn cancel_transfer(&self, vehicle: &str) -> bool {
        self.dispatch.cancel_transfer(vehicle)
    }

    /// Fire-and-watch takeoff sequence; see [`QuickFly`].
    pub fn quick_fly(&self, vehicle: &str, altitude: f64) -> Result<QuickFly, LinkError> {
        self.dispatch.quick_fly(vehicle, altitude)
    }
}

fn spawn_sim_driver(
    sim: Arc<Mutex<Option<SimEngine>>>,
    store: TelemetryStore,
    bus: EventBus,
    stop: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs_f64(TICK_DT));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if stop.load(Ordering::Relaxed) {
                break;
            }
            // Tick inside a block so the lock is gone before the next await.
            let output = {
                let mut engine = sim.lock().unwrap();
                match engine.as_mut() {
                    Some(engine) => engine.tick(),
                    None => break,
                }
            };
            for (vehicle, telemetry) in output.updates {
                store.replace(&vehicle, telemetry.clone());
                bus.emit(LinkEvent::TelemetryChanged { vehicle, telemetry });
            }
            for event in output.events {
                bus.emit(match event {
                    SimEvent::ModeChanged { vehicle, mode } => {
                        LinkEvent::ModeChanged { vehicle, mode }
                    }
                    SimEvent::WaypointReached { vehicle, index } => LinkEvent::WaypointReached {
                        vehicle,
                        index: index as u16,
                    },
                    SimEvent::LaunchTriggered { carrier, vehicle } => {
                        LinkEvent::LaunchTriggered { carrier, vehicle }
                    }
                });
            }
        }
        debug!("sim driver stopped");
    })
}

async fn join_with_grace(mut handle: tokio::task::JoinHandle<()>, what: &str) {
    if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
        warn!("{}: did not stop in time, aborting", what);
        handle.abort();
    }
}
