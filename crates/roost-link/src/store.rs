//! Per-vehicle telemetry slots.
//!
//! Each vehicle owns a `tokio::sync::watch` channel: the router (live links)
//! or the simulation driver publishes snapshots into the sender half, and
//! any number of readers hold receivers without ever contending with the
//! writer. The registry lock is only held to look a slot up, never while
//! reading or writing telemetry.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use roost_proto::telemetry::VehicleTelemetry;
use roost_proto::VehicleId;
use tokio::sync::watch;

#[derive(Debug, Clone, Default)]
pub struct TelemetryStore {
    slots: Arc<RwLock<HashMap<VehicleId, watch::Sender<VehicleTelemetry>>>>,
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the slot for a vehicle if it does not exist yet.
    pub fn register(&self, id: &str) {
        let mut slots = self.slots.write().unwrap();
        slots
            .entry(id.to_string())
            .or_insert_with(|| watch::channel(VehicleTelemetry::default()).0);
    }

    /// Mutate a vehicle's record in place and notify watchers. Returns
    /// false for vehicles that were never registered.
    pub fn update(&self, id: &str, f: impl FnOnce(&mut VehicleTelemetry)) -> bool {
        let slots = self.slots.read().unwrap();
        match slots.get(id) {
            Some(tx) => {
                tx.send_modify(f);
                true
            }
            None => false,
        }
    }

    /// Replace a vehicle's record wholesale (simulation driver path).
    pub fn replace(&self, id: &str, telemetry: VehicleTelemetry) -> bool {
        let slots = self.slots.read().unwrap();
        match slots.get(id) {
            Some(tx) => {
                tx.send_replace(telemetry);
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self, id: &str) -> Option<VehicleTelemetry> {
        let slots = self.slots.read().unwrap();
        slots.get(id).map(|tx| tx.borrow().clone())
    }

    /// Subscribe to one vehicle's snapshots.
    pub fn watch(&self, id: &str) -> Option<watch::Receiver<VehicleTelemetry>> {
        let slots = self.slots.read().unwrap();
        slots.get(id).map(|tx| tx.subscribe())
    }

    /// Liveness is derived from heartbeat age, never stored.
    pub fn is_connected(&self, id: &str) -> bool {
        self.snapshot(id).map(|t| t.is_connected()).unwrap_or(false)
    }

    pub fn vehicle_ids(&self) -> Vec<VehicleId> {
        let slots = self.slots.read().unwrap();
        let mut ids: Vec<VehicleId> = slots.keys().cloned().collect();
        ids.sort();
        ids
    }
}
