//! Broadcast notifications emitted by the router and the simulation driver.

use roost_proto::telemetry::VehicleTelemetry;
use roost_proto::VehicleId;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Position/speed snapshot changed. Emitted on position and HUD
    /// updates, not on every field write.
    TelemetryChanged {
        vehicle: VehicleId,
        telemetry: VehicleTelemetry,
    },
    ConnectionChanged {
        vehicle: VehicleId,
        connected: bool,
    },
    ModeChanged {
        vehicle: VehicleId,
        mode: String,
    },
    ArmedChanged {
        vehicle: VehicleId,
        armed: bool,
    },
    WaypointReached {
        vehicle: VehicleId,
        index: u16,
    },
    LaunchTriggered {
        carrier: VehicleId,
        vehicle: VehicleId,
    },
    StatusText {
        vehicle: VehicleId,
        severity: u8,
        text: String,
    },
}

/// Fan-out bus. Slow subscribers lag and drop old events rather than
/// backpressuring the router.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LinkEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.tx.subscribe()
    }

    /// Send error just means nobody is listening right now.
    pub fn emit(&self, ev: LinkEvent) {
        let _ = self.tx.send(ev);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_every_subscriber() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(LinkEvent::ModeChanged {
            vehicle: "carrier1".into(),
            mode: "AUTO".into(),
        });

        for rx in [&mut a, &mut b] {
            match rx.recv().await {
                Ok(LinkEvent::ModeChanged { vehicle, mode }) => {
                    assert_eq!(vehicle, "carrier1");
                    assert_eq!(mode, "AUTO");
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.emit(LinkEvent::ConnectionChanged {
            vehicle: "dart1.1".into(),
            connected: true,
        });
    }
}
