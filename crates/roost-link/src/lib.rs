//! Vehicle link layer: transports, frame routing, telemetry state and the
//! command surface.
//!
//! A [`VehicleLink`] session speaks MAVLink to real autopilots over TCP,
//! UDP or serial, or to the in-process simulation engine, behind one API.
//! Inbound frames flow reader thread to router task to telemetry store,
//! with change notifications fanning out on a broadcast bus. Commands go
//! the other way through the dispatcher, which picks the live writer or
//! the engine per vehicle.

pub mod connection;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod link;
pub mod mission;
pub mod quickfly;
pub mod router;
pub mod store;
pub mod transport;

pub use dispatch::Dispatcher;
pub use error::LinkError;
pub use events::{EventBus, LinkEvent};
pub use link::{VehicleLink, HEARTBEAT_TIMEOUT, TRANSFER_STEP_TIMEOUT};
pub use quickfly::{QuickFly, QuickFlyStage};
pub use store::TelemetryStore;

/// MAVLink system id this station claims on every outgoing frame.
pub const GCS_SYSTEM_ID: u8 = 255;
