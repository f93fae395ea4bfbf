//! Deterministic flight model used when no autopilot is on the other end.
//!
//! The engine steps every vehicle at a fixed 10 Hz on flat-earth
//! geometry. All randomness comes from one seeded generator and vehicles
//! advance in sorted-id order, so a given seed and command sequence
//! always replays the same trajectories. Nothing in here does IO; the
//! link layer owns the clock and feeds engine output to its stores.

pub mod engine;

pub use engine::{SimEngine, SimEvent, TickOutput};

/// Seconds advanced per tick.
pub const TICK_DT: f64 = 0.1;

/// Every simulated vehicle spawns loitering here, 127 m up.
pub const SPAWN_LAT: f64 = 52.0;
pub const SPAWN_LON: f64 = -1.5;
pub const SPAWN_ALT: f64 = 127.0;
