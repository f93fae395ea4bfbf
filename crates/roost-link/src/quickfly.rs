//! Guided-takeoff sequencer.
//!
//! Runs the bench-test bring-up as a background task: GPS gate, GUIDED,
//! force-arm, arm confirmation, then a takeoff for rotary airframes. The
//! GPS and arming gates are advisory and fall through with a warning;
//! command failures abandon the sequence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use roost_proto::{VehicleId, VehicleKind};

use crate::dispatch::Dispatcher;
use crate::error::LinkError;

const GPS_WAIT: Duration = Duration::from_secs(30);
const GPS_POLL: Duration = Duration::from_millis(500);
const SETTLE: Duration = Duration::from_millis(1500);
const ARM_WAIT: Duration = Duration::from_secs(5);
const ARM_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuickFlyStage {
    WaitGps,
    SetGuided,
    Arm,
    ConfirmArm,
    Takeoff,
    Done,
    Failed,
}

/// Handle on a running sequence.
pub struct QuickFly {
    stage: watch::Receiver<QuickFlyStage>,
    cancel: Arc<AtomicBool>,
    handle: tokio::task::JoinHandle<()>,
}

impl QuickFly {
    pub fn stage(&self) -> QuickFlyStage {
        *self.stage.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<QuickFlyStage> {
        self.stage.clone()
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Waits the sequence out and reports the terminal stage.
    pub async fn wait(self) -> QuickFlyStage {
        let _ = self.handle.await;
        *self.stage.borrow()
    }
}

pub(crate) fn start(dispatcher: Dispatcher, vehicle: VehicleId, altitude: f64) -> QuickFly {
    let (tx, rx) = watch::channel(QuickFlyStage::WaitGps);
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    let handle = tokio::spawn(async move {
        info!("{}: quick fly to {}m", vehicle, altitude);
        match run(&dispatcher, &vehicle, altitude, &tx, &flag).await {
            Ok(()) => {
                let _ = tx.send(QuickFlyStage::Done);
                info!("{}: quick fly sequence complete", vehicle);
            }
            Err(e) => {
                let _ = tx.send(QuickFlyStage::Failed);
                warn!("{}: quick fly abandoned: {}", vehicle, e);
            }
        }
    });
    QuickFly { stage: rx, cancel, handle }
}

async fn run(
    dispatcher: &Dispatcher,
    vehicle: &VehicleId,
    altitude: f64,
    tx: &watch::Sender<QuickFlyStage>,
    cancel: &AtomicBool,
) -> Result<(), LinkError> {
    let _ = tx.send(QuickFlyStage::WaitGps);
    let deadline = Instant::now() + GPS_WAIT;
    loop {
        check_cancel(cancel)?;
        match dispatcher.telemetry(vehicle) {
            Some(t) if t.has_3d_fix() => {
                info!("{}: 3D fix with {} sats", vehicle, t.gps_sats);
                break;
            }
            _ => {}
        }
        if Instant::now() >= deadline {
            warn!("{}: no 3D fix yet, pressing on with force arm", vehicle);
            break;
        }
        tokio::time::sleep(GPS_POLL).await;
    }

    let _ = tx.send(QuickFlyStage::SetGuided);
    check_cancel(cancel)?;
    dispatcher.set_mode(vehicle, "GUIDED")?;
    tokio::time::sleep(SETTLE).await;

    let _ = tx.send(QuickFlyStage::Arm);
    check_cancel(cancel)?;
    dispatcher.arm(vehicle, true, true)?;
    tokio::time::sleep(SETTLE).await;

    let _ = tx.send(QuickFlyStage::ConfirmArm);
    let deadline = Instant::now() + ARM_WAIT;
    loop {
        check_cancel(cancel)?;
        if dispatcher.telemetry(vehicle).map(|t| t.armed).unwrap_or(false) {
            info!("{}: arming confirmed", vehicle);
            break;
        }
        if Instant::now() >= deadline {
            warn!("{}: arming not confirmed, continuing anyway", vehicle);
            break;
        }
        tokio::time::sleep(ARM_POLL).await;
    }

    let _ = tx.send(QuickFlyStage::Takeoff);
    check_cancel(cancel)?;
    match dispatcher.kind_of(vehicle) {
        Some(VehicleKind::FixedWing) => {
            info!("{}: armed in GUIDED, send a goto to get airborne", vehicle);
        }
        _ => {
            dispatcher.takeoff(vehicle, altitude)?;
            info!("{}: takeoff to {}m", vehicle, altitude);
        }
    }
    Ok(())
}

fn check_cancel(cancel: &AtomicBool) -> Result<(), LinkError> {
    if cancel.load(Ordering::Relaxed) {
        Err(LinkError::Cancelled)
    } else {
        Ok(())
    }
}
