use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use roost_fleet::{FleetConfig, ProfileTable, VehicleSpec};
use roost_link::transport::Endpoint;
use roost_link::{LinkEvent, QuickFlyStage, VehicleLink};
use roost_proto::mission::MissionWaypoint;
use roost_proto::status;

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Parser)]
#[command(name = "roost", version, about = "NAVroost - carrier fleet ground station link")]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the config file without opening any link.
    Doctor,
    /// Fly the whole fleet in the built-in simulator and tail events.
    Sim {
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Connect the [sitl] endpoints and tail events.
    Sitl,
    /// Guided arm-and-takeoff for one vehicle.
    Fly {
        vehicle: String,
        #[arg(long, default_value_t = 30.0)]
        alt: f64,
    },
    Mission {
        #[command(subcommand)]
        cmd: MissionCmd,
    },
}

#[derive(Debug, Subcommand)]
enum MissionCmd {
    /// Upload a TOML waypoint file to a vehicle.
    Up { vehicle: String, file: String },
    /// Download and print a vehicle's stored mission.
    Down { vehicle: String },
}

#[derive(Debug, serde::Deserialize)]
struct Config {
    fleet: FleetCfg,
    #[serde(default)]
    profiles: ProfileTable,

    sitl: Option<BTreeMap<String, String>>,
    hardware: Option<HardwareCfg>,
    backup: Option<BackupCfg>,
    sim: Option<SimCfg>,
}

#[derive(Debug, serde::Deserialize)]
struct FleetCfg {
    vehicles: Vec<VehicleSpec>,
}

#[derive(Debug, serde::Deserialize)]
struct HardwareCfg {
    port: String,
    baud: u32,
}

#[derive(Debug, serde::Deserialize)]
struct BackupCfg {
    host: String,
    port: u16,
}

#[derive(Debug, serde::Deserialize)]
struct SimCfg {
    seed: Option<u64>,
}

#[derive(Debug, serde::Deserialize)]
struct MissionFile {
    waypoints: Vec<MissionWaypoint>,
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).context("read config")?;
    Ok(toml::from_str(&s).context("parse config toml")?)
}

fn fleet_of(cfg: &Config) -> FleetConfig {
    FleetConfig {
        vehicles: cfg.fleet.vehicles.clone(),
        profiles: cfg.profiles.clone(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg).await?,
        Command::Sim { seed } => sim(&cfg, seed).await?,
        Command::Sitl => sitl(&cfg).await?,
        Command::Fly { vehicle, alt } => fly(&cfg, &vehicle, alt).await?,
        Command::Mission { cmd } => mission(&cfg, cmd).await?,
    }
    Ok(())
}

async fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    let fleet = fleet_of(cfg);
    roost_fleet::doctor::check_fleet(&fleet)?;
    roost_fleet::doctor::check_profiles(&fleet)?;

    if let Some(endpoints) = &cfg.sitl {
        for (vehicle, url) in endpoints {
            anyhow::ensure!(fleet.vehicle(vehicle).is_some(), "[sitl] {} not in fleet", vehicle);
            Endpoint::parse(url).with_context(|| format!("[sitl] {}", vehicle))?;
        }
    }
    if let Some(hw) = &cfg.hardware {
        anyhow::ensure!(!hw.port.is_empty(), "hardware.port missing");
        anyhow::ensure!(hw.baud > 0, "hardware.baud invalid");
    }
    if let Some(b) = &cfg.backup {
        anyhow::ensure!(!b.host.is_empty(), "backup.host missing");
        anyhow::ensure!(b.port != 0, "backup.port invalid");
        anyhow::ensure!(
            fleet.primary_carrier().is_some(),
            "[backup] needs a fixed-wing carrier in the fleet"
        );
    }

    info!("doctor: OK");
    Ok(())
}

async fn sim(cfg: &Config, seed: Option<u64>) -> Result<()> {
    let link = VehicleLink::new(fleet_of(cfg));
    let ids = link.start_sim(sim_seed(cfg, seed));
    println!("{} vehicles up: {}", ids.len(), ids.join(", "));
    watch_events(&link).await
}

async fn sitl(cfg: &Config) -> Result<()> {
    let endpoints = cfg.sitl.as_ref().context("no [sitl] config section")?;
    let link = VehicleLink::new(fleet_of(cfg));
    let up = link.connect_sitl(endpoints).await?;
    println!("{} vehicles up: {}", up.len(), up.join(", "));
    watch_events(&link).await
}

async fn fly(cfg: &Config, vehicle: &str, alt: f64) -> Result<()> {
    let link = VehicleLink::new(fleet_of(cfg));
    bring_up(&link, cfg).await?;

    let qf = link.quick_fly(vehicle, alt)?;
    let mut stages = qf.watch();
    let who = vehicle.to_string();
    tokio::spawn(async move {
        let stage = *stages.borrow();
        info!("{}: {:?}", who, stage);
        while stages.changed().await.is_ok() {
            let stage = *stages.borrow();
            info!("{}: {:?}", who, stage);
        }
    });

    let stage = qf.wait().await;
    if let Some(t) = link.telemetry(vehicle) {
        println!(
            "{} mode={} alt={:.0} armed={}",
            vehicle, t.mode, t.alt, t.armed
        );
    }
    link.disconnect_all().await;
    anyhow::ensure!(stage == QuickFlyStage::Done, "quick fly stopped at {:?}", stage);
    Ok(())
}

async fn mission(cfg: &Config, cmd: MissionCmd) -> Result<()> {
    let link = VehicleLink::new(fleet_of(cfg));
    bring_up(&link, cfg).await?;

    let outcome = match cmd {
        MissionCmd::Up { vehicle, file } => {
            let s = std::fs::read_to_string(&file).context("read mission file")?;
            let mf: MissionFile = toml::from_str(&s).context("parse mission toml")?;
            let count = mf.waypoints.len();
            let res = link.upload_mission(&vehicle, mf.waypoints).await;
            if res.is_ok() {
                println!("{}: {} waypoints uploaded", vehicle, count);
            }
            res.map_err(anyhow::Error::from)
        }
        MissionCmd::Down { vehicle } => match link.download_mission(&vehicle).await {
            Ok(wps) => {
                println!("{}: {} waypoints", vehicle, wps.len());
                for (i, wp) in wps.iter().enumerate() {
                    println!("wp {} {}", i, describe(wp));
                }
                Ok(())
            }
            Err(e) => Err(anyhow::Error::from(e)),
        },
    };

    link.disconnect_all().await;
    outcome
}

fn describe(wp: &MissionWaypoint) -> String {
    let mut line = format!(
        "kind={:?} lat={:.7} lon={:.7} alt={:.1}",
        wp.kind, wp.lat, wp.lon, wp.alt
    );
    if let Some(s) = wp.speed {
        line.push_str(&format!(" speed={}", s));
    }
    if let Some(t) = wp.loiter_secs {
        line.push_str(&format!(" loiter={}s", t));
    }
    if let Some(v) = &wp.launch_vehicle {
        line.push_str(&format!(" launches={}", v));
    }
    line
}

// --- link bring-up helpers ---

/// One-shot commands take whatever link the config describes, most
/// capable first.
async fn bring_up(link: &VehicleLink, cfg: &Config) -> Result<()> {
    if let Some(endpoints) = &cfg.sitl {
        let up = link.connect_sitl(endpoints).await?;
        info!("sitl: {} vehicles up", up.len());
        return Ok(());
    }
    if let Some(hw) = &cfg.hardware {
        link.connect_hardware(&hw.port, hw.baud).await?;
        return Ok(());
    }
    if let Some(b) = &cfg.backup {
        let v = link.connect_backup(&b.host, b.port).await?;
        info!("{}: backup link only", v);
        return Ok(());
    }
    link.start_sim(sim_seed(cfg, None));
    Ok(())
}

fn sim_seed(cfg: &Config, flag: Option<u64>) -> u64 {
    flag.or(cfg.sim.as_ref().and_then(|s| s.seed))
        .unwrap_or_else(|| time::OffsetDateTime::now_utc().unix_timestamp() as u64)
}

async fn watch_events(link: &VehicleLink) -> Result<()> {
    let mut events = link.events();
    let mut status_board = tokio::time::interval(Duration::from_secs(10));
    status_board.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c, shutting down");
                break;
            }
            _ = status_board.tick() => print_fleet(link),
            ev = events.recv() => match ev {
                Ok(ev) => print_event(&ev),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("event feed lagged, {} dropped", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    link.disconnect_all().await;
    Ok(())
}

fn print_fleet(link: &VehicleLink) {
    for id in link.vehicle_ids() {
        let Some(t) = link.telemetry(&id) else { continue };
        println!(
            "{} {} {} mode={} alt={:.0} batt={:.0}% sats={}",
            stamp(),
            id,
            if link.is_connected(&id) { "up" } else { "stale" },
            t.mode,
            t.alt,
            t.battery_pct,
            t.gps_sats
        );
    }
}

fn print_event(ev: &LinkEvent) {
    // Telemetry ticks arrive at 10 Hz per vehicle; the status board
    // covers them.
    let line = match ev {
        LinkEvent::TelemetryChanged { .. } => return,
        LinkEvent::ConnectionChanged { vehicle, connected } => {
            format!("{} {}", vehicle, if *connected { "connected" } else { "disconnected" })
        }
        LinkEvent::ModeChanged { vehicle, mode } => format!("{} mode {}", vehicle, mode),
        LinkEvent::ArmedChanged { vehicle, armed } => {
            format!("{} {}", vehicle, if *armed { "armed" } else { "disarmed" })
        }
        LinkEvent::WaypointReached { vehicle, index } => {
            format!("{} reached waypoint {}", vehicle, index)
        }
        LinkEvent::LaunchTriggered { carrier, vehicle } => {
            format!("{} launching {}", carrier, vehicle)
        }
        LinkEvent::StatusText { vehicle, severity, text } => {
            format!("{} [{}] {}", vehicle, status::severity_name(*severity), text)
        }
    };
    println!("{} {}", stamp(), line);
}

fn stamp() -> String {
    let now = time::OffsetDateTime::now_utc();
    let fmt = time::macros::format_description!("[hour]:[minute]:[second]");
    now.format(&fmt).unwrap_or_else(|_| now.unix_timestamp().to_string())
}
