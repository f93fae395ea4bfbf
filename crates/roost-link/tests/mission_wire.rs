//! Wire-level exercises against scripted autopilot peers. Each test
//! connects a [`VehicleLink`] to the in-process channel transport and
//! drives the far end by hand.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mavlink::common::{
    GLOBAL_POSITION_INT_DATA, HEARTBEAT_DATA, MISSION_ACK_DATA, MISSION_COUNT_DATA,
    MISSION_ITEM_INT_DATA, MISSION_REQUEST_INT_DATA, MavAutopilot, MavCmd, MavFrame, MavMessage,
    MavMissionResult, MavModeFlag, MavSeverity, MavState, MavType, STATUSTEXT_DATA,
};
use mavlink::MavHeader;
use tokio::sync::broadcast;

use roost_fleet::profile::PerfOverrides;
use roost_fleet::{FleetConfig, ProfileTable, VehicleSpec};
use roost_link::transport::{channel_pair, ChannelPeer};
use roost_link::{LinkError, LinkEvent, VehicleLink, GCS_SYSTEM_ID};
use roost_proto::mission::{MissionWaypoint, WaypointKind};
use roost_proto::VehicleKind;

const PLANE_SYSID: u8 = 1;
const DART_SYSID: u8 = 2;

fn spec(
    id: &str,
    kind: VehicleKind,
    system_id: u8,
    carrier: Option<&str>,
    slot: Option<u8>,
) -> VehicleSpec {
    VehicleSpec {
        id: id.to_string(),
        kind,
        system_id,
        carrier: carrier.map(str::to_string),
        slot,
        performance: PerfOverrides::default(),
    }
}

fn fleet() -> FleetConfig {
    FleetConfig {
        vehicles: vec![
            spec("carrier1", VehicleKind::FixedWing, PLANE_SYSID, None, None),
            spec("dart1.1", VehicleKind::RotaryWing, DART_SYSID, Some("carrier1"), Some(1)),
        ],
        profiles: ProfileTable::default(),
    }
}

fn test_link() -> VehicleLink {
    VehicleLink::with_timeouts(fleet(), Duration::from_millis(500), Duration::from_millis(200))
}

fn ap_header(system_id: u8) -> MavHeader {
    MavHeader { system_id, component_id: 1, sequence: 0 }
}

fn heartbeat(mavtype: MavType, custom_mode: u32) -> MavMessage {
    MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode,
        mavtype,
        autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
        base_mode: MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED,
        system_status: MavState::MAV_STATE_ACTIVE,
        mavlink_version: 3,
    })
}

fn mission_ack(result: MavMissionResult) -> MavMessage {
    MavMessage::MISSION_ACK(MISSION_ACK_DATA {
        target_system: GCS_SYSTEM_ID,
        target_component: 0,
        mavtype: result,
    })
}

fn mission_request(seq: u16) -> MavMessage {
    MavMessage::MISSION_REQUEST_INT(MISSION_REQUEST_INT_DATA {
        seq,
        target_system: GCS_SYSTEM_ID,
        target_component: 0,
    })
}

fn stored_item(seq: u16, command: MavCmd, x: i32, y: i32, alt: f32) -> MavMessage {
    MavMessage::MISSION_ITEM_INT(MISSION_ITEM_INT_DATA {
        param1: 0.0,
        param2: 0.0,
        param3: 0.0,
        param4: 0.0,
        x,
        y,
        z: alt,
        seq,
        command,
        target_system: GCS_SYSTEM_ID,
        target_component: 0,
        frame: MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT,
        current: 0,
        autocontinue: 1,
    })
}

/// Drains frames from the link until one matches, panicking if none
/// shows up in time.
fn wait_from_link(peer: &ChannelPeer, pred: impl Fn(&MavMessage) -> bool) -> MavMessage {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if let Some((_, msg)) = peer.recv_timeout(Duration::from_millis(100)) {
            if pred(&msg) {
                return msg;
            }
        }
    }
    panic!("link never sent the expected frame");
}

async fn next_matching(
    rx: &mut broadcast::Receiver<LinkEvent>,
    mut pred: impl FnMut(&LinkEvent) -> bool,
) -> LinkEvent {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Ok(ev)) if pred(&ev) => return ev,
            Ok(Ok(_)) => continue,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) => panic!("event bus closed"),
            Err(_) => panic!("timed out waiting for event"),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mission_upload_round_trip_with_launch_row() {
    let link = test_link();
    let (pair, peer) = channel_pair("chan:carrier1");
    peer.send(ap_header(PLANE_SYSID), heartbeat(MavType::MAV_TYPE_FIXED_WING, 12));
    link.connect_channel("carrier1", pair).await.expect("connects");

    let autopilot = thread::spawn(move || {
        wait_from_link(&peer, |m| matches!(m, MavMessage::MISSION_CLEAR_ALL(_)));
        peer.send(ap_header(PLANE_SYSID), mission_ack(MavMissionResult::MAV_MISSION_ACCEPTED));

        let count = match wait_from_link(&peer, |m| matches!(m, MavMessage::MISSION_COUNT(_))) {
            MavMessage::MISSION_COUNT(c) => c.count,
            _ => unreachable!(),
        };

        let mut items = Vec::new();
        for seq in 0..count {
            peer.send(ap_header(PLANE_SYSID), mission_request(seq));
            match wait_from_link(&peer, |m| matches!(m, MavMessage::MISSION_ITEM_INT(_))) {
                MavMessage::MISSION_ITEM_INT(item) => items.push(item),
                _ => unreachable!(),
            }
        }
        peer.send(ap_header(PLANE_SYSID), mission_ack(MavMissionResult::MAV_MISSION_ACCEPTED));
        items
    });

    let launch = MissionWaypoint {
        launch_vehicle: Some("dart1.1".to_string()),
        ..MissionWaypoint::new(WaypointKind::Launch, 52.001, -1.5, 60.0)
    };
    let mission = vec![
        MissionWaypoint::new(WaypointKind::Takeoff, 52.0, -1.5, 40.0),
        launch,
        MissionWaypoint::new(WaypointKind::Waypoint, 52.002, -1.5, 60.0),
    ];
    link.upload_mission("carrier1", mission).await.expect("upload succeeds");

    // home dup, takeoff, launch point, release servo, waypoint
    let items = autopilot.join().expect("autopilot script");
    assert_eq!(items.len(), 5);
    assert_eq!(items[0].command, MavCmd::MAV_CMD_NAV_WAYPOINT);
    assert_eq!(items[0].x, 520_000_000);
    assert_eq!(items[0].current, 1);
    assert_eq!(items[1].command, MavCmd::MAV_CMD_NAV_TAKEOFF);
    assert_eq!(items[2].x, 520_010_000);
    assert_eq!(items[3].command, MavCmd::MAV_CMD_DO_SET_SERVO);
    assert_eq!(items[3].param1, 9.0);
    assert_eq!(items[3].param2, 1900.0);
    assert_eq!(items[4].x, 520_020_000);
    for (i, item) in items.iter().enumerate() {
        assert_eq!(item.seq, i as u16);
        assert_eq!(item.target_system, PLANE_SYSID);
    }
    assert!(items[1..].iter().all(|item| item.current == 0));

    link.disconnect_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upload_stall_after_count_reports_partial_mission() {
    let link = test_link();
    let (pair, peer) = channel_pair("chan:carrier1");
    peer.send(ap_header(PLANE_SYSID), heartbeat(MavType::MAV_TYPE_FIXED_WING, 12));
    link.connect_channel("carrier1", pair).await.expect("connects");

    let autopilot = thread::spawn(move || {
        wait_from_link(&peer, |m| matches!(m, MavMessage::MISSION_CLEAR_ALL(_)));
        peer.send(ap_header(PLANE_SYSID), mission_ack(MavMissionResult::MAV_MISSION_ACCEPTED));
        wait_from_link(&peer, |m| matches!(m, MavMessage::MISSION_COUNT(_)));
        peer.send(ap_header(PLANE_SYSID), mission_request(0));
        wait_from_link(&peer, |m| matches!(m, MavMessage::MISSION_ITEM_INT(_)));
        // Go quiet without hanging up, past the step deadline.
        thread::sleep(Duration::from_millis(600));
    });

    let mission = vec![MissionWaypoint::new(WaypointKind::Waypoint, 52.0, -1.5, 50.0)];
    let err = link.upload_mission("carrier1", mission).await.expect_err("stalls");
    assert!(err.left_partial_mission());
    match err {
        LinkError::ProtocolTimeout { vehicle, partial, .. } => {
            assert_eq!(vehicle, "carrier1");
            assert!(partial);
        }
        other => panic!("unexpected error: {}", other),
    }

    autopilot.join().expect("autopilot script");
    link.disconnect_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upload_stall_during_clear_aborts_clean() {
    let link = test_link();
    let (pair, peer) = channel_pair("chan:carrier1");
    peer.send(ap_header(PLANE_SYSID), heartbeat(MavType::MAV_TYPE_FIXED_WING, 12));
    link.connect_channel("carrier1", pair).await.expect("connects");

    let autopilot = thread::spawn(move || {
        // Swallow the clear without acknowledging it, staying connected.
        wait_from_link(&peer, |m| matches!(m, MavMessage::MISSION_CLEAR_ALL(_)));
        thread::sleep(Duration::from_millis(600));
    });

    let mission = vec![MissionWaypoint::new(WaypointKind::Waypoint, 52.0, -1.5, 50.0)];
    let err = link.upload_mission("carrier1", mission).await.expect_err("stalls");
    // Nothing was erased yet, so the stored mission is intact.
    assert!(!err.left_partial_mission());
    match err {
        LinkError::ProtocolTimeout { stage, partial, .. } => {
            assert_eq!(stage, "mission clear");
            assert!(!partial);
        }
        other => panic!("unexpected error: {}", other),
    }

    autopilot.join().expect("autopilot script");
    link.disconnect_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_aborts_a_waiting_upload() {
    // Generous step deadline so the cancel always lands first.
    let link = Arc::new(VehicleLink::with_timeouts(
        fleet(),
        Duration::from_millis(500),
        Duration::from_secs(5),
    ));
    let (pair, peer) = channel_pair("chan:carrier1");
    peer.send(ap_header(PLANE_SYSID), heartbeat(MavType::MAV_TYPE_FIXED_WING, 12));
    link.connect_channel("carrier1", pair).await.expect("connects");

    // The autopilot never answers the clear, leaving the worker waiting.
    let upload = {
        let link = link.clone();
        tokio::spawn(async move {
            let mission = vec![MissionWaypoint::new(WaypointKind::Waypoint, 52.0, -1.5, 50.0)];
            link.upload_mission("carrier1", mission).await
        })
    };

    // The slot appears once the worker claims it.
    let deadline = Instant::now() + Duration::from_secs(2);
    while !link.cancel_transfer("carrier1") {
        assert!(Instant::now() < deadline, "transfer never started");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let err = upload.await.expect("worker joins").expect_err("cancelled");
    assert!(matches!(err, LinkError::Cancelled));

    drop(peer);
    link.disconnect_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn download_skips_home_and_keeps_rtl() {
    let link = test_link();
    let (pair, peer) = channel_pair("chan:carrier1");
    peer.send(ap_header(PLANE_SYSID), heartbeat(MavType::MAV_TYPE_FIXED_WING, 12));
    link.connect_channel("carrier1", pair).await.expect("connects");

    let autopilot = thread::spawn(move || {
        wait_from_link(&peer, |m| matches!(m, MavMessage::MISSION_REQUEST_LIST(_)));
        peer.send(
            ap_header(PLANE_SYSID),
            MavMessage::MISSION_COUNT(MISSION_COUNT_DATA {
                count: 3,
                target_system: GCS_SYSTEM_ID,
                target_component: 0,
            }),
        );
        for seq in 0..3u16 {
            let req = match wait_from_link(&peer, |m| matches!(m, MavMessage::MISSION_REQUEST_INT(_)))
            {
                MavMessage::MISSION_REQUEST_INT(req) => req,
                _ => unreachable!(),
            };
            assert_eq!(req.seq, seq);
            let item = match seq {
                0 => stored_item(0, MavCmd::MAV_CMD_NAV_WAYPOINT, 520_000_000, -15_000_000, 0.0),
                1 => stored_item(1, MavCmd::MAV_CMD_NAV_WAYPOINT, 520_020_000, -15_000_000, 55.0),
                _ => stored_item(2, MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH, 0, 0, 0.0),
            };
            peer.send(ap_header(PLANE_SYSID), item);
        }
        wait_from_link(&peer, |m| matches!(m, MavMessage::MISSION_ACK(_)));
    });

    let mission = link.download_mission("carrier1").await.expect("download succeeds");
    autopilot.join().expect("autopilot script");

    assert_eq!(mission.len(), 2);
    assert_eq!(mission[0].kind, WaypointKind::Waypoint);
    assert!((mission[0].lat - 52.002).abs() < 1e-7);
    assert!((mission[0].alt - 55.0).abs() < 1e-6);
    assert_eq!(mission[1].kind, WaypointKind::Rtl);

    link.disconnect_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_endpoint_fails_the_connect() {
    let link = VehicleLink::with_timeouts(
        fleet(),
        Duration::from_millis(200),
        Duration::from_millis(200),
    );
    let (pair, _peer) = channel_pair("chan:carrier1");

    let err = link.connect_channel("carrier1", pair).await.expect_err("no heartbeat");
    match err {
        LinkError::ConnectionTimeout { vehicle, .. } => assert_eq!(vehicle, "carrier1"),
        other => panic!("unexpected error: {}", other),
    }
    assert!(link.telemetry("carrier1").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sitl_sweep_reports_the_timeout_when_nothing_connects() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    let quiet = thread::spawn(move || {
        // Accept and hold the socket open without ever speaking MAVLink.
        let conn = listener.accept();
        thread::sleep(Duration::from_millis(600));
        drop(conn);
    });

    let link = VehicleLink::with_timeouts(
        fleet(),
        Duration::from_millis(200),
        Duration::from_millis(200),
    );
    let mut endpoints = std::collections::BTreeMap::new();
    endpoints.insert("carrier1".to_string(), format!("tcp:127.0.0.1:{}", addr.port()));
    // Unknown ids are skipped before any socket is opened.
    endpoints.insert("intruder".to_string(), "tcp:127.0.0.1:9".to_string());

    let err = link.connect_sitl(&endpoints).await.expect_err("nothing heard");
    assert!(matches!(err, LinkError::ConnectionTimeout { .. }));
    assert!(link.vehicle_ids().is_empty());
    quiet.join().expect("listener thread");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shared_bus_splits_vehicles_by_system_id() {
    let link = test_link();
    let mut events = link.events();
    let (pair, peer) = channel_pair("chan:bus");
    link.connect_bus_channel(pair);

    peer.send(ap_header(PLANE_SYSID), heartbeat(MavType::MAV_TYPE_FIXED_WING, 12));
    peer.send(ap_header(DART_SYSID), heartbeat(MavType::MAV_TYPE_QUADROTOR, 5));

    next_matching(&mut events, |ev| {
        matches!(ev, LinkEvent::ConnectionChanged { vehicle, connected: true } if vehicle == "carrier1")
    })
    .await;
    next_matching(&mut events, |ev| {
        matches!(ev, LinkEvent::ConnectionChanged { vehicle, connected: true } if vehicle == "dart1.1")
    })
    .await;

    peer.send(
        ap_header(PLANE_SYSID),
        MavMessage::GLOBAL_POSITION_INT(GLOBAL_POSITION_INT_DATA {
            lat: 520_000_000,
            lon: -15_000_000,
            relative_alt: 120_000,
            hdg: 9000,
            ..Default::default()
        }),
    );
    peer.send(
        ap_header(DART_SYSID),
        MavMessage::GLOBAL_POSITION_INT(GLOBAL_POSITION_INT_DATA {
            lat: 521_000_000,
            lon: -15_000_000,
            relative_alt: 80_000,
            hdg: 27000,
            ..Default::default()
        }),
    );

    next_matching(&mut events, |ev| {
        matches!(ev, LinkEvent::TelemetryChanged { vehicle, .. } if vehicle == "dart1.1")
    })
    .await;

    let carrier = link.telemetry("carrier1").expect("registered");
    let dart = link.telemetry("dart1.1").expect("registered");
    assert!((carrier.lat - 52.0).abs() < 1e-7);
    assert!((dart.lat - 52.1).abs() < 1e-7);
    assert_eq!(carrier.mode, "LOITER");
    assert_eq!(dart.mode, "LOITER");
    assert!(carrier.alt > dart.alt);

    // each discovered vehicle got its own stream request
    let mut stream_targets = Vec::new();
    while let Some((_, msg)) = peer.recv_timeout(Duration::from_millis(100)) {
        if let MavMessage::REQUEST_DATA_STREAM(req) = msg {
            stream_targets.push(req.target_system);
        }
    }
    stream_targets.sort_unstable();
    assert_eq!(stream_targets, [PLANE_SYSID, DART_SYSID]);

    link.disconnect_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_text_surfaces_as_an_event() {
    let link = test_link();
    let (pair, peer) = channel_pair("chan:carrier1");
    peer.send(ap_header(PLANE_SYSID), heartbeat(MavType::MAV_TYPE_FIXED_WING, 12));
    link.connect_channel("carrier1", pair).await.expect("connects");

    let mut events = link.events();
    let mut text = [0u8; 50];
    for (dst, src) in text.iter_mut().zip(b"Throttle failsafe on") {
        *dst = *src;
    }
    peer.send(
        ap_header(PLANE_SYSID),
        MavMessage::STATUSTEXT(STATUSTEXT_DATA {
            severity: MavSeverity::MAV_SEVERITY_WARNING,
            text,
        }),
    );

    let ev = next_matching(&mut events, |ev| matches!(ev, LinkEvent::StatusText { .. })).await;
    match ev {
        LinkEvent::StatusText { vehicle, severity, text } => {
            assert_eq!(vehicle, "carrier1");
            assert_eq!(severity, 4);
            assert_eq!(text, "Throttle failsafe on");
        }
        _ => unreachable!(),
    }

    link.disconnect_all().await;
}
