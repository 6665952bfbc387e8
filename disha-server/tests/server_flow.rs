//! End-to-end scenarios over real sockets: register, link ceremony,
//! UDP out-of-order delivery with resync, and monitor fan-out.

use disha_protocol::{messages, resync, tracking, wire};
use disha_server::config::ServerConfig;
use disha_server::runtime::ServerRuntime;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

fn start_server(request_min_interval: Duration) -> (ServerRuntime, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ServerConfig::new(dir.path().to_path_buf());
    config.port = 0;
    config.request_min_interval = request_min_interval;
    let runtime = ServerRuntime::start(config).unwrap();
    (runtime, dir)
}

fn connect(runtime: &ServerRuntime) -> TcpStream {
    let addr = SocketAddr::from(([127, 0, 0, 1], runtime.tcp_addr().port()));
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

fn udp_target(runtime: &ServerRuntime) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], runtime.udp_addr().port()))
}

fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut header = [0u8; wire::HEADER_SIZE];
    stream.read_exact(&mut header).unwrap();
    let size = wire::size(&header) as usize;
    assert!(size >= wire::HEADER_SIZE);
    let mut frame = vec![0u8; size];
    frame[..wire::HEADER_SIZE].copy_from_slice(&header);
    stream.read_exact(&mut frame[wire::HEADER_SIZE..]).unwrap();
    frame
}

fn expect_eof(stream: &mut TcpStream) {
    let mut byte = [0u8; 1];
    assert_eq!(stream.read(&mut byte).unwrap(), 0);
}

fn register_device(runtime: &ServerRuntime) -> Uuid {
    let mut stream = connect(runtime);
    let mut request = [0u8; messages::register_request::SIZE];
    messages::register_request::encode(&mut request);
    stream.write_all(&request).unwrap();

    let reply = read_frame(&mut stream);
    assert_eq!(wire::id(&reply), messages::register_reply::ID);
    let device_id = messages::register_reply::device_id(&reply);
    assert!(!device_id.is_nil());
    device_id
}

fn location_update(device_id: Uuid, sequence: u64, time: i64, latitude: f64) -> Vec<u8> {
    let size = tracking::TS_PREFIX_SIZE + tracking::LOCATION_SIZE;
    let mut frame = vec![0u8; size];
    let pos = tracking::encode_ts(&mut frame, size as u16, device_id, sequence);
    tracking::add_location(&mut frame, pos, time, latitude, 2.29, 35.0);
    frame
}

#[test]
fn test_register_creates_marker_and_closes() {
    let (runtime, dir) = start_server(Duration::ZERO);

    let mut stream = connect(&runtime);
    stream.write_all(&[0x00, 0x04, 0x00, 0x05]).unwrap();

    let reply = read_frame(&mut stream);
    assert_eq!(reply.len(), messages::register_reply::SIZE);
    assert_eq!(wire::id(&reply), messages::register_reply::ID);
    let device_id = messages::register_reply::device_id(&reply);

    // marker file named by the canonical UUID form
    assert!(dir.path().join(device_id.to_string()).is_file());
    // trackers do not keep request connections open
    expect_eof(&mut stream);

    runtime.stop();
}

#[test]
fn test_link_ceremony_with_follow_up_exception() {
    let (runtime, _dir) = start_server(Duration::from_millis(150));
    let device_id = register_device(&runtime);
    std::thread::sleep(Duration::from_millis(200));

    // tracker asks for a code
    let mut tracker = connect(&runtime);
    let mut request = [0u8; messages::tracker_link_request::SIZE];
    messages::tracker_link_request::encode(&mut request, device_id);
    tracker.write_all(&request).unwrap();
    let reply = read_frame(&mut tracker);
    assert_eq!(wire::id(&reply), messages::tracker_link_reply::ID);
    let link_code = messages::tracker_link_reply::link_code(&reply);
    assert!((1..=99_999).contains(&link_code));
    expect_eof(&mut tracker);

    std::thread::sleep(Duration::from_millis(200));

    // monitor redeems it and immediately opens the stream on the same
    // connection; the second request inside the interval is only allowed
    // because the link request declared it as the expected follow-up
    let mut monitor = connect(&runtime);
    let mut request = [0u8; messages::monitor_link_request::SIZE];
    messages::monitor_link_request::encode(&mut request, link_code);
    monitor.write_all(&request).unwrap();
    let reply = read_frame(&mut monitor);
    assert_eq!(wire::id(&reply), messages::monitor_link_reply::ID);
    assert_eq!(messages::monitor_link_reply::device_id(&reply), device_id);

    let mut request = [0u8; messages::stream_open_request::SIZE];
    messages::stream_open_request::encode(&mut request, device_id);
    monitor.write_all(&request).unwrap();
    let snapshot = read_frame(&mut monitor);
    assert_eq!(wire::id(&snapshot), tracking::ID);
    // fresh device: bare header snapshot
    assert_eq!(snapshot.len(), wire::HEADER_SIZE);

    runtime.stop();
}

#[test]
fn test_unknown_link_code_gets_nil_reply() {
    let (runtime, _dir) = start_server(Duration::ZERO);

    let mut monitor = connect(&runtime);
    let mut request = [0u8; messages::monitor_link_request::SIZE];
    messages::monitor_link_request::encode(&mut request, 4242);
    monitor.write_all(&request).unwrap();

    let reply = read_frame(&mut monitor);
    assert_eq!(wire::id(&reply), messages::monitor_link_reply::ID);
    assert!(messages::monitor_link_reply::device_id(&reply).is_nil());

    runtime.stop();
}

#[test]
fn test_udp_out_of_order_with_resync() {
    let (runtime, _dir) = start_server(Duration::ZERO);
    let device_id = register_device(&runtime);

    // newest first: sn 7 carries the later fix, sn 8 the earlier one
    let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
    udp.send_to(&location_update(device_id, 7, 100, 48.85), udp_target(&runtime))
        .unwrap();
    udp.send_to(&location_update(device_id, 8, 50, 48.86), udp_target(&runtime))
        .unwrap();

    // resync over TCP until both datagrams have landed
    let mut stream = connect(&runtime);
    let listed = [8u64, 7, 6];
    let mut acks = Vec::new();
    let mut requests = Vec::new();
    for _ in 0..50 {
        let mut request = vec![0u8; resync::resync_request::size(listed.len())];
        resync::resync_request::encode(&mut request, device_id, &listed);
        stream.write_all(&request).unwrap();

        let reply = read_frame(&mut stream);
        assert_eq!(wire::id(&reply), resync::resync_reply::ID);
        let decoded = resync::resync_reply::decode(&reply);
        acks = decoded.0;
        requests = decoded.1;
        if acks.len() == 2 {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    // partitions preserve request order; 6 was never sent
    assert_eq!(acks, vec![8, 7]);
    assert_eq!(requests, vec![6]);

    // the snapshot carries the location with the highest timestamp,
    // regardless of arrival order
    let mut monitor = connect(&runtime);
    let mut request = [0u8; messages::stream_open_request::SIZE];
    messages::stream_open_request::encode(&mut request, device_id);
    monitor.write_all(&request).unwrap();
    let snapshot = read_frame(&mut monitor);
    let fields: Vec<_> = tracking::fields_sm(&snapshot)
        .map(Result::unwrap)
        .collect();
    assert_eq!(fields.len(), 1);
    match fields[0] {
        tracking::Field::Location { time, latitude, .. } => {
            assert_eq!(time, 100);
            assert_eq!(latitude, 48.85);
        }
        ref other => panic!("expected location, got {:?}", other),
    }

    runtime.stop();
}

#[test]
fn test_monitor_receives_live_updates() {
    let (runtime, _dir) = start_server(Duration::ZERO);
    let device_id = register_device(&runtime);

    let mut monitor = connect(&runtime);
    let mut request = [0u8; messages::stream_open_request::SIZE];
    messages::stream_open_request::encode(&mut request, device_id);
    monitor.write_all(&request).unwrap();
    let snapshot = read_frame(&mut monitor);
    assert_eq!(snapshot.len(), wire::HEADER_SIZE);

    // tracker pushes a battery level over TCP
    let mut tracker = connect(&runtime);
    let size = tracking::TS_PREFIX_SIZE + tracking::BATTERY_LEVEL_SIZE;
    let mut frame = vec![0u8; size];
    let pos = tracking::encode_ts(&mut frame, size as u16, device_id, 1);
    tracking::add_battery_level(&mut frame, pos, 1_000, 80);
    tracker.write_all(&frame).unwrap();

    let update = read_frame(&mut monitor);
    assert_eq!(wire::id(&update), tracking::ID);
    let fields: Vec<_> = tracking::fields_sm(&update).map(Result::unwrap).collect();
    assert_eq!(
        fields,
        vec![tracking::Field::BatteryLevel {
            time: 1_000,
            level: 80
        }]
    );

    // an older reading must neither stick nor fan out
    let mut frame = vec![0u8; size];
    let pos = tracking::encode_ts(&mut frame, size as u16, device_id, 2);
    tracking::add_battery_level(&mut frame, pos, 500, 90);
    tracker.write_all(&frame).unwrap();

    let mut second_monitor = connect(&runtime);
    let mut request = [0u8; messages::stream_open_request::SIZE];
    messages::stream_open_request::encode(&mut request, device_id);
    second_monitor.write_all(&request).unwrap();
    let snapshot = read_frame(&mut second_monitor);
    let fields: Vec<_> = tracking::fields_sm(&snapshot)
        .map(Result::unwrap)
        .collect();
    assert_eq!(
        fields,
        vec![tracking::Field::BatteryLevel {
            time: 1_000,
            level: 80
        }]
    );

    runtime.stop();
}

#[test]
fn test_rate_limiter_drops_burst_requests() {
    let (runtime, dir) = start_server(Duration::from_secs(60));

    // first request from this address is admitted
    let device_id = register_device(&runtime);
    assert!(dir.path().join(device_id.to_string()).is_file());

    // an immediate second register is silently dropped: the connection
    // closes without a reply and no new marker appears
    let mut stream = connect(&runtime);
    let mut request = [0u8; messages::register_request::SIZE];
    messages::register_request::encode(&mut request);
    stream.write_all(&request).unwrap();
    expect_eof(&mut stream);

    let markers = std::fs::read_dir(dir.path())
        .unwrap()
        .filter(|e| {
            let name = e.as_ref().unwrap().file_name();
            name.to_str().map(|n| n.len() == 36).unwrap_or(false)
        })
        .count();
    assert_eq!(markers, 1);

    runtime.stop();
}

#[test]
fn test_malformed_control_frame_consumes_rate_slot() {
    let (runtime, dir) = start_server(Duration::from_secs(60));

    // a TrackerLinkRequest with a bad size is rejected, but it still
    // counts against the address's rate slot
    let mut stream = connect(&runtime);
    stream
        .write_all(&[0x00, 0x06, 0x00, 0x07, 0x00, 0x00])
        .unwrap();
    expect_eof(&mut stream);

    // so a well-formed register right behind it is dropped silently
    let mut stream = connect(&runtime);
    let mut request = [0u8; messages::register_request::SIZE];
    messages::register_request::encode(&mut request);
    stream.write_all(&request).unwrap();
    expect_eof(&mut stream);

    let markers = std::fs::read_dir(dir.path())
        .unwrap()
        .filter(|e| {
            let name = e.as_ref().unwrap().file_name();
            name.to_str().map(|n| n.len() == 36).unwrap_or(false)
        })
        .count();
    assert_eq!(markers, 0);

    runtime.stop();
}

#[test]
fn test_invalid_header_closes_connection() {
    let (runtime, _dir) = start_server(Duration::ZERO);

    let mut stream = connect(&runtime);
    // declared size 2 is below the header size
    stream.write_all(&[0x00, 0x02, 0x00, 0x00]).unwrap();
    expect_eof(&mut stream);

    runtime.stop();
}

#[test]
fn test_persisted_updates_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let make_config = || {
        let mut config = ServerConfig::new(dir.path().to_path_buf());
        config.port = 0;
        config.request_min_interval = Duration::ZERO;
        config
    };

    let device_id;
    {
        let runtime = ServerRuntime::start(make_config()).unwrap();
        device_id = register_device(&runtime);

        // tracking then resync on the same connection: the session
        // handles them in order, so the ack proves the update was both
        // fused and queued for persistence before the shutdown below
        let mut tracker = connect(&runtime);
        tracker
            .write_all(&location_update(device_id, 3, 700, 48.87))
            .unwrap();
        let mut request = vec![0u8; resync::resync_request::size(1)];
        resync::resync_request::encode(&mut request, device_id, &[3]);
        tracker.write_all(&request).unwrap();
        let reply = read_frame(&mut tracker);
        assert_eq!(resync::resync_reply::decode(&reply).0, vec![3]);
        runtime.stop();
    }

    // a fresh instance replays the tracking file back into memory
    let runtime = ServerRuntime::start(make_config()).unwrap();
    let mut monitor = connect(&runtime);
    let mut request = [0u8; messages::stream_open_request::SIZE];
    messages::stream_open_request::encode(&mut request, device_id);
    monitor.write_all(&request).unwrap();
    let snapshot = read_frame(&mut monitor);
    let fields: Vec<_> = tracking::fields_sm(&snapshot)
        .map(Result::unwrap)
        .collect();
    assert_eq!(fields.len(), 1);
    assert!(matches!(
        fields[0],
        tracking::Field::Location { time: 700, .. }
    ));

    runtime.stop();
}
