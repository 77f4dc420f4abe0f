//! End-to-end branch scenarios on the loopback interface.

use std::sync::{Arc, Mutex};

use serde_json::json;
use uuid::Uuid;
use yogi_core::{
    Branch, BranchEventInfo, BranchEvents, BranchPtr, Context, ContextPtr, Duration, Encoding,
    ErrorKind, Payload,
};

const ADV_ADDRESS: &str = "239.255.0.1";

fn create_branch(
    context: &ContextPtr,
    name: &str,
    network: &str,
    password: &str,
    path: &str,
    port: u16,
) -> BranchPtr {
    Branch::create(
        Arc::clone(context),
        &json!({
            "name": name,
            "network_name": network,
            "network_password": password,
            "path": path,
            "advertising_interfaces": ["localhost"],
            "advertising_address": ADV_ADDRESS,
            "advertising_port": port,
            "advertising_interval": 0.1,
            "timeout": 3.0,
        }),
    )
    .unwrap()
}

type Events = Arc<Mutex<Vec<BranchEventInfo>>>;

/// Keeps an event await armed and records everything that arrives.
fn record_events(branch: &BranchPtr, events: Events) {
    let rearm_branch = Arc::clone(branch);
    branch.await_event_async(
        BranchEvents::ALL,
        Box::new(move |res, info| {
            if res.is_err() {
                return;
            }
            if let Some(info) = info {
                events.lock().expect("Mutex poisoned").push(info);
            }
            record_events(&rearm_branch, events);
        }),
    );
}

fn run_until<F: Fn() -> bool>(context: &ContextPtr, pred: F) {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while !pred() {
        context.run(Duration::from_millis(10)).unwrap();
        assert!(std::time::Instant::now() < deadline, "test timed out");
    }
}

fn has_event(events: &Events, event: BranchEvents, uuid: Uuid, kind: Option<ErrorKind>) -> bool {
    events
        .lock()
        .expect("Mutex poisoned")
        .iter()
        .any(|info| {
            info.event == event
                && info.uuid == uuid
                && match (&info.result, kind) {
                    (Ok(()), None) => true,
                    (Err(err), Some(kind)) => err.kind() == kind,
                    _ => false,
                }
        })
}

#[test]
fn advertising_datagram_layout() {
    let context = Context::create().unwrap();
    let port = 46011;

    // Raw observer socket joined to the group on the loopback interface.
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )
    .unwrap();
    socket.set_reuse_address(true).unwrap();
    let bind_addr: std::net::SocketAddr = format!("0.0.0.0:{port}").parse().unwrap();
    socket.bind(&bind_addr.into()).unwrap();
    socket
        .join_multicast_v4(
            &ADV_ADDRESS.parse().unwrap(),
            &std::net::Ipv4Addr::LOCALHOST,
        )
        .unwrap();
    socket
        .set_read_timeout(Some(std::time::Duration::from_secs(5)))
        .unwrap();
    let observer: std::net::UdpSocket = socket.into();

    let branch = create_branch(&context, "adv", "net-adv", "", "/adv", port);
    context.run_in_background().unwrap();

    let mut buffer = [0u8; 64];
    let received = observer.recv(&mut buffer).unwrap();

    context.stop();
    assert!(context.wait_for_stopped(Duration::from_secs(5)));

    assert_eq!(received, 25);
    assert_eq!(&buffer[..5], b"YOGI\0");
    assert_eq!(&buffer[7..23], branch.uuid().as_bytes());

    let announced_port = u16::from_be_bytes([buffer[23], buffer[24]]);
    assert_eq!(
        u64::from(announced_port),
        branch.info_json()["tcp_server_port"].as_u64().unwrap()
    );
}

#[test]
fn branches_discover_query_and_connect() {
    let context = Context::create().unwrap();
    let port = 46012;

    let a = create_branch(&context, "a", "net-connect", "pw", "/a", port);
    let events_a: Events = Arc::new(Mutex::new(Vec::new()));
    record_events(&a, Arc::clone(&events_a));

    let b = create_branch(&context, "b", "net-connect", "pw", "/b", port);
    let events_b: Events = Arc::new(Mutex::new(Vec::new()));
    record_events(&b, Arc::clone(&events_b));

    run_until(&context, || {
        has_event(&events_a, BranchEvents::CONNECT_FINISHED, b.uuid(), None)
            && has_event(&events_b, BranchEvents::CONNECT_FINISHED, a.uuid(), None)
    });

    assert!(has_event(&events_a, BranchEvents::BRANCH_DISCOVERED, b.uuid(), None));
    assert!(has_event(&events_a, BranchEvents::BRANCH_QUERIED, b.uuid(), None));

    let connected_a = a.connected_branches();
    assert_eq!(connected_a.len(), 1);
    assert_eq!(connected_a[0].0, b.uuid());
    assert_eq!(connected_a[0].1["name"], json!("b"));

    let connected_b = b.connected_branches();
    assert_eq!(connected_b.len(), 1);
    assert_eq!(connected_b[0].0, a.uuid());
}

#[test]
fn password_mismatch_prevents_the_session() {
    let context = Context::create().unwrap();
    let port = 46013;

    let a = create_branch(&context, "a", "net-pw", "", "/a", port);
    let events_a: Events = Arc::new(Mutex::new(Vec::new()));
    record_events(&a, Arc::clone(&events_a));

    let b = create_branch(&context, "b", "net-pw", "diff", "/b", port);

    run_until(&context, || {
        has_event(
            &events_a,
            BranchEvents::CONNECT_FINISHED,
            b.uuid(),
            Some(ErrorKind::PasswordMismatch),
        )
    });

    assert!(a.connected_branches().is_empty());
    assert!(b.connected_branches().is_empty());
}

#[test]
fn duplicate_path_is_rejected() {
    let context = Context::create().unwrap();
    let port = 46014;

    let a = create_branch(&context, "a", "net-path", "pw", "/x", port);
    let events_a: Events = Arc::new(Mutex::new(Vec::new()));
    record_events(&a, Arc::clone(&events_a));

    let b = create_branch(&context, "b", "net-path", "pw", "/x", port);
    let events_b: Events = Arc::new(Mutex::new(Vec::new()));
    record_events(&b, Arc::clone(&events_b));

    run_until(&context, || {
        has_event(
            &events_a,
            BranchEvents::CONNECT_FINISHED,
            b.uuid(),
            Some(ErrorKind::DuplicateBranchPath),
        ) || has_event(
            &events_b,
            BranchEvents::CONNECT_FINISHED,
            a.uuid(),
            Some(ErrorKind::DuplicateBranchPath),
        )
    });

    assert!(a.connected_branches().is_empty());
    assert!(b.connected_branches().is_empty());
}

#[test]
fn network_name_mismatch_is_rejected() {
    let context = Context::create().unwrap();
    let port = 46015;

    let a = create_branch(&context, "a", "net-one", "pw", "/a", port);
    let events_a: Events = Arc::new(Mutex::new(Vec::new()));
    record_events(&a, Arc::clone(&events_a));

    let b = create_branch(&context, "b", "net-two", "pw", "/b", port);
    let events_b: Events = Arc::new(Mutex::new(Vec::new()));
    record_events(&b, Arc::clone(&events_b));

    run_until(&context, || {
        has_event(
            &events_a,
            BranchEvents::CONNECT_FINISHED,
            b.uuid(),
            Some(ErrorKind::NetNameMismatch),
        ) || has_event(
            &events_b,
            BranchEvents::CONNECT_FINISHED,
            a.uuid(),
            Some(ErrorKind::NetNameMismatch),
        )
    });

    assert!(a.connected_branches().is_empty());
}

#[test]
fn ghost_branches_observe_without_connecting() {
    let context = Context::create().unwrap();
    let port = 46016;

    let a = create_branch(&context, "a", "net-ghost", "pw", "/a", port);

    let ghost = Branch::create(
        Arc::clone(&context),
        &json!({
            "name": "ghost",
            "network_name": "net-ghost",
            "network_password": "pw",
            "advertising_interfaces": ["localhost"],
            "advertising_address": ADV_ADDRESS,
            "advertising_port": port,
            "advertising_interval": 0.1,
            "timeout": 3.0,
            "ghost_mode": true,
        }),
    )
    .unwrap();

    let events_ghost: Events = Arc::new(Mutex::new(Vec::new()));
    record_events(&ghost, Arc::clone(&events_ghost));

    run_until(&context, || {
        has_event(
            &events_ghost,
            BranchEvents::BRANCH_DISCOVERED,
            a.uuid(),
            None,
        )
    });

    // Give any (wrong) connection attempt time to finish.
    context.run(Duration::from_millis(500)).unwrap();
    assert!(ghost.connected_branches().is_empty());
    assert!(a.connected_branches().is_empty());
}

#[test]
fn broadcasts_fan_out_to_all_peers_but_not_the_sender() {
    let context = Context::create().unwrap();
    let port = 46017;

    let a = create_branch(&context, "a", "net-bc", "pw", "/a", port);
    let b = create_branch(&context, "b", "net-bc", "pw", "/b", port);
    let c = create_branch(&context, "c", "net-bc", "pw", "/c", port);

    run_until(&context, || {
        a.connected_branches().len() == 2
            && b.connected_branches().len() == 2
            && c.connected_branches().len() == 2
    });

    type Delivery = Arc<Mutex<Option<(Uuid, Vec<u8>)>>>;
    let make_receiver = |branch: &BranchPtr, encoding| -> Delivery {
        let delivery: Delivery = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&delivery);
        branch.receive_broadcast(
            encoding,
            vec![0u8; 256],
            Box::new(move |res, source, buffer, written| {
                res.unwrap();
                *slot.lock().expect("Mutex poisoned") =
                    Some((source.unwrap(), buffer[..written].to_vec()));
            }),
        );
        delivery
    };

    let delivery_a = make_receiver(&a, Encoding::Msgpack);
    let delivery_b = make_receiver(&b, Encoding::Json);
    let delivery_c = make_receiver(&c, Encoding::Msgpack);

    let sent = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&sent);
    a.send_broadcast_async(
        &Payload::from_json_str("[1,2,3]"),
        false,
        Box::new(move |res, oid| {
            *slot.lock().expect("Mutex poisoned") = Some((res, oid));
        }),
    )
    .unwrap();

    run_until(&context, || {
        sent.lock().expect("Mutex poisoned").is_some()
            && delivery_b.lock().expect("Mutex poisoned").is_some()
            && delivery_c.lock().expect("Mutex poisoned").is_some()
    });

    let (res, oid) = sent.lock().expect("Mutex poisoned").take().unwrap();
    res.unwrap();
    assert!(oid.value() > 0);

    let (source, data) = delivery_b.lock().expect("Mutex poisoned").take().unwrap();
    assert_eq!(source, a.uuid());
    assert_eq!(&data[..data.len() - 1], b"[1,2,3]");
    assert_eq!(*data.last().unwrap(), 0);

    let (source, data) = delivery_c.lock().expect("Mutex poisoned").take().unwrap();
    assert_eq!(source, a.uuid());
    let decoded: serde_json::Value = decode_msgpack_to_json(&data);
    assert_eq!(decoded, json!([1, 2, 3]));

    // The sender does not deliver to itself.
    context.run(Duration::from_millis(300)).unwrap();
    assert!(delivery_a.lock().expect("Mutex poisoned").is_none());
}

fn decode_msgpack_to_json(data: &[u8]) -> serde_json::Value {
    // Minimal MessagePack decode for the assertion above: round-trip through
    // the payload re-encoder.
    let payload = Payload::new(data, Encoding::Msgpack);
    let mut buffer = vec![0u8; 1024];
    let mut written = 0;
    payload
        .serialize_to_user_buffer(&mut buffer, Encoding::Json, &mut written)
        .unwrap();
    serde_json::from_slice(&buffer[..written - 1]).unwrap()
}

#[test]
fn branches_reconnect_after_a_peer_returns() {
    let context = Context::create().unwrap();
    let port = 46018;

    let a = create_branch(&context, "a", "net-re", "pw", "/a", port);
    let events_a: Events = Arc::new(Mutex::new(Vec::new()));
    record_events(&a, Arc::clone(&events_a));

    let b = create_branch(&context, "b", "net-re", "pw", "/b", port);
    let b_uuid = b.uuid();

    run_until(&context, || {
        has_event(&events_a, BranchEvents::CONNECT_FINISHED, b_uuid, None)
    });

    drop(b);
    run_until(&context, || {
        has_event(
            &events_a,
            BranchEvents::CONNECTION_LOST,
            b_uuid,
            Some(ErrorKind::RwSocketFailed),
        ) || has_event(
            &events_a,
            BranchEvents::CONNECTION_LOST,
            b_uuid,
            Some(ErrorKind::Timeout),
        )
    });

    let c = create_branch(&context, "c", "net-re", "pw", "/c", port);
    run_until(&context, || {
        has_event(&events_a, BranchEvents::CONNECT_FINISHED, c.uuid(), None)
    });
}
