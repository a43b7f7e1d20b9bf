// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test/bench code readability over pedantic
#![allow(clippy::cast_possible_truncation)] // Test parameters
#![allow(clippy::missing_panics_doc)] // Tests/examples panic on failure
#![allow(clippy::items_after_statements)] // Test helpers
#![allow(clippy::too_many_lines)] // Example/test code
#![allow(clippy::needless_pass_by_value)] // Test functions
#![allow(clippy::redundant_closure_for_method_calls)] // Test code clarity
#![allow(clippy::similar_names)] // Test variable naming

//! Shared-memory transport integration tests.
//!
//! Exercises the transport contract end to end over real POSIX segments:
//! locator ownership, input/output channel bookkeeping, port filling and
//! message delivery between a sender resource and an input channel.

#![cfg(target_os = "linux")]

use hdds_transport::config::{SharedMemTransportDescriptor, UdpTransportDescriptor};
use hdds_transport::shm::{unicast_port_name, SharedSegment, ShmError};
use hdds_transport::transport::{SharedMemTransport, UdpV4Transport};
use hdds_transport::{
    Locator, LocatorKind, LocatorSelector, LocatorSelectorEntry, NetworkFactory, PortParameters,
    TransportError, TransportInterface, TransportReceiver,
};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const SEND_TIMEOUT: Duration = Duration::from_millis(500);

fn random_port() -> u32 {
    fastrand::u32(20_000..40_000)
}

fn shm_transport() -> SharedMemTransport {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut shm = SharedMemTransport::new(SharedMemTransportDescriptor::default());
    shm.init().expect("shared memory transport init");
    shm
}

fn udp_transport() -> UdpV4Transport {
    let mut udp = UdpV4Transport::new(UdpTransportDescriptor::default());
    udp.init().expect("udp transport init");
    udp
}

/// Receiver forwarding every payload to a channel.
fn collecting_receiver() -> (Arc<dyn TransportReceiver>, mpsc::Receiver<Vec<u8>>) {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let receiver = move |data: &[u8], _local: &Locator, _remote: &Locator| {
        if let Ok(tx) = tx.lock() {
            let _ = tx.send(data.to_vec());
        }
    };
    (Arc::new(receiver), rx)
}

fn noop_receiver() -> Arc<dyn TransportReceiver> {
    Arc::new(|_: &[u8], _: &Locator, _: &Locator| {})
}

fn random_locator() -> Locator {
    let port = fastrand::u32(0..70_000);
    match fastrand::u8(0..4) {
        0 => Locator::shm(port),
        1 => Locator::shm_multicast(port),
        2 => Locator::udp_v4(Ipv4Addr::new(10, 0, 0, fastrand::u8(..)), port),
        _ => Locator::invalid(),
    }
}

#[test]
fn test_distinct_kinds_never_claim_same_locator() {
    let shm = shm_transport();
    let udp = udp_transport();
    assert_ne!(shm.kind(), udp.kind());

    for _ in 0..500 {
        let locator = random_locator();
        assert!(
            !(shm.is_locator_supported(&locator) && udp.is_locator_supported(&locator)),
            "both transports claim {}",
            locator
        );
        assert_eq!(
            shm.is_locator_supported(&locator),
            locator.kind == LocatorKind::Shm
        );
    }
}

#[test]
fn test_input_locators_match_on_port_only() {
    let shm = shm_transport();

    for _ in 0..200 {
        let a = random_locator();
        let b = random_locator();
        assert!(shm.do_input_locators_match(&a, &a));
        assert_eq!(
            shm.do_input_locators_match(&a, &b),
            shm.do_input_locators_match(&b, &a)
        );
    }

    // Unicast and multicast flavours of a port share one input channel.
    assert!(shm.do_input_locators_match(&Locator::shm(7411), &Locator::shm_multicast(7411)));
    assert!(!shm.do_input_locators_match(&Locator::shm(7411), &Locator::shm(7412)));
}

#[test]
fn test_open_close_reopen_input_channel() {
    let shm = shm_transport();
    let locator = Locator::shm(random_port());

    assert!(!shm.close_input_channel(&locator), "nothing open yet");
    assert!(!shm.is_input_channel_open(&locator));

    shm.open_input_channel(&locator, 1024, noop_receiver())
        .expect("open");
    assert!(shm.is_input_channel_open(&locator));

    // Opening again is a no-op.
    shm.open_input_channel(&locator, 1024, noop_receiver())
        .expect("open twice");
    assert_eq!(shm.input_channel_count(), 1);

    assert!(shm.close_input_channel(&locator));
    assert!(!shm.is_input_channel_open(&locator));
    assert!(!shm.close_input_channel(&locator));

    shm.open_input_channel(&locator, 1024, noop_receiver())
        .expect("reopen after close");
    assert!(shm.is_input_channel_open(&locator));
    shm.shutdown();
    assert_eq!(shm.input_channel_count(), 0);
}

#[test]
fn test_unsupported_input_locator_rejected() {
    let shm = shm_transport();
    let udp = Locator::udp_v4(Ipv4Addr::LOCALHOST, 7411);
    let res = shm.open_input_channel(&udp, 1024, noop_receiver());
    assert!(matches!(res, Err(TransportError::UnsupportedLocator(_))));
    assert!(!shm.is_input_channel_open(&udp));
}

#[test]
fn test_output_channel_reused() {
    let shm = shm_transport();
    let mut senders = Vec::new();

    shm.open_output_channel(&mut senders, &Locator::shm(7411))
        .expect("first sender");
    shm.open_output_channel(&mut senders, &Locator::shm(7413))
        .expect("second call");
    assert_eq!(senders.len(), 1);
    assert_eq!(senders[0].kind(), LocatorKind::Shm);

    let udp = Locator::udp_v4(Ipv4Addr::LOCALHOST, 7411);
    assert!(shm.open_output_channel(&mut senders, &udp).is_err());
    assert_eq!(senders.len(), 1);
}

#[test]
fn test_fill_never_overwrites_port() {
    let shm = shm_transport();
    let params = PortParameters::default();

    for _ in 0..100 {
        let port = fastrand::u32(1..65_536);
        let domain = fastrand::u32(0..10);
        let participant = fastrand::u32(0..10);

        let mut mc = Locator::shm_multicast(port);
        shm.fill_metatraffic_multicast_locator(&mut mc, &params, domain);
        assert_eq!(mc.port, port);

        let mut uc = Locator::shm(port);
        shm.fill_metatraffic_unicast_locator(&mut uc, &params, domain, participant);
        assert_eq!(uc.port, port);

        let mut user = Locator::shm(port);
        shm.fill_unicast_locator(&mut user, &params, domain, participant);
        assert_eq!(user.port, port);
    }

    let mut zero = Locator::shm(0);
    shm.fill_metatraffic_unicast_locator(&mut zero, &params, 0, 1);
    assert_eq!(zero.port, params.unicast_port(0, 1));

    let mut zero = Locator::shm_multicast(0);
    shm.fill_metatraffic_multicast_locator(&mut zero, &params, 0);
    assert_eq!(zero.port, params.multicast_port(0));
}

#[test]
fn test_initial_peer_expansion() {
    let mut shm =
        SharedMemTransport::new(SharedMemTransportDescriptor::default().with_max_initial_peers_range(3));
    shm.init().expect("init");
    let params = PortParameters::default();

    let mut peers = Vec::new();
    shm.configure_initial_peer_locator(&Locator::shm(0), &params, 0, &mut peers);
    assert_eq!(peers.len(), 3);
    let mut ports: Vec<u32> = peers.iter().map(|l| l.port).collect();
    ports.sort_unstable();
    ports.dedup();
    assert_eq!(ports.len(), 3);
    for (i, peer) in peers.iter().enumerate() {
        assert_eq!(peer.port, params.unicast_port(0, i as u32));
        assert_eq!(peer.kind, LocatorKind::Shm);
    }

    let mut fixed = Vec::new();
    shm.configure_initial_peer_locator(&Locator::shm(9000), &params, 0, &mut fixed);
    assert_eq!(fixed, vec![Locator::shm(9000)]);
}

#[test]
fn test_remote_to_main_local() {
    let shm = shm_transport();
    let local = shm.remote_to_main_local(&Locator::shm(7411));
    assert_eq!(local.kind, LocatorKind::Shm);
    assert_eq!(local.port, 7411);
    assert!(local.is_address_unset());

    let other = shm.remote_to_main_local(&Locator::udp_v4(Ipv4Addr::LOCALHOST, 7411));
    assert!(!other.is_valid());
}

#[test]
fn test_send_receive_roundtrip() {
    let shm = shm_transport();
    let locator = Locator::shm(random_port());
    let (receiver, rx) = collecting_receiver();

    shm.open_input_channel(&locator, 4096, receiver)
        .expect("open input");

    let mut senders = Vec::new();
    shm.open_output_channel(&mut senders, &locator)
        .expect("open output");

    for i in 0..16u8 {
        let payload = vec![i; 64 + usize::from(i)];
        shm.send(&senders[0], &payload, &locator, false, SEND_TIMEOUT)
            .expect("send");
    }

    for i in 0..16u8 {
        let got = rx.recv_timeout(RECV_TIMEOUT).expect("message delivered");
        assert_eq!(got, vec![i; 64 + usize::from(i)], "FIFO order per port");
    }

    let metrics = shm.metrics().expect("initialized");
    assert!(metrics.writes >= 16);
}

#[test]
fn test_send_honors_timeout_while_port_locked() {
    let shm = shm_transport();
    let port = random_port();
    let locator = Locator::shm(port);
    shm.open_input_channel(&locator, 1024, noop_receiver())
        .expect("open input");
    let mut senders = Vec::new();
    shm.open_output_channel(&mut senders, &locator)
        .expect("open output");

    // Another handle on the port keeps its queue lock
    let segment = SharedSegment::open(&unicast_port_name(port as u16)).expect("open port segment");
    let held = segment
        .mutex()
        .lock_timeout(Duration::from_secs(1))
        .expect("take port lock");

    let start = Instant::now();
    let res = shm.send(&senders[0], b"late", &locator, false, Duration::from_millis(10));
    let elapsed = start.elapsed();
    assert!(
        matches!(res, Err(TransportError::Shm(ShmError::Timeout))),
        "unexpected result {:?}",
        res
    );
    assert!(elapsed < Duration::from_millis(500), "send blocked for {:?}", elapsed);

    drop(held);
    shm.send(&senders[0], b"on time", &locator, false, SEND_TIMEOUT)
        .expect("send after unlock");
}

#[test]
fn test_send_with_unbounded_timeout() {
    let shm = shm_transport();
    let locator = Locator::shm(random_port());
    let (receiver, rx) = collecting_receiver();
    shm.open_input_channel(&locator, 1024, receiver)
        .expect("open input");
    let mut senders = Vec::new();
    shm.open_output_channel(&mut senders, &locator)
        .expect("open output");

    shm.send(&senders[0], b"patient", &locator, false, Duration::MAX)
        .expect("send");
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).expect("delivered"), b"patient");
}

#[test]
fn test_input_resource_kind_follows_locator() {
    let shm = shm_transport();
    let locator = Locator::shm(random_port());
    let (receiver, rx) = collecting_receiver();

    // Flag disagrees with the unicast locator; the locator wins
    let channel = shm
        .create_input_channel_resource(&locator, true, 1024, receiver)
        .expect("create input resource");
    assert_eq!(channel.locator(), &locator);

    let mut senders = Vec::new();
    shm.open_output_channel(&mut senders, &locator)
        .expect("open output");
    shm.send(&senders[0], b"unicast", &locator, false, SEND_TIMEOUT)
        .expect("send");
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).expect("delivered"), b"unicast");
}

#[test]
fn test_send_rejects_oversize_payload() {
    let mut shm =
        SharedMemTransport::new(SharedMemTransportDescriptor::default().with_max_message_size(128));
    shm.init().expect("init");
    let locator = Locator::shm(random_port());
    let mut senders = Vec::new();
    shm.open_output_channel(&mut senders, &locator)
        .expect("open output");

    let res = shm.send(&senders[0], &[0u8; 129], &locator, false, SEND_TIMEOUT);
    assert!(matches!(
        res,
        Err(TransportError::MessageTooLarge { size: 129, max: 128 })
    ));
}

#[test]
fn test_close_from_callback_does_not_deadlock() {
    let shm = Arc::new(shm_transport());
    let locator = Locator::shm(random_port());
    let delivered = Arc::new(AtomicUsize::new(0));
    let (done_tx, done_rx) = mpsc::channel();
    let done_tx = Mutex::new(done_tx);

    let weak = Arc::downgrade(&shm);
    let counter = Arc::clone(&delivered);
    let receiver = move |_: &[u8], local: &Locator, _: &Locator| {
        counter.fetch_add(1, Ordering::SeqCst);
        if let Some(shm) = weak.upgrade() {
            let closed = shm.close_input_channel(local);
            if let Ok(tx) = done_tx.lock() {
                let _ = tx.send(closed);
            }
        }
    };

    shm.open_input_channel(&locator, 1024, Arc::new(receiver))
        .expect("open input");
    let mut senders = Vec::new();
    shm.open_output_channel(&mut senders, &locator)
        .expect("open output");
    shm.send(&senders[0], b"close me", &locator, false, SEND_TIMEOUT)
        .expect("send");

    let closed = done_rx.recv_timeout(RECV_TIMEOUT).expect("callback ran");
    assert!(closed);
    assert!(!shm.is_input_channel_open(&locator));
    assert_eq!(delivered.load(Ordering::SeqCst), 1);
}

#[test]
fn test_factory_routes_shm_and_udp() {
    let mut factory = NetworkFactory::new();
    factory
        .register_transport(Box::new(SharedMemTransport::new(
            SharedMemTransportDescriptor::default(),
        )))
        .expect("register shm");
    factory
        .register_transport(Box::new(UdpV4Transport::new(UdpTransportDescriptor::default())))
        .expect("register udp");
    assert_eq!(factory.transport_count(), 2);

    let local = Locator::shm(random_port());
    let (receiver, rx) = collecting_receiver();
    assert!(factory.build_receiver_resources(&local, 4096, receiver));

    let mut senders = Vec::new();
    assert!(factory.build_send_resources(&mut senders, &local));
    assert!(factory.build_send_resources(
        &mut senders,
        &Locator::udp_v4(Ipv4Addr::LOCALHOST, 7411)
    ));
    assert_eq!(senders.len(), 2);

    let mut selector = LocatorSelector::new();
    assert!(selector.add_entry(LocatorSelectorEntry::new([1; 16], vec![local], vec![])));
    selector.reset(true);
    factory.select_locators(&mut selector);
    assert_eq!(selector.selected_size(), 1);

    let delivered = factory
        .send(&senders, b"via factory", &selector, SEND_TIMEOUT)
        .expect("send");
    assert_eq!(delivered, 1);
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).expect("delivered"), b"via factory");

    assert!(factory.close_receiver_resources(&local));
    assert!(!factory.close_receiver_resources(&local));
    factory.shutdown();
}
