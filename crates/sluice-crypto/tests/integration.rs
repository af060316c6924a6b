//! Key agreement and protected media between two receive queues.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::time::timeout;

use sluice_core::{
    spawn_worker, ControlFrame, GateState, IncomingQueue, IngestOutcome, QueueConfig,
    RtpPacketBuilder,
};
use sluice_crypto::handshake::message_type;
use sluice_crypto::{NoiseEngine, Role};

const ALICE_SSRC: u32 = 0xa11c_e000;
const BOB_SSRC: u32 = 0x0b0b_0000;

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn queue(role: Role, local_ssrc: u32, peer: SocketAddr) -> IncomingQueue {
    let config = QueueConfig {
        local_ssrc: Some(local_ssrc),
        ..Default::default()
    };
    IncomingQueue::builder(config)
        .handshake(Box::new(NoiseEngine::generate(role)))
        .control_peer(peer)
        .build()
        .unwrap()
}

/// Move pending control frames from one queue into the other until both
/// are quiet.
fn pump(
    a: &IncomingQueue,
    a_addr: SocketAddr,
    b: &IncomingQueue,
    b_addr: SocketAddr,
    now: Instant,
) {
    for _ in 0..8 {
        let from_a = a.drain_outbound();
        let from_b = b.drain_outbound();
        if from_a.is_empty() && from_b.is_empty() {
            return;
        }
        for (_, frame) in from_a {
            b.ingest(frame.to_vec(), a_addr, now);
        }
        for (_, frame) in from_b {
            a.ingest(frame.to_vec(), b_addr, now);
        }
    }
}

fn media(ssrc: u32, seq: u16, payload: &[u8]) -> Vec<u8> {
    RtpPacketBuilder::new(ssrc)
        .payload_type(96)
        .sequence(seq)
        .timestamp(u32::from(seq) * 960)
        .build(payload)
}

#[test]
fn handshake_then_protected_media() {
    let now = Instant::now();
    let (alice_addr, bob_addr) = (addr(5000), addr(5002));
    let alice = queue(Role::Initiator, ALICE_SSRC, bob_addr);
    let bob = queue(Role::Responder, BOB_SSRC, alice_addr);

    assert!(alice.start_handshake(now));
    pump(&alice, alice_addr, &bob, bob_addr, now);

    assert!(alice.gate_state().contains(GateState::STARTED | GateState::SECURED));
    assert!(bob.gate_state().contains(GateState::STARTED | GateState::SECURED));

    for seq in 10..14u16 {
        let protected = alice
            .protect_outgoing(&media(ALICE_SSRC, seq, b"opus frame"), now)
            .unwrap();
        assert_ne!(&protected[12..], b"opus frame");
        bob.ingest(protected, alice_addr, now);
    }

    assert_eq!(bob.queued_len(), 4);
    let packet = bob.pop_front(Some(ALICE_SSRC)).unwrap();
    assert_eq!(packet.sequence(), 10);
    assert_eq!(&packet.payload()[..], b"opus frame");
}

#[test]
fn unprotected_media_is_refused_once_secured() {
    let now = Instant::now();
    let (alice_addr, bob_addr) = (addr(6000), addr(6002));
    let alice = queue(Role::Initiator, ALICE_SSRC, bob_addr);
    let bob = queue(Role::Responder, BOB_SSRC, alice_addr);
    alice.start_handshake(now);
    pump(&alice, alice_addr, &bob, bob_addr, now);

    let outcome = bob.ingest(media(ALICE_SSRC, 1, &[0u8; 32]), alice_addr, now);
    assert!(matches!(outcome, IngestOutcome::Dropped(_)));
    assert_eq!(bob.queued_len(), 0);
    assert_eq!(bob.stats().decrypt_failures, 1);
}

#[test]
fn lost_msg3_is_recovered_by_retransmission() {
    let now = Instant::now();
    let (alice_addr, bob_addr) = (addr(7000), addr(7002));
    let alice = queue(Role::Initiator, ALICE_SSRC, bob_addr);
    let bob = queue(Role::Responder, BOB_SSRC, alice_addr);

    alice.start_handshake(now);
    for (_, frame) in alice.drain_outbound() {
        bob.ingest(frame.to_vec(), alice_addr, now);
    }
    for (_, frame) in bob.drain_outbound() {
        alice.ingest(frame.to_vec(), bob_addr, now);
    }
    // msg3 lost on the way
    assert_eq!(alice.drain_outbound().len(), 1);
    assert!(alice.gate_state().contains(GateState::SECURED));
    assert!(!bob.gate_state().contains(GateState::SECURED));

    let later = now + Duration::from_secs(1);
    alice.housekeeping(later);
    pump(&alice, alice_addr, &bob, bob_addr, later);
    assert!(bob.gate_state().contains(GateState::SECURED));
}

#[test]
fn stopping_the_handshake_drops_keys() {
    let now = Instant::now();
    let (alice_addr, bob_addr) = (addr(8000), addr(8002));
    let alice = queue(Role::Initiator, ALICE_SSRC, bob_addr);
    let bob = queue(Role::Responder, BOB_SSRC, alice_addr);
    alice.start_handshake(now);
    pump(&alice, alice_addr, &bob, bob_addr, now);

    bob.stop_handshake();
    assert_eq!(bob.gate_state(), GateState::empty());

    // without keys media passes through in the clear again
    for seq in 0..3u16 {
        bob.ingest(media(ALICE_SSRC, seq, b"clear"), alice_addr, now);
    }
    assert_eq!(bob.queued_len(), 3);
}

#[test]
fn stray_control_frame_does_not_wedge_key_agreement() {
    let now = Instant::now();
    let (alice_addr, bob_addr) = (addr(9000), addr(9002));
    let alice = queue(Role::Initiator, ALICE_SSRC, bob_addr);
    let bob = queue(Role::Responder, BOB_SSRC, alice_addr);

    let mut junk = vec![message_type::MSG1];
    junk.extend_from_slice(&[0x5a; 40]);
    let stray = ControlFrame::new(1, 9, junk).encode().to_vec();
    assert_eq!(bob.ingest(stray, addr(9999), now), IngestOutcome::Control { ssrc: 9 });

    alice.start_handshake(now);
    pump(&alice, alice_addr, &bob, bob_addr, now);
    assert!(alice.gate_state().contains(GateState::SECURED));
    assert!(bob.gate_state().contains(GateState::SECURED));
}

#[test]
fn failed_negotiation_can_be_restarted() {
    let start = Instant::now();
    let (alice_addr, bob_addr) = (addr(9100), addr(9102));
    let alice = queue(Role::Initiator, ALICE_SSRC, bob_addr);
    alice.start_handshake(start);

    // nobody answers until the retransmit schedule runs out
    let mut now = start;
    while alice.gate_state().contains(GateState::STARTED) {
        now += Duration::from_millis(100);
        assert!(now < start + Duration::from_secs(30), "negotiation never failed");
        alice.housekeeping(now);
    }
    assert_eq!(alice.gate_state(), GateState::empty());
    alice.drain_outbound();

    let bob = queue(Role::Responder, BOB_SSRC, alice_addr);
    assert!(alice.start_handshake(now));
    pump(&alice, alice_addr, &bob, bob_addr, now);
    assert!(alice.gate_state().contains(GateState::SECURED));
    assert!(bob.gate_state().contains(GateState::SECURED));
}

/// Full path over loopback UDP with a worker on each side.
#[tokio::test]
async fn handshake_over_udp_workers() {
    let alice_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let bob_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let alice_addr = alice_socket.local_addr().unwrap();
    let bob_addr = bob_socket.local_addr().unwrap();

    let alice = Arc::new(queue(Role::Initiator, ALICE_SSRC, bob_addr));
    let bob = Arc::new(queue(Role::Responder, BOB_SSRC, alice_addr));
    let alice_worker = spawn_worker(alice.clone(), alice_socket.clone());
    let bob_worker = spawn_worker(bob.clone(), bob_socket);

    alice.start_handshake(Instant::now());

    let secured = timeout(Duration::from_secs(5), async {
        while !bob.gate_state().contains(GateState::SECURED) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(secured.is_ok(), "handshake did not complete");

    for seq in 0..4u16 {
        let protected = alice
            .protect_outgoing(&media(ALICE_SSRC, seq, b"over the wire"), Instant::now())
            .unwrap();
        alice_socket.send_to(&protected, bob_addr).await.unwrap();
    }

    let received = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(packet) = bob.pop_front(Some(ALICE_SSRC)) {
                return packet;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(&received.payload()[..], b"over the wire");

    alice_worker.shutdown().await.unwrap();
    bob_worker.shutdown().await.unwrap();
}
