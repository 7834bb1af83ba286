//! Conservative synchronization between kernels linked in memory.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;

use lockstep::kernel::{ContextId, Kernel};
use lockstep::peer::{PeerConfig, PeerId, PeerSyncManager};
use lockstep::time::VirtualTime;
use lockstep::transport::memory::{MemoryHub, MemoryTransport};
use lockstep::transport::{alloc_send, poll_recv, Connector, LinkParams, MessageKind, Role};

const A: PeerId = PeerId::new(0);
const B: PeerId = PeerId::new(1);
const LOOKAHEAD: u64 = 10;
const RECEIVER: ContextId = ContextId::new(1);

#[derive(Debug, PartialEq, Eq)]
enum Entry {
    Local(u64),
    Delivery(u64, Bytes),
}

/// Steps whichever kernel is behind until both have reached `end`.
fn interleave(a: &mut Kernel, b: &mut Kernel, end: VirtualTime) {
    let mut steps = 0;
    while a.now() < end || b.now() < end {
        if a.now() <= b.now() {
            a.step().unwrap();
        } else {
            b.step().unwrap();
        }
        steps += 1;
        assert!(steps < 1_000_000, "kernels stalled at {} and {}", a.now(), b.now());
    }
}

/// Peer A sends a single data message for `5L` while both peers keep
/// exchanging heartbeats. Peer B has a local event at every tick and must
/// not run any of those after `5L` before the delivery.
#[test]
fn peer_sync_delivery_is_never_late() {
    let mut hub = MemoryHub::new();

    let mut a = Kernel::new();
    a.attach_peers(PeerSyncManager::establish(PeerConfig::new(A).link(B, LOOKAHEAD), &mut hub).unwrap());
    a.schedule(4 * LOOKAHEAD, |k| k.transmit(B, RECEIVER, "payload").unwrap());

    let log = Rc::new(RefCell::new(Vec::new()));
    let mut b = Kernel::new();
    let mut manager =
        PeerSyncManager::establish(PeerConfig::new(B).link(A, LOOKAHEAD), &mut hub).unwrap();
    let l = log.clone();
    manager.register_handler(RECEIVER, move |k: &mut Kernel, delivery| {
        assert_eq!(k.current_context(), RECEIVER);
        assert_eq!(delivery.peer, A);
        l.borrow_mut()
            .push(Entry::Delivery(k.now().as_ticks(), delivery.payload));
    });
    b.attach_peers(manager);
    for t in 1..=10 * LOOKAHEAD {
        let l = log.clone();
        b.schedule(t, move |k| l.borrow_mut().push(Entry::Local(k.now().as_ticks())));
    }

    interleave(&mut a, &mut b, VirtualTime::from_ticks(10 * LOOKAHEAD));

    let log = log.borrow();
    let position = log
        .iter()
        .position(|entry| matches!(entry, Entry::Delivery(..)))
        .unwrap();
    assert_eq!(
        log[position],
        Entry::Delivery(5 * LOOKAHEAD, Bytes::from_static(b"payload"))
    );
    assert!(log[..position]
        .iter()
        .all(|entry| matches!(entry, Entry::Local(t) if *t <= 5 * LOOKAHEAD)));
    assert_eq!(log.len() as u64, 10 * LOOKAHEAD + 1);

    let stats = b.peers().unwrap().stats(A).unwrap();
    assert_eq!(stats.data_received, 1);
    // At least one null message per lookahead period.
    assert!(stats.sync_received >= 9);
    assert!(b.peers().unwrap().next_guaranteed_time(A).unwrap() >= VirtualTime::from_ticks(100));
}

/// A peer which stops committing holds the other one back.
#[test]
fn peer_sync_silent_peer_blocks_progress() {
    let mut hub = MemoryHub::new();
    let mut remote = hub
        .create_or_connect(&LinkParams {
            local: A,
            peer: B,
            role: Role::Create,
            lookahead: LOOKAHEAD,
            name: "/tmp/sim_shm0_1".into(),
            sync: true,
        })
        .unwrap()
        .transport;

    let mut b = Kernel::new();
    b.attach_peers(PeerSyncManager::establish(PeerConfig::new(B).link(A, LOOKAHEAD), &mut hub).unwrap());
    b.schedule(100, |_| {});

    alloc_send(&mut remote, VirtualTime::from_ticks(25)).send(
        MessageKind::Sync,
        ContextId::NONE,
        Bytes::new(),
    );
    for _ in 0..1000 {
        b.step().unwrap();
    }
    // Busy polling at the last committed time.
    assert_eq!(b.now().as_ticks(), 25);
    assert_eq!(b.peek_next_time(), Some(VirtualTime::from_ticks(25)));

    alloc_send(&mut remote, VirtualTime::from_ticks(200)).send(
        MessageKind::Sync,
        ContextId::NONE,
        Bytes::new(),
    );
    b.stop_after(76);
    b.run().unwrap();
    assert_eq!(b.now().as_ticks(), 101);
    assert!(drain(&mut remote).windows(2).all(|w| w[0] < w[1]));
}

/// A heartbeat at `t=10` with a lookahead of 10 leaves exactly one
/// heartbeat pending, at `t=20`.
#[test]
fn peer_sync_heartbeat_rescheduled_once() {
    let mut hub = MemoryHub::new();
    let mut remote = hub
        .create_or_connect(&LinkParams {
            local: A,
            peer: B,
            role: Role::Create,
            lookahead: LOOKAHEAD,
            name: "/tmp/sim_shm0_1".into(),
            sync: true,
        })
        .unwrap()
        .transport;
    alloc_send(&mut remote, VirtualTime::from_ticks(1_000)).send(
        MessageKind::Sync,
        ContextId::NONE,
        Bytes::new(),
    );

    let mut b = Kernel::new();
    b.attach_peers(PeerSyncManager::establish(PeerConfig::new(B).link(A, LOOKAHEAD), &mut hub).unwrap());
    b.run_until(VirtualTime::from_ticks(10)).unwrap();
    assert_eq!(drain(&mut remote), vec![10, 20]);

    // Heartbeat at 20, poll at 1000.
    assert_eq!(b.pending(), 2);
    assert_eq!(b.peek_next_time(), Some(VirtualTime::from_ticks(20)));
    b.step().unwrap();
    assert_eq!(drain(&mut remote), vec![30]);
    assert_eq!(b.peek_next_time(), Some(VirtualTime::from_ticks(30)));
}

/// Drains null messages sent to the remote end and returns their markers.
fn drain(remote: &mut MemoryTransport) -> Vec<u64> {
    let mut markers = Vec::new();
    while let Some(message) = poll_recv(&mut *remote, VirtualTime::MAX) {
        assert_eq!(message.kind, MessageKind::Sync);
        markers.push(message.timestamp.as_ticks());
    }

    markers
}
