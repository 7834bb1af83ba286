//! Establishment of peer links.

use std::error::Error;

use lockstep::kernel::Kernel;
use lockstep::peer::{PeerConfig, PeerId, PeerSyncManager, SetupError};
use lockstep::transport::memory::MemoryHub;
use lockstep::transport::HandshakeError;

const P0: PeerId = PeerId::new(0);
const P1: PeerId = PeerId::new(1);
const P2: PeerId = PeerId::new(2);

#[test]
fn peer_setup_three_peers_full_mesh() {
    let mut hub = MemoryHub::new();

    let configs = [
        PeerConfig::new(P2).link(P0, 5).link(P1, 7),
        PeerConfig::new(P0).link(P1, 3).link(P2, 5),
        PeerConfig::new(P1).link(P2, 7).link(P0, 3),
    ];
    let managers: Vec<_> = configs
        .into_iter()
        .map(|config| PeerSyncManager::establish(config, &mut hub).unwrap())
        .collect();

    assert_eq!(hub.pending_count(), 0);
    assert_eq!(managers[0].peers().collect::<Vec<_>>(), vec![P0, P1]);
    assert_eq!(managers[1].lookahead(P2), Some(5));
    assert_eq!(managers[2].channel_name(P2), Some("/tmp/sim_shm1_2"));
    assert_eq!(managers[2].channel_name(P1), None);
}

#[test]
fn peer_setup_lookahead_mismatch() {
    let mut hub = MemoryHub::new();

    PeerSyncManager::establish(PeerConfig::new(P0).link(P1, 10), &mut hub).unwrap();
    let err = PeerSyncManager::establish(PeerConfig::new(P1).link(P0, 20), &mut hub).unwrap_err();

    assert!(matches!(
        err,
        SetupError::Handshake {
            peer: P0,
            source: HandshakeError::LookaheadMismatch { .. }
        }
    ));
    assert!(err.source().is_some());
}

#[test]
fn peer_setup_attach_and_detach() {
    let mut hub = MemoryHub::new();
    let manager = PeerSyncManager::establish(PeerConfig::new(P0).link(P1, 10), &mut hub).unwrap();

    let mut kernel = Kernel::new();
    assert!(kernel.peers().is_none());
    kernel.attach_peers(manager);
    assert_eq!(kernel.peers().map(|p| p.local()), Some(P0));
    // Heartbeat and poll.
    assert_eq!(kernel.pending(), 2);

    let manager = kernel.detach_peers().unwrap();
    assert_eq!(manager.local(), P0);
    // Cancelled events are discarded without being invoked.
    kernel.run().unwrap();
    assert_eq!(kernel.event_count(), 0);
    assert_eq!(kernel.pending(), 0);
}
