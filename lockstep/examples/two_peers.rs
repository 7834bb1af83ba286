//! Example: two peer simulators playing ping-pong from separate threads.
//!
//! This example demonstrates in particular:
//!
//! * conservative synchronization of two kernels through an in-memory hub,
//! * delivery handlers replying to a peer,
//! * log timestamping with the virtual time.
//!
//! ```text
//! ┌──────────────┐   ping (t + L)   ┌──────────────┐
//! │              ├─────────────────►│              │
//! │    Peer 0    │                  │    Peer 1    │
//! │              │◄─────────────────┤              │
//! └──────────────┘   pong (t + L)   └──────────────┘
//! ```
//!
//! Run with `RUST_LOG=info` to see the exchange.

use std::cell::Cell;
use std::rc::Rc;
use std::thread;

use bytes::Bytes;
use tracing::info;

use lockstep::kernel::{ContextId, Kernel};
use lockstep::peer::{PeerConfig, PeerId, PeerSyncManager};
use lockstep::tracing::SimulationTime;
use lockstep::transport::memory::MemoryHub;

const PINGER: PeerId = PeerId::new(0);
const PONGER: PeerId = PeerId::new(1);

const PING: ContextId = ContextId::new(1);
const PONG: ContextId = ContextId::new(2);

const LOOKAHEAD: u64 = 10;
const PING_PERIOD: u64 = 25;
const DURATION: u64 = 1_000;

fn ping(kernel: &mut Kernel, count: u32) {
    info!(count, "ping");
    if let Err(e) = kernel.transmit(PONGER, PING, Bytes::from(count.to_le_bytes().to_vec())) {
        tracing::error!("{e}");
        return;
    }
    kernel.schedule(PING_PERIOD, move |k| ping(k, count + 1));
}

fn decode(payload: &[u8]) -> u32 {
    payload
        .try_into()
        .map(u32::from_le_bytes)
        .unwrap_or_default()
}

fn run_pinger(mut hub: MemoryHub) -> Result<u32, Box<dyn std::error::Error + Send + Sync>> {
    let config = PeerConfig::new(PINGER).link(PONGER, LOOKAHEAD);
    let mut manager = PeerSyncManager::establish(config, &mut hub)?;

    let pongs = Rc::new(Cell::new(0));
    let p = pongs.clone();
    manager.register_handler(PONG, move |_: &mut Kernel, delivery| {
        info!(count = decode(&delivery.payload), "pong");
        p.set(p.get() + 1);
    });

    let mut kernel = Kernel::new();
    kernel.attach_peers(manager);
    kernel.schedule_with_context(PING, 0, |k| ping(k, 0));
    kernel.stop_after(DURATION);
    kernel.run()?;
    kernel.teardown();

    Ok(pongs.get())
}

fn run_ponger(mut hub: MemoryHub) -> Result<u32, Box<dyn std::error::Error + Send + Sync>> {
    let config = PeerConfig::new(PONGER).link(PINGER, LOOKAHEAD);
    let mut manager = PeerSyncManager::establish(config, &mut hub)?;

    let pings = Rc::new(Cell::new(0));
    let p = pings.clone();
    manager.register_handler(PING, move |k: &mut Kernel, delivery| {
        p.set(p.get() + 1);
        if let Err(e) = k.transmit(PINGER, PONG, delivery.payload) {
            tracing::error!("{e}");
        }
    });

    let mut kernel = Kernel::new();
    kernel.attach_peers(manager);
    kernel.stop_after(DURATION);
    kernel.run()?;
    kernel.teardown();

    Ok(pings.get())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_timer(SimulationTime::with_system_timer())
        .init();

    let hub = MemoryHub::new();

    let h = hub.clone();
    let pinger = thread::spawn(move || run_pinger(h));
    let ponger = thread::spawn(move || run_ponger(hub));

    let pongs = pinger.join().unwrap().unwrap();
    let pings = ponger.join().unwrap().unwrap();

    // Pings sent at t=0, 25, ..., 975 arrive 10 ticks later; pongs sent at
    // t=10, 35, ..., 985 arrive before t=1000 as well.
    assert_eq!(pings, 40);
    assert_eq!(pongs, 40);
    println!("{pings} pings and {pongs} pongs exchanged");
}
