//! A discrete-event simulation kernel with conservative time synchronization
//! between peer simulators.
//!
//! Lockstep is made of three layers:
//!
//! * an event priority queue ([`queue`]) ordering pending events by virtual
//!   timestamp and, for equal timestamps, by submission order; the default
//!   backend is a calendar queue with amortized *O*(1) insertion and removal,
//! * a single-threaded simulation [`Kernel`](kernel::Kernel) ([`kernel`])
//!   which owns the virtual clock, invokes events in chronological order and
//!   absorbs events injected from other threads,
//! * a peer synchronization manager ([`peer`]) which links the kernel to
//!   other simulators running out of process and keeps all clocks in
//!   lockstep with a conservative, null-message protocol.
//!
//! The transport that physically carries bytes between peers is abstracted
//! by the traits of the [`transport`] module; an in-memory implementation is
//! provided for tests and single-process setups.
//!
//! # A practical overview
//!
//! ## Running a local simulation
//!
//! Events are closures taking the kernel as argument, which lets them
//! schedule further events:
//!
//! ```
//! use lockstep::kernel::Kernel;
//!
//! let mut kernel = Kernel::new();
//!
//! // A self-rescheduling event firing every 10 ticks.
//! fn tick(kernel: &mut Kernel) {
//!     if kernel.now().as_ticks() < 50 {
//!         kernel.schedule(10, tick);
//!     }
//! }
//! kernel.schedule_now(tick);
//!
//! kernel.run().unwrap();
//! assert_eq!(kernel.now().as_ticks(), 50);
//! kernel.teardown();
//! ```
//!
//! ## Linking peer simulators
//!
//! Each simulator process builds a [`PeerConfig`](peer::PeerConfig)
//! describing its links, establishes them with
//! [`PeerSyncManager::establish`](peer::PeerSyncManager::establish) and
//! attaches the resulting manager to its kernel. From then on, every link is
//! serviced by two self-rescheduling kernel events:
//!
//! 1. a *heartbeat* which, every `lookahead` ticks, commits the local
//!    simulator to never send a message earlier than `now + lookahead`,
//! 2. a *poll* which drains inbound messages without blocking and re-arms
//!    itself no later than the bound last committed by the peer.
//!
//! Since the poll event always fires before the kernel can move past a bound
//! committed by the peer, a message can never arrive after the local clock
//! has passed its timestamp.
//!
//! ```
//! use lockstep::kernel::{ContextId, Kernel};
//! use lockstep::peer::{PeerConfig, PeerId, PeerSyncManager};
//! use lockstep::transport::memory::MemoryHub;
//!
//! let mut hub = MemoryHub::new();
//!
//! let config = PeerConfig::new(PeerId::new(0)).link(PeerId::new(1), 100);
//! let mut manager = PeerSyncManager::establish(config, &mut hub).unwrap();
//! manager.register_handler(ContextId::new(7), |kernel: &mut Kernel, delivery| {
//!     println!("{} bytes received at t={}", delivery.payload.len(), kernel.now());
//! });
//!
//! let mut kernel = Kernel::new();
//! kernel.attach_peers(manager);
//! // kernel.run() now advances in lockstep with peer #1.
//! ```
//!
//! # Other resources
//!
//! The `examples` directory of the crate contains a two-peer simulation where
//! each peer runs on its own thread.
//!
//! ## Modules documentation
//!
//! * the [`kernel`] module discusses the event lifecycle, cancellation and
//!   cross-thread injection,
//! * the [`queue`] module documents the calendar queue and its resizing
//!   policy,
//! * the [`peer`] module details the synchronization protocol and its failure
//!   modes.
#![warn(missing_docs, missing_debug_implementations, unreachable_pub)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod kernel;
mod loom_exports;
#[cfg(feature = "tracing")]
pub(crate) mod macros;
pub mod peer;
pub mod queue;
pub mod time;
#[cfg(feature = "tracing")]
pub mod tracing;
pub mod transport;
pub(crate) mod util;
