//! Conservative synchronization with peer simulators.
//!
//! A [`PeerSyncManager`] owns one link per peer. Each link carries two kinds
//! of messages over an ordered channel:
//!
//! * *data messages*, timestamped with their delivery time and addressed to
//!   a context of the receiving peer,
//! * *null messages*, which carry no payload and commit the sender to never
//!   send a message timestamped earlier than the null message itself.
//!
//! Since the timestamps sent on a channel never decrease, every message
//! received from a peer is a lower bound on the timestamps of its future
//! messages. The manager records this bound as the *next guaranteed time* of
//! the link.
//!
//! # Protocol
//!
//! Once the manager is attached to a kernel, each link is serviced by two
//! self-rescheduling kernel events:
//!
//! * the *heartbeat*, every `lookahead` ticks, sends a null message
//!   timestamped `now + lookahead`. Sending a data message re-arms the
//!   heartbeat one lookahead later, since the data message carries the same
//!   commitment,
//! * the *poll* drains inbound messages without blocking, schedules a
//!   delivery event for each data message and re-arms itself at the next
//!   guaranteed time of the link. If the peer has not committed past the
//!   current time, the poll re-arms itself at the current time, which holds
//!   the kernel back until the peer makes progress.
//!
//! The poll event always fires before the kernel can move past the bound
//! committed by the peer, so a data message can never arrive after the local
//! clock has passed its timestamp. A peer which breaks this guarantee causes
//! the kernel to return an [`ExecutionError`].
//!
//! Links created with [`PeerConfig::unsynchronized_link`] do not take part in
//! the protocol: they send no null messages, their poll event runs at a fixed
//! period and late messages are delivered immediately. Both peers must agree
//! on the mode of their link: the peer which attaches to the channel second
//! fails to establish the link, and the first one fails on its next poll with
//! [`ExecutionError::LinkRejected`].
//!
//! # Examples
//!
//! Two peers stepped alternately on the same thread:
//!
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! use lockstep::kernel::{ContextId, Kernel};
//! use lockstep::peer::{PeerConfig, PeerId, PeerSyncManager};
//! use lockstep::transport::memory::MemoryHub;
//!
//! let (p0, p1) = (PeerId::new(0), PeerId::new(1));
//! let mut hub = MemoryHub::new();
//!
//! let mut sender = Kernel::new();
//! let manager = PeerSyncManager::establish(PeerConfig::new(p0).link(p1, 10), &mut hub)?;
//! sender.attach_peers(manager);
//! sender.schedule(5, move |k| k.transmit(p1, ContextId::new(3), "hello").unwrap());
//!
//! let received = Rc::new(RefCell::new(None));
//! let mut receiver = Kernel::new();
//! let mut manager = PeerSyncManager::establish(PeerConfig::new(p1).link(p0, 10), &mut hub)?;
//! let r = received.clone();
//! manager.register_handler(ContextId::new(3), move |k: &mut Kernel, delivery| {
//!     *r.borrow_mut() = Some((k.now().as_ticks(), delivery.payload));
//! });
//! receiver.attach_peers(manager);
//!
//! while received.borrow().is_none() {
//!     sender.step()?;
//!     receiver.step()?;
//! }
//! assert_eq!(received.borrow().as_ref().unwrap().0, 15);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod config;
mod link;

use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::fmt;
use std::rc::Rc;

use bytes::Bytes;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace};

use crate::kernel::{Action, ContextId, ExecutionError, Kernel};
use crate::time::VirtualTime;
use crate::transport::{
    poll_recv, Connector, HandshakeError, LinkParams, MessageKind, Role, Transport,
};

pub use config::{LinkConfig, PeerConfig, SyncMode};
pub use link::LinkStats;

use link::PeerLink;

/// Identifier of a peer simulator.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PeerId(u32);

impl PeerId {
    /// Creates a peer identifier.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the numeric value of the identifier.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A data message delivered to a context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// The sending peer.
    pub peer: PeerId,
    /// The destination context.
    pub context: ContextId,
    /// Delivery time requested by the sender.
    ///
    /// This is the current time except for late messages on unsynchronized
    /// links.
    pub timestamp: VirtualTime,
    /// Message payload.
    pub payload: Bytes,
}

type Handler = Rc<dyn Fn(&mut Kernel, Delivery)>;

/// Synchronization manager of the links to peer simulators.
///
/// See the [module-level documentation](crate::peer) for the protocol.
pub struct PeerSyncManager {
    local: PeerId,
    links: BTreeMap<PeerId, PeerLink>,
    handlers: HashMap<ContextId, Handler>,
    max_drain_per_poll: usize,
}

impl PeerSyncManager {
    /// Validates the configuration and establishes a channel to each peer.
    ///
    /// Links are established in the order of the configuration. Each peer
    /// must establish its own side of the link, with the same lookahead.
    pub fn establish<C: Connector>(
        config: PeerConfig,
        connector: &mut C,
    ) -> Result<Self, SetupError> {
        let local = config.local();

        if config.dir_prefix().is_empty() {
            return Err(SetupError::MissingAddress);
        }
        let mut seen = Vec::with_capacity(config.links().len());
        for link in config.links() {
            let peer = link.peer;
            if peer == local {
                return Err(SetupError::SelfLink(peer));
            }
            if seen.contains(&peer) {
                return Err(SetupError::DuplicatePeer(peer));
            }
            if link.lookahead == 0 {
                return Err(SetupError::NullLookahead(peer));
            }
            if link.mode == (SyncMode::Unsynchronized { poll_delay: 0 }) {
                return Err(SetupError::NullPollDelay(peer));
            }
            seen.push(peer);
        }

        let mut links = BTreeMap::new();
        for link in config.links() {
            let params = LinkParams {
                local,
                peer: link.peer,
                role: Role::of(local, link.peer),
                lookahead: link.lookahead,
                name: config.channel_name(link.peer),
                sync: link.mode == SyncMode::Conservative,
            };

            let channel = connector
                .create_or_connect(&params)
                .map_err(|source| SetupError::Handshake {
                    peer: link.peer,
                    source,
                })?;
            if params.sync && !channel.sync {
                return Err(SetupError::SyncUnsupported(link.peer));
            }
            info!(
                local = %local,
                peer = %link.peer,
                name = %params.name,
                role = ?params.role,
                lookahead = link.lookahead,
                mode = ?link.mode,
                "peer link established"
            );

            links.insert(
                link.peer,
                PeerLink {
                    peer: link.peer,
                    lookahead: link.lookahead,
                    mode: link.mode,
                    name: params.name,
                    transport: Box::new(channel.transport),
                    next_guaranteed: VirtualTime::ZERO,
                    last_sent: VirtualTime::ZERO,
                    heartbeat: None,
                    poll: None,
                    stats: LinkStats::default(),
                },
            );
        }

        Ok(Self {
            local,
            links,
            handlers: HashMap::new(),
            max_drain_per_poll: config.drain_bound(),
        })
    }

    /// Registers the handler of data messages addressed to a context,
    /// replacing any previous handler.
    ///
    /// The handler is invoked by a kernel event at the delivery time, in the
    /// destination context.
    pub fn register_handler<F>(&mut self, context: ContextId, handler: F)
    where
        F: Fn(&mut Kernel, Delivery) + 'static,
    {
        self.handlers.insert(context, Rc::new(handler));
    }

    /// Returns the local peer.
    pub fn local(&self) -> PeerId {
        self.local
    }

    /// Returns an iterator over the linked peers, in increasing order.
    pub fn peers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.links.keys().copied()
    }

    /// Returns the message counters of the link to a peer.
    pub fn stats(&self, peer: PeerId) -> Option<LinkStats> {
        self.links.get(&peer).map(|link| link.stats)
    }

    /// Returns the lower bound committed by a peer on the timestamps of its
    /// future messages.
    pub fn next_guaranteed_time(&self, peer: PeerId) -> Option<VirtualTime> {
        self.links.get(&peer).map(|link| link.next_guaranteed)
    }

    /// Returns the lookahead of the link to a peer.
    pub fn lookahead(&self, peer: PeerId) -> Option<u64> {
        self.links.get(&peer).map(|link| link.lookahead)
    }

    /// Returns the channel name of the link to a peer.
    pub fn channel_name(&self, peer: PeerId) -> Option<&str> {
        self.links.get(&peer).map(|link| link.name.as_str())
    }

    /// Schedules the heartbeat and poll events of all links at the current
    /// time.
    pub(crate) fn start(&mut self, kernel: &mut Kernel) {
        for link in self.links.values_mut() {
            if link.is_synchronized() {
                link.heartbeat =
                    Some(kernel.schedule_action(0, ContextId::NONE, Action::Heartbeat(link.peer)));
            }
            link.poll = Some(kernel.schedule_action(0, ContextId::NONE, Action::Poll(link.peer)));
        }
        debug!(time = %kernel.now(), links = self.links.len(), "peer events scheduled");
    }

    /// Cancels the heartbeat and poll events of all links.
    pub(crate) fn cancel_events(&mut self, kernel: &mut Kernel) {
        for link in self.links.values_mut() {
            for handle in [link.heartbeat.take(), link.poll.take()].into_iter().flatten() {
                kernel.cancel(&handle);
            }
        }
        debug!(time = %kernel.now(), "peer events cancelled");
    }

    /// Sends a null message and re-arms the heartbeat one lookahead later.
    pub(crate) fn heartbeat(&mut self, kernel: &mut Kernel, peer: PeerId) {
        let Some(link) = self.links.get_mut(&peer) else {
            return;
        };

        let now = kernel.now();
        link.send_sync(now);
        link.heartbeat = now
            .checked_add(link.lookahead)
            .map(|_| kernel.schedule_action(link.lookahead, ContextId::NONE, Action::Heartbeat(peer)));
    }

    /// Drains inbound messages and re-arms the poll event.
    pub(crate) fn poll(&mut self, kernel: &mut Kernel, peer: PeerId) -> Result<(), ExecutionError> {
        let Some(link) = self.links.get_mut(&peer) else {
            return Ok(());
        };

        let now = kernel.now();
        if link.transport.is_rejected() {
            let err = ExecutionError::LinkRejected { peer, time: now };
            error!("{err}");
            return Err(err);
        }
        let synchronized = link.is_synchronized();
        let mut drained = 0;

        while drained < self.max_drain_per_poll {
            let Some(message) = poll_recv(&mut *link.transport, VirtualTime::MAX) else {
                break;
            };
            drained += 1;

            if synchronized {
                if message.timestamp < link.next_guaranteed {
                    let err = ExecutionError::NonMonotonicTimestamp {
                        peer,
                        time: now,
                        timestamp: message.timestamp,
                        previous: link.next_guaranteed,
                    };
                    error!("{err}");
                    return Err(err);
                }
                link.next_guaranteed = message.timestamp;
            }

            match message.kind {
                MessageKind::Sync => {
                    link.stats.sync_received += 1;
                    trace!(%peer, marker = %message.timestamp, "null message received");
                }
                MessageKind::Data => {
                    link.stats.data_received += 1;

                    let delay = match message.timestamp.checked_duration_since(now) {
                        Some(delay) => delay,
                        None if synchronized => {
                            let err = ExecutionError::MessageInPast {
                                peer,
                                time: now,
                                timestamp: message.timestamp,
                            };
                            error!("{err}");
                            return Err(err);
                        }
                        None => {
                            debug!(%peer, timestamp = %message.timestamp, "late message delivered now");
                            0
                        }
                    };

                    let context = message.destination;
                    let Some(handler) = self.handlers.get(&context).cloned() else {
                        let err = ExecutionError::NoRecipient {
                            peer,
                            time: now,
                            context,
                        };
                        error!("{err}");
                        return Err(err);
                    };
                    let delivery = Delivery {
                        peer,
                        context,
                        timestamp: message.timestamp,
                        payload: message.payload.clone(),
                    };
                    trace!(%peer, %context, timestamp = %message.timestamp, "data message received");

                    kernel.schedule_with_context(context, delay, move |kernel| {
                        handler(kernel, delivery)
                    });
                }
            }
        }

        let delay = if drained == self.max_drain_per_poll {
            0
        } else {
            match link.mode {
                SyncMode::Conservative => link.next_guaranteed.saturating_duration_since(now),
                SyncMode::Unsynchronized { poll_delay } => poll_delay,
            }
        };
        link.poll = Some(kernel.schedule_action(delay, ContextId::NONE, Action::Poll(peer)));

        Ok(())
    }

    /// Sends a data message, by default for delivery one lookahead from now.
    pub(crate) fn transmit(
        &mut self,
        kernel: &mut Kernel,
        peer: PeerId,
        destination: ContextId,
        payload: Bytes,
        delivery: Option<VirtualTime>,
    ) -> Result<(), SendError> {
        let link = self
            .links
            .get_mut(&peer)
            .ok_or(SendError::UnknownPeer(peer))?;

        let now = kernel.now();
        let earliest = now.checked_add(link.lookahead).unwrap_or(VirtualTime::MAX);
        let delivery = delivery.unwrap_or(earliest);
        if delivery < earliest {
            return Err(SendError::LookaheadViolation {
                peer,
                earliest,
                requested: delivery,
            });
        }
        if delivery < link.last_sent {
            return Err(SendError::OutOfOrder {
                peer,
                last: link.last_sent,
                requested: delivery,
            });
        }

        link.send_data(delivery, destination, payload);

        if link.is_synchronized() {
            if let Some(handle) = link.heartbeat.take() {
                kernel.cancel(&handle);
            }
            link.heartbeat = now.checked_add(link.lookahead).map(|_| {
                kernel.schedule_action(link.lookahead, ContextId::NONE, Action::Heartbeat(peer))
            });
        }

        Ok(())
    }
}

impl fmt::Debug for PeerSyncManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSyncManager")
            .field("local", &self.local)
            .field("peers", &self.links.keys().collect::<Vec<_>>())
            .field("handlers", &self.handlers.len())
            .finish_non_exhaustive()
    }
}

/// Error returned when the links to peers cannot be established.
#[derive(Debug)]
pub enum SetupError {
    /// The channel directory is empty.
    MissingAddress,
    /// A link has a zero lookahead.
    NullLookahead(PeerId),
    /// An unsynchronized link has a zero polling period.
    NullPollDelay(PeerId),
    /// A link points to the local peer.
    SelfLink(PeerId),
    /// Several links point to the same peer.
    DuplicatePeer(PeerId),
    /// The channel to a peer could not be established.
    Handshake {
        /// The remote peer.
        peer: PeerId,
        /// The transport error.
        source: HandshakeError,
    },
    /// A conservative link was requested but the peer does not synchronize.
    SyncUnsupported(PeerId),
}

impl fmt::Display for SetupError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingAddress => fmt.write_str("no channel directory was specified"),
            Self::NullLookahead(peer) => write!(fmt, "the link to peer {peer} has a zero lookahead"),
            Self::NullPollDelay(peer) => {
                write!(fmt, "the link to peer {peer} has a zero polling period")
            }
            Self::SelfLink(peer) => write!(fmt, "peer {peer} cannot be linked to itself"),
            Self::DuplicatePeer(peer) => write!(fmt, "peer {peer} is linked more than once"),
            Self::Handshake { peer, source } => {
                write!(fmt, "the link to peer {peer} could not be established: {source}")
            }
            Self::SyncUnsupported(peer) => {
                write!(fmt, "peer {peer} does not support conservative synchronization")
            }
        }
    }
}

impl Error for SetupError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Handshake { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Error returned when a message cannot be sent to a peer.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SendError {
    /// No peer synchronization manager is attached to the kernel.
    NoPeers,
    /// The peer is not linked.
    UnknownPeer(PeerId),
    /// The delivery time is less than one lookahead from now.
    LookaheadViolation {
        /// The remote peer.
        peer: PeerId,
        /// Earliest possible delivery time.
        earliest: VirtualTime,
        /// Requested delivery time.
        requested: VirtualTime,
    },
    /// The delivery time is earlier than the timestamp of a message already
    /// sent to the same peer.
    OutOfOrder {
        /// The remote peer.
        peer: PeerId,
        /// Timestamp of the last message sent.
        last: VirtualTime,
        /// Requested delivery time.
        requested: VirtualTime,
    },
}

impl fmt::Display for SendError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoPeers => fmt.write_str("no peer synchronization manager is attached"),
            Self::UnknownPeer(peer) => write!(fmt, "peer {peer} is not linked"),
            Self::LookaheadViolation {
                peer,
                earliest,
                requested,
            } => write!(
                fmt,
                "delivery to peer {peer} requested at t={requested}, before the earliest possible time t={earliest}"
            ),
            Self::OutOfOrder {
                peer,
                last,
                requested,
            } => write!(
                fmt,
                "delivery to peer {peer} requested at t={requested}, before a message already sent for t={last}"
            ),
        }
    }
}

impl Error for SendError {}
