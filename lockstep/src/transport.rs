//! Message channels between peer simulators.
//!
//! A [`Transport`] is one end of a bidirectional, ordered channel between two
//! peers. Each message carries a virtual timestamp; timestamps sent on a
//! channel never decrease, which is what allows the receiver to treat every
//! message as a lower bound on the timestamps of all subsequent messages.
//!
//! Channels are established by a [`Connector`] from the parameters of a link.
//! The peer with the lower identifier creates the channel and the other peer
//! attaches to it, both using the same channel name.
//!
//! Transport buffers are handed out as RAII guards: an [`OutBuffer`] obtained
//! from [`alloc_send`] releases its reserved space unless it is sent, and an
//! [`InBuffer`] obtained from [`poll_recv`] releases the received message when
//! dropped.
//!
//! The [`memory`] module provides an in-process implementation.

pub mod memory;

use std::error::Error;
use std::fmt;
use std::ops::Deref;

use bytes::Bytes;
use crossbeam_utils::Backoff;

use crate::kernel::ContextId;
use crate::peer::PeerId;
use crate::time::VirtualTime;

/// The kind of a message.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// A payload for a context of the receiving peer.
    Data,
    /// A null message, which only carries a timestamp.
    Sync,
}

/// A timestamped message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Kind of message.
    pub kind: MessageKind,
    /// For data messages, the delivery time; for null messages, the
    /// committed lower bound on the timestamps of subsequent messages.
    pub timestamp: VirtualTime,
    /// Destination context, or [`ContextId::NONE`] for null messages.
    pub destination: ContextId,
    /// Payload, empty for null messages.
    pub payload: Bytes,
}

/// One end of a channel to a peer.
///
/// Implementations must not block: a transient lack of buffer space or of
/// inbound messages is reported through the return value.
pub trait Transport {
    /// Tries to reserve space for one outbound message.
    ///
    /// Once this returns `true`, the next call to [`Transport::commit`] must
    /// succeed.
    fn try_reserve(&mut self) -> bool;

    /// Sends a message using the reserved space.
    fn commit(&mut self, message: Message);

    /// Releases the reserved space.
    fn abandon(&mut self);

    /// Returns the oldest inbound message if its timestamp is at or before the
    /// horizon, leaving it in the channel.
    fn poll_recv(&mut self, horizon: VirtualTime) -> Option<Message>;

    /// Releases the oldest inbound message.
    fn recv_done(&mut self);

    /// Checks whether the peer refused the channel after it was created.
    ///
    /// A creator may return from [`Connector::create_or_connect`] before its
    /// peer attaches, in which case the peer reports a failed negotiation
    /// through this flag.
    fn is_rejected(&self) -> bool {
        false
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn try_reserve(&mut self) -> bool {
        (**self).try_reserve()
    }
    fn commit(&mut self, message: Message) {
        (**self).commit(message)
    }
    fn abandon(&mut self) {
        (**self).abandon()
    }
    fn poll_recv(&mut self, horizon: VirtualTime) -> Option<Message> {
        (**self).poll_recv(horizon)
    }
    fn recv_done(&mut self) {
        (**self).recv_done()
    }
    fn is_rejected(&self) -> bool {
        (**self).is_rejected()
    }
}

/// Reserves space for an outbound message timestamped `timestamp`, spinning
/// until space is available.
pub fn alloc_send<T: Transport + ?Sized>(
    transport: &mut T,
    timestamp: VirtualTime,
) -> OutBuffer<'_, T> {
    let backoff = Backoff::new();
    while !transport.try_reserve() {
        backoff.snooze();
    }

    OutBuffer {
        transport,
        timestamp,
        is_sent: false,
    }
}

/// Returns the oldest inbound message if its timestamp is at or before the
/// horizon.
pub fn poll_recv<T: Transport + ?Sized>(
    transport: &mut T,
    horizon: VirtualTime,
) -> Option<InBuffer<'_, T>> {
    let message = transport.poll_recv(horizon)?;

    Some(InBuffer { transport, message })
}

/// Reserved space for an outbound message.
///
/// The space is released on drop unless the buffer was sent.
pub struct OutBuffer<'a, T: Transport + ?Sized> {
    transport: &'a mut T,
    timestamp: VirtualTime,
    is_sent: bool,
}

impl<T: Transport + ?Sized> OutBuffer<'_, T> {
    /// Returns the timestamp of the message.
    pub fn timestamp(&self) -> VirtualTime {
        self.timestamp
    }

    /// Sends the message.
    pub fn send(mut self, kind: MessageKind, destination: ContextId, payload: Bytes) {
        self.transport.commit(Message {
            kind,
            timestamp: self.timestamp,
            destination,
            payload,
        });
        self.is_sent = true;
    }
}

impl<T: Transport + ?Sized> Drop for OutBuffer<'_, T> {
    fn drop(&mut self) {
        if !self.is_sent {
            self.transport.abandon();
        }
    }
}

impl<T: Transport + ?Sized> fmt::Debug for OutBuffer<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutBuffer")
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}

/// A received message, released on drop.
pub struct InBuffer<'a, T: Transport + ?Sized> {
    transport: &'a mut T,
    message: Message,
}

impl<T: Transport + ?Sized> Deref for InBuffer<'_, T> {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.message
    }
}

impl<T: Transport + ?Sized> Drop for InBuffer<'_, T> {
    fn drop(&mut self) {
        self.transport.recv_done();
    }
}

impl<T: Transport + ?Sized> fmt::Debug for InBuffer<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InBuffer")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Which side of a channel a peer takes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// The peer creates the channel.
    Create,
    /// The peer attaches to a channel created by the other peer.
    Attach,
}

impl Role {
    /// Returns the role of `local` on a channel to `peer`: the lower
    /// identifier creates.
    pub fn of(local: PeerId, peer: PeerId) -> Self {
        if local < peer {
            Self::Create
        } else {
            Self::Attach
        }
    }
}

/// Parameters of a channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkParams {
    /// Local peer.
    pub local: PeerId,
    /// Remote peer.
    pub peer: PeerId,
    /// Side taken by the local peer.
    pub role: Role,
    /// Link latency, in ticks, which both peers must agree on.
    pub lookahead: u64,
    /// Channel name, identical on both sides.
    pub name: String,
    /// Whether the local peer requests synchronization.
    pub sync: bool,
}

/// An established channel.
#[derive(Debug)]
pub struct Channel<T> {
    /// Local end of the channel.
    pub transport: T,
    /// Whether synchronization was negotiated.
    pub sync: bool,
}

/// Establishes channels.
pub trait Connector {
    /// The transport type of the channels.
    type Transport: Transport + 'static;

    /// Creates or attaches to the channel described by `params`.
    fn create_or_connect(
        &mut self,
        params: &LinkParams,
    ) -> Result<Channel<Self::Transport>, HandshakeError>;
}

/// Error returned when a channel cannot be established.
#[derive(Debug)]
pub enum HandshakeError {
    /// Both peers claim the same role.
    RoleConflict {
        /// Channel name.
        name: String,
        /// The role claimed twice.
        role: Role,
    },
    /// The peers disagree on the link latency.
    LookaheadMismatch {
        /// Channel name.
        name: String,
        /// Local lookahead.
        local: u64,
        /// Remote lookahead.
        remote: u64,
    },
    /// One peer requests synchronization and the other does not.
    SyncMismatch {
        /// Channel name.
        name: String,
        /// Whether the local peer requests synchronization.
        local: bool,
        /// Whether the remote peer requests synchronization.
        remote: bool,
    },
    /// A transport-specific failure.
    Transport(Box<dyn Error + Send + Sync>),
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RoleConflict { name, role } => {
                write!(fmt, "both ends of channel '{name}' claim the {role:?} role")
            }
            Self::LookaheadMismatch {
                name,
                local,
                remote,
            } => write!(
                fmt,
                "lookahead mismatch on channel '{name}': {local} locally, {remote} remotely"
            ),
            Self::SyncMismatch {
                name,
                local,
                remote,
            } => write!(
                fmt,
                "synchronization mismatch on channel '{name}': requested {local} locally, {remote} remotely"
            ),
            Self::Transport(e) => write!(fmt, "transport failure: {e}"),
        }
    }
}

impl Error for HandshakeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Transport(e) => Some(&**e),
            _ => None,
        }
    }
}
