//! In-memory channels.
//!
//! A [`MemoryHub`] plays the role of the shared-memory namespace in which
//! peers meet: the first peer to request a channel name allocates a pair of
//! bounded rings and parks the remote end in the hub until the other peer
//! claims it. Both peers may run on the same thread, e.g. when their kernels
//! are stepped alternately, or on different threads.
//!
//! Both peers must request the same synchronization mode. The creator of a
//! channel returns before its peer attaches, so a mismatch detected by the
//! attaching peer is reported to the creator through
//! [`Transport::is_rejected`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::time::VirtualTime;
use crate::util::ring::{ring, Consumer, Producer};

use super::{Channel, Connector, HandshakeError, LinkParams, Message, Role, Transport};

/// A channel half-established by the first peer.
struct PendingLink {
    role: Role,
    lookahead: u64,
    sync: bool,
    remote_end: MemoryTransport,
}

/// A rendezvous point for in-memory channels.
///
/// Clones of a hub share the same namespace.
#[derive(Clone)]
pub struct MemoryHub {
    pending: Arc<Mutex<HashMap<String, PendingLink>>>,
    capacity: usize,
}

impl MemoryHub {
    /// Default number of in-flight messages in each direction.
    pub const DEFAULT_CAPACITY: usize = 1024;

    /// Creates a hub with the default channel capacity.
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Creates a hub whose channels hold up to `capacity` in-flight messages
    /// in each direction.
    ///
    /// # Panics
    ///
    /// Panics if the capacity is zero.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "the channel capacity cannot be zero");

        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            capacity,
        }
    }

    /// Returns the number of channels created by one peer and not yet
    /// claimed by the other.
    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for MemoryHub {
    type Transport = MemoryTransport;

    fn create_or_connect(
        &mut self,
        params: &LinkParams,
    ) -> Result<Channel<MemoryTransport>, HandshakeError> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(link) = pending.remove(&params.name) else {
            let (local_end, remote_end) = MemoryTransport::pair(self.capacity);
            pending.insert(
                params.name.clone(),
                PendingLink {
                    role: params.role,
                    lookahead: params.lookahead,
                    sync: params.sync,
                    remote_end,
                },
            );
            debug!(name = %params.name, role = ?params.role, "in-memory channel created");

            return Ok(Channel {
                transport: local_end,
                sync: params.sync,
            });
        };

        if link.role == params.role {
            return Err(HandshakeError::RoleConflict {
                name: params.name.clone(),
                role: params.role,
            });
        }
        if link.lookahead != params.lookahead {
            return Err(HandshakeError::LookaheadMismatch {
                name: params.name.clone(),
                local: params.lookahead,
                remote: link.lookahead,
            });
        }
        if link.sync != params.sync {
            link.remote_end.rejected.store(true, Ordering::Release);
            debug!(name = %params.name, role = ?params.role, "in-memory channel rejected");

            return Err(HandshakeError::SyncMismatch {
                name: params.name.clone(),
                local: params.sync,
                remote: link.sync,
            });
        }
        debug!(name = %params.name, role = ?params.role, "in-memory channel claimed");

        Ok(Channel {
            transport: link.remote_end,
            sync: params.sync,
        })
    }
}

impl fmt::Debug for MemoryHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryHub")
            .field("capacity", &self.capacity)
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// One end of an in-memory channel.
///
/// Messages sent after the other end was dropped are discarded.
pub struct MemoryTransport {
    tx: Producer<Message>,
    rx: Consumer<Message>,
    rejected: Arc<AtomicBool>,
}

impl MemoryTransport {
    fn pair(capacity: usize) -> (Self, Self) {
        let (tx_a, rx_b) = ring(capacity);
        let (tx_b, rx_a) = ring(capacity);
        let rejected = Arc::new(AtomicBool::new(false));

        (
            Self {
                tx: tx_a,
                rx: rx_a,
                rejected: rejected.clone(),
            },
            Self {
                tx: tx_b,
                rx: rx_b,
                rejected,
            },
        )
    }

    /// Checks whether the other end was dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || self.rx.is_closed()
    }
}

impl Transport for MemoryTransport {
    fn try_reserve(&mut self) -> bool {
        self.tx.is_closed() || self.tx.has_space()
    }

    fn commit(&mut self, message: Message) {
        if self.tx.is_closed() {
            debug!(timestamp = %message.timestamp, "message to a closed channel discarded");
            return;
        }
        if self.tx.try_push(message).is_err() {
            panic!("internal simulation error: message committed without reserved space");
        }
    }

    fn abandon(&mut self) {}

    fn poll_recv(&mut self, horizon: VirtualTime) -> Option<Message> {
        self.rx
            .peek()
            .filter(|message| message.timestamp <= horizon)
            .cloned()
    }

    fn recv_done(&mut self) {
        self.rx.pop();
    }

    fn is_rejected(&self) -> bool {
        self.rejected.load(Ordering::Acquire)
    }
}

impl fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("is_closed", &self.is_closed())
            .field("is_rejected", &self.is_rejected())
            .finish_non_exhaustive()
    }
}
