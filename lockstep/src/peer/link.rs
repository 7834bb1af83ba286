use bytes::Bytes;
use tracing::trace;

use crate::kernel::{ContextId, EventHandle};
use crate::time::VirtualTime;
use crate::transport::{alloc_send, MessageKind, Transport};

use super::{PeerId, SyncMode};

/// Message counters of a link.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Data messages sent.
    pub data_sent: u64,
    /// Data messages received.
    pub data_received: u64,
    /// Null messages sent.
    pub sync_sent: u64,
    /// Null messages received.
    pub sync_received: u64,
}

/// State of the link to one peer.
pub(super) struct PeerLink {
    pub(super) peer: PeerId,
    pub(super) lookahead: u64,
    pub(super) mode: SyncMode,
    pub(super) name: String,
    pub(super) transport: Box<dyn Transport>,
    // Lower bound committed by the peer on the timestamps of its messages.
    pub(super) next_guaranteed: VirtualTime,
    // Timestamp of the last message sent.
    pub(super) last_sent: VirtualTime,
    pub(super) heartbeat: Option<EventHandle>,
    pub(super) poll: Option<EventHandle>,
    pub(super) stats: LinkStats,
}

impl PeerLink {
    pub(super) fn is_synchronized(&self) -> bool {
        self.mode == SyncMode::Conservative
    }

    /// Sends a null message committing to `now + lookahead`, or to the
    /// timestamp of the last message sent if later.
    pub(super) fn send_sync(&mut self, now: VirtualTime) {
        let marker = now
            .checked_add(self.lookahead)
            .unwrap_or(VirtualTime::MAX)
            .max(self.last_sent);

        alloc_send(&mut *self.transport, marker).send(MessageKind::Sync, ContextId::NONE, Bytes::new());
        self.last_sent = marker;
        self.stats.sync_sent += 1;
        trace!(peer = %self.peer, %marker, "null message sent");
    }

    pub(super) fn send_data(&mut self, delivery: VirtualTime, destination: ContextId, payload: Bytes) {
        let len = payload.len();

        alloc_send(&mut *self.transport, delivery).send(MessageKind::Data, destination, payload);
        self.last_sent = delivery;
        self.stats.data_sent += 1;
        trace!(peer = %self.peer, %delivery, %destination, len, "data message sent");
    }
}
