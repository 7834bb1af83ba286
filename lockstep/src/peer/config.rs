#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::PeerId;

/// How the clock of a link's peer constrains the local clock.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SyncMode {
    /// Conservative synchronization with null messages: the local clock never
    /// passes the bound last committed by the peer.
    Conservative,
    /// No synchronization: inbound messages are polled every `poll_delay`
    /// ticks and late messages are delivered immediately.
    Unsynchronized {
        /// Polling period, in ticks.
        poll_delay: u64,
    },
}

/// Configuration of a link to a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LinkConfig {
    /// Remote peer.
    pub peer: PeerId,
    /// Link latency in ticks, i.e. the minimum delay between sending a
    /// message and its delivery. Both peers must use the same value.
    pub lookahead: u64,
    /// Synchronization mode.
    pub mode: SyncMode,
}

/// Configuration of the links of a simulator.
///
/// # Examples
///
/// ```
/// use lockstep::peer::{PeerConfig, PeerId};
///
/// // Peer #1 is linked to peer #0 with a 100-tick lookahead and to peer #2,
/// // which does not synchronize, with a 50-tick lookahead.
/// let config = PeerConfig::new(PeerId::new(1))
///     .dir("/dev/shm/")
///     .link(PeerId::new(0), 100)
///     .unsynchronized_link(PeerId::new(2), 50, 10);
///
/// assert_eq!(config.links().len(), 2);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PeerConfig {
    local: PeerId,
    dir: String,
    links: Vec<LinkConfig>,
    max_drain_per_poll: usize,
}

impl PeerConfig {
    /// Default directory prefix of channel names.
    pub const DEFAULT_DIR: &'static str = "/tmp/";

    /// Default maximum number of messages drained by a single poll.
    pub const DEFAULT_MAX_DRAIN_PER_POLL: usize = 64;

    /// Creates a configuration without links for the specified local peer.
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            dir: Self::DEFAULT_DIR.to_owned(),
            links: Vec::new(),
            max_drain_per_poll: Self::DEFAULT_MAX_DRAIN_PER_POLL,
        }
    }

    /// Sets the directory prefix of channel names.
    ///
    /// The channel between peers `a < b` is named `{dir}sim_shm{a}_{b}`.
    pub fn dir(mut self, dir: impl Into<String>) -> Self {
        self.dir = dir.into();

        self
    }

    /// Adds a conservatively synchronized link.
    pub fn link(self, peer: PeerId, lookahead: u64) -> Self {
        self.with_link(LinkConfig {
            peer,
            lookahead,
            mode: SyncMode::Conservative,
        })
    }

    /// Adds a link without synchronization, polled every `poll_delay` ticks.
    pub fn unsynchronized_link(self, peer: PeerId, lookahead: u64, poll_delay: u64) -> Self {
        self.with_link(LinkConfig {
            peer,
            lookahead,
            mode: SyncMode::Unsynchronized { poll_delay },
        })
    }

    /// Adds a link.
    pub fn with_link(mut self, link: LinkConfig) -> Self {
        self.links.push(link);

        self
    }

    /// Sets the maximum number of messages drained by a single poll; values
    /// below 1 are treated as 1.
    ///
    /// A poll which reaches this bound re-arms itself immediately, which lets
    /// other events at the same time run in between.
    pub fn max_drain_per_poll(mut self, count: usize) -> Self {
        self.max_drain_per_poll = count.max(1);

        self
    }

    /// Returns the local peer.
    pub fn local(&self) -> PeerId {
        self.local
    }

    /// Returns the configured links.
    pub fn links(&self) -> &[LinkConfig] {
        &self.links
    }

    pub(super) fn dir_prefix(&self) -> &str {
        &self.dir
    }

    pub(super) fn drain_bound(&self) -> usize {
        self.max_drain_per_poll.max(1)
    }

    /// Returns the channel name of the link to `peer`.
    pub fn channel_name(&self, peer: PeerId) -> String {
        let (a, b) = if self.local < peer {
            (self.local, peer)
        } else {
            (peer, self.local)
        };

        format!("{}sim_shm{}_{}", self.dir, a.as_u32(), b.as_u32())
    }
}
