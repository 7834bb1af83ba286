use std::collections::VecDeque;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::loom_exports::sync::Arc;
use crate::queue::{CalendarQueue, EventQueue, QueueKind};
use crate::time::VirtualTime;

use super::event::ScheduledEvent;
use super::inbox::Inbox;
use super::{ContextId, Kernel, KernelState};

/// Builder for a [`Kernel`].
///
/// # Examples
///
/// ```
/// use lockstep::kernel::KernelInit;
/// use lockstep::queue::{BucketOrder, QueueKind};
///
/// let kernel = KernelInit::new()
///     .queue(QueueKind::Calendar { order: BucketOrder::Descending })
///     .calendar_layout(64, 100)
///     .init();
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct KernelInit {
    queue: QueueKind,
    buckets: usize,
    width: u64,
}

impl KernelInit {
    /// Creates a builder for a kernel backed by an ascending calendar queue.
    pub fn new() -> Self {
        Self {
            queue: QueueKind::default(),
            buckets: 2,
            width: 1,
        }
    }

    /// Selects the event queue backend.
    pub fn queue(mut self, kind: QueueKind) -> Self {
        self.queue = kind;

        self
    }

    /// Sets the initial number of buckets and the initial bucket width of a
    /// calendar queue.
    ///
    /// The layout adapts as the queue grows and shrinks, so this only matters
    /// at the beginning of a simulation. It is ignored by other backends.
    pub fn calendar_layout(mut self, buckets: usize, width: u64) -> Self {
        self.buckets = buckets;
        self.width = width;

        self
    }

    /// Builds a kernel at virtual time zero.
    pub fn init(self) -> Kernel {
        let queue: Box<dyn EventQueue<ScheduledEvent>> = match self.queue {
            QueueKind::Calendar { order } => {
                Box::new(CalendarQueue::with_layout(self.buckets, self.width, order))
            }
            kind @ QueueKind::Heap => kind.build(),
        };

        Kernel {
            queue,
            queue_kind: self.queue,
            now: VirtualTime::ZERO,
            current_sequence: 0,
            current_context: ContextId::NONE,
            next_sequence: 1,
            unscheduled: 0,
            event_count: 0,
            state: KernelState::Idle,
            stop_requested: false,
            stopped: false,
            teardown_events: VecDeque::new(),
            inbox: Arc::new(Inbox::new()),
            peers: None,
        }
    }
}

impl Default for KernelInit {
    fn default() -> Self {
        Self::new()
    }
}
