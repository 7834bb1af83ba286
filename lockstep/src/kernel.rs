//! Single-threaded simulation kernel.
//!
//! The [`Kernel`] owns the virtual clock and the queue of pending events. An
//! event is a closure taking the kernel as argument, which lets it inspect
//! the current time and schedule further events.
//!
//! # Event lifecycle
//!
//! An event scheduled with a delay `d` at time `t` is invoked once the kernel
//! reaches `t + d`, after all events with an earlier timestamp and after all
//! events with the same timestamp that were scheduled before it. Scheduling
//! returns an [`EventHandle`] which can be used to:
//!
//! * cancel the event with [`Kernel::cancel`], in constant time: the event
//!   stays queued and is silently discarded when it reaches the front of the
//!   queue, without advancing time,
//! * remove the event from the queue with [`Kernel::remove`],
//! * check whether the event is still pending with [`Kernel::is_expired`].
//!
//! Events registered with [`Kernel::schedule_at_teardown`] are not part of
//! the timeline: they are invoked by [`Kernel::teardown`], in registration
//! order.
//!
//! # Contexts
//!
//! Each event is attributed to a [`ContextId`], typically identifying the
//! simulated entity which owns it. The context has no effect on ordering.
//! Events scheduled with [`Kernel::schedule`] inherit the context of the
//! event being invoked.
//!
//! # Cross-thread injection
//!
//! A kernel cannot leave the thread that created it, so its scheduling
//! methods can only be called from that thread. Other threads submit events
//! through an [`Injector`], which appends them to an inbox merged by the
//! kernel before each processing step:
//!
//! ```compile_fail
//! use lockstep::kernel::Kernel;
//!
//! fn assert_send<T: Send>(_: T) {}
//! assert_send(Kernel::new());
//! ```

mod event;
mod inbox;
mod init;

use std::cell::Cell;
use std::collections::VecDeque;
use std::error::Error;
use std::fmt;
use std::rc::Rc;

use bytes::Bytes;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::loom_exports::sync::Arc;
#[cfg(feature = "tracing")]
use crate::macros::scoped_thread_local::scoped_thread_local;
use crate::peer::{PeerId, PeerSyncManager, SendError};
use crate::queue::{EventKey, EventQueue, QueueKind};
use crate::time::VirtualTime;

pub use event::EventHandle;
pub use inbox::{InjectError, Injector};
pub use init::KernelInit;

pub(crate) use event::Action;

use event::{HandleKind, ScheduledEvent, TeardownEvent};
use inbox::{Inbox, InboxEntry};

/// Timestamp and context of the event being invoked on this thread.
#[cfg(feature = "tracing")]
#[derive(Copy, Clone, Debug)]
pub(crate) struct EventContext {
    pub(crate) time: VirtualTime,
    pub(crate) context: ContextId,
}

#[cfg(feature = "tracing")]
scoped_thread_local!(pub(crate) static EVENT_CONTEXT: EventContext);

/// Runs `f` with the timestamp and context of an event visible to the log
/// timer.
#[cfg(feature = "tracing")]
fn with_event_context<R>(time: VirtualTime, context: ContextId, f: impl FnOnce() -> R) -> R {
    EVENT_CONTEXT.set(&EventContext { time, context }, f)
}

#[cfg(not(feature = "tracing"))]
fn with_event_context<R>(_time: VirtualTime, _context: ContextId, f: impl FnOnce() -> R) -> R {
    f()
}

/// Identifier of the logical owner of an event.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ContextId(u32);

impl ContextId {
    /// The context of events which are not attributed to any entity.
    pub const NONE: Self = Self(u32::MAX);

    /// Creates a context identifier.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the numeric value of the identifier.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::NONE {
            f.write_str("none")
        } else {
            fmt::Display::fmt(&self.0, f)
        }
    }
}

/// Lifecycle state of a [`Kernel`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KernelState {
    /// The kernel was never run.
    Idle,
    /// The kernel is processing events.
    Running,
    /// The kernel returned from a run or a step and can be run again.
    Stopped,
    /// The kernel was torn down.
    TornDown,
}

/// Simulation kernel.
///
/// A kernel is created with [`Kernel::new`] or with a [`KernelInit`]
/// builder. See the [module-level documentation](crate::kernel) for an
/// overview.
pub struct Kernel {
    queue: Box<dyn EventQueue<ScheduledEvent>>,
    queue_kind: QueueKind,
    now: VirtualTime,
    current_sequence: u64,
    current_context: ContextId,
    next_sequence: u64,
    // Queued events, including cancelled ones not discarded yet.
    unscheduled: usize,
    event_count: u64,
    state: KernelState,
    // Pending stop, consumed by the next run.
    stop_requested: bool,
    // Whether the last run returned on a stop.
    stopped: bool,
    teardown_events: VecDeque<TeardownEvent>,
    inbox: Arc<Inbox<InboxEntry>>,
    peers: Option<PeerSyncManager>,
}

impl Kernel {
    /// Creates a kernel with the default configuration.
    pub fn new() -> Self {
        KernelInit::new().init()
    }

    /// Returns the current virtual time.
    pub fn now(&self) -> VirtualTime {
        self.now
    }

    /// Returns the largest time at which an event can be scheduled.
    pub fn maximum_time(&self) -> VirtualTime {
        VirtualTime::MAX
    }

    /// Returns the context of the event being invoked, or
    /// [`ContextId::NONE`] outside of an event.
    pub fn current_context(&self) -> ContextId {
        self.current_context
    }

    /// Returns the number of events invoked so far.
    ///
    /// Cancelled events are not counted.
    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    /// Returns the number of queued events, including cancelled events which
    /// were not discarded yet.
    pub fn pending(&self) -> usize {
        self.unscheduled
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> KernelState {
        self.state
    }

    /// Returns the backend of the event queue.
    pub fn queue_kind(&self) -> QueueKind {
        self.queue_kind
    }

    /// Checks whether the kernel has nothing left to do, either because no
    /// event is pending or because a stop was requested and not yet followed
    /// by a new run.
    pub fn is_finished(&self) -> bool {
        self.stop_requested || self.stopped || (self.unscheduled == 0 && self.inbox.is_empty())
    }

    /// Schedules an event `delay` ticks from now, in the current context.
    ///
    /// # Panics
    ///
    /// Panics if the scheduled time would exceed [`VirtualTime::MAX`].
    pub fn schedule<F>(&mut self, delay: u64, action: F) -> EventHandle
    where
        F: FnOnce(&mut Kernel) + 'static,
    {
        self.schedule_action(delay, self.current_context, Action::Call(Box::new(action)))
    }

    /// Schedules an event at the current time, in the current context.
    ///
    /// The event is invoked after all events already scheduled for the
    /// current time.
    pub fn schedule_now<F>(&mut self, action: F) -> EventHandle
    where
        F: FnOnce(&mut Kernel) + 'static,
    {
        self.schedule(0, action)
    }

    /// Schedules an event `delay` ticks from now, in the specified context.
    ///
    /// # Panics
    ///
    /// Panics if the scheduled time would exceed [`VirtualTime::MAX`].
    pub fn schedule_with_context<F>(
        &mut self,
        context: ContextId,
        delay: u64,
        action: F,
    ) -> EventHandle
    where
        F: FnOnce(&mut Kernel) + 'static,
    {
        self.schedule_action(delay, context, Action::Call(Box::new(action)))
    }

    /// Registers an event to be invoked at teardown, in the current context.
    pub fn schedule_at_teardown<F>(&mut self, action: F) -> EventHandle
    where
        F: FnOnce(&mut Kernel) + 'static,
    {
        let sequence = self.next_sequence();
        let cancelled = Rc::default();
        self.teardown_events.push_back(TeardownEvent {
            sequence,
            context: self.current_context,
            action: Box::new(action),
            cancelled: Rc::clone(&cancelled),
        });

        EventHandle {
            time: self.now,
            context: self.current_context,
            sequence,
            kind: HandleKind::Teardown,
            cancelled,
        }
    }

    /// Schedules an event after which [`Kernel::run`] returns.
    pub fn stop_after(&mut self, delay: u64) -> EventHandle {
        self.schedule_action(delay, ContextId::NONE, Action::Stop)
    }

    /// Requests the kernel to return from [`Kernel::run`] once the current
    /// event completes.
    ///
    /// A stop requested while the kernel is not running, or from an event
    /// invoked by [`Kernel::step`], stays pending: the next run returns
    /// before invoking any event.
    pub fn stop(&mut self) {
        debug!(time = %self.now, "stop requested");
        self.stop_requested = true;
    }

    /// Returns a handle to submit events from other threads.
    pub fn injector(&self) -> Injector {
        Injector {
            inbox: self.inbox.clone(),
        }
    }

    /// Checks whether an event was invoked, cancelled or removed.
    ///
    /// An event is expired once the kernel has moved past its timestamp, or
    /// has reached it and invoked an event submitted no earlier. Events
    /// registered for teardown expire when invoked.
    pub fn is_expired(&self, handle: &EventHandle) -> bool {
        if handle.is_cancelled() || self.state == KernelState::TornDown {
            return true;
        }

        match handle.kind {
            HandleKind::Teardown => !self
                .teardown_events
                .iter()
                .any(|event| event.sequence == handle.sequence),
            HandleKind::Timed => {
                handle.time < self.now
                    || (handle.time == self.now && handle.sequence <= self.current_sequence)
            }
        }
    }

    /// Returns the number of ticks until the event is invoked, or zero if it
    /// is expired or registered for teardown.
    pub fn delay_left(&self, handle: &EventHandle) -> u64 {
        if handle.is_teardown() || self.is_expired(handle) {
            0
        } else {
            handle.time.saturating_duration_since(self.now)
        }
    }

    /// Cancels an event.
    ///
    /// The event stays in the queue until its time comes. Cancelling an
    /// expired event has no effect.
    pub fn cancel(&mut self, handle: &EventHandle) {
        if !self.is_expired(handle) {
            handle.cancelled.set(true);
        }
    }

    /// Removes an event from the queue.
    ///
    /// Returns `false` if the event had already expired.
    pub fn remove(&mut self, handle: &EventHandle) -> bool {
        if self.is_expired(handle) {
            return false;
        }

        let removed = match handle.kind {
            HandleKind::Teardown => self
                .teardown_events
                .iter()
                .position(|event| event.sequence == handle.sequence)
                .and_then(|pos| self.teardown_events.remove(pos))
                .is_some(),
            HandleKind::Timed => {
                let removed = self
                    .queue
                    .remove(EventKey::new(handle.time, handle.sequence))
                    .is_some();
                if removed {
                    self.unscheduled -= 1;
                }
                removed
            }
        };
        if removed {
            handle.cancelled.set(true);
        }

        removed
    }

    /// Runs the simulation until no event is left or until a stop is
    /// requested.
    ///
    /// Calling `run` again on a stopped kernel resumes the simulation.
    ///
    /// An error is returned if a peer violated the synchronization protocol,
    /// in which case the simulation cannot be continued consistently.
    ///
    /// # Panics
    ///
    /// Panics if called from an event or after teardown.
    pub fn run(&mut self) -> Result<(), ExecutionError> {
        self.run_bounded(VirtualTime::MAX)
    }

    /// Runs the simulation while the next event is scheduled at or before
    /// the specified time, then moves the clock to that time.
    ///
    /// The clock is not moved if the run was stopped or failed, or if the
    /// specified time is in the past.
    ///
    /// # Panics
    ///
    /// Panics if called from an event or after teardown.
    pub fn run_until(&mut self, time: VirtualTime) -> Result<(), ExecutionError> {
        self.run_bounded(time)?;

        if !self.stopped && time > self.now {
            self.now = time;
            self.current_sequence = self.next_sequence - 1;
        }

        Ok(())
    }

    /// Processes the next event, if any.
    ///
    /// Cancelled events are discarded first. Returns `true` if an event was
    /// invoked. This makes it possible to interleave several kernels on a
    /// single thread.
    ///
    /// # Panics
    ///
    /// Panics if called from an event or after teardown.
    pub fn step(&mut self) -> Result<bool, ExecutionError> {
        self.enter("step");
        self.merge_inbox();
        let result = self.process_next(VirtualTime::MAX);
        self.state = KernelState::Stopped;

        result.map(|time| time.is_some())
    }

    /// Returns the time of the next event, if any.
    ///
    /// Cancelled events at the front of the queue are discarded and pending
    /// injected events are merged.
    pub fn peek_next_time(&mut self) -> Option<VirtualTime> {
        self.merge_inbox();

        self.next_live_time()
    }

    /// Moves all pending events to a queue of the specified kind.
    pub fn set_queue(&mut self, kind: QueueKind) {
        let mut queue = kind.build();
        while !self.queue.is_empty() {
            let (key, event) = self.queue.remove_next();
            queue.insert(key, event);
        }
        debug!(from = ?self.queue_kind, to = ?kind, pending = queue.len(), "event queue replaced");
        self.queue = queue;
        self.queue_kind = kind;
    }

    /// Tears the kernel down.
    ///
    /// Teardown events are invoked in registration order, skipping cancelled
    /// ones. The peer synchronization manager, if any, is then detached and
    /// all pending events are discarded. Events injected afterwards are
    /// refused.
    ///
    /// # Panics
    ///
    /// Panics if called from an event or more than once.
    pub fn teardown(&mut self) {
        self.enter("teardown");
        info!(time = %self.now, "tearing down kernel");

        while let Some(event) = self.teardown_events.pop_front() {
            if event.cancelled.get() {
                continue;
            }
            self.current_context = event.context;
            with_event_context(self.now, event.context, || (event.action)(self));
        }
        self.current_context = ContextId::NONE;

        drop(self.detach_peers());
        drop(self.inbox.close());

        let discarded = self.queue.len();
        while !self.queue.is_empty() {
            self.queue.remove_next();
        }
        self.unscheduled = 0;
        self.state = KernelState::TornDown;

        debug!(discarded, "pending events discarded");
    }

    /// Attaches a peer synchronization manager and schedules its heartbeat
    /// and poll events at the current time.
    ///
    /// # Panics
    ///
    /// Panics if a manager is already attached.
    pub fn attach_peers(&mut self, mut peers: PeerSyncManager) {
        assert!(
            self.peers.is_none(),
            "a peer synchronization manager is already attached"
        );
        peers.start(self);
        self.peers = Some(peers);
    }

    /// Detaches the peer synchronization manager, if any, after cancelling
    /// its heartbeat and poll events.
    pub fn detach_peers(&mut self) -> Option<PeerSyncManager> {
        let mut peers = self.peers.take()?;
        peers.cancel_events(self);

        Some(peers)
    }

    /// Returns the attached peer synchronization manager, if any.
    pub fn peers(&self) -> Option<&PeerSyncManager> {
        self.peers.as_ref()
    }

    /// Sends a message to a context of a peer, for delivery one lookahead
    /// from now.
    pub fn transmit(
        &mut self,
        peer: PeerId,
        destination: ContextId,
        payload: impl Into<Bytes>,
    ) -> Result<(), SendError> {
        let payload = payload.into();

        self.with_peers(|peers, kernel| peers.transmit(kernel, peer, destination, payload, None))
            .unwrap_or(Err(SendError::NoPeers))
    }

    /// Sends a message to a context of a peer, for delivery at the specified
    /// time.
    ///
    /// The delivery time cannot be earlier than one lookahead from now, nor
    /// earlier than the timestamp of any message previously sent to the same
    /// peer.
    pub fn transmit_at(
        &mut self,
        peer: PeerId,
        destination: ContextId,
        payload: impl Into<Bytes>,
        delivery: VirtualTime,
    ) -> Result<(), SendError> {
        let payload = payload.into();

        self.with_peers(|peers, kernel| {
            peers.transmit(kernel, peer, destination, payload, Some(delivery))
        })
        .unwrap_or(Err(SendError::NoPeers))
    }

    /// Schedules a kernel action.
    pub(crate) fn schedule_action(
        &mut self,
        delay: u64,
        context: ContextId,
        action: Action,
    ) -> EventHandle {
        let cancelled = Rc::new(Cell::new(false));
        let key = self.insert_event(delay, context, action, Some(Rc::clone(&cancelled)));

        EventHandle {
            time: key.time,
            context,
            sequence: key.sequence,
            kind: HandleKind::Timed,
            cancelled,
        }
    }

    fn next_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        sequence
    }

    fn insert_event(
        &mut self,
        delay: u64,
        context: ContextId,
        action: Action,
        cancelled: Option<Rc<Cell<bool>>>,
    ) -> EventKey {
        let time = self.now.checked_add(delay).unwrap_or_else(|| {
            panic!(
                "scheduling an event {delay} ticks after t={} overflows the maximum virtual time",
                self.now
            )
        });
        let key = EventKey::new(time, self.next_sequence());

        self.queue.insert(
            key,
            ScheduledEvent {
                context,
                action,
                cancelled,
            },
        );
        self.unscheduled += 1;

        key
    }

    fn merge_inbox(&mut self) {
        for entry in self.inbox.take_all() {
            let InboxEntry {
                delay,
                context,
                action,
            } = entry;
            let key = self.insert_event(delay, context, Action::Call(action), None);
            trace!(time = %key.time, %context, "injected event merged");
        }
    }

    /// Discards cancelled events at the front of the queue and returns the
    /// time of the first live event.
    fn next_live_time(&mut self) -> Option<VirtualTime> {
        loop {
            match self.queue.peek_next() {
                None => return None,
                Some((key, event)) if !event.is_cancelled() => return Some(key.time),
                Some(_) => {}
            }
            let (key, _) = self.queue.remove_next();
            self.unscheduled -= 1;
            trace!(time = %key.time, sequence = key.sequence, "cancelled event discarded");
        }
    }

    /// Invokes the next live event if it is scheduled at or before the
    /// horizon, returning its time.
    fn process_next(
        &mut self,
        horizon: VirtualTime,
    ) -> Result<Option<VirtualTime>, ExecutionError> {
        match self.next_live_time() {
            Some(time) if time <= horizon => {}
            _ => return Ok(None),
        }

        let (key, event) = self.queue.remove_next();
        self.unscheduled -= 1;
        if key.time < self.now {
            panic!(
                "internal simulation error: event scheduled at t={} dequeued at t={}",
                key.time, self.now
            );
        }

        self.now = key.time;
        self.current_sequence = key.sequence;
        self.current_context = event.context;
        self.event_count += 1;
        trace!(
            time = %key.time,
            sequence = key.sequence,
            context = %event.context,
            action = ?event.action,
            "invoking event"
        );

        let result = with_event_context(key.time, event.context, || self.invoke(event.action));
        self.current_context = ContextId::NONE;
        result?;

        Ok(Some(key.time))
    }

    fn invoke(&mut self, action: Action) -> Result<(), ExecutionError> {
        match action {
            Action::Call(f) => {
                f(self);
                Ok(())
            }
            Action::Stop => {
                self.stop();
                Ok(())
            }
            Action::Heartbeat(peer) => {
                self.with_peers(|peers, kernel| peers.heartbeat(kernel, peer));
                Ok(())
            }
            Action::Poll(peer) => self
                .with_peers(|peers, kernel| peers.poll(kernel, peer))
                .unwrap_or(Ok(())),
        }
    }

    /// Lends the peer synchronization manager together with the kernel.
    ///
    /// Returns `None` if no manager is attached.
    fn with_peers<R>(
        &mut self,
        f: impl FnOnce(&mut PeerSyncManager, &mut Kernel) -> R,
    ) -> Option<R> {
        let mut peers = self.peers.take()?;
        let result = f(&mut peers, self);
        self.peers = Some(peers);

        Some(result)
    }

    fn run_bounded(&mut self, horizon: VirtualTime) -> Result<(), ExecutionError> {
        self.enter("run");
        self.stopped = false;
        info!(time = %self.now, "kernel running");

        let result = loop {
            self.merge_inbox();
            if self.stop_requested {
                self.stop_requested = false;
                self.stopped = true;
                break Ok(());
            }
            match self.process_next(horizon) {
                Ok(Some(_)) => {}
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.state = KernelState::Stopped;

        if result.is_ok() && !self.stopped && self.queue.is_empty() {
            assert!(
                self.unscheduled == 0,
                "internal simulation error: {} events were lost",
                self.unscheduled
            );
        }
        info!(
            time = %self.now,
            events = self.event_count,
            stopped = self.stopped,
            "kernel returned"
        );

        result
    }

    /// Moves to the running state, checking for re-entrance.
    fn enter(&mut self, operation: &str) {
        match self.state {
            KernelState::Running => panic!("`{operation}` cannot be called from within an event"),
            KernelState::TornDown => panic!("`{operation}` called on a torn-down kernel"),
            KernelState::Idle | KernelState::Stopped => self.state = KernelState::Running,
        }
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("now", &self.now)
            .field("state", &self.state)
            .field("pending", &self.unscheduled)
            .field("event_count", &self.event_count)
            .field("queue_kind", &self.queue_kind)
            .finish_non_exhaustive()
    }
}

/// Error returned when a peer violates the synchronization protocol.
///
/// Such errors are fatal: the causal order of the simulation can no longer be
/// guaranteed.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ExecutionError {
    /// A message is timestamped earlier than a previous message on the same
    /// link.
    NonMonotonicTimestamp {
        /// The sending peer.
        peer: PeerId,
        /// Local virtual time.
        time: VirtualTime,
        /// Timestamp of the offending message.
        timestamp: VirtualTime,
        /// Timestamp of the previous message.
        previous: VirtualTime,
    },
    /// A data message is timestamped earlier than the local virtual time.
    MessageInPast {
        /// The sending peer.
        peer: PeerId,
        /// Local virtual time.
        time: VirtualTime,
        /// Timestamp of the offending message.
        timestamp: VirtualTime,
    },
    /// A data message is addressed to a context without a delivery handler.
    NoRecipient {
        /// The sending peer.
        peer: PeerId,
        /// Local virtual time.
        time: VirtualTime,
        /// Destination of the message.
        context: ContextId,
    },
    /// The peer refused the link after it was created, because the peers
    /// disagree on synchronization.
    LinkRejected {
        /// The remote peer.
        peer: PeerId,
        /// Local virtual time.
        time: VirtualTime,
    },
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonMonotonicTimestamp {
                peer,
                time,
                timestamp,
                previous,
            } => write!(
                fmt,
                "at t={time}, peer {peer} sent a message timestamped t={timestamp}, earlier than its previous message timestamped t={previous}"
            ),
            Self::MessageInPast {
                peer,
                time,
                timestamp,
            } => write!(
                fmt,
                "at t={time}, received a message from peer {peer} timestamped in the past at t={timestamp}"
            ),
            Self::NoRecipient {
                peer,
                time,
                context,
            } => write!(
                fmt,
                "at t={time}, received a message from peer {peer} for context {context} which has no delivery handler"
            ),
            Self::LinkRejected { peer, time } => write!(
                fmt,
                "at t={time}, peer {peer} rejected the link because it does not request the same synchronization mode"
            ),
        }
    }
}

impl Error for ExecutionError {}
