use std::cell::Cell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ptr;
use std::rc::Rc;

use crate::peer::PeerId;
use crate::time::VirtualTime;

use super::{ContextId, Kernel};

/// A boxed user event.
pub(crate) type EventFn = Box<dyn FnOnce(&mut Kernel)>;

/// The action performed when an event is invoked.
pub(crate) enum Action {
    /// A user closure.
    Call(EventFn),
    /// Requests the kernel to stop.
    Stop,
    /// Sends a null message to a peer and re-arms itself.
    Heartbeat(PeerId),
    /// Drains inbound messages from a peer and re-arms itself.
    Poll(PeerId),
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Call(_) => f.write_str("Call"),
            Self::Stop => f.write_str("Stop"),
            Self::Heartbeat(peer) => write!(f, "Heartbeat({peer})"),
            Self::Poll(peer) => write!(f, "Poll({peer})"),
        }
    }
}

/// An event stored in the kernel's queue.
pub(crate) struct ScheduledEvent {
    pub(crate) context: ContextId,
    pub(crate) action: Action,
    // `None` for events injected from other threads, which have no handle.
    pub(crate) cancelled: Option<Rc<Cell<bool>>>,
}

impl ScheduledEvent {
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.as_ref().is_some_and(|flag| flag.get())
    }
}

/// An event registered for invocation at teardown.
pub(crate) struct TeardownEvent {
    pub(crate) sequence: u64,
    pub(crate) context: ContextId,
    pub(crate) action: EventFn,
    pub(crate) cancelled: Rc<Cell<bool>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum HandleKind {
    Timed,
    Teardown,
}

/// A handle to a scheduled event.
///
/// A handle can be used to cancel or remove the event and to query whether it
/// is still pending; see [`Kernel::cancel`], [`Kernel::remove`] and
/// [`Kernel::is_expired`].
///
/// Clones of a handle refer to the same event.
#[derive(Clone)]
pub struct EventHandle {
    pub(crate) time: VirtualTime,
    pub(crate) context: ContextId,
    pub(crate) sequence: u64,
    pub(crate) kind: HandleKind,
    pub(crate) cancelled: Rc<Cell<bool>>,
}

impl EventHandle {
    /// Returns the timestamp at which the event is scheduled.
    ///
    /// For events scheduled at teardown, this is the time at which the event
    /// was registered.
    pub fn time(&self) -> VirtualTime {
        self.time
    }

    /// Returns the context in which the event will be invoked.
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Returns the submission sequence number of the event.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Checks whether the event is to be invoked at teardown.
    pub fn is_teardown(&self) -> bool {
        self.kind == HandleKind::Teardown
    }

    /// Checks whether the event was cancelled or removed.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

impl PartialEq for EventHandle {
    /// Considers clones to be equal, rather than handles with equal fields.
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(&*self.cancelled, &*other.cancelled)
    }
}

impl Eq for EventHandle {}

impl Hash for EventHandle {
    fn hash<H>(&self, state: &mut H)
    where
        H: Hasher,
    {
        ptr::hash(&*self.cancelled, state)
    }
}

impl fmt::Debug for EventHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandle")
            .field("time", &self.time)
            .field("context", &self.context)
            .field("sequence", &self.sequence)
            .field("teardown", &self.is_teardown())
            .field("cancelled", &self.cancelled.get())
            .finish()
    }
}
