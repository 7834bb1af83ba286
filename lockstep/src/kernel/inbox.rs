//! Cross-thread event injection.

use std::error::Error;
use std::fmt;
use std::mem;

use crate::loom_exports::sync::atomic::{AtomicBool, Ordering};
use crate::loom_exports::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{ContextId, Kernel};

/// A mutex-guarded queue of submissions from other threads.
///
/// The lock is only held to append or to swap out the whole queue, so
/// producers never wait for a merge to complete.
pub(crate) struct Inbox<T> {
    entries: Mutex<Vec<T>>,
    // Allows the kernel to skip the lock when nothing was submitted.
    is_empty: AtomicBool,
    is_closed: AtomicBool,
}

impl<T> Inbox<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            is_empty: AtomicBool::new(true),
            is_closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<T>> {
        // No user code runs under the lock so a poisoned mutex still holds a
        // consistent queue.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends an entry, giving it back if the inbox is closed.
    pub(crate) fn push(&self, entry: T) -> Result<(), T> {
        let mut entries = self.lock();
        if self.is_closed.load(Ordering::Relaxed) {
            return Err(entry);
        }
        entries.push(entry);
        self.is_empty.store(false, Ordering::Release);

        Ok(())
    }

    /// Takes all pending entries in submission order.
    pub(crate) fn take_all(&self) -> Vec<T> {
        // Ordering: this Acquire load synchronizes with the Release store in
        // `push`. A submission racing with this check is merged next time.
        if self.is_empty.load(Ordering::Acquire) {
            return Vec::new();
        }
        let mut entries = self.lock();
        self.is_empty.store(true, Ordering::Relaxed);

        mem::take(&mut *entries)
    }

    /// Refuses all further submissions and returns the pending ones.
    pub(crate) fn close(&self) -> Vec<T> {
        let mut entries = self.lock();
        self.is_closed.store(true, Ordering::Relaxed);
        self.is_empty.store(true, Ordering::Relaxed);

        mem::take(&mut *entries)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.is_empty.load(Ordering::Acquire)
    }
}

/// A submission from another thread.
pub(crate) struct InboxEntry {
    pub(crate) delay: u64,
    pub(crate) context: ContextId,
    pub(crate) action: Box<dyn FnOnce(&mut Kernel) + Send>,
}

/// A handle to submit events to a [`Kernel`] from any thread.
///
/// Injected events are merged into the kernel's queue before the kernel
/// processes its next event, at the kernel's time at that moment incremented
/// by the requested delay. Injected events cannot be cancelled.
///
/// An `Injector` is obtained with [`Kernel::injector`].
///
/// # Examples
///
/// ```
/// use std::thread;
/// use lockstep::kernel::{ContextId, Kernel};
///
/// let mut kernel = Kernel::new();
/// let injector = kernel.injector();
///
/// thread::spawn(move || {
///     injector
///         .schedule_with_context(ContextId::new(3), 5, |kernel: &mut Kernel| {
///             assert_eq!(kernel.current_context(), ContextId::new(3));
///         })
///         .unwrap();
/// })
/// .join()
/// .unwrap();
///
/// kernel.run().unwrap();
/// assert_eq!(kernel.now().as_ticks(), 5);
/// ```
#[derive(Clone)]
pub struct Injector {
    pub(super) inbox: Arc<Inbox<InboxEntry>>,
}

impl Injector {
    /// Submits an event to be invoked in the specified context, `delay` ticks
    /// after the merge.
    ///
    /// An error is returned if the kernel was torn down.
    pub fn schedule_with_context<F>(
        &self,
        context: ContextId,
        delay: u64,
        action: F,
    ) -> Result<(), InjectError>
    where
        F: FnOnce(&mut Kernel) + Send + 'static,
    {
        self.inbox
            .push(InboxEntry {
                delay,
                context,
                action: Box::new(action),
            })
            .map_err(|_| InjectError {})
    }
}

impl fmt::Debug for Injector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Injector").finish_non_exhaustive()
    }
}

/// Error returned when an event is injected into a torn-down kernel.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct InjectError {}

impl fmt::Display for InjectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "injecting an event into a torn-down kernel")
    }
}

impl Error for InjectError {}

#[cfg(all(test, not(lockstep_loom)))]
mod tests {
    use super::*;

    use std::thread;

    #[test]
    fn inbox_preserves_submission_order() {
        let inbox = Arc::new(Inbox::new());
        assert!(inbox.take_all().is_empty());

        let th = {
            let inbox = inbox.clone();
            thread::spawn(move || {
                for i in 0..1000 {
                    inbox.push(i).unwrap();
                }
            })
        };

        let mut received = Vec::new();
        while received.len() < 1000 {
            received.extend(inbox.take_all());
        }
        th.join().unwrap();

        assert!((0..1000).eq(received.into_iter()));
    }

    #[test]
    fn inbox_closed() {
        let inbox = Inbox::new();
        inbox.push(1).unwrap();

        assert_eq!(inbox.close(), vec![1]);
        assert_eq!(inbox.push(2), Err(2));
        assert!(inbox.take_all().is_empty());
    }
}
