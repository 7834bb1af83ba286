//! Bounded single-producer single-consumer FIFO ring.
//!
//! The ring carries the messages of one direction of an in-memory link. The
//! producer can check for free space before committing to a push, which lets
//! the transport hand out a send buffer only when the push is guaranteed to
//! succeed.

use std::cell::Cell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::panic::{RefUnwindSafe, UnwindSafe};

use crossbeam_utils::CachePadded;

use crate::loom_exports::cell::UnsafeCell;
use crate::loom_exports::sync::atomic::{AtomicBool, Ordering};
use crate::loom_exports::sync::Arc;

/// A slot containing at most one value.
struct Slot<T> {
    is_full: AtomicBool,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            is_full: AtomicBool::new(false),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// Storage shared by the producer and the consumer.
struct Ring<T> {
    slots: Box<[CachePadded<Slot<T>>]>,
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        for slot in self.slots.iter_mut() {
            if slot.is_full.load(Ordering::Relaxed) {
                // Safety: both handles are gone and a full slot holds an
                // initialized value.
                slot.value.with_mut(|p| unsafe { (*p).assume_init_drop() });
            }
        }
    }
}

unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> UnwindSafe for Ring<T> {}
impl<T> RefUnwindSafe for Ring<T> {}

/// A handle to a ring that can push values.
pub(crate) struct Producer<T> {
    ring: Arc<Ring<T>>,
    write_idx: usize,
    _non_sync_phantom: PhantomData<Cell<()>>,
}

impl<T> Producer<T> {
    /// Checks whether the next push would succeed.
    ///
    /// Once this returns `true`, it keeps returning `true` until the next
    /// push since only the producer can fill a slot.
    pub(crate) fn has_space(&self) -> bool {
        // Ordering: this Acquire load synchronizes with the Release store in
        // `pop` so the consumer is done reading the slot.
        !self.ring.slots[self.write_idx]
            .is_full
            .load(Ordering::Acquire)
    }

    /// Pushes a value, giving it back if the ring is full.
    pub(crate) fn try_push(&mut self, value: T) -> Result<(), T> {
        if !self.has_space() {
            return Err(value);
        }

        let slot = &self.ring.slots[self.write_idx];

        // Safety: the slot is empty so the consumer will not access it before
        // `is_full` is set.
        slot.value.with_mut(|p| unsafe { (*p).write(value) });

        // Ordering: this Release store synchronizes with the Acquire load in
        // `peek` and `pop`.
        slot.is_full.store(true, Ordering::Release);

        self.write_idx = (self.write_idx + 1) % self.ring.slots.len();

        Ok(())
    }

    /// Checks whether the consumer was dropped.
    pub(crate) fn is_closed(&self) -> bool {
        Arc::strong_count(&self.ring) == 1
    }
}

/// A handle to a ring that can pop values.
pub(crate) struct Consumer<T> {
    ring: Arc<Ring<T>>,
    read_idx: usize,
    _non_sync_phantom: PhantomData<Cell<()>>,
}

impl<T> Consumer<T> {
    /// Returns a reference to the oldest value, if any.
    pub(crate) fn peek(&self) -> Option<&T> {
        let slot = &self.ring.slots[self.read_idx];

        if !slot.is_full.load(Ordering::Acquire) {
            return None;
        }

        // Safety: the slot is full and only the consumer can empty it, which
        // requires a mutable borrow of `self`.
        Some(slot.value.with(|p| unsafe { (*p).assume_init_ref() }))
    }

    /// Pops the oldest value, if any.
    pub(crate) fn pop(&mut self) -> Option<T> {
        let slot = &self.ring.slots[self.read_idx];

        if !slot.is_full.load(Ordering::Acquire) {
            return None;
        }

        // Safety: the slot is full so we have exclusive ownership of an
        // initialized value.
        let value = slot.value.with(|p| unsafe { (*p).assume_init_read() });

        // Ordering: this Release store synchronizes with the Acquire load in
        // `has_space`.
        slot.is_full.store(false, Ordering::Release);

        self.read_idx = (self.read_idx + 1) % self.ring.slots.len();

        Some(value)
    }

    /// Checks whether the producer was dropped.
    pub(crate) fn is_closed(&self) -> bool {
        Arc::strong_count(&self.ring) == 1
    }
}

/// Creates the producer and consumer handles of a ring with the specified
/// capacity.
///
/// # Panics
///
/// Panics if the capacity is zero.
pub(crate) fn ring<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    assert!(capacity > 0, "a ring must have a non-zero capacity");

    let slots = (0..capacity).map(|_| CachePadded::new(Slot::new())).collect();
    let ring = Arc::new(Ring { slots });

    let producer = Producer {
        ring: ring.clone(),
        write_idx: 0,
        _non_sync_phantom: PhantomData,
    };
    let consumer = Consumer {
        ring,
        read_idx: 0,
        _non_sync_phantom: PhantomData,
    };

    (producer, consumer)
}
