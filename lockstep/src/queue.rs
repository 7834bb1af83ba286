//! Event priority queues.
//!
//! The kernel keeps its pending events in a priority queue ordered by
//! [`EventKey`], i.e. by virtual timestamp and, for equal timestamps, by
//! submission sequence. Since sequence numbers are unique and increasing,
//! events sharing a timestamp are always extracted in submission order, which
//! makes simulations deterministic.
//!
//! Two backends implement the [`EventQueue`] trait:
//!
//! * [`CalendarQueue`], the default, a bucketed calendar queue with
//!   amortized *O*(1) insertion and extraction when timestamps are reasonably
//!   spread out,
//! * [`HeapQueue`], a binary heap with *O*(log *N*) insertion, extraction and
//!   deletion, whose performance does not depend on the distribution of
//!   timestamps.
//!
//! The backend is selected with [`KernelInit::queue`](crate::kernel::KernelInit::queue)
//! and can be swapped during a simulation with
//! [`Kernel::set_queue`](crate::kernel::Kernel::set_queue).

mod calendar;
mod heap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::time::VirtualTime;

pub use calendar::CalendarQueue;
pub use heap::HeapQueue;

/// The ordering key of a queued event.
///
/// Keys are ordered lexicographically, by timestamp first and then by
/// sequence number.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventKey {
    /// Virtual timestamp of the event.
    pub time: VirtualTime,
    /// Submission sequence number.
    pub sequence: u64,
}

impl EventKey {
    /// Creates a new key.
    pub const fn new(time: VirtualTime, sequence: u64) -> Self {
        Self { time, sequence }
    }
}

/// A priority queue of values ordered by [`EventKey`].
///
/// Keys are expected to be unique: inserting a key which is already in the
/// queue is a logic error.
pub trait EventQueue<V> {
    /// Inserts a value.
    fn insert(&mut self, key: EventKey, value: V);

    /// Returns the key of the lowest entry and a reference to its value,
    /// leaving it in the queue.
    fn peek_next(&self) -> Option<(EventKey, &V)>;

    /// Removes the lowest entry.
    ///
    /// # Panics
    ///
    /// Panics if the queue is empty.
    fn remove_next(&mut self) -> (EventKey, V);

    /// Removes the entry with the specified key, if still queued.
    fn remove(&mut self, key: EventKey) -> Option<V>;

    /// Returns the number of queued entries.
    fn len(&self) -> usize;

    /// Checks whether the queue is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The backend of the kernel's event queue.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum QueueKind {
    /// A [`CalendarQueue`] with the specified bucket order.
    Calendar {
        /// Sort order within each bucket.
        order: BucketOrder,
    },
    /// A [`HeapQueue`].
    Heap,
}

impl QueueKind {
    /// Creates an empty queue of this kind.
    pub fn build<V: 'static>(self) -> Box<dyn EventQueue<V>> {
        match self {
            Self::Calendar { order } => Box::new(CalendarQueue::with_order(order)),
            Self::Heap => Box::new(HeapQueue::new()),
        }
    }
}

impl Default for QueueKind {
    fn default() -> Self {
        Self::Calendar {
            order: BucketOrder::Ascending,
        }
    }
}

/// Storage order of the entries of a calendar bucket.
///
/// The order only affects the cost of insertion and extraction, never the
/// order in which entries are extracted. Descending buckets extract from the
/// back of the bucket, which may be cheaper when most insertions land after
/// the current minimum.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BucketOrder {
    /// Lowest key at the front.
    #[default]
    Ascending,
    /// Lowest key at the back.
    Descending,
}

#[cfg(all(test, not(lockstep_loom)))]
mod tests {
    use std::cell::Cell;
    use std::collections::BTreeMap;

    use super::*;

    use crate::util::rng::Rng;

    fn key(time: u64, sequence: u64) -> EventKey {
        EventKey::new(VirtualTime::from_ticks(time), sequence)
    }

    fn backends() -> [(&'static str, Box<dyn EventQueue<char>>); 3] {
        [
            ("calendar", QueueKind::default().build()),
            (
                "calendar (descending)",
                QueueKind::Calendar {
                    order: BucketOrder::Descending,
                }
                .build(),
            ),
            ("heap", QueueKind::Heap.build()),
        ]
    }

    enum Op {
        Insert(u64, char),
        Pull(Option<(u64, char)>),
        Remove(u64, Option<char>),
    }

    // Sequence numbers are assigned in insertion order so that they can be
    // referred to by their timestamp and value only.
    fn check(operations: &[Op]) {
        for (name, mut queue) in backends() {
            let mut sequence = 0;
            let mut keys = Vec::new();

            for op in operations {
                match *op {
                    Op::Insert(time, value) => {
                        let k = key(time, sequence);
                        sequence += 1;
                        keys.push((k, value));
                        queue.insert(k, value);
                    }
                    Op::Pull(expected) => {
                        let pulled = if queue.is_empty() {
                            None
                        } else {
                            let peeked = queue.peek_next().map(|(k, v)| (k, *v));
                            let (k, v) = queue.remove_next();
                            assert_eq!(peeked, Some((k, v)), "{name}");
                            Some((k.time.as_ticks(), v))
                        };
                        assert_eq!(pulled, expected, "{name}");
                    }
                    Op::Remove(time, expected) => {
                        let k = keys
                            .iter()
                            .find(|(k, v)| k.time.as_ticks() == time && Some(*v) == expected)
                            .or_else(|| keys.iter().find(|(k, _)| k.time.as_ticks() == time))
                            .map(|(k, _)| *k)
                            .unwrap();
                        assert_eq!(queue.remove(k), expected, "{name}");
                    }
                }
            }
        }
    }

    #[test]
    fn queue_smoke() {
        check(&[
            Op::Insert(5, 'a'),
            Op::Insert(2, 'b'),
            Op::Insert(3, 'c'),
            Op::Insert(4, 'd'),
            Op::Insert(9, 'e'),
            Op::Insert(1, 'f'),
            Op::Insert(8, 'g'),
            Op::Insert(0, 'h'),
            Op::Insert(7, 'i'),
            Op::Insert(6, 'j'),
            Op::Pull(Some((0, 'h'))),
            Op::Pull(Some((1, 'f'))),
            Op::Pull(Some((2, 'b'))),
            Op::Pull(Some((3, 'c'))),
            Op::Pull(Some((4, 'd'))),
            Op::Pull(Some((5, 'a'))),
            Op::Pull(Some((6, 'j'))),
            Op::Pull(Some((7, 'i'))),
            Op::Pull(Some((8, 'g'))),
            Op::Pull(Some((9, 'e'))),
            Op::Pull(None),
        ]);
    }

    #[test]
    fn queue_equal_timestamps() {
        check(&[
            Op::Insert(4, 'a'),
            Op::Insert(1, 'b'),
            Op::Insert(3, 'c'),
            Op::Pull(Some((1, 'b'))),
            Op::Insert(4, 'd'),
            Op::Insert(8, 'e'),
            Op::Insert(3, 'f'),
            Op::Pull(Some((3, 'c'))),
            Op::Pull(Some((3, 'f'))),
            Op::Pull(Some((4, 'a'))),
            Op::Insert(8, 'g'),
            Op::Pull(Some((4, 'd'))),
            Op::Pull(Some((8, 'e'))),
            Op::Pull(Some((8, 'g'))),
            Op::Pull(None),
        ]);
    }

    #[test]
    fn queue_remove() {
        check(&[
            Op::Insert(8, 'a'),
            Op::Insert(1, 'b'),
            Op::Insert(3, 'c'),
            Op::Insert(3, 'd'),
            Op::Insert(2, 'e'),
            Op::Pull(Some((1, 'b'))),
            Op::Insert(4, 'f'),
            Op::Remove(3, Some('d')),
            Op::Remove(1, None),
            Op::Insert(5, 'g'),
            Op::Pull(Some((2, 'e'))),
            Op::Pull(Some((3, 'c'))),
            Op::Remove(3, None),
            Op::Pull(Some((4, 'f'))),
            Op::Pull(Some((5, 'g'))),
            Op::Pull(Some((8, 'a'))),
            Op::Pull(None),
        ]);
    }

    #[test]
    fn queue_far_apart_timestamps() {
        check(&[
            Op::Insert(1_000_000, 'a'),
            Op::Insert(3, 'b'),
            Op::Insert(VirtualTime::MAX.as_ticks(), 'c'),
            Op::Insert(70_000, 'd'),
            Op::Pull(Some((3, 'b'))),
            Op::Insert(69_999, 'e'),
            Op::Pull(Some((69_999, 'e'))),
            Op::Pull(Some((70_000, 'd'))),
            Op::Pull(Some((1_000_000, 'a'))),
            Op::Pull(Some((VirtualTime::MAX.as_ticks(), 'c'))),
            Op::Pull(None),
        ]);
    }

    #[test]
    #[should_panic]
    fn calendar_remove_next_on_empty() {
        let mut queue = CalendarQueue::<()>::new();
        queue.remove_next();
    }

    #[test]
    #[should_panic]
    fn heap_remove_next_on_empty() {
        let mut queue = HeapQueue::<()>::new();
        queue.remove_next();
    }

    // Timestamps are drawn above the last extracted timestamp, as in a
    // simulation, but are otherwise random; occasional bursts push the
    // calendar through several resizes.
    fn fuzz(mut queue: Box<dyn EventQueue<u64>>) {
        const ITER: usize = if cfg!(miri) { 1000 } else { 1_000_000 };
        const MAX_DELAY: u64 = 99;

        const INSERT_WEIGHT: u64 = 5;
        const INSERT_AND_MARK_WEIGHT: u64 = 1;
        const PULL_WEIGHT: u64 = INSERT_WEIGHT + INSERT_AND_MARK_WEIGHT;
        const REMOVE_MARKED_WEIGHT: u64 = 1;
        const TOTAL_WEIGHT: u64 =
            INSERT_WEIGHT + INSERT_AND_MARK_WEIGHT + PULL_WEIGHT + REMOVE_MARKED_WEIGHT;

        let mut shadow_queue: BTreeMap<EventKey, u64> = BTreeMap::new();
        let sequence = Cell::new(0u64);
        let mut now = 0u64;
        let mut marked: Option<EventKey> = None;

        let rng = Rng::new(12345);
        let next_key = |now: u64| {
            let s = sequence.get();
            sequence.set(s + 1);
            key(now + rng.gen_bounded(MAX_DELAY + 1), s)
        };

        for _ in 0..ITER {
            let mut op = rng.gen_bounded(TOTAL_WEIGHT);
            if op < INSERT_WEIGHT {
                let burst = if rng.gen_ratio(1, 1000) { 200 } else { 1 };
                for _ in 0..burst {
                    let k = next_key(now);
                    let value = rng.gen();
                    queue.insert(k, value);
                    shadow_queue.insert(k, value);
                }
                continue;
            }
            op -= INSERT_WEIGHT;
            if op < INSERT_AND_MARK_WEIGHT {
                let k = next_key(now);
                let value = rng.gen();
                queue.insert(k, value);
                shadow_queue.insert(k, value);
                marked = Some(k);
                continue;
            }
            op -= INSERT_AND_MARK_WEIGHT;
            if op < PULL_WEIGHT {
                let pulled = (!queue.is_empty()).then(|| queue.remove_next());
                let shadow_pulled = shadow_queue.pop_first();
                assert_eq!(pulled, shadow_pulled);
                if let Some((k, _)) = pulled {
                    now = k.time.as_ticks();
                }
                assert_eq!(queue.len(), shadow_queue.len());
                continue;
            }
            if let Some(k) = marked.take() {
                assert_eq!(queue.remove(k), shadow_queue.remove(&k));
            }
        }

        while let Some(shadow_pulled) = shadow_queue.pop_first() {
            assert_eq!(queue.remove_next(), shadow_pulled);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn calendar_fuzz() {
        fuzz(QueueKind::default().build());
    }

    #[test]
    fn calendar_descending_fuzz() {
        fuzz(
            QueueKind::Calendar {
                order: BucketOrder::Descending,
            }
            .build(),
        );
    }

    #[test]
    fn heap_fuzz() {
        fuzz(QueueKind::Heap.build());
    }
}
