//! Binary-heap queue.

use std::collections::HashMap;
use std::fmt;

use slab::Slab;

use super::{EventKey, EventQueue};

/// A binary heap with *O*(log *N*) deletion of arbitrary entries.
///
/// The heap holds keys together with an index pointing to a slab-allocated
/// node, which stores the value and a back-pointing index into the heap. This
/// cross-indexing is what makes deletion by key possible without a linear
/// search; a hash map resolves the key to its slab node.
///
/// Values never move from the moment they are inserted until they are
/// extracted.
pub struct HeapQueue<V> {
    heap: Vec<Item>,
    slab: Slab<Node<V>>,
    index: HashMap<EventKey, usize>,
}

impl<V> HeapQueue<V> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            heap: Vec::new(),
            slab: Slab::new(),
            index: HashMap::new(),
        }
    }

    /// Detaches the node at `slab_idx` and returns its value.
    fn take_node(&mut self, key: EventKey, slab_idx: usize) -> V {
        self.index.remove(&key);

        self.slab.remove(slab_idx).value
    }

    /// Fills the vacant heap slot `heap_idx` with the last heap item.
    fn fill_vacancy(&mut self, heap_idx: usize) {
        let Some(last_item) = self.heap.pop() else {
            return;
        };
        if let Some(item) = self.heap.get(heap_idx) {
            if last_item.key < item.key {
                self.sift_up(last_item, heap_idx);
            } else {
                self.sift_down(last_item, heap_idx);
            }
        }
    }

    /// Takes a heap item and, starting at `heap_idx`, moves it up the heap
    /// while a parent has a larger key.
    fn sift_up(&mut self, item: Item, heap_idx: usize) {
        let mut child_heap_idx = heap_idx;

        while child_heap_idx != 0 {
            let parent_heap_idx = (child_heap_idx - 1) / 2;

            if item.key >= self.heap[parent_heap_idx].key {
                break;
            }

            // Move the parent down one level.
            let parent = self.heap[parent_heap_idx];
            self.heap[child_heap_idx] = parent;
            self.slab[parent.slab_idx].heap_idx = child_heap_idx;

            child_heap_idx = parent_heap_idx;
        }

        self.heap[child_heap_idx] = item;
        self.slab[item.slab_idx].heap_idx = child_heap_idx;
    }

    /// Takes a heap item and, starting at `heap_idx`, moves it down the heap
    /// while a child has a smaller key.
    fn sift_down(&mut self, item: Item, heap_idx: usize) {
        let mut parent_heap_idx = heap_idx;
        let mut child_heap_idx = 2 * parent_heap_idx + 1;

        while child_heap_idx < self.heap.len() {
            // Pick the sibling with the smaller key.
            if let Some(other_child) = self.heap.get(child_heap_idx + 1) {
                child_heap_idx += (self.heap[child_heap_idx].key > other_child.key) as usize;
            }

            if item.key <= self.heap[child_heap_idx].key {
                break;
            }

            // Move the child up one level.
            let child = self.heap[child_heap_idx];
            self.heap[parent_heap_idx] = child;
            self.slab[child.slab_idx].heap_idx = parent_heap_idx;

            parent_heap_idx = child_heap_idx;
            child_heap_idx = 2 * parent_heap_idx + 1;
        }

        self.heap[parent_heap_idx] = item;
        self.slab[item.slab_idx].heap_idx = parent_heap_idx;
    }
}

impl<V> EventQueue<V> for HeapQueue<V> {
    fn insert(&mut self, key: EventKey, value: V) {
        let slab_idx = self.slab.insert(Node {
            value,
            heap_idx: 0, // overridden in `sift_up`
        });
        let previous = self.index.insert(key, slab_idx);
        assert!(
            previous.is_none(),
            "attempted to insert a key which is already queued"
        );

        let heap_idx = self.heap.len();
        let item = Item { key, slab_idx };
        self.heap.push(item);
        self.sift_up(item, heap_idx);
    }

    fn peek_next(&self) -> Option<(EventKey, &V)> {
        let item = self.heap.first()?;

        Some((item.key, &self.slab[item.slab_idx].value))
    }

    fn remove_next(&mut self) -> (EventKey, V) {
        let Some(&Item { key, slab_idx }) = self.heap.first() else {
            panic!("attempted to remove an entry from an empty heap queue");
        };
        let value = self.take_node(key, slab_idx);
        self.fill_vacancy(0);

        (key, value)
    }

    fn remove(&mut self, key: EventKey) -> Option<V> {
        let slab_idx = *self.index.get(&key)?;
        let heap_idx = self.slab[slab_idx].heap_idx;
        let value = self.take_node(key, slab_idx);
        self.fill_vacancy(heap_idx);

        Some(value)
    }

    fn len(&self) -> usize {
        self.heap.len()
    }
}

impl<V> Default for HeapQueue<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for HeapQueue<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapQueue")
            .field("len", &self.heap.len())
            .finish_non_exhaustive()
    }
}

/// A heap item.
#[derive(Copy, Clone)]
struct Item {
    key: EventKey,
    slab_idx: usize,
}

/// A slab node.
struct Node<V> {
    value: V,
    heap_idx: usize,
}
