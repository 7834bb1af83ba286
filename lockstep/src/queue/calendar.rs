//! Calendar queue.

use std::collections::VecDeque;
use std::fmt;

use super::{BucketOrder, EventKey, EventQueue};

/// Minimum number of buckets.
const MIN_BUCKETS: usize = 2;

/// Maximum number of buckets.
const MAX_BUCKETS: usize = 1 << 15;

/// Maximum number of entries sampled to estimate the bucket width.
const MAX_WIDTH_SAMPLES: usize = 25;

type Bucket<V> = VecDeque<(EventKey, V)>;

/// A calendar queue.
///
/// Entries are hashed into an array of buckets by timestamp: each bucket
/// covers a `width`-long interval of virtual time, and the array wraps around
/// every `n_buckets × width` ticks, one such cycle being a "year". The
/// extraction of the minimum scans the buckets starting at the bucket of the
/// last extracted entry, advancing the upper bound of the current year slot
/// by `width` at each bucket; the first bucket whose lowest entry lies below
/// that bound holds the minimum. If a whole year elapses without a hit, which
/// happens when entries are sparse, the minimum is found by a direct search
/// over all buckets.
///
/// The number of buckets doubles when the queue holds more than twice as
/// many entries as there are buckets, and halves when it holds fewer than a
/// quarter. Each resize estimates a new width from the spacing of the
/// earliest entries and rehashes the whole queue.
///
/// Extraction in ascending key order assumes that keys are never inserted
/// below the key of the last extracted entry, which holds in a simulation
/// since events are never scheduled in the past. Should this happen
/// nonetheless, the scan position is moved back so that the order is still
/// preserved.
pub struct CalendarQueue<V> {
    buckets: Vec<Bucket<V>>,
    width: u64,
    order: BucketOrder,
    // Bucket of the last extracted entry, where the next scan starts.
    last_bucket: usize,
    // Upper bound, exclusive, of the year slot of `last_bucket`.
    bucket_top: u64,
    // Timestamp of the last extracted entry.
    last_time: u64,
    len: usize,
}

impl<V> CalendarQueue<V> {
    /// Creates an empty queue with ascending buckets.
    pub fn new() -> Self {
        Self::with_order(BucketOrder::Ascending)
    }

    /// Creates an empty queue with the specified bucket order.
    pub fn with_order(order: BucketOrder) -> Self {
        Self::with_layout(MIN_BUCKETS, 1, order)
    }

    /// Creates an empty queue with the specified initial number of buckets,
    /// bucket width and bucket order.
    ///
    /// The number of buckets is clamped to the range supported by the queue
    /// and a zero width is treated as 1.
    pub fn with_layout(n_buckets: usize, width: u64, order: BucketOrder) -> Self {
        let mut queue = Self {
            buckets: Vec::new(),
            width: 1,
            order,
            last_bucket: 0,
            bucket_top: 0,
            last_time: 0,
            len: 0,
        };
        queue.init(n_buckets.clamp(MIN_BUCKETS, MAX_BUCKETS), width.max(1), 0);

        queue
    }

    /// Returns the current number of buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Returns the current bucket width.
    pub fn width(&self) -> u64 {
        self.width
    }

    fn init(&mut self, n_buckets: usize, width: u64, start_time: u64) {
        self.buckets = (0..n_buckets).map(|_| VecDeque::new()).collect();
        self.width = width;
        self.last_time = start_time;
        self.last_bucket = self.hash(start_time);
        self.bucket_top = self.year_slot_top(start_time);
    }

    fn hash(&self, time: u64) -> usize {
        ((time / self.width) % self.buckets.len() as u64) as usize
    }

    fn year_slot_top(&self, time: u64) -> u64 {
        (time / self.width + 1).saturating_mul(self.width)
    }

    /// Returns the lowest entry of a bucket.
    fn bucket_min(&self, bucket: &Bucket<V>) -> Option<EventKey> {
        match self.order {
            BucketOrder::Ascending => bucket.front(),
            BucketOrder::Descending => bucket.back(),
        }
        .map(|(key, _)| *key)
    }

    /// Returns the index of the bucket holding the lowest entry.
    fn find_min_bucket(&self) -> Option<usize> {
        if self.len == 0 {
            return None;
        }

        let n_buckets = self.buckets.len();
        let mut idx = self.last_bucket;
        let mut bucket_top = self.bucket_top;

        loop {
            if let Some(key) = self.bucket_min(&self.buckets[idx]) {
                if key.time.as_ticks() < bucket_top {
                    return Some(idx);
                }
            }
            idx = (idx + 1) % n_buckets;
            bucket_top = bucket_top.saturating_add(self.width);

            if idx == self.last_bucket {
                break;
            }
        }

        // A whole year elapsed without a hit: search directly.
        self.buckets
            .iter()
            .enumerate()
            .filter_map(|(idx, bucket)| self.bucket_min(bucket).map(|key| (key, idx)))
            .min()
            .map(|(_, idx)| idx)
    }

    fn insert_entry(&mut self, key: EventKey, value: V) {
        let time = key.time.as_ticks();

        if time < self.last_time {
            self.last_time = time;
            self.last_bucket = self.hash(time);
            self.bucket_top = self.year_slot_top(time);
        }

        let order = self.order;
        let idx = self.hash(time);
        let bucket = &mut self.buckets[idx];
        let pos = match order {
            BucketOrder::Ascending => bucket.partition_point(|(k, _)| *k < key),
            BucketOrder::Descending => bucket.partition_point(|(k, _)| *k > key),
        };
        bucket.insert(pos, (key, value));
        self.len += 1;
    }

    fn remove_min_entry(&mut self) -> Option<(EventKey, V)> {
        let idx = self.find_min_bucket()?;
        let bucket = &mut self.buckets[idx];
        let (key, value) = match self.order {
            BucketOrder::Ascending => bucket.pop_front(),
            BucketOrder::Descending => bucket.pop_back(),
        }?;

        let time = key.time.as_ticks();
        self.last_bucket = idx;
        self.last_time = time;
        self.bucket_top = self.year_slot_top(time);
        self.len -= 1;

        Some((key, value))
    }

    /// Estimates a bucket width from the spacing of the earliest entries.
    ///
    /// The width is 3 times the average gap between consecutive samples,
    /// after discarding gaps larger than twice the raw average.
    fn estimate_width(&mut self) -> u64 {
        if self.len < 2 {
            return 1;
        }

        let n_samples = if self.len <= 5 {
            self.len
        } else {
            (5 + self.len / 10).min(MAX_WIDTH_SAMPLES)
        };

        let (last_bucket, bucket_top, last_time) =
            (self.last_bucket, self.bucket_top, self.last_time);

        let mut samples = Vec::with_capacity(n_samples);
        for _ in 0..n_samples {
            match self.remove_min_entry() {
                Some(entry) => samples.push(entry),
                None => break,
            }
        }
        let times: Vec<u64> = samples.iter().map(|(key, _)| key.time.as_ticks()).collect();
        for (key, value) in samples {
            self.insert_entry(key, value);
        }

        self.last_bucket = last_bucket;
        self.bucket_top = bucket_top;
        self.last_time = last_time;

        let gaps: Vec<u64> = times.windows(2).map(|w| w[1] - w[0]).collect();
        if gaps.is_empty() {
            return 1;
        }
        let twice_average =
            gaps.iter().map(|&gap| u128::from(gap)).sum::<u128>() / gaps.len() as u128 * 2;

        let (sum, count) = gaps
            .iter()
            .map(|&gap| u128::from(gap))
            .filter(|&gap| gap <= twice_average)
            .fold((0u128, 0u128), |(sum, count), gap| (sum + gap, count + 1));
        if count == 0 {
            return 1;
        }

        u64::try_from(sum / count * 3).unwrap_or(u64::MAX).max(1)
    }

    fn resize(&mut self, n_buckets: usize) {
        let width = self.estimate_width();
        let old_buckets = std::mem::take(&mut self.buckets);

        self.init(n_buckets, width, self.last_time);
        self.len = 0;
        for (key, value) in old_buckets.into_iter().flatten() {
            self.insert_entry(key, value);
        }
    }

    fn resize_up(&mut self) {
        let n_buckets = self.buckets.len();
        if self.len > 2 * n_buckets && n_buckets < MAX_BUCKETS {
            self.resize(n_buckets * 2);
        }
    }

    fn resize_down(&mut self) {
        let n_buckets = self.buckets.len();
        if self.len < n_buckets / 4 && n_buckets > MIN_BUCKETS {
            self.resize((n_buckets / 2).max(MIN_BUCKETS));
        }
    }
}

impl<V> EventQueue<V> for CalendarQueue<V> {
    fn insert(&mut self, key: EventKey, value: V) {
        self.insert_entry(key, value);
        self.resize_up();
    }

    fn peek_next(&self) -> Option<(EventKey, &V)> {
        let bucket = &self.buckets[self.find_min_bucket()?];
        let (key, value) = match self.order {
            BucketOrder::Ascending => bucket.front(),
            BucketOrder::Descending => bucket.back(),
        }?;

        Some((*key, value))
    }

    fn remove_next(&mut self) -> (EventKey, V) {
        let entry = self
            .remove_min_entry()
            .unwrap_or_else(|| panic!("attempted to remove an entry from an empty calendar queue"));
        self.resize_down();

        entry
    }

    fn remove(&mut self, key: EventKey) -> Option<V> {
        let order = self.order;
        let idx = self.hash(key.time.as_ticks());
        let bucket = &mut self.buckets[idx];
        let pos = match order {
            BucketOrder::Ascending => bucket.binary_search_by(|(k, _)| k.cmp(&key)),
            BucketOrder::Descending => bucket.binary_search_by(|(k, _)| key.cmp(k)),
        }
        .ok()?;
        let (_, value) = bucket.remove(pos)?;
        self.len -= 1;
        self.resize_down();

        Some(value)
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl<V> Default for CalendarQueue<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for CalendarQueue<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CalendarQueue")
            .field("len", &self.len)
            .field("bucket_count", &self.buckets.len())
            .field("width", &self.width)
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}
