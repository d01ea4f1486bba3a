//! Slot pool implementation.
//!
//! Free slot indices live in a lock-free `SegQueue`, availability is tracked
//! by a semaphore so async producers can wait for a slot, and published
//! slots are queued in a second `SegQueue` in publication order.

use bytes::Bytes;
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info};

/// Location and length of a published datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotHandle {
    /// Slot index inside the pool.
    pub index: usize,
    /// Number of valid bytes in the slot.
    pub size: usize,
}

struct SlotPoolInner {
    slots: Vec<Mutex<Vec<u8>>>,
    free_slots: SegQueue<usize>,
    published: SegQueue<SlotHandle>,
    semaphore: Semaphore,
    slot_capacity: usize,
    available: AtomicUsize,
    closed: AtomicBool,
    total_published: AtomicU64,
    total_freed: AtomicU64,
}

impl SlotPoolInner {
    fn release(&self, index: usize) {
        self.free_slots.push(index);
        self.available.fetch_add(1, Ordering::Relaxed);
        self.total_freed.fetch_add(1, Ordering::Relaxed);
        self.semaphore.add_permits(1);
    }
}

/// Pool of numbered, pre-allocated datagram slots.
///
/// Cloning is cheap and every clone refers to the same slots, so the producer
/// and the consumer side each hold their own handle.
#[derive(Clone)]
pub struct SlotPool {
    inner: Arc<SlotPoolInner>,
}

impl SlotPool {
    /// Create a pool of `n_slots` slots holding up to `slot_capacity` bytes each.
    ///
    /// # Panics
    ///
    /// Panics if `n_slots` or `slot_capacity` is 0.
    #[must_use]
    pub fn new(n_slots: usize, slot_capacity: usize) -> Self {
        assert!(n_slots > 0, "n_slots must be > 0");
        assert!(slot_capacity > 0, "slot_capacity must be > 0");

        let free_slots = SegQueue::new();
        let mut slots = Vec::with_capacity(n_slots);
        for index in 0..n_slots {
            slots.push(Mutex::new(Vec::with_capacity(slot_capacity)));
            free_slots.push(index);
        }

        info!(n_slots, slot_capacity, "SlotPool created");

        Self {
            inner: Arc::new(SlotPoolInner {
                slots,
                free_slots,
                published: SegQueue::new(),
                semaphore: Semaphore::new(n_slots),
                slot_capacity,
                available: AtomicUsize::new(n_slots),
                closed: AtomicBool::new(false),
                total_published: AtomicU64::new(0),
                total_freed: AtomicU64::new(0),
            }),
        }
    }

    /// Reserve a free slot without blocking.
    ///
    /// Returns `None` when every slot is either being written or waiting to be
    /// freed by the consumer.
    #[must_use]
    pub fn try_acquire(&self) -> Option<WritableSlot> {
        let permit = self.inner.semaphore.try_acquire().ok()?;
        let index = self.inner.free_slots.pop()?;
        permit.forget();
        Some(self.reserve(index))
    }

    /// Reserve a free slot, waiting until the consumer frees one.
    ///
    /// Returns `None` once the pool has been closed.
    pub async fn acquire(&self) -> Option<WritableSlot> {
        let permit = self.inner.semaphore.acquire().await.ok()?;
        let index = self.inner.free_slots.pop()?;
        permit.forget();
        Some(self.reserve(index))
    }

    /// Reserve a free slot, waiting at most `timeout`.
    pub async fn try_acquire_timeout(&self, timeout: Duration) -> Option<WritableSlot> {
        tokio::time::timeout(timeout, self.acquire()).await.ok()?
    }

    fn reserve(&self, index: usize) -> WritableSlot {
        self.inner.available.fetch_sub(1, Ordering::Relaxed);
        WritableSlot {
            index,
            len: 0,
            published: false,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Pop the next published datagram, oldest first.
    #[must_use]
    pub fn get(&self) -> Option<SlotHandle> {
        self.inner.published.pop()
    }

    /// Copy the bytes of a published slot out of the pool.
    ///
    /// The slot stays reserved until [`SlotPool::free_by_index`] is called.
    #[must_use]
    pub fn copy_out(&self, handle: SlotHandle) -> Bytes {
        let slot = self.inner.slots[handle.index].lock();
        let end = handle.size.min(slot.len());
        Bytes::copy_from_slice(&slot[..end])
    }

    /// Return a consumed slot to the free list.
    ///
    /// Freeing the same index twice without an intervening publish corrupts
    /// the availability count.
    pub fn free_by_index(&self, index: usize, size: usize) {
        debug!(index, size, "freeing slot");
        self.inner.slots[index].lock().clear();
        self.inner.release(index);
    }

    /// Mark the producer side as finished and wake waiting producers.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.semaphore.close();
    }

    /// Whether the producer side has finished.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of published datagrams not yet taken by the consumer.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.published.len()
    }

    /// Number of currently free slots.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.available.load(Ordering::Relaxed)
    }

    /// Total number of slots.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.slots.len()
    }

    /// Capacity of each slot in bytes.
    #[must_use]
    pub fn slot_capacity(&self) -> usize {
        self.inner.slot_capacity
    }

    /// Total number of publishes since creation.
    #[must_use]
    pub fn total_published(&self) -> u64 {
        self.inner.total_published.load(Ordering::Relaxed)
    }

    /// Total number of slots returned since creation.
    #[must_use]
    pub fn total_freed(&self) -> u64 {
        self.inner.total_freed.load(Ordering::Relaxed)
    }
}

/// A reserved slot being filled by the producer.
///
/// Dropping it without calling [`WritableSlot::publish`] returns the slot to
/// the pool.
pub struct WritableSlot {
    index: usize,
    len: usize,
    published: bool,
    pool: Arc<SlotPoolInner>,
}

impl WritableSlot {
    /// Slot index.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Replace the slot contents with `src`.
    ///
    /// # Panics
    ///
    /// Panics if `src` is larger than the slot capacity.
    pub fn copy_from_slice(&mut self, src: &[u8]) {
        assert!(
            src.len() <= self.pool.slot_capacity,
            "copy_from_slice: len ({}) exceeds slot capacity ({})",
            src.len(),
            self.pool.slot_capacity
        );
        let mut slot = self.pool.slots[self.index].lock();
        slot.clear();
        slot.extend_from_slice(src);
        self.len = src.len();
    }

    /// Hand the slot to the consumer.
    pub fn publish(mut self) -> SlotHandle {
        let handle = SlotHandle {
            index: self.index,
            size: self.len,
        };
        self.published = true;
        self.pool.published.push(handle);
        self.pool.total_published.fetch_add(1, Ordering::Relaxed);
        handle
    }
}

impl Drop for WritableSlot {
    fn drop(&mut self) {
        if !self.published {
            self.pool.slots[self.index].lock().clear();
            self.pool.release(self.index);
        }
    }
}
